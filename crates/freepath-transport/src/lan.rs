//! TCP link adapter for peers on the same network.
//!
//! Outbound connections are opened explicitly with [`LanLinkAdapter::connect`].
//! Inbound connections are anonymous until their first frame, which must be
//! a HANDSHAKE arriving within the configured timeout; the connection is
//! then labelled with the node ID the handshake payload claims. The
//! protocol layer verifies that claim before any session exists.
//!
//! At most one connection per peer is registered. When both nodes dial
//! each other, the connection dialed by the smaller node ID survives on
//! both ends. An inbound connection never replaces the connection of an
//! established session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use freepath_core::LinkConfig;
use freepath_core::error::{ConfigError, LinkError};
use freepath_core::frame::{Frame, FrameType};
use freepath_core::handshake::HandshakeHandler;
use freepath_core::identity::{ContactLookup, NodeId};
use freepath_core::link::{FrameHandler, LinkAdapter, LinkEvents};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::connection::{Connection, FrameReader, configure_stream};
use crate::slot::Slot;

/// Pause after a failed `accept` before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

struct Registered {
    generation: u64,
    outbound: bool,
    conn: Arc<Connection>,
}

struct LanInner {
    local_id: NodeId,
    listen_addr: SocketAddr,
    config: LinkConfig,
    contacts: Arc<dyn ContactLookup>,
    handler: Slot<Arc<dyn FrameHandler>>,
    events: Slot<Arc<dyn LinkEvents>>,
    /// Registered connections (peer -> connection)
    connections: DashMap<NodeId, Registered>,
    /// Peers with an outbound connect in progress
    connecting: DashSet<NodeId>,
    inbound_slots: Arc<Semaphore>,
    running: AtomicBool,
    next_generation: AtomicU64,
    local_addr: Slot<SocketAddr>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// TCP [`LinkAdapter`].
#[derive(Clone)]
pub struct LanLinkAdapter {
    inner: Arc<LanInner>,
}

impl std::fmt::Debug for LanLinkAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanLinkAdapter")
            .field("local_id", &self.inner.local_id)
            .field("listen_addr", &self.inner.listen_addr)
            .field("connections", &self.inner.connections.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl LanLinkAdapter {
    /// Create an adapter that will listen on `listen_addr` once started.
    ///
    /// Only peers known to `contacts` are dialed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` does not validate.
    pub fn new(
        local_id: NodeId,
        listen_addr: SocketAddr,
        contacts: Arc<dyn ContactLookup>,
        config: LinkConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let inbound_slots = Arc::new(Semaphore::new(config.max_inbound_connections));
        Ok(Self {
            inner: Arc::new(LanInner {
                local_id,
                listen_addr,
                config,
                contacts,
                handler: Slot::empty(),
                events: Slot::empty(),
                connections: DashMap::new(),
                connecting: DashSet::new(),
                inbound_slots,
                running: AtomicBool::new(false),
                next_generation: AtomicU64::new(1),
                local_addr: Slot::empty(),
                accept_task: Mutex::new(None),
            }),
        })
    }

    /// Register the connection lifecycle sink, typically
    /// [`freepath_core::StatefulProtocol::link_events`].
    pub fn set_link_events(&self, events: Arc<dyn LinkEvents>) {
        self.inner.events.set(Some(events));
    }

    /// Address actually bound, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get()
    }

    /// Whether the adapter is accepting and sending.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Whether a connection to `peer` is registered.
    #[must_use]
    pub fn is_connected(&self, peer: &NodeId) -> bool {
        self.inner.connections.contains_key(peer)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Open a connection to `peer` at `addr`.
    ///
    /// Self, unknown peers, peers already connected and peers with a
    /// connect in progress are skipped. Once registered, the link events
    /// sink is told so it can start a handshake.
    ///
    /// # Errors
    ///
    /// [`LinkError::NotStarted`] or the socket error from dialing.
    pub async fn connect(&self, peer: NodeId, addr: SocketAddr) -> Result<(), LinkError> {
        if !self.is_running() {
            return Err(LinkError::NotStarted);
        }
        if peer == self.inner.local_id {
            tracing::debug!("skipping connection to self");
            return Ok(());
        }
        if self.inner.contacts.contact(&peer).is_none() {
            tracing::debug!(%peer, "skipping connection to unknown peer");
            return Ok(());
        }
        if self.is_connected(&peer) {
            tracing::debug!(%peer, "already connected");
            return Ok(());
        }
        if !self.inner.connecting.insert(peer) {
            tracing::debug!(%peer, "connect already in progress");
            return Ok(());
        }

        let result = self.dial(peer, addr).await;
        self.inner.connecting.remove(&peer);
        result
    }

    async fn dial(&self, peer: NodeId, addr: SocketAddr) -> Result<(), LinkError> {
        let stream = TcpStream::connect(addr).await?;
        configure_stream(&stream)?;
        let (read, write) = stream.into_split();
        let conn = Arc::new(Connection::new(write, addr, self.inner.config.mtu));

        let Some(generation) = self.register(peer, Arc::clone(&conn), true).await else {
            tracing::debug!(%peer, "keeping existing connection");
            conn.close().await;
            return Ok(());
        };
        tracing::info!(%peer, %addr, "connected");

        let reader = FrameReader::new(read, &self.inner.config);
        let adapter = self.clone();
        tokio::spawn(async move {
            adapter.read_loop(peer, generation, conn, reader).await;
        });

        if let Some(events) = self.inner.events.get() {
            if let Err(e) = events.on_connection_established(peer).await {
                tracing::warn!(%peer, error = %e, "connection setup failed");
                self.close_if_current(&peer, generation).await;
            }
        }
        Ok(())
    }

    /// Register `conn` for `peer`. Returns its generation, or `None` if the
    /// existing connection wins.
    ///
    /// An inbound connection is only labelled by an unverified claim, so it
    /// is refused while a session with `peer` is established.
    async fn register(&self, peer: NodeId, conn: Arc<Connection>, outbound: bool) -> Option<u64> {
        if !self.is_running() {
            return None;
        }
        if !outbound && self.session_established(&peer) {
            tracing::debug!(
                %peer,
                addr = %conn.peer_addr(),
                "session established, refusing inbound connection"
            );
            return None;
        }
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let registered = Registered {
            generation,
            outbound,
            conn,
        };

        let displaced = match self.inner.connections.entry(peer) {
            Entry::Vacant(slot) => {
                slot.insert(registered);
                None
            }
            Entry::Occupied(mut slot) => {
                if keep_existing(&self.inner.local_id, &peer, slot.get().outbound, outbound) {
                    return None;
                }
                Some(std::mem::replace(slot.get_mut(), registered).conn)
            }
        };

        if let Some(old) = displaced {
            tracing::debug!(%peer, addr = %old.peer_addr(), "replacing duplicate connection");
            old.close().await;
        }
        Some(generation)
    }

    fn session_established(&self, peer: &NodeId) -> bool {
        self.inner
            .events
            .get()
            .is_some_and(|events| events.has_session(peer))
    }

    async fn close_if_current(&self, peer: &NodeId, generation: u64) {
        if let Some((_, registered)) = self
            .inner
            .connections
            .remove_if(peer, |_, r| r.generation == generation)
        {
            registered.conn.close().await;
        }
    }

    async fn deliver(&self, peer: NodeId, frame: Frame) {
        if !self.is_running() {
            return;
        }
        if let Some(handler) = self.inner.handler.get() {
            handler.on_frame(peer, frame).await;
        }
    }

    async fn read_loop(
        &self,
        peer: NodeId,
        generation: u64,
        conn: Arc<Connection>,
        mut reader: FrameReader,
    ) {
        loop {
            let next = tokio::select! {
                () = conn.closed() => break,
                next = reader.next_frame() => next,
            };
            match next {
                Ok(frame) => self.deliver(peer, frame).await,
                Err(e) => {
                    tracing::debug!(%peer, error = %e, "connection ended");
                    break;
                }
            }
        }
        conn.close().await;

        let was_current = self
            .inner
            .connections
            .remove_if(&peer, |_, r| r.generation == generation)
            .is_some();
        if was_current && self.is_running() {
            tracing::info!(%peer, "peer disconnected");
            if let Some(events) = self.inner.events.get() {
                events.on_peer_disconnected(peer).await;
            }
        }
    }

    async fn accept_loop(&self, listener: TcpListener) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let Ok(permit) = Arc::clone(&self.inner.inbound_slots).try_acquire_owned() else {
                tracing::debug!(%addr, "inbound connection limit reached, rejecting");
                continue;
            };
            let adapter = self.clone();
            tokio::spawn(async move {
                adapter.serve_inbound(stream, addr).await;
                drop(permit);
            });
        }
    }

    async fn serve_inbound(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = configure_stream(&stream) {
            tracing::debug!(%addr, error = %e, "failed to configure inbound socket");
        }
        let (read, write) = stream.into_split();
        let mut reader = FrameReader::new(read, &self.inner.config);

        let first = match tokio::time::timeout(
            self.inner.config.first_frame_timeout,
            reader.next_frame(),
        )
        .await
        {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                tracing::debug!(%addr, error = %e, "inbound connection failed before handshake");
                return;
            }
            Err(_) => {
                tracing::debug!(%addr, "no handshake within first-frame timeout");
                return;
            }
        };

        if first.frame_type() != FrameType::Handshake {
            tracing::debug!(%addr, wire_type = %first.wire_type, "first frame is not a handshake");
            return;
        }
        let Some(peer) = HandshakeHandler::claimed_node_id(&first.payload) else {
            tracing::debug!(%addr, "handshake payload carries no node id");
            return;
        };
        if peer == self.inner.local_id {
            tracing::debug!(%addr, "inbound connection claims our own node id");
            return;
        }

        let conn = Arc::new(Connection::new(write, addr, self.inner.config.mtu));
        let Some(generation) = self.register(peer, Arc::clone(&conn), false).await else {
            tracing::debug!(%peer, %addr, "keeping existing connection");
            conn.close().await;
            return;
        };
        tracing::debug!(%peer, %addr, "inbound connection registered");

        self.deliver(peer, first).await;
        self.read_loop(peer, generation, conn, reader).await;
    }
}

/// Of two connections to the same peer, keep the one dialed by the smaller
/// node ID. Otherwise the newer connection wins.
fn keep_existing(local: &NodeId, peer: &NodeId, existing_outbound: bool, new_outbound: bool) -> bool {
    let preferred_outbound = local < peer;
    existing_outbound == preferred_outbound && new_outbound != preferred_outbound
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

#[async_trait]
impl LinkAdapter for LanLinkAdapter {
    fn set_inbound_frame_handler(&self, handler: Arc<dyn FrameHandler>) {
        self.inner.handler.set(Some(handler));
    }

    async fn start(&self) -> Result<(), LinkError> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(LinkError::AlreadyStarted);
        }

        let bound = bind_listener(self.inner.listen_addr)
            .and_then(|listener| Ok((listener.local_addr()?, listener)));
        let (local_addr, listener) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        self.inner.local_addr.set(Some(local_addr));

        let adapter = self.clone();
        let task = tokio::spawn(async move {
            adapter.accept_loop(listener).await;
        });
        *self.inner.accept_task.lock().await = Some(task);

        tracing::info!(node_id = %self.inner.local_id, %local_addr, "LAN link listening");
        Ok(())
    }

    async fn stop(&self) {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        if let Some(task) = self.inner.accept_task.lock().await.take() {
            task.abort();
        }
        let peers: Vec<NodeId> = self.inner.connections.iter().map(|e| *e.key()).collect();
        for peer in &peers {
            self.close_connection(peer).await;
        }
        self.inner.local_addr.set(None);
        tracing::info!(node_id = %self.inner.local_id, "LAN link stopped");
    }

    async fn close_connection(&self, peer: &NodeId) {
        if let Some((_, registered)) = self.inner.connections.remove(peer) {
            registered.conn.close().await;
            tracing::debug!(%peer, "connection closed");
        }
    }

    async fn send_frame(&self, peer: &NodeId, frame: &Frame) -> Result<(), LinkError> {
        if !self.is_running() {
            return Err(LinkError::NotStarted);
        }
        let conn = self
            .inner
            .connections
            .get(peer)
            .map(|r| Arc::clone(&r.conn))
            .ok_or(LinkError::NotConnected(*peer))?;
        conn.send_frame(frame).await
    }
}
