//! Stateful session engine.
//!
//! [`StatefulProtocol`] owns the peer → session table and the table of
//! initiator handshakes awaiting a response. It drives the handshake over
//! a [`LinkAdapter`], allocates outbound sequence numbers, authenticates
//! inbound frames and hands decrypted DATA/ACK frames to the application.
//!
//! Inbound session frames go through three steps: a short check of the
//! seq under the table lock, AEAD verification with no lock held, then a
//! re-check and acceptance under the lock. A frame that loses a race
//! against another frame for the same peer, or against a session change,
//! is dropped at the re-check.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use freepath_crypto::aead::AeadKey;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ProtocolConfig;
use crate::error::{ConfigError, HandshakeError, ProtocolError};
use crate::frame::{Frame, FrameType};
use crate::frame_crypto;
use crate::handshake::{HandshakeHandler, InitiatorContext, SCHEMA};
use crate::identity::{ContactLookup, LocalIdentity, NodeId};
use crate::link::{FrameHandler, LinkAdapter, LinkEvents};
use crate::session::SessionState;

struct PendingInitiator {
    peer: NodeId,
    ctx: Arc<InitiatorContext>,
    created_at: Instant,
}

enum Allocation {
    Ready { header: Frame, key: AeadKey },
    RolledOver(SessionState),
    Missing,
}

struct ProtocolInner {
    identity: Arc<LocalIdentity>,
    handshake: HandshakeHandler,
    link: Arc<dyn LinkAdapter>,
    app: Arc<dyn FrameHandler>,
    config: ProtocolConfig,
    /// Established sessions (peer -> state)
    sessions: DashMap<NodeId, SessionState>,
    /// Initiator handshakes awaiting frame 1 (stream id -> context)
    pending: DashMap<String, PendingInitiator>,
    running: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Session-oriented secure transport over a [`LinkAdapter`].
///
/// Cheap to clone; clones share the same tables.
#[derive(Clone)]
pub struct StatefulProtocol {
    inner: Arc<ProtocolInner>,
}

impl std::fmt::Debug for StatefulProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatefulProtocol")
            .field("node_id", &self.local_node_id())
            .field("sessions", &self.inner.sessions.len())
            .field("pending", &self.inner.pending.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl StatefulProtocol {
    /// Create a protocol with the default [`ProtocolConfig`].
    ///
    /// Decrypted DATA and ACK frames are handed to `app`.
    #[must_use]
    pub fn new(
        identity: Arc<LocalIdentity>,
        contacts: Arc<dyn ContactLookup>,
        link: Arc<dyn LinkAdapter>,
        app: Arc<dyn FrameHandler>,
    ) -> Self {
        Self::build(identity, contacts, link, app, ProtocolConfig::default())
    }

    /// Create a protocol with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` does not validate.
    pub fn with_config(
        identity: Arc<LocalIdentity>,
        contacts: Arc<dyn ContactLookup>,
        link: Arc<dyn LinkAdapter>,
        app: Arc<dyn FrameHandler>,
        config: ProtocolConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(identity, contacts, link, app, config))
    }

    fn build(
        identity: Arc<LocalIdentity>,
        contacts: Arc<dyn ContactLookup>,
        link: Arc<dyn LinkAdapter>,
        app: Arc<dyn FrameHandler>,
        config: ProtocolConfig,
    ) -> Self {
        let handshake = HandshakeHandler::new(Arc::clone(&identity), contacts);
        Self {
            inner: Arc::new(ProtocolInner {
                identity,
                handshake,
                link,
                app,
                config,
                sessions: DashMap::new(),
                pending: DashMap::new(),
                running: AtomicBool::new(false),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// This node's ID.
    #[must_use]
    pub fn local_node_id(&self) -> NodeId {
        self.inner.identity.node_id()
    }

    /// Whether `start` has been called without a matching `stop`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Whether an established session with `peer` exists.
    #[must_use]
    pub fn has_session(&self, peer: &NodeId) -> bool {
        self.inner.sessions.contains_key(peer)
    }

    /// Number of established sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Number of initiator handshakes awaiting a response.
    #[must_use]
    pub fn pending_handshake_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Connection event sink to hand to a link adapter.
    ///
    /// Holds only a weak reference, so the adapter may keep it for its
    /// whole lifetime without keeping the protocol alive.
    #[must_use]
    pub fn link_events(&self) -> Arc<dyn LinkEvents> {
        Arc::new(WeakProtocol(Arc::downgrade(&self.inner)))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Register with the link, start it and launch the expired-handshake sweep.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::AlreadyRunning`] on a second call, or the link's
    /// start failure.
    pub async fn start(&self) -> Result<(), ProtocolError> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ProtocolError::AlreadyRunning);
        }

        self.inner
            .link
            .set_inbound_frame_handler(Arc::new(WeakProtocol(Arc::downgrade(&self.inner))));
        if let Err(e) = self.inner.link.start().await {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        let weak = Arc::downgrade(&self.inner);
        let period = self
            .inner
            .config
            .sweep_interval()
            .max(Duration::from_millis(1));
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                StatefulProtocol { inner }.evict_expired_handshakes().await;
            }
        });
        *self.inner.sweeper.lock().await = Some(sweeper);

        tracing::info!(node_id = %self.local_node_id(), "protocol started");
        Ok(())
    }

    /// Close every session, stop the link and clear all state.
    ///
    /// No frame is delivered to the application once this returns.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::NotRunning`] if the protocol is not running.
    pub async fn stop(&self) -> Result<(), ProtocolError> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ProtocolError::NotRunning);
        }

        if let Some(sweeper) = self.inner.sweeper.lock().await.take() {
            sweeper.abort();
        }

        let peers: Vec<NodeId> = self.inner.sessions.iter().map(|e| *e.key()).collect();
        for peer in peers {
            tracing::debug!(%peer, "closing session");
            self.close_session(&peer).await;
        }
        self.inner.pending.clear();
        self.inner.link.stop().await;

        tracing::info!(node_id = %self.local_node_id(), "protocol stopped");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Outbound
    // ═══════════════════════════════════════════════════════════════════════

    /// Send frame 0 of a new handshake to `peer`.
    ///
    /// The session is established asynchronously once the response arrives.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::NotRunning`], a CSPRNG failure, or the link's send
    /// failure (in which case nothing stays pending).
    pub async fn initiate_handshake(&self, peer: NodeId) -> Result<(), ProtocolError> {
        if !self.is_running() {
            return Err(ProtocolError::NotRunning);
        }

        let stream_id = HandshakeHandler::new_stream_id()?;
        let (frame, ctx) = self.inner.handshake.create_initiator_frame(&stream_id);
        self.inner.pending.insert(
            stream_id.clone(),
            PendingInitiator {
                peer,
                ctx: Arc::new(ctx),
                created_at: Instant::now(),
            },
        );

        if let Err(e) = self.inner.link.send_frame(&peer, &frame).await {
            self.inner.pending.remove(&stream_id);
            return Err(e.into());
        }
        tracing::debug!(%peer, %stream_id, "handshake initiated");
        Ok(())
    }

    /// Encrypt and send `payload` to `peer` as a DATA frame.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::NoSession`] without a session,
    /// [`ProtocolError::SeqRollover`] when the session had to be closed, or
    /// a link failure.
    pub async fn send(&self, peer: &NodeId, payload: &[u8]) -> Result<(), ProtocolError> {
        self.send_encrypted(peer, FrameType::Data, payload).await
    }

    /// Acknowledge `acked_seq` with an ACK frame carrying it as 4 BE bytes.
    ///
    /// # Errors
    ///
    /// Same as [`StatefulProtocol::send`].
    pub async fn send_ack(&self, peer: &NodeId, acked_seq: u32) -> Result<(), ProtocolError> {
        self.send_encrypted(peer, FrameType::Ack, &acked_seq.to_be_bytes())
            .await
    }

    /// Send CLOSE, forget the session and close the connection.
    ///
    /// Does nothing if there is no session with `peer`.
    pub async fn close_session(&self, peer: &NodeId) {
        let Some((_, mut session)) = self.inner.sessions.remove(peer) else {
            return;
        };
        self.send_close(peer, &mut session).await;
        self.inner.link.close_connection(peer).await;
        tracing::info!(%peer, "session closed");
    }

    async fn send_encrypted(
        &self,
        peer: &NodeId,
        frame_type: FrameType,
        plaintext: &[u8],
    ) -> Result<(), ProtocolError> {
        let (header, key) = match self.allocate(peer, frame_type) {
            Allocation::Ready { header, key } => (header, key),
            Allocation::Missing => return Err(ProtocolError::NoSession(*peer)),
            Allocation::RolledOver(mut session) => {
                tracing::warn!(%peer, "outbound seq near rollover, closing session");
                self.send_close(peer, &mut session).await;
                self.inner.link.close_connection(peer).await;
                return Err(ProtocolError::SeqRollover(*peer));
            }
        };

        let frame = frame_crypto::seal(header, plaintext, &key)?;
        self.inner.link.send_frame(peer, &frame).await?;
        Ok(())
    }

    /// Allocate the next outbound seq, or take the session out of the table
    /// if it has reached the rollover threshold.
    fn allocate(&self, peer: &NodeId, frame_type: FrameType) -> Allocation {
        let Entry::Occupied(mut entry) = self.inner.sessions.entry(*peer) else {
            return Allocation::Missing;
        };
        if entry.get().outbound_exhausted() {
            return Allocation::RolledOver(entry.remove());
        }

        let session = entry.get_mut();
        match session.next_outbound_seq() {
            Some(seq) => Allocation::Ready {
                header: Frame::new(SCHEMA, session.stream_id(), seq, frame_type, Vec::new()),
                key: session.session_key().clone(),
            },
            None => Allocation::RolledOver(entry.remove()),
        }
    }

    /// Best-effort CLOSE on a session already removed from the table.
    async fn send_close(&self, peer: &NodeId, session: &mut SessionState) {
        let Some(seq) = session.next_outbound_seq() else {
            return;
        };
        let header = Frame::new(SCHEMA, session.stream_id(), seq, FrameType::Close, Vec::new());
        match frame_crypto::seal(header, &[], session.session_key()) {
            Ok(frame) => {
                if let Err(e) = self.inner.link.send_frame(peer, &frame).await {
                    tracing::debug!(%peer, error = %e, "failed to send CLOSE");
                }
            }
            Err(e) => tracing::warn!(%peer, error = %e, "failed to seal CLOSE"),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inbound
    // ═══════════════════════════════════════════════════════════════════════

    /// Process one reassembled frame received from `peer`.
    ///
    /// Link adapters reach this through the handler registered in
    /// [`StatefulProtocol::start`]. Invalid frames are dropped silently.
    pub async fn handle_inbound_frame(&self, peer: NodeId, frame: Frame) {
        if !self.is_running() {
            return;
        }
        if frame.schema != SCHEMA {
            tracing::debug!(%peer, schema = frame.schema, "dropping frame with unsupported schema");
            return;
        }

        match frame.frame_type() {
            FrameType::Handshake => self.handle_handshake(peer, frame).await,
            FrameType::Data | FrameType::Ack => self.handle_delivery(peer, frame).await,
            FrameType::Close => self.handle_close(peer, frame).await,
            FrameType::Unknown => self.handle_unknown(peer, &frame),
        }
    }

    async fn handle_delivery(&self, peer: NodeId, mut frame: Frame) {
        let Some((generation, plaintext)) = self.open(&peer, &frame) else {
            return;
        };
        match self.accept_seq(&peer, generation, frame.seq) {
            None => {}
            Some(true) => {
                tracing::warn!(%peer, "inbound seq near rollover, closing session");
                if let Some(mut session) = self.remove_current(&peer, generation) {
                    self.send_close(&peer, &mut session).await;
                    self.inner.link.close_connection(&peer).await;
                }
            }
            Some(false) => {
                frame.payload = plaintext;
                self.inner.app.on_frame(peer, frame).await;
            }
        }
    }

    async fn handle_close(&self, peer: NodeId, frame: Frame) {
        let Some((generation, _)) = self.open(&peer, &frame) else {
            return;
        };
        if self.accept_seq(&peer, generation, frame.seq).is_none() {
            return;
        }
        if self.remove_current(&peer, generation).is_some() {
            self.inner.link.close_connection(&peer).await;
            tracing::info!(%peer, "session closed by peer");
        }
    }

    fn handle_unknown(&self, peer: NodeId, frame: &Frame) {
        let Some((generation, _)) = self.open(&peer, frame) else {
            return;
        };
        if self.accept_seq(&peer, generation, frame.seq).is_some() {
            tracing::debug!(%peer, wire_type = %frame.wire_type, "discarding frame of unknown type");
        }
    }

    /// Check the seq and authenticate the payload. Returns the session
    /// generation the frame was verified against and the plaintext.
    fn open(&self, peer: &NodeId, frame: &Frame) -> Option<(u64, Vec<u8>)> {
        let (key, generation) = {
            let Some(session) = self.inner.sessions.get(peer) else {
                tracing::debug!(%peer, "dropping frame without session");
                return None;
            };
            if !session.is_valid_inbound_seq(frame.seq) {
                tracing::debug!(%peer, seq = frame.seq, "dropping replayed or out-of-order frame");
                return None;
            }
            (session.session_key().clone(), session.generation())
        };

        match frame_crypto::decrypt(frame, &key) {
            Ok(plaintext) => Some((generation, plaintext)),
            Err(_) => {
                tracing::debug!(%peer, seq = frame.seq, "dropping frame that failed authentication");
                None
            }
        }
    }

    /// Re-check and record `seq`. `Some(exhausted)` on acceptance.
    fn accept_seq(&self, peer: &NodeId, generation: u64, seq: u32) -> Option<bool> {
        let mut session = self.inner.sessions.get_mut(peer)?;
        if session.generation() != generation || !session.accept_inbound_seq(seq) {
            tracing::debug!(%peer, seq, "frame lost a race with a concurrent update");
            return None;
        }
        Some(session.inbound_exhausted())
    }

    fn remove_current(&self, peer: &NodeId, generation: u64) -> Option<SessionState> {
        self.inner
            .sessions
            .remove_if(peer, |_, session| session.generation() == generation)
            .map(|(_, session)| session)
    }

    fn insert_session(&self, peer: NodeId, session: SessionState) -> bool {
        match self.inner.sessions.entry(peer) {
            Entry::Vacant(slot) => {
                slot.insert(session);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    fn remove_pending(&self, stream_id: &str, ctx: &Arc<InitiatorContext>) -> bool {
        self.inner
            .pending
            .remove_if(stream_id, |_, pending| Arc::ptr_eq(&pending.ctx, ctx))
            .is_some()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Handshake
    // ═══════════════════════════════════════════════════════════════════════

    async fn handle_handshake(&self, peer: NodeId, frame: Frame) {
        if self.has_session(&peer) {
            tracing::debug!(%peer, "discarding handshake for established session");
            return;
        }

        let pending = self
            .inner
            .pending
            .get(&frame.stream_id)
            .map(|p| (p.peer, p.created_at, Arc::clone(&p.ctx)));
        match pending {
            Some((intended, created_at, ctx)) => {
                self.complete_handshake(peer, &frame, intended, created_at, ctx)
                    .await;
            }
            None => self.respond_to_handshake(peer, &frame).await,
        }
    }

    async fn complete_handshake(
        &self,
        peer: NodeId,
        frame: &Frame,
        intended: NodeId,
        created_at: Instant,
        ctx: Arc<InitiatorContext>,
    ) {
        if peer != intended {
            // Leave the context for the peer we actually contacted
            tracing::warn!(%peer, expected = %intended, "handshake response from unexpected peer");
            self.inner.link.close_connection(&peer).await;
            return;
        }

        if created_at.elapsed() > self.inner.config.handshake_timeout {
            self.remove_pending(&frame.stream_id, &ctx);
            tracing::debug!(%peer, stream_id = %frame.stream_id, "handshake response after timeout");
            self.inner.link.close_connection(&peer).await;
            return;
        }

        let result = self
            .inner
            .handshake
            .complete_initiator_handshake(&ctx, frame);
        let claimed = self.remove_pending(&frame.stream_id, &ctx);

        match result {
            Err(e) => {
                tracing::warn!(%peer, error = %e, "handshake verification failed");
                self.inner.link.close_connection(&peer).await;
            }
            Ok(_) if !claimed => {
                tracing::debug!(%peer, "handshake already completed");
            }
            Ok((verified, _)) if verified != peer => {
                let e = HandshakeError::PeerMismatch {
                    expected: peer,
                    verified,
                };
                tracing::warn!(%peer, error = %e, "handshake rejected");
                self.inner.link.close_connection(&peer).await;
            }
            Ok((_, session)) => {
                if self.insert_session(peer, session) {
                    tracing::info!(%peer, "session established as initiator");
                } else {
                    tracing::debug!(%peer, "session already established, keeping existing");
                }
            }
        }
    }

    async fn respond_to_handshake(&self, peer: NodeId, frame: &Frame) {
        let outcome = match self.inner.handshake.process_initiator_frame(frame) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "handshake verification failed");
                self.inner.link.close_connection(&peer).await;
                return;
            }
        };
        if outcome.peer != peer {
            let e = HandshakeError::PeerMismatch {
                expected: peer,
                verified: outcome.peer,
            };
            tracing::warn!(%peer, error = %e, "handshake rejected");
            self.inner.link.close_connection(&peer).await;
            return;
        }

        // Both sides initiated: the smaller node ID keeps the initiator role
        let contending: Vec<String> = self
            .inner
            .pending
            .iter()
            .filter(|e| e.peer == peer)
            .map(|e| e.key().clone())
            .collect();
        if !contending.is_empty() {
            if self.local_node_id() < peer {
                tracing::debug!(%peer, "simultaneous handshake, keeping initiator role");
                return;
            }
            for stream_id in &contending {
                self.inner.pending.remove(stream_id);
            }
            tracing::debug!(%peer, "simultaneous handshake, yielding to peer");
        }

        if let Err(e) = self.inner.link.send_frame(&peer, &outcome.response).await {
            tracing::warn!(%peer, error = %e, "failed to send handshake response");
            return;
        }
        if self.insert_session(peer, outcome.session) {
            tracing::info!(%peer, "session established as responder");
        } else {
            tracing::debug!(%peer, "session already established, keeping existing");
        }
    }

    /// Drop initiator handshakes older than the configured timeout and close
    /// their connections. Returns how many were dropped.
    ///
    /// Runs periodically while the protocol is started.
    pub async fn evict_expired_handshakes(&self) -> usize {
        let timeout = self.inner.config.handshake_timeout;
        let mut expired = Vec::new();
        self.inner.pending.retain(|stream_id, pending| {
            if pending.created_at.elapsed() > timeout {
                expired.push((stream_id.clone(), pending.peer));
                false
            } else {
                true
            }
        });

        for (stream_id, peer) in &expired {
            tracing::debug!(%peer, %stream_id, "abandoning expired handshake");
            self.inner.link.close_connection(peer).await;
        }
        expired.len()
    }
}

/// Weak handle registered with the link, so the link never keeps the
/// protocol alive.
struct WeakProtocol(Weak<ProtocolInner>);

impl WeakProtocol {
    fn upgrade(&self) -> Option<StatefulProtocol> {
        self.0.upgrade().map(|inner| StatefulProtocol { inner })
    }
}

#[async_trait]
impl FrameHandler for WeakProtocol {
    async fn on_frame(&self, peer: NodeId, frame: Frame) {
        if let Some(protocol) = self.upgrade() {
            protocol.handle_inbound_frame(peer, frame).await;
        }
    }
}

#[async_trait]
impl LinkEvents for WeakProtocol {
    async fn on_connection_established(&self, peer: NodeId) -> Result<(), ProtocolError> {
        match self.upgrade() {
            Some(protocol) => protocol.initiate_handshake(peer).await,
            None => Err(ProtocolError::NotRunning),
        }
    }

    async fn on_peer_disconnected(&self, peer: NodeId) {
        if let Some(protocol) = self.upgrade() {
            protocol.inner.pending.retain(|_, pending| pending.peer != peer);
            protocol.close_session(&peer).await;
        }
    }

    fn has_session(&self, peer: &NodeId) -> bool {
        self.upgrade()
            .is_some_and(|protocol| protocol.has_session(peer))
    }
}
