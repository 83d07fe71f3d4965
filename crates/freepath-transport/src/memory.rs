//! In-process link adapters joined by a shared [`MemoryNetwork`].
//!
//! Frames still take the full byte path: JSON, fragmentation to the MTU,
//! wire envelopes, header checks and reassembly. Each adapter processes its
//! inbound queue on a single task, so frames between two nodes arrive in
//! send order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use freepath_core::LinkConfig;
use freepath_core::error::{ConfigError, LinkError};
use freepath_core::frame::{Frame, FrameType};
use freepath_core::identity::NodeId;
use freepath_core::link::{FrameHandler, LinkAdapter, LinkEvents};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::codec::{self, DecodeOutcome, FrameDecoder};
use crate::slot::Slot;

#[derive(Debug)]
enum Delivery {
    Envelope { from: NodeId, bytes: Vec<u8> },
    /// The remote end closed its side of the virtual connection
    Disconnect { from: NodeId },
    /// Drop local state for `peer` without reporting it
    Forget { peer: NodeId },
}

/// Switchboard shared by every memory adapter.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<DashMap<NodeId, mpsc::UnboundedSender<Delivery>>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an adapter for `local_id` on this network.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` does not validate.
    pub fn adapter(
        &self,
        local_id: NodeId,
        config: LinkConfig,
    ) -> Result<MemoryLinkAdapter, ConfigError> {
        config.validate()?;
        Ok(MemoryLinkAdapter {
            inner: Arc::new(MemoryInner {
                local_id,
                network: self.clone(),
                config,
                handler: Slot::empty(),
                events: Slot::empty(),
                inbox: Slot::empty(),
                running: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        })
    }

    /// Whether a started adapter is attached for `node_id`.
    #[must_use]
    pub fn is_attached(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    fn route(&self, to: &NodeId, delivery: Delivery) -> bool {
        self.nodes
            .get(to)
            .is_some_and(|inbox| inbox.send(delivery).is_ok())
    }
}

struct MemoryInner {
    local_id: NodeId,
    network: MemoryNetwork,
    config: LinkConfig,
    handler: Slot<Arc<dyn FrameHandler>>,
    events: Slot<Arc<dyn LinkEvents>>,
    inbox: Slot<mpsc::UnboundedSender<Delivery>>,
    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// [`LinkAdapter`] attached to a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryLinkAdapter {
    inner: Arc<MemoryInner>,
}

impl std::fmt::Debug for MemoryLinkAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLinkAdapter")
            .field("local_id", &self.inner.local_id)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

struct PeerState {
    decoder: FrameDecoder,
    established: bool,
}

impl MemoryLinkAdapter {
    /// Register the connection lifecycle sink.
    pub fn set_link_events(&self, events: Arc<dyn LinkEvents>) {
        self.inner.events.set(Some(events));
    }

    /// Whether the adapter is attached and delivering.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Announce a connection to `peer`, as a dialing adapter would.
    ///
    /// # Errors
    ///
    /// [`LinkError::NotStarted`], or [`LinkError::NotConnected`] if `peer`
    /// is not attached to the network.
    pub async fn connect(&self, peer: NodeId) -> Result<(), LinkError> {
        if !self.is_running() {
            return Err(LinkError::NotStarted);
        }
        if !self.inner.network.is_attached(&peer) {
            return Err(LinkError::NotConnected(peer));
        }
        if let Some(events) = self.inner.events.get() {
            if let Err(e) = events.on_connection_established(peer).await {
                tracing::warn!(%peer, error = %e, "connection setup failed");
                self.close_connection(&peer).await;
            }
        }
        Ok(())
    }

    async fn run(&self, mut inbox: mpsc::UnboundedReceiver<Delivery>) {
        let mut peers: HashMap<NodeId, PeerState> = HashMap::new();
        while let Some(delivery) = inbox.recv().await {
            match delivery {
                Delivery::Envelope { from, bytes } => {
                    if let Some(frame) = self.accept_envelope(&mut peers, from, &bytes) {
                        self.deliver(from, frame).await;
                    }
                }
                Delivery::Disconnect { from } => {
                    peers.remove(&from);
                    if self.is_running() {
                        tracing::info!(peer = %from, "peer disconnected");
                        if let Some(events) = self.inner.events.get() {
                            events.on_peer_disconnected(from).await;
                        }
                    }
                }
                Delivery::Forget { peer } => {
                    peers.remove(&peer);
                }
            }
        }
    }

    fn accept_envelope(
        &self,
        peers: &mut HashMap<NodeId, PeerState>,
        from: NodeId,
        bytes: &[u8],
    ) -> Option<Frame> {
        let state = peers.entry(from).or_insert_with(|| PeerState {
            decoder: FrameDecoder::new(&self.inner.config),
            established: false,
        });

        let frame = match state.decoder.push_envelope(bytes) {
            Ok(DecodeOutcome::Frame(frame)) => frame,
            Ok(DecodeOutcome::Pending) => return None,
            Ok(DecodeOutcome::Dropped(e)) => {
                tracing::debug!(peer = %from, error = %e, "dropping malformed frame");
                return None;
            }
            Err(e) => {
                tracing::debug!(peer = %from, error = %e, "closing connection on bad envelope");
                self.drop_peer(peers, from);
                return None;
            }
        };

        if !state.established {
            if frame.frame_type() != FrameType::Handshake {
                tracing::debug!(peer = %from, "first frame is not a handshake");
                self.drop_peer(peers, from);
                return None;
            }
            state.established = true;
        }
        Some(frame)
    }

    fn drop_peer(&self, peers: &mut HashMap<NodeId, PeerState>, peer: NodeId) {
        peers.remove(&peer);
        self.inner.network.route(
            &peer,
            Delivery::Disconnect {
                from: self.inner.local_id,
            },
        );
    }

    async fn deliver(&self, peer: NodeId, frame: Frame) {
        if !self.is_running() {
            return;
        }
        if let Some(handler) = self.inner.handler.get() {
            handler.on_frame(peer, frame).await;
        }
    }
}

#[async_trait]
impl LinkAdapter for MemoryLinkAdapter {
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

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .network
            .nodes
            .insert(self.inner.local_id, tx.clone());
        self.inner.inbox.set(Some(tx));

        let adapter = self.clone();
        let task = tokio::spawn(async move {
            adapter.run(rx).await;
        });
        *self.inner.task.lock().await = Some(task);
        tracing::debug!(node_id = %self.inner.local_id, "memory link attached");
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

        self.inner.network.nodes.remove(&self.inner.local_id);
        self.inner.inbox.set(None);
        if let Some(task) = self.inner.task.lock().await.take() {
            task.abort();
        }
        tracing::debug!(node_id = %self.inner.local_id, "memory link detached");
    }

    async fn close_connection(&self, peer: &NodeId) {
        if let Some(inbox) = self.inner.inbox.get() {
            let _ = inbox.send(Delivery::Forget { peer: *peer });
        }
        self.inner.network.route(
            peer,
            Delivery::Disconnect {
                from: self.inner.local_id,
            },
        );
    }

    async fn send_frame(&self, peer: &NodeId, frame: &Frame) -> Result<(), LinkError> {
        if !self.is_running() {
            return Err(LinkError::NotStarted);
        }
        if !self.inner.network.is_attached(peer) {
            return Err(LinkError::NotConnected(*peer));
        }

        for bytes in codec::encode_frame(frame, self.inner.config.mtu)? {
            let delivery = Delivery::Envelope {
                from: self.inner.local_id,
                bytes,
            };
            if !self.inner.network.route(peer, delivery) {
                return Err(LinkError::ConnectionClosed);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use freepath_core::error::ProtocolError;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    struct Node {
        id: NodeId,
        adapter: MemoryLinkAdapter,
        frames: mpsc::UnboundedReceiver<(NodeId, Frame)>,
        events: mpsc::UnboundedReceiver<(&'static str, NodeId)>,
    }

    struct RecordingEvents(mpsc::UnboundedSender<(&'static str, NodeId)>);

    #[async_trait]
    impl LinkEvents for RecordingEvents {
        async fn on_connection_established(&self, peer: NodeId) -> Result<(), ProtocolError> {
            let _ = self.0.send(("established", peer));
            Ok(())
        }

        async fn on_peer_disconnected(&self, peer: NodeId) {
            let _ = self.0.send(("disconnected", peer));
        }
    }

    async fn node(network: &MemoryNetwork, byte: u8, config: LinkConfig) -> Node {
        let id = NodeId::from_bytes([byte; 16]);
        let adapter = network.adapter(id, config).unwrap();
        let (frame_tx, frames) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        adapter.set_inbound_frame_handler(Arc::new(frame_tx));
        adapter.set_link_events(Arc::new(RecordingEvents(event_tx)));
        adapter.start().await.unwrap();
        Node {
            id,
            adapter,
            frames,
            events,
        }
    }

    fn handshake_from(id: &NodeId) -> Frame {
        let mut payload = vec![0u8; 144];
        payload[64..80].copy_from_slice(id.as_bytes());
        Frame::new(1, "s", 0, FrameType::Handshake, payload)
    }

    async fn recv_frame(node: &mut Node) -> (NodeId, Frame) {
        tokio::time::timeout(WAIT, node.frames.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order_across_fragments() {
        let network = MemoryNetwork::new();
        let config = LinkConfig {
            mtu: 16,
            ..LinkConfig::default()
        };
        let a = node(&network, 1, config.clone()).await;
        let mut b = node(&network, 2, config).await;

        let hello = handshake_from(&a.id);
        let data = Frame::new(1, "s", 1, FrameType::Data, vec![3; 300]);
        a.adapter.send_frame(&b.id, &hello).await.unwrap();
        a.adapter.send_frame(&b.id, &data).await.unwrap();

        assert_eq!(recv_frame(&mut b).await, (a.id, hello));
        assert_eq!(recv_frame(&mut b).await, (a.id, data));
    }

    #[tokio::test]
    async fn test_first_frame_must_be_handshake() {
        let network = MemoryNetwork::new();
        let mut a = node(&network, 1, LinkConfig::default()).await;
        let mut b = node(&network, 2, LinkConfig::default()).await;

        let data = Frame::new(1, "s", 0, FrameType::Data, b"early".to_vec());
        a.adapter.send_frame(&b.id, &data).await.unwrap();
        a.adapter.send_frame(&b.id, &handshake_from(&a.id)).await.unwrap();

        // Only the handshake, on the fresh connection, gets through
        let (_, frame) = recv_frame(&mut b).await;
        assert_eq!(frame.frame_type(), FrameType::Handshake);
        assert!(b.frames.try_recv().is_err());
        let event = tokio::time::timeout(WAIT, a.events.recv()).await.unwrap();
        assert_eq!(event, Some(("disconnected", b.id)));
    }

    #[tokio::test]
    async fn test_send_to_detached_peer_fails() {
        let network = MemoryNetwork::new();
        let a = node(&network, 1, LinkConfig::default()).await;
        let ghost = NodeId::from_bytes([9u8; 16]);
        assert!(matches!(
            a.adapter.send_frame(&ghost, &handshake_from(&a.id)).await,
            Err(LinkError::NotConnected(_))
        ));
        assert!(matches!(
            a.adapter.connect(ghost).await,
            Err(LinkError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_reports_established() {
        let network = MemoryNetwork::new();
        let mut a = node(&network, 1, LinkConfig::default()).await;
        let b = node(&network, 2, LinkConfig::default()).await;
        a.adapter.connect(b.id).await.unwrap();
        assert_eq!(a.events.recv().await, Some(("established", b.id)));
    }

    #[tokio::test]
    async fn test_close_connection_notifies_remote() {
        let network = MemoryNetwork::new();
        let mut a = node(&network, 1, LinkConfig::default()).await;
        let mut b = node(&network, 2, LinkConfig::default()).await;
        a.adapter.send_frame(&b.id, &handshake_from(&a.id)).await.unwrap();
        recv_frame(&mut b).await;
        b.adapter.send_frame(&a.id, &handshake_from(&b.id)).await.unwrap();
        recv_frame(&mut a).await;

        a.adapter.close_connection(&b.id).await;
        let event = tokio::time::timeout(WAIT, b.events.recv()).await.unwrap();
        assert_eq!(event, Some(("disconnected", a.id)));
    }

    #[tokio::test]
    async fn test_stop_detaches() {
        let network = MemoryNetwork::new();
        let a = node(&network, 1, LinkConfig::default()).await;
        let b = node(&network, 2, LinkConfig::default()).await;
        b.adapter.stop().await;
        assert!(!network.is_attached(&b.id));
        assert!(matches!(
            a.adapter.send_frame(&b.id, &handshake_from(&a.id)).await,
            Err(LinkError::NotConnected(_))
        ));
        assert!(matches!(
            b.adapter.send_frame(&a.id, &handshake_from(&b.id)).await,
            Err(LinkError::NotStarted)
        ));
    }
}
