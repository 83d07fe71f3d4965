//! Seams between the protocol layer, the physical link and the application.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{LinkError, ProtocolError};
use crate::frame::Frame;
use crate::identity::NodeId;

/// Receives frames, either from a link adapter (inbound, still encrypted)
/// or from the protocol engine (delivered, decrypted).
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Handle one frame from `peer`.
    async fn on_frame(&self, peer: NodeId, frame: Frame);
}

#[async_trait]
impl FrameHandler for mpsc::Sender<(NodeId, Frame)> {
    async fn on_frame(&self, peer: NodeId, frame: Frame) {
        if self.send((peer, frame)).await.is_err() {
            tracing::debug!(%peer, "frame receiver dropped");
        }
    }
}

#[async_trait]
impl FrameHandler for mpsc::UnboundedSender<(NodeId, Frame)> {
    async fn on_frame(&self, peer: NodeId, frame: Frame) {
        if self.send((peer, frame)).is_err() {
            tracing::debug!(%peer, "frame receiver dropped");
        }
    }
}

/// Physical transport abstraction.
///
/// Adapters fragment outbound frames to their MTU, reassemble inbound
/// packets, and never encrypt. No frame may reach the inbound handler
/// before [`LinkAdapter::start`] or after [`LinkAdapter::stop`] returns.
#[async_trait]
pub trait LinkAdapter: Send + Sync {
    /// Register the handler for reassembled inbound frames. Call before `start`.
    fn set_inbound_frame_handler(&self, handler: Arc<dyn FrameHandler>);

    /// Bind, listen and begin accepting connections.
    async fn start(&self) -> Result<(), LinkError>;

    /// Tear down every connection and release resources.
    async fn stop(&self);

    /// Close the connection to `peer`, if any.
    async fn close_connection(&self, peer: &NodeId);

    /// Fragment and transmit `frame` to `peer`.
    async fn send_frame(&self, peer: &NodeId, frame: &Frame) -> Result<(), LinkError>;
}

/// Connection lifecycle notifications from a link adapter.
#[async_trait]
pub trait LinkEvents: Send + Sync {
    /// An outbound connection to `peer` has been registered. Returning an
    /// error makes the adapter drop the connection.
    async fn on_connection_established(&self, peer: NodeId) -> Result<(), ProtocolError>;

    /// The registered connection to `peer` has gone away.
    async fn on_peer_disconnected(&self, peer: NodeId);

    /// Whether an authenticated session with `peer` is established.
    ///
    /// Adapters must not let an unverified connection replace the one such
    /// a session runs over.
    fn has_session(&self, _peer: &NodeId) -> bool {
        false
    }
}
