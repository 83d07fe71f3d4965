//! Two-node test fixture for integration testing
//!
//! Builds a pair of mutually trusting nodes, each a [`StatefulProtocol`]
//! on top of a real link adapter, with decrypted frames collected in an
//! inbox.
//!
//! # Example
//!
//! ```no_run
//! use freepath_integration_tests::fixtures::TwoNodeFixture;
//!
//! #[tokio::test]
//! async fn test_basic_exchange() {
//!     let mut fixture = TwoNodeFixture::memory().await;
//!     fixture.establish().await;
//!
//!     let bob = fixture.bob.node_id();
//!     fixture.alice.protocol.send(&bob, b"hi").await.unwrap();
//!     let (_, frame) = fixture.bob.recv().await.unwrap();
//!     assert_eq!(frame.payload, b"hi");
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use freepath_core::{
    ContactBook, Frame, LinkAdapter, LinkConfig, LocalIdentity, NodeId, ProtocolConfig,
    StatefulProtocol,
};
use freepath_transport::{LanLinkAdapter, MemoryLinkAdapter, MemoryNetwork};
use tokio::sync::mpsc;

/// Upper bound for any single wait in a test
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `cond` until it holds or [`WAIT_TIMEOUT`] elapses.
pub async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Contact book trusting every identity in `identities`.
pub fn contacts_of(identities: &[&LocalIdentity]) -> Arc<ContactBook> {
    let book = ContactBook::new();
    for identity in identities {
        book.add(identity.contact_info());
    }
    Arc::new(book)
}

/// One node under test.
pub struct TestNode<L> {
    /// Long-term keys
    pub identity: Arc<LocalIdentity>,
    /// The node's link adapter
    pub link: L,
    /// Session engine
    pub protocol: StatefulProtocol,
    inbox: mpsc::UnboundedReceiver<(NodeId, Frame)>,
}

impl<L: LinkAdapter + Clone + 'static> TestNode<L> {
    /// Wire a protocol onto `link`.
    pub fn new(identity: Arc<LocalIdentity>, contacts: Arc<ContactBook>, link: L) -> Self {
        Self::with_config(identity, contacts, link, ProtocolConfig::default())
    }

    /// Wire a protocol with a custom configuration onto `link`.
    pub fn with_config(
        identity: Arc<LocalIdentity>,
        contacts: Arc<ContactBook>,
        link: L,
        config: ProtocolConfig,
    ) -> Self {
        let (tx, inbox) = mpsc::unbounded_channel();
        let protocol = StatefulProtocol::with_config(
            identity.clone(),
            contacts,
            Arc::new(link.clone()),
            Arc::new(tx),
            config,
        )
        .expect("valid protocol config");
        Self {
            identity,
            link,
            protocol,
            inbox,
        }
    }
}

impl<L> TestNode<L> {
    /// This node's ID.
    pub fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    /// Next delivered frame, or `None` after [`WAIT_TIMEOUT`].
    pub async fn recv(&mut self) -> Option<(NodeId, Frame)> {
        tokio::time::timeout(WAIT_TIMEOUT, self.inbox.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next delivered frame if one arrives within `wait`.
    pub async fn try_recv_for(&mut self, wait: Duration) -> Option<(NodeId, Frame)> {
        tokio::time::timeout(wait, self.inbox.recv())
            .await
            .ok()
            .flatten()
    }
}

/// A pair of nodes that trust each other.
pub struct TwoNodeFixture<L> {
    /// Node that dials
    pub alice: TestNode<L>,
    /// Node that answers
    pub bob: TestNode<L>,
}

impl<L> TwoNodeFixture<L> {
    /// Wait until both sides hold a session with each other.
    pub async fn wait_for_sessions(&self) -> bool {
        let alice_id = self.alice.node_id();
        let bob_id = self.bob.node_id();
        wait_until(|| {
            self.alice.protocol.has_session(&bob_id) && self.bob.protocol.has_session(&alice_id)
        })
        .await
    }

    /// Stop both protocols.
    pub async fn shutdown(self) {
        let _ = self.alice.protocol.stop().await;
        let _ = self.bob.protocol.stop().await;
    }
}

impl TwoNodeFixture<MemoryLinkAdapter> {
    /// Two started nodes on a fresh in-process network.
    pub async fn memory() -> Self {
        Self::memory_with_config(LinkConfig::default()).await
    }

    /// Two started nodes on a fresh in-process network using `config`.
    pub async fn memory_with_config(config: LinkConfig) -> Self {
        let network = MemoryNetwork::new();
        let (alice, bob) = identities();
        let contacts = contacts_of(&[alice.as_ref(), bob.as_ref()]);

        let node = |identity: &Arc<LocalIdentity>| {
            let link = network
                .adapter(identity.node_id(), config.clone())
                .expect("valid link config");
            let node = TestNode::new(identity.clone(), contacts.clone(), link);
            node.link.set_link_events(node.protocol.link_events());
            node
        };
        let fixture = Self {
            alice: node(&alice),
            bob: node(&bob),
        };
        start_both(&fixture).await;
        fixture
    }

    /// Announce the connection from Alice and wait for both sessions.
    pub async fn establish(&self) {
        self.alice
            .link
            .connect(self.bob.node_id())
            .await
            .expect("memory connect");
        assert!(self.wait_for_sessions().await, "handshake did not complete");
    }
}

impl TwoNodeFixture<LanLinkAdapter> {
    /// Two started nodes listening on loopback.
    pub async fn lan() -> Self {
        let (alice, bob) = identities();
        let contacts = contacts_of(&[alice.as_ref(), bob.as_ref()]);

        let node = |identity: &Arc<LocalIdentity>| {
            let link = LanLinkAdapter::new(
                identity.node_id(),
                "127.0.0.1:0".parse().expect("loopback address"),
                contacts.clone(),
                LinkConfig::default(),
            )
            .expect("valid link config");
            let node = TestNode::new(identity.clone(), contacts.clone(), link);
            node.link.set_link_events(node.protocol.link_events());
            node
        };
        let fixture = Self {
            alice: node(&alice),
            bob: node(&bob),
        };
        start_both(&fixture).await;
        fixture
    }

    /// Dial Bob from Alice and wait for both sessions.
    pub async fn establish(&self) {
        let addr = self.bob.link.local_addr().expect("bob is listening");
        self.alice
            .link
            .connect(self.bob.node_id(), addr)
            .await
            .expect("tcp connect");
        assert!(self.wait_for_sessions().await, "handshake did not complete");
    }
}

fn identities() -> (Arc<LocalIdentity>, Arc<LocalIdentity>) {
    (
        Arc::new(LocalIdentity::generate()),
        Arc::new(LocalIdentity::generate()),
    )
}

async fn start_both<L>(fixture: &TwoNodeFixture<L>) {
    fixture.alice.protocol.start().await.expect("alice starts");
    fixture.bob.protocol.start().await.expect("bob starts");
}
