//! # Freepath Core
//!
//! Protocol layer of the Freepath peer-to-peer secure transport.
//!
//! This crate provides:
//! - Wire envelope, link packet and frame codecs
//! - Fragmentation and bounded reassembly
//! - Per-frame AEAD with header-bound associated data
//! - The two-message mutually authenticated handshake
//! - The stateful session engine ([`StatefulProtocol`])
//! - Sessionless envelopes for one-way or relayed delivery
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Application (FrameHandler)                  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     StatefulProtocol                            │
//! │   (handshake, seq allocation, replay checks, rollover)          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     Frames + frame_crypto                       │
//! │   (JSON records, ChaCha20-Poly1305 over header-derived AAD)     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     LinkAdapter                                 │
//! │   (fragmentation, reassembly, "FREE" wire envelopes)            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Stateless envelopes ([`envelope`]) bypass the session engine entirely.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod base58;
pub mod binary;
pub mod config;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod frame_crypto;
pub mod handshake;
pub mod identity;
pub mod link;
pub mod packet;
pub mod protocol;
pub mod session;
pub mod wire;

pub use config::{LinkConfig, ProtocolConfig};
pub use envelope::{Fragment, StatelessEnvelope};
pub use error::{
    Base58Error, CodecError, ConfigError, EnvelopeError, Error, HandshakeError, LinkError,
    ProtocolError, Result,
};
pub use frame::{Frame, FrameType};
pub use handshake::HandshakeHandler;
pub use identity::{ContactBook, ContactInfo, ContactLookup, LocalIdentity, NodeId};
pub use link::{FrameHandler, LinkAdapter, LinkEvents};
pub use packet::{LinkAdapterPacket, Reassembler};
pub use protocol::StatefulProtocol;
pub use session::SessionState;
