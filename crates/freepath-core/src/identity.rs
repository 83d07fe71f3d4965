//! Node identity: node IDs, the local key bundle and trusted contacts.

use std::fmt;
use std::str::FromStr;

use dashmap::DashMap;
use freepath_crypto::hash::sha256;
use freepath_crypto::signatures::{SigningKey, VerifyingKey};
use freepath_crypto::x25519;
use rand_core::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::base58;
use crate::error::Base58Error;

/// Raw node ID size in bytes
pub const NODE_ID_SIZE: usize = 16;

/// 16-byte node identifier: `SHA-256(ed25519_public)[0..16]`.
///
/// Displayed and parsed as Base58. Ordering compares the Base58 text, so
/// tie-breaks agree with peers that order node IDs as strings; it differs
/// from raw byte order when the encodings have different lengths.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    /// Wrap raw node ID bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; NODE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Wrap a raw node ID slice, returning `None` unless it is 16 bytes.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        slice.try_into().ok().map(Self)
    }

    /// Derive the node ID bound to an Ed25519 public key.
    #[must_use]
    pub fn from_sig_key(key: &VerifyingKey) -> Self {
        let digest = sha256(key.as_bytes());
        let mut id = [0u8; NODE_ID_SIZE];
        id.copy_from_slice(&digest[..NODE_ID_SIZE]);
        Self(id)
    }

    /// Raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    /// Base58 text form.
    #[must_use]
    pub fn to_base58(&self) -> String {
        base58::encode(&self.0)
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        if self.0 == other.0 {
            return std::cmp::Ordering::Equal;
        }
        self.to_base58().cmp(&other.to_base58())
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

impl FromStr for NodeId {
    type Err = Base58Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = base58::decode(s)?;
        Self::from_slice(&raw).ok_or(Base58Error::InvalidLength {
            expected: NODE_ID_SIZE,
            actual: raw.len(),
        })
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// The local node's long-term keys.
///
/// Created once at startup. Equality is by node ID.
#[derive(Clone)]
pub struct LocalIdentity {
    node_id: NodeId,
    sig_key: SigningKey,
    enc_key: x25519::PrivateKey,
}

impl LocalIdentity {
    /// Generate fresh Ed25519 and X25519 key pairs.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_keys(
            SigningKey::generate(&mut OsRng),
            x25519::PrivateKey::generate(&mut OsRng),
        )
    }

    /// Restore an identity from its secret key material.
    #[must_use]
    pub fn from_secret_keys(sig_seed: &[u8; 32], enc_secret: [u8; 32]) -> Self {
        Self::from_keys(
            SigningKey::from_bytes(sig_seed),
            x25519::PrivateKey::from_bytes(enc_secret),
        )
    }

    fn from_keys(sig_key: SigningKey, enc_key: x25519::PrivateKey) -> Self {
        let node_id = NodeId::from_sig_key(&sig_key.verifying_key());
        Self {
            node_id,
            sig_key,
            enc_key,
        }
    }

    /// Node ID derived from the signing key.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Ed25519 signing key.
    #[must_use]
    pub fn signing_key(&self) -> &SigningKey {
        &self.sig_key
    }

    /// Ed25519 public key.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.sig_key.verifying_key()
    }

    /// X25519 private key used for stateless envelopes.
    #[must_use]
    pub fn enc_key(&self) -> &x25519::PrivateKey {
        &self.enc_key
    }

    /// X25519 public key used for stateless envelopes.
    #[must_use]
    pub fn enc_public(&self) -> x25519::PublicKey {
        self.enc_key.public_key()
    }

    /// Public half of this identity, as a contact would store it.
    #[must_use]
    pub fn contact_info(&self) -> ContactInfo {
        ContactInfo {
            sig_key_public: self.verifying_key(),
            enc_key_public: self.enc_public(),
        }
    }
}

impl PartialEq for LocalIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for LocalIdentity {}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// Verified public keys of a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContactInfo {
    /// Ed25519 public key
    pub sig_key_public: VerifyingKey,
    /// X25519 public key
    pub enc_key_public: x25519::PublicKey,
}

impl ContactInfo {
    /// Node ID bound to this contact's signing key.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        NodeId::from_sig_key(&self.sig_key_public)
    }
}

/// Source of trusted contact keys.
///
/// The handshake and the stateless envelope codec only ever trust keys
/// returned here, never keys asserted by the peer.
pub trait ContactLookup: Send + Sync {
    /// Trusted keys for `node_id`, if it is a known contact.
    fn contact(&self, node_id: &NodeId) -> Option<ContactInfo>;

    /// Trusted Ed25519 key for `node_id`.
    fn sig_key(&self, node_id: &NodeId) -> Option<VerifyingKey> {
        self.contact(node_id).map(|c| c.sig_key_public)
    }
}

/// Concurrent in-memory contact list.
#[derive(Debug, Default)]
pub struct ContactBook {
    contacts: DashMap<NodeId, ContactInfo>,
}

impl ContactBook {
    /// Create an empty contact book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a contact keyed by the node ID derived from its signing key.
    pub fn add(&self, info: ContactInfo) -> NodeId {
        let node_id = info.node_id();
        self.contacts.insert(node_id, info);
        node_id
    }

    /// Remove a contact.
    pub fn remove(&self, node_id: &NodeId) -> Option<ContactInfo> {
        self.contacts.remove(node_id).map(|(_, info)| info)
    }

    /// Whether `node_id` is a known contact.
    #[must_use]
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.contacts.contains_key(node_id)
    }

    /// Number of contacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    /// Whether the book is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}

impl ContactLookup for ContactBook {
    fn contact(&self, node_id: &NodeId) -> Option<ContactInfo> {
        self.contacts.get(node_id).map(|entry| *entry.value())
    }
}
