//! Error types for the Freepath core protocol.

use thiserror::Error;

use crate::identity::NodeId;
use freepath_crypto::CryptoError;

/// Core protocol errors
#[derive(Debug, Error)]
pub enum Error {
    /// Structural or decoding error
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Base58 decoding error
    #[error("base58 error: {0}")]
    Base58(#[from] Base58Error),

    /// Handshake verification error
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Stateless envelope rejection
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Link adapter error
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// Session management error
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Invalid configuration
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Configuration validation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A value is outside its allowed range
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: &'static str,
    },
}

/// Structural and decoding errors for every byte-level codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer too short to parse
    #[error("buffer too short: expected at least {expected}, got {actual}")]
    Truncated {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Magic bytes did not match "FREE"
    #[error("invalid magic bytes: not a Freepath connection")]
    BadMagic,

    /// Wire version other than the supported one
    #[error("unsupported wire version: {0}")]
    UnsupportedVersion(u8),

    /// Unknown wire type code
    #[error("unknown wire type code: 0x{0:02X}")]
    UnknownTypeCode(u8),

    /// Payload length over the allowed maximum
    #[error("payload length {len} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Offending length
        len: usize,
        /// Allowed maximum
        max: usize,
    },

    /// UNKNOWN frame types have no wire type code
    #[error("cannot encode frame type {0:?} onto the wire")]
    UnencodableType(String),

    /// Frame type string longer than 255 bytes
    #[error("frame type string is {0} bytes, maximum is 255")]
    TypeTooLong(usize),

    /// Fragment count of zero or above the maximum
    #[error("invalid fragment count: {0}")]
    InvalidFragmentCount(u16),

    /// Fragment index not below the fragment count
    #[error("fragment index {index} out of range for fragment count {count}")]
    FragmentIndexOutOfRange {
        /// Fragment index
        index: u16,
        /// Fragment count
        count: u16,
    },

    /// Frame would need more fragments than allowed
    #[error("frame needs {needed} fragments, maximum is {max}")]
    TooManyFragments {
        /// Fragments required
        needed: usize,
        /// Allowed maximum
        max: usize,
    },

    /// MTU of zero
    #[error("mtu must be greater than zero")]
    ZeroMtu,

    /// Malformed JSON
    #[error("malformed json: {0}")]
    Json(String),
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// Base58 decoding errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Base58Error {
    /// Character outside the Bitcoin alphabet
    #[error("illegal character {character:?} at {position}")]
    InvalidCharacter {
        /// Offending character
        character: char,
        /// Character position in the input
        position: usize,
    },

    /// Decoded value has the wrong length for the target type
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },
}

/// Handshake verification failures. Every variant aborts the handshake.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Payload is not exactly 144 bytes
    #[error("invalid handshake payload size: {0}")]
    InvalidPayloadSize(usize),

    /// Claimed node ID is not in the contact lookup
    #[error("unknown peer node id")]
    UnknownPeer,

    /// Embedded signing key differs from the trusted key
    #[error("received signing key does not match contact list")]
    SigningKeyMismatch,

    /// Signature did not verify under the trusted key
    #[error("handshake signature verification failed")]
    BadSignature,

    /// X25519 produced an all-zero shared secret
    #[error("low-order point: all-zero shared secret")]
    LowOrderPoint,

    /// Verified node ID differs from the expected peer
    #[error("verified peer {verified} does not match expected peer {expected}")]
    PeerMismatch {
        /// Peer the connection layer intended to reach
        expected: NodeId,
        /// Peer recovered from the handshake
        verified: NodeId,
    },

    /// Cryptographic primitive failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Stateless envelope rejections, one per failed check.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Schema is not supported
    #[error("unsupported schema: {0}")]
    UnsupportedSchema(i32),

    /// Fragment count below one
    #[error("invalid fragment count: {0}")]
    InvalidFragmentCount(i32),

    /// Fragment index outside `0..fragment_count`
    #[error("fragment index {index} out of range for fragment count {count}")]
    FragmentIndexOutOfRange {
        /// Fragment index
        index: i32,
        /// Fragment count
        count: i32,
    },

    /// Receiver ID is not valid Base58 node ID text
    #[error("invalid receiver id encoding")]
    InvalidReceiverId,

    /// Receiver ID is not the local node
    #[error("envelope receiver id does not match local node id")]
    ReceiverMismatch,

    /// Sender ID is not valid Base58 node ID text
    #[error("invalid sender id encoding")]
    InvalidSenderId,

    /// Sender is not in the contact lookup
    #[error("unknown sender node id")]
    UnknownSender,

    /// Field is not valid Base64
    #[error("invalid {0} encoding")]
    InvalidBase64(&'static str),

    /// Nonce is not 12 bytes
    #[error("nonce must be 12 bytes, got {0}")]
    InvalidNonceLength(usize),

    /// Signature did not verify under the sender's trusted key
    #[error("signature verification failed")]
    BadSignature,

    /// X25519 produced an all-zero shared secret
    #[error("low-order point: all-zero shared secret")]
    LowOrderPoint,

    /// AEAD encryption or decryption failed
    #[error("aead operation failed")]
    Aead,
}

/// Link adapter errors
#[derive(Debug, Error)]
pub enum LinkError {
    /// Adapter has not been started, or has been stopped
    #[error("link adapter not started")]
    NotStarted,

    /// Adapter is already running
    #[error("link adapter already started")]
    AlreadyStarted,

    /// No connection to the peer
    #[error("not connected to peer {0}")]
    NotConnected(NodeId),

    /// Connection closed while in use
    #[error("connection closed")]
    ConnectionClosed,

    /// Socket-level failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding failure while framing an outbound frame
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Caller-visible session management failures
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// No active session for the peer
    #[error("no active session for peer {0}")]
    NoSession(NodeId),

    /// Outbound seq reached the rollover threshold; the session was closed
    #[error("session seq near rollover for peer {0}; session closed, initiate a new handshake")]
    SeqRollover(NodeId),

    /// `start` called twice
    #[error("protocol already running")]
    AlreadyRunning,

    /// Operation requires a running protocol
    #[error("protocol not running")]
    NotRunning,

    /// Handshake could not be started
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Link adapter failure
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// Cryptographic failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Encoding failure
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_error_display() {
        let err = CodecError::PayloadTooLarge { len: 20, max: 10 };
        assert_eq!(err.to_string(), "payload length 20 exceeds maximum 10");
    }

    #[test]
    fn test_envelope_error_names_field() {
        assert_eq!(
            EnvelopeError::InvalidBase64("nonce").to_string(),
            "invalid nonce encoding"
        );
    }

    #[test]
    fn test_error_from_conversions() {
        let err: Error = CodecError::BadMagic.into();
        assert!(matches!(err, Error::Codec(CodecError::BadMagic)));

        let err: Error = HandshakeError::UnknownPeer.into();
        assert!(matches!(err, Error::Handshake(HandshakeError::UnknownPeer)));
    }
}
