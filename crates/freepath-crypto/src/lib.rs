//! # Freepath Crypto
//!
//! Cryptographic primitives for the Freepath protocol.
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Identity / Signatures | Ed25519 | 128-bit |
//! | Key Exchange | X25519 | 128-bit |
//! | KDF | HKDF-SHA256 | 128-bit |
//! | AEAD | ChaCha20-Poly1305 (IETF) | 256-bit key |
//! | Hash | SHA-256 | 128-bit collision |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod error;
pub mod hash;
pub mod random;
pub mod signatures;
pub mod x25519;

pub use error::CryptoError;

/// X25519 key and shared-secret size
pub const X25519_KEY_SIZE: usize = 32;

/// Ed25519 seed and verifying key size
pub const ED25519_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;

/// SHA-256 digest size, also the HKDF-SHA256 salt size
pub const SHA256_OUTPUT_SIZE: usize = 32;
