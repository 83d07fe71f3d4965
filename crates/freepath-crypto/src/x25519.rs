//! X25519 key agreement.
//!
//! Long-term encryption keys seal stateless envelopes; handshakes use a
//! fresh ephemeral pair per stream. Agreement with a low-order point yields
//! the all-zero secret and is refused.

use rand_core::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{CryptoError, X25519_KEY_SIZE};

/// Secret half of an X25519 key pair.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey(x25519_dalek::StaticSecret);

/// Public half of an X25519 key pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PublicKey(x25519_dalek::PublicKey);

/// Raw agreement output. Only ever used as HKDF input keying material.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(x25519_dalek::SharedSecret);

impl PrivateKey {
    /// Fresh clamped secret from `rng`.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(rng))
    }

    /// Rebuild a secret from its stored scalar.
    #[must_use]
    pub fn from_bytes(scalar: [u8; X25519_KEY_SIZE]) -> Self {
        Self(scalar.into())
    }

    /// Stored scalar, for writing an identity to disk.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; X25519_KEY_SIZE] {
        self.0.to_bytes()
    }

    /// Matching public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey((&self.0).into())
    }

    /// Agree on a shared secret with `peer`.
    ///
    /// # Errors
    ///
    /// [`CryptoError::LowOrderPoint`] when `peer` forces the all-zero output.
    pub fn exchange(&self, peer: &PublicKey) -> Result<SharedSecret, CryptoError> {
        let shared = self.0.diffie_hellman(&peer.0);
        if shared.was_contributory() {
            Ok(SharedSecret(shared))
        } else {
            Err(CryptoError::LowOrderPoint)
        }
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PrivateKey").finish_non_exhaustive()
    }
}

impl PublicKey {
    /// Wrap raw key bytes. Every 32-byte string is a valid u-coordinate.
    #[must_use]
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self(bytes.into())
    }

    /// Parse a key from a length-checked slice.
    ///
    /// # Errors
    ///
    /// [`CryptoError::InvalidKeyLength`] unless `slice` is 32 bytes long.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        <[u8; X25519_KEY_SIZE]>::try_from(slice)
            .map(Self::from_bytes)
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: X25519_KEY_SIZE,
                actual: slice.len(),
            })
    }

    /// Owned copy of the key bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; X25519_KEY_SIZE] {
        self.0.to_bytes()
    }

    /// Borrowed key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        self.0.as_bytes()
    }
}

impl SharedSecret {
    /// Raw secret bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        self.0.as_bytes()
    }
}
