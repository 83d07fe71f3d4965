//! SHA-256 hashing and HKDF-SHA256 key derivation (RFC 5869).

use hkdf::Hkdf;
use sha2::{Digest, Sha256};

use crate::{CryptoError, SHA256_OUTPUT_SIZE};

/// SHA-256 output (32 bytes).
pub type HashOutput = [u8; SHA256_OUTPUT_SIZE];

/// All-zero salt used by every Freepath key derivation.
pub const ZERO_SALT: [u8; SHA256_OUTPUT_SIZE] = [0u8; SHA256_OUTPUT_SIZE];

/// Compute the SHA-256 hash of input data.
#[must_use]
pub fn sha256(data: &[u8]) -> HashOutput {
    Sha256::digest(data).into()
}

/// HKDF-SHA256 extract-then-expand into `out`.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivationFailed`] if `out` is longer than
/// 255 * 32 bytes.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], out: &mut [u8]) -> Result<(), CryptoError> {
    Hkdf::<Sha256>::new(Some(salt), ikm)
        .expand(info, out)
        .map_err(|_| CryptoError::KeyDerivationFailed)
}

/// Derive a 32-byte key with HKDF-SHA256.
///
/// # Errors
///
/// Propagates [`hkdf_sha256`] failures; a 32-byte output is always in range.
pub fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut out = [0u8; 32];
    hkdf_sha256(ikm, salt, info, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hkdf_rfc5869_case1() {
        let ikm = [0x0bu8; 22];
        let salt = hex::decode("000102030405060708090a0b0c").unwrap();
        let info = hex::decode("f0f1f2f3f4f5f6f7f8f9").unwrap();

        let mut okm = [0u8; 42];
        hkdf_sha256(&ikm, &salt, &info, &mut okm).unwrap();
        assert_eq!(
            hex::encode(okm),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865"
        );
    }

    #[test]
    fn test_derive_key_is_hkdf_prefix() {
        let mut long = [0u8; 64];
        hkdf_sha256(b"ikm", &ZERO_SALT, b"info", &mut long).unwrap();
        assert_eq!(derive_key(b"ikm", &ZERO_SALT, b"info").unwrap(), long[..32]);
    }

    #[test]
    fn test_derive_key_info_separation() {
        assert_ne!(
            derive_key(b"ikm", &ZERO_SALT, b"a").unwrap(),
            derive_key(b"ikm", &ZERO_SALT, b"b").unwrap()
        );
    }

    #[test]
    fn test_hkdf_output_too_long() {
        let mut out = vec![0u8; 255 * 32 + 1];
        assert_eq!(
            hkdf_sha256(b"ikm", &ZERO_SALT, b"", &mut out),
            Err(CryptoError::KeyDerivationFailed)
        );
    }
}
