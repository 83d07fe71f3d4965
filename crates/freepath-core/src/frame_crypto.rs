//! Per-frame AEAD: nonce and associated data derived from the frame header.
//!
//! - nonce = 8 zero bytes ‖ seq (4 BE)
//! - aad = schema (4 BE) ‖ seq (4 BE) ‖ len(type) (1) ‖ type ‖ stream id
//!
//! The raw `type` string is used, so frames of types this node does not
//! recognise still authenticate. The payload is not part of the AAD.

use freepath_crypto::CryptoError;
use freepath_crypto::aead::{AeadKey, Nonce};

use crate::binary::{put_i32, put_u32};
use crate::error::CodecError;
use crate::frame::Frame;

/// Associated data for `frame`.
///
/// # Errors
///
/// Returns [`CodecError::TypeTooLong`] if the type string exceeds 255 bytes.
pub fn build_aad(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let wire_type = frame.wire_type.as_bytes();
    let type_len =
        u8::try_from(wire_type.len()).map_err(|_| CodecError::TypeTooLong(wire_type.len()))?;

    let mut aad = Vec::with_capacity(4 + 4 + 1 + wire_type.len() + frame.stream_id.len());
    put_i32(&mut aad, frame.schema);
    put_u32(&mut aad, frame.seq);
    aad.push(type_len);
    aad.extend_from_slice(wire_type);
    aad.extend_from_slice(frame.stream_id.as_bytes());
    Ok(aad)
}

/// Encrypt `plaintext` under the header fields of `frame`.
///
/// `frame.payload` is ignored.
///
/// # Errors
///
/// Returns [`CryptoError::EncryptionFailed`] on failure, including an
/// over-long type string.
pub fn encrypt(plaintext: &[u8], frame: &Frame, key: &AeadKey) -> Result<Vec<u8>, CryptoError> {
    let aad = build_aad(frame).map_err(|_| CryptoError::EncryptionFailed)?;
    key.encrypt(&Nonce::from_seq(frame.seq), plaintext, &aad)
}

/// Decrypt and authenticate `frame.payload`.
///
/// # Errors
///
/// Returns [`CryptoError::DecryptionFailed`] on any authentication failure.
pub fn decrypt(frame: &Frame, key: &AeadKey) -> Result<Vec<u8>, CryptoError> {
    let aad = build_aad(frame).map_err(|_| CryptoError::DecryptionFailed)?;
    key.decrypt(&Nonce::from_seq(frame.seq), &frame.payload, &aad)
}

/// Build an encrypted frame in one step.
///
/// # Errors
///
/// Propagates [`encrypt`] failures.
pub fn seal(mut header: Frame, plaintext: &[u8], key: &AeadKey) -> Result<Frame, CryptoError> {
    header.payload = encrypt(plaintext, &header, key)?;
    Ok(header)
}
