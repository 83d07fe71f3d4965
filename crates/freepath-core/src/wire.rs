//! Wire envelope: the fixed 10-byte header that delimits messages on a
//! byte-stream link.
//!
//! ```text
//! ┌──────────┬─────────┬──────┬────────────┬─────────────┐
//! │ "FREE"   │ version │ type │ length(BE) │ payload ... │
//! │ 4 bytes  │ 1 byte  │ 1    │ 4 bytes    │ length      │
//! └──────────┴─────────┴──────┴────────────┴─────────────┘
//! ```

use crate::binary::{Reader, put_u32};
use crate::error::CodecError;
use crate::frame::FrameType;

/// "FREE" in ASCII
pub const MAGIC: [u8; 4] = *b"FREE";

/// Supported wire version
pub const WIRE_VERSION: u8 = 1;

/// Header size: magic(4) + version(1) + type(1) + length(4)
pub const HEADER_SIZE: usize = 10;

/// Maximum payload length (16 MiB). Larger lengths close the connection.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Decoded wire envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    /// Version byte as received
    pub version: u8,
    /// Type code as received
    pub type_code: u8,
    /// Payload length in bytes
    pub length: usize,
}

impl WireHeader {
    /// Fail unless the version is [`WIRE_VERSION`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnsupportedVersion`] otherwise.
    pub fn check_version(&self) -> Result<(), CodecError> {
        if self.version == WIRE_VERSION {
            Ok(())
        } else {
            Err(CodecError::UnsupportedVersion(self.version))
        }
    }

    /// Parsed frame type for the type code.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownTypeCode`] for codes outside 0..=3.
    pub fn frame_type(&self) -> Result<FrameType, CodecError> {
        FrameType::try_from(self.type_code)
    }
}

/// Prefix `payload` with a wire envelope header.
///
/// # Errors
///
/// Returns [`CodecError::PayloadTooLarge`] for payloads over
/// [`MAX_PAYLOAD_SIZE`] and [`CodecError::UnencodableType`] for
/// [`FrameType::Unknown`].
pub fn encode(frame_type: FrameType, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    let type_code = frame_type.wire_code()?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&MAGIC);
    buf.push(WIRE_VERSION);
    buf.push(type_code);
    // Bounded by MAX_PAYLOAD_SIZE above
    put_u32(&mut buf, payload.len() as u32);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode and validate a wire envelope header from the start of `buf`.
///
/// The version byte is returned, not checked; see [`WireHeader::check_version`].
///
/// # Errors
///
/// Returns [`CodecError::Truncated`], [`CodecError::BadMagic`] or
/// [`CodecError::PayloadTooLarge`].
pub fn decode_header(buf: &[u8]) -> Result<WireHeader, CodecError> {
    let mut reader = Reader::new(buf);
    let magic: [u8; 4] = reader.array().map_err(|_| CodecError::Truncated {
        expected: HEADER_SIZE,
        actual: buf.len(),
    })?;
    if reader.remaining() < HEADER_SIZE - MAGIC.len() {
        return Err(CodecError::Truncated {
            expected: HEADER_SIZE,
            actual: buf.len(),
        });
    }
    if magic != MAGIC {
        return Err(CodecError::BadMagic);
    }

    let version = reader.u8()?;
    let type_code = reader.u8()?;
    let length = reader.u32()? as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge {
            len: length,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    Ok(WireHeader {
        version,
        type_code,
        length,
    })
}
