//! Protocol frames and their JSON encoding.
//!
//! A frame is serialized as a JSON object:
//!
//! ```text
//! {"schema":1,"streamId":"...","seq":0,"type":"HANDSHAKE","payload":"<base64>"}
//! ```
//!
//! The raw `type` string is kept verbatim in [`Frame::wire_type`] because it
//! is bound into the AEAD associated data; [`FrameType`] is only a parsed
//! view of it.

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Maximum length of the `type` string, bounded by its one-byte AAD length prefix.
pub const MAX_WIRE_TYPE_LEN: usize = 255;

/// Parsed frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Handshake message (frame 0 or frame 1)
    Handshake,
    /// Encrypted application data
    Data,
    /// Encrypted acknowledgment of a seq
    Ack,
    /// Encrypted session termination
    Close,
    /// Any type string this implementation does not recognise
    Unknown,
}

impl FrameType {
    /// Parse a raw wire type string, falling back to [`FrameType::Unknown`].
    #[must_use]
    pub fn from_wire_str(s: &str) -> Self {
        match s {
            "HANDSHAKE" => Self::Handshake,
            "DATA" => Self::Data,
            "ACK" => Self::Ack,
            "CLOSE" => Self::Close,
            _ => Self::Unknown,
        }
    }

    /// Canonical wire string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Handshake => "HANDSHAKE",
            Self::Data => "DATA",
            Self::Ack => "ACK",
            Self::Close => "CLOSE",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// One-byte type code used in the wire envelope header.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnencodableType`] for [`FrameType::Unknown`].
    pub fn wire_code(self) -> Result<u8, CodecError> {
        match self {
            Self::Handshake => Ok(0x00),
            Self::Data => Ok(0x01),
            Self::Ack => Ok(0x02),
            Self::Close => Ok(0x03),
            Self::Unknown => Err(CodecError::UnencodableType(self.as_str().to_owned())),
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Handshake),
            0x01 => Ok(Self::Data),
            0x02 => Ok(Self::Ack),
            0x03 => Ok(Self::Close),
            _ => Err(CodecError::UnknownTypeCode(value)),
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    /// Schema version
    pub schema: i32,
    /// Session correlation identifier chosen by the initiator
    pub stream_id: String,
    /// Sequence number within the session
    pub seq: u32,
    /// Raw type string as sent on the wire
    #[serde(rename = "type")]
    pub wire_type: String,
    /// Payload bytes (ciphertext on the wire, plaintext once delivered)
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame of a known type.
    #[must_use]
    pub fn new(
        schema: i32,
        stream_id: impl Into<String>,
        seq: u32,
        frame_type: FrameType,
        payload: Vec<u8>,
    ) -> Self {
        Self::with_wire_type(schema, stream_id, seq, frame_type.as_str(), payload)
    }

    /// Build a frame carrying an arbitrary type string.
    #[must_use]
    pub fn with_wire_type(
        schema: i32,
        stream_id: impl Into<String>,
        seq: u32,
        wire_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            schema,
            stream_id: stream_id.into(),
            seq,
            wire_type: wire_type.into(),
            payload,
        }
    }

    /// Parsed view of [`Frame::wire_type`].
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        FrameType::from_wire_str(&self.wire_type)
    }

    /// Serialize to UTF-8 JSON.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse UTF-8 JSON.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] for malformed JSON, a seq outside `u32`,
    /// or a payload that is not standard padded Base64, and
    /// [`CodecError::TypeTooLong`] for a type string over 255 bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let frame: Self = serde_json::from_slice(bytes)?;
        if frame.wire_type.len() > MAX_WIRE_TYPE_LEN {
            return Err(CodecError::TypeTooLong(frame.wire_type.len()));
        }
        Ok(frame)
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_from_wire_str() {
        assert_eq!(FrameType::from_wire_str("HANDSHAKE"), FrameType::Handshake);
        assert_eq!(FrameType::from_wire_str("DATA"), FrameType::Data);
        assert_eq!(FrameType::from_wire_str("ACK"), FrameType::Ack);
        assert_eq!(FrameType::from_wire_str("CLOSE"), FrameType::Close);
        assert_eq!(FrameType::from_wire_str("data"), FrameType::Unknown);
        assert_eq!(FrameType::from_wire_str("REKEY"), FrameType::Unknown);
    }

    #[test]
    fn test_wire_codes() {
        for (ty, code) in [
            (FrameType::Handshake, 0x00),
            (FrameType::Data, 0x01),
            (FrameType::Ack, 0x02),
            (FrameType::Close, 0x03),
        ] {
            assert_eq!(ty.wire_code().unwrap(), code);
            assert_eq!(FrameType::try_from(code).unwrap(), ty);
        }
        assert!(FrameType::Unknown.wire_code().is_err());
        assert_eq!(
            FrameType::try_from(0x04),
            Err(CodecError::UnknownTypeCode(0x04))
        );
    }

    #[test]
    fn test_json_layout() {
        let frame = Frame::new(1, "abc", 7, FrameType::Data, vec![1, 2, 3]);
        let json = String::from_utf8(frame.encode().unwrap()).unwrap();
        assert_eq!(
            json,
            r#"{"schema":1,"streamId":"abc","seq":7,"type":"DATA","payload":"AQID"}"#
        );
    }

    #[test]
    fn test_unknown_type_preserved() {
        let json = br#"{"schema":1,"streamId":"s","seq":3,"type":"FUTURE","payload":""}"#;
        let frame = Frame::decode(json).unwrap();
        assert_eq!(frame.frame_type(), FrameType::Unknown);
        assert_eq!(frame.wire_type, "FUTURE");
        assert_eq!(frame.encode().unwrap(), json.to_vec());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let json = br#"{"schema":1,"streamId":"s","seq":3,"type":"ACK","payload":"","extra":true}"#;
        assert_eq!(Frame::decode(json).unwrap().frame_type(), FrameType::Ack);
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        // bad base64
        assert!(Frame::decode(br#"{"schema":1,"streamId":"s","seq":0,"type":"DATA","payload":"!!"}"#).is_err());
        // seq outside u32
        assert!(Frame::decode(br#"{"schema":1,"streamId":"s","seq":4294967296,"type":"DATA","payload":""}"#).is_err());
        assert!(Frame::decode(br#"{"schema":1,"streamId":"s","seq":-1,"type":"DATA","payload":""}"#).is_err());
        // missing field
        assert!(Frame::decode(br#"{"schema":1,"seq":0,"type":"DATA","payload":""}"#).is_err());
        assert!(Frame::decode(b"not json").is_err());
    }

    #[test]
    fn test_decode_rejects_long_type() {
        let frame = Frame::with_wire_type(1, "s", 0, "X".repeat(256), vec![]);
        let bytes = frame.encode().unwrap();
        assert_eq!(Frame::decode(&bytes), Err(CodecError::TypeTooLong(256)));
    }

    #[test]
    fn test_max_seq_roundtrip() {
        let frame = Frame::new(1, "s", u32::MAX, FrameType::Close, vec![]);
        assert_eq!(Frame::decode(&frame.encode().unwrap()).unwrap(), frame);
    }
}
