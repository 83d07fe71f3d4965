//! Byte-level path shared by every adapter:
//! frame JSON → fragments → wire envelopes, and back.

use freepath_core::error::CodecError;
use freepath_core::frame::Frame;
use freepath_core::packet::{self, LinkAdapterPacket, Reassembler};
use freepath_core::wire::{self, WireHeader};
use freepath_core::LinkConfig;

/// Serialize `frame` into one wire envelope per fragment.
///
/// # Errors
///
/// Fails for frames of unknown type (no wire code), frames needing more
/// than the maximum fragment count, and oversized envelopes.
pub fn encode_frame(frame: &Frame, mtu: usize) -> Result<Vec<Vec<u8>>, CodecError> {
    let frame_type = frame.frame_type();
    let bytes = frame.encode()?;
    packet::fragment(frame.seq, &bytes, mtu)?
        .iter()
        .map(|packet| wire::encode(frame_type, &packet.encode()?))
        .collect()
}

/// Why an envelope did not yield a frame.
#[derive(Debug)]
pub enum DecodeOutcome {
    /// A complete frame
    Frame(Frame),
    /// More fragments are needed, or the fragment was dropped
    Pending,
    /// The envelope or the frame inside it is malformed; the stream
    /// framing is still intact
    Dropped(CodecError),
}

/// Per-connection inbound state.
#[derive(Debug)]
pub struct FrameDecoder {
    reassembler: Reassembler,
}

impl FrameDecoder {
    /// Create a decoder with the reassembly limits of `config`.
    #[must_use]
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            reassembler: Reassembler::new(config.reassembly_timeout, config.max_pending_reassembly),
        }
    }

    /// Feed the payload of one envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnsupportedVersion`] when the header carries a
    /// version other than 1; the connection must be closed.
    pub fn push(&mut self, header: &WireHeader, payload: &[u8]) -> Result<DecodeOutcome, CodecError> {
        header.check_version()?;

        let packet = match LinkAdapterPacket::decode(payload) {
            Ok((packet, _)) => packet,
            Err(e) => return Ok(DecodeOutcome::Dropped(e)),
        };
        let Some(bytes) = self.reassembler.push(packet) else {
            return Ok(DecodeOutcome::Pending);
        };
        Ok(match Frame::decode(&bytes) {
            Ok(frame) => DecodeOutcome::Frame(frame),
            Err(e) => DecodeOutcome::Dropped(e),
        })
    }

    /// Decode a complete envelope held in one buffer.
    ///
    /// # Errors
    ///
    /// Header failures, including the version check.
    pub fn push_envelope(&mut self, envelope: &[u8]) -> Result<DecodeOutcome, CodecError> {
        let header = wire::decode_header(envelope)?;
        let payload = &envelope[wire::HEADER_SIZE..];
        if payload.len() != header.length {
            return Err(CodecError::Truncated {
                expected: wire::HEADER_SIZE + header.length,
                actual: envelope.len(),
            });
        }
        self.push(&header, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use freepath_core::frame::FrameType;

    fn decode_all(decoder: &mut FrameDecoder, envelopes: &[Vec<u8>]) -> Vec<Frame> {
        envelopes
            .iter()
            .filter_map(|e| match decoder.push_envelope(e).unwrap() {
                DecodeOutcome::Frame(frame) => Some(frame),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_single_envelope_frame() {
        let frame = Frame::new(1, "sid", 3, FrameType::Data, b"payload".to_vec());
        let envelopes = encode_frame(&frame, 65_536).unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(&envelopes[0][..4], b"FREE");
        assert_eq!(envelopes[0][5], 0x01);

        let mut decoder = FrameDecoder::new(&LinkConfig::default());
        assert_eq!(decode_all(&mut decoder, &envelopes), vec![frame]);
    }

    #[test]
    fn test_fragmented_frame_reassembles() {
        let frame = Frame::new(1, "sid", 9, FrameType::Data, vec![0xAB; 500]);
        let envelopes = encode_frame(&frame, 64).unwrap();
        assert!(envelopes.len() > 1);

        let mut decoder = FrameDecoder::new(&LinkConfig::default());
        let frames = decode_all(&mut decoder, &envelopes);
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn test_unknown_type_cannot_be_encoded() {
        let frame = Frame::with_wire_type(1, "sid", 0, "PING", vec![]);
        assert!(matches!(
            encode_frame(&frame, 1024),
            Err(CodecError::UnencodableType(_))
        ));
    }

    #[test]
    fn test_wrong_version_is_fatal() {
        let frame = Frame::new(1, "sid", 0, FrameType::Ack, vec![]);
        let mut envelope = encode_frame(&frame, 1024).unwrap().remove(0);
        envelope[4] = 2;

        let mut decoder = FrameDecoder::new(&LinkConfig::default());
        assert!(matches!(
            decoder.push_envelope(&envelope),
            Err(CodecError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_malformed_frame_is_dropped() {
        let packet = LinkAdapterPacket {
            seq: 0,
            frag_index: 0,
            frag_count: 1,
            data: b"{not json".to_vec(),
        };
        let envelope = wire::encode(FrameType::Data, &packet.encode().unwrap()).unwrap();

        let mut decoder = FrameDecoder::new(&LinkConfig::default());
        assert!(matches!(
            decoder.push_envelope(&envelope),
            Ok(DecodeOutcome::Dropped(_))
        ));
    }
}
