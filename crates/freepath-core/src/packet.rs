//! Link adapter packets: fragmentation of serialized frames to the link MTU
//! and bounded reassembly on the receiving side.
//!
//! ```text
//! seq(4 BE) | frag_index(2 BE) | frag_count(2 BE) | length(4 BE) | data
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::binary::{Reader, put_u16, put_u32};
use crate::error::CodecError;

/// Packet header size: seq(4) + frag_index(2) + frag_count(2) + length(4)
pub const HEADER_SIZE: usize = 12;

/// Maximum fragments per frame
pub const MAX_FRAG_COUNT: u16 = 1024;

/// Default link MTU for stream transports
pub const DEFAULT_MTU: usize = 65_536;

/// Incomplete reassemblies older than this are discarded
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum seq values awaiting reassembly at once
pub const MAX_PENDING_REASSEMBLY: usize = 64;

/// One fragment of a serialized frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkAdapterPacket {
    /// Seq of the frame being carried
    pub seq: u32,
    /// Zero-based fragment index
    pub frag_index: u16,
    /// Total fragments for this seq
    pub frag_count: u16,
    /// Fragment bytes
    pub data: Vec<u8>,
}

impl LinkAdapterPacket {
    /// Serialize header and data.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::PayloadTooLarge`] if the data length does not
    /// fit the 32-bit length field.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let len = u32::try_from(self.data.len()).map_err(|_| CodecError::PayloadTooLarge {
            len: self.data.len(),
            max: u32::MAX as usize,
        })?;
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.data.len());
        put_u32(&mut buf, self.seq);
        put_u16(&mut buf, self.frag_index);
        put_u16(&mut buf, self.frag_count);
        put_u32(&mut buf, len);
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    /// Parse one packet from the start of `buf`, returning it with the
    /// number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Fails on a short buffer, a zero or oversized fragment count, or a
    /// fragment index not below the count.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let mut reader = Reader::new(buf);
        let seq = reader.u32()?;
        let frag_index = reader.u16()?;
        let frag_count = reader.u16()?;
        let length = reader.u32()? as usize;

        if frag_count == 0 || frag_count > MAX_FRAG_COUNT {
            return Err(CodecError::InvalidFragmentCount(frag_count));
        }
        if frag_index >= frag_count {
            return Err(CodecError::FragmentIndexOutOfRange {
                index: frag_index,
                count: frag_count,
            });
        }

        let data = reader.bytes(length)?.to_vec();
        Ok((
            Self {
                seq,
                frag_index,
                frag_count,
                data,
            },
            reader.position(),
        ))
    }
}

/// Split `frame_bytes` into packets of at most `mtu` data bytes.
///
/// An empty frame still produces one (empty) packet.
///
/// # Errors
///
/// Returns [`CodecError::ZeroMtu`] for a zero MTU and
/// [`CodecError::TooManyFragments`] if more than [`MAX_FRAG_COUNT`]
/// fragments would be needed.
pub fn fragment(
    seq: u32,
    frame_bytes: &[u8],
    mtu: usize,
) -> Result<Vec<LinkAdapterPacket>, CodecError> {
    if mtu == 0 {
        return Err(CodecError::ZeroMtu);
    }
    let needed = frame_bytes.len().div_ceil(mtu).max(1);
    if needed > usize::from(MAX_FRAG_COUNT) {
        return Err(CodecError::TooManyFragments {
            needed,
            max: usize::from(MAX_FRAG_COUNT),
        });
    }
    // needed <= MAX_FRAG_COUNT
    let frag_count = needed as u16;

    if frame_bytes.is_empty() {
        return Ok(vec![LinkAdapterPacket {
            seq,
            frag_index: 0,
            frag_count,
            data: Vec::new(),
        }]);
    }

    Ok(frame_bytes
        .chunks(mtu)
        .zip(0u16..)
        .map(|(chunk, frag_index)| LinkAdapterPacket {
            seq,
            frag_index,
            frag_count,
            data: chunk.to_vec(),
        })
        .collect())
}

#[derive(Debug)]
struct PendingFrame {
    fragments: Vec<Option<Vec<u8>>>,
    received: usize,
    created_at: Instant,
}

/// Per-connection reassembly table keyed by seq.
///
/// Not synchronized: each connection feeds its packets from a single task.
#[derive(Debug)]
pub struct Reassembler {
    timeout: Duration,
    max_pending: usize,
    pending: HashMap<u32, PendingFrame>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(REASSEMBLY_TIMEOUT, MAX_PENDING_REASSEMBLY)
    }
}

impl Reassembler {
    /// Create a reassembler with the given limits.
    #[must_use]
    pub fn new(timeout: Duration, max_pending: usize) -> Self {
        Self {
            timeout,
            max_pending,
            pending: HashMap::new(),
        }
    }

    /// Number of seq values awaiting more fragments.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed one packet; returns the complete frame bytes once every fragment
    /// of its seq has arrived.
    pub fn push(&mut self, packet: LinkAdapterPacket) -> Option<Vec<u8>> {
        self.push_at(packet, Instant::now())
    }

    /// [`Reassembler::push`] with an explicit clock reading.
    pub fn push_at(&mut self, packet: LinkAdapterPacket, now: Instant) -> Option<Vec<u8>> {
        self.evict_stale(now);

        if packet.frag_count == 1 {
            return Some(packet.data);
        }

        let count = usize::from(packet.frag_count);
        let index = usize::from(packet.frag_index);
        if index >= count {
            return None;
        }

        if !self.pending.contains_key(&packet.seq) && self.pending.len() >= self.max_pending {
            tracing::debug!(seq = packet.seq, "reassembly table full, dropping packet");
            return None;
        }

        let entry = self
            .pending
            .entry(packet.seq)
            .or_insert_with(|| PendingFrame {
                fragments: vec![None; count],
                received: 0,
                created_at: now,
            });

        if entry.fragments.len() != count {
            tracing::debug!(
                seq = packet.seq,
                expected = entry.fragments.len(),
                got = count,
                "fragment count mismatch, dropping packet"
            );
            return None;
        }

        let slot = &mut entry.fragments[index];
        if slot.is_none() {
            entry.received += 1;
        }
        *slot = Some(packet.data);

        if entry.received < count {
            return None;
        }

        let done = self.pending.remove(&packet.seq)?;
        Some(done.fragments.into_iter().flatten().flatten().collect())
    }

    fn evict_stale(&mut self, now: Instant) {
        let timeout = self.timeout;
        self.pending.retain(|seq, pending| {
            let keep = now.saturating_duration_since(pending.created_at) <= timeout;
            if !keep {
                tracing::debug!(seq, "evicting stale reassembly");
            }
            keep
        });
    }
}
