//! Per-peer session state: stream ID, session key and sequence counters.

use std::sync::atomic::{AtomicU64, Ordering};

use freepath_crypto::aead::AeadKey;

/// Sessions are torn down once a seq reaches this value.
pub const SEQ_ROLLOVER_THRESHOLD: u32 = 0xFFFF_FFF0;

/// Largest representable seq.
pub const SEQ_MAX: u32 = u32::MAX;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// State of one established session.
///
/// Both counters start empty; the first outbound frame uses seq 0 and the
/// first inbound frame may use any seq.
#[derive(Debug)]
pub struct SessionState {
    stream_id: String,
    session_key: AeadKey,
    outbound_seq: Option<u32>,
    inbound_seq: Option<u32>,
    generation: u64,
}

impl SessionState {
    /// Create a session with no frames sent or received.
    #[must_use]
    pub fn new(stream_id: impl Into<String>, session_key: AeadKey) -> Self {
        Self {
            stream_id: stream_id.into(),
            session_key,
            outbound_seq: None,
            inbound_seq: None,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Stream ID agreed during the handshake.
    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Symmetric session key.
    #[must_use]
    pub fn session_key(&self) -> &AeadKey {
        &self.session_key
    }

    /// Last seq sent, if any.
    #[must_use]
    pub fn outbound_seq(&self) -> Option<u32> {
        self.outbound_seq
    }

    /// Last seq accepted, if any.
    #[must_use]
    pub fn inbound_seq(&self) -> Option<u32> {
        self.inbound_seq
    }

    /// Token distinguishing this session from any later one for the same peer.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the outbound counter has reached the rollover threshold.
    #[must_use]
    pub fn outbound_exhausted(&self) -> bool {
        self.outbound_seq
            .is_some_and(|seq| seq >= SEQ_ROLLOVER_THRESHOLD)
    }

    /// Whether the inbound counter has reached the rollover threshold.
    #[must_use]
    pub fn inbound_exhausted(&self) -> bool {
        self.inbound_seq
            .is_some_and(|seq| seq >= SEQ_ROLLOVER_THRESHOLD)
    }

    /// Advance and return the outbound seq. `None` once [`SEQ_MAX`] has been used.
    pub fn next_outbound_seq(&mut self) -> Option<u32> {
        let next = match self.outbound_seq {
            None => 0,
            Some(seq) => seq.checked_add(1)?,
        };
        self.outbound_seq = Some(next);
        Some(next)
    }

    /// Whether `seq` is strictly greater than the last accepted inbound seq.
    #[must_use]
    pub fn is_valid_inbound_seq(&self, seq: u32) -> bool {
        self.inbound_seq.is_none_or(|last| seq > last)
    }

    /// Record `seq` as accepted. Returns `false` (and changes nothing) if it
    /// is not valid.
    pub fn accept_inbound_seq(&mut self, seq: u32) -> bool {
        if !self.is_valid_inbound_seq(seq) {
            return false;
        }
        self.inbound_seq = Some(seq);
        true
    }

    #[cfg(test)]
    pub(crate) fn set_outbound_seq(&mut self, seq: u32) {
        self.outbound_seq = Some(seq);
    }
}
