//! Two-message mutually authenticated handshake.
//!
//! Each side sends one 144-byte payload:
//!
//! ```text
//! ephemeral X25519 public (32) ‖ Ed25519 public (32) ‖ node id (16) ‖ signature (64)
//! ```
//!
//! where the signature covers `ephemeral ‖ node id`. Only the signing key
//! returned by the [`ContactLookup`] is trusted; the embedded key must match
//! it byte for byte. The session key is
//! `HKDF-SHA256(X25519(eph, peer_eph), salt = 0^32, info = payload0 ‖ payload1)`.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use freepath_crypto::aead::AeadKey;
use freepath_crypto::hash::{ZERO_SALT, derive_key};
use freepath_crypto::random::random_array;
use freepath_crypto::signatures::Signature;
use freepath_crypto::x25519;
use freepath_crypto::{ED25519_KEY_SIZE, ED25519_SIGNATURE_SIZE, X25519_KEY_SIZE};
use rand_core::OsRng;
use zeroize::Zeroize;

use crate::base58;
use crate::error::HandshakeError;
use crate::frame::{Frame, FrameType};
use crate::identity::{ContactLookup, LocalIdentity, NODE_ID_SIZE, NodeId};
use crate::session::SessionState;

/// Supported frame schema
pub const SCHEMA: i32 = 1;

/// Handshake payload size: 32 + 32 + 16 + 64
pub const PAYLOAD_SIZE: usize = SIGNATURE.end;

/// Random bytes behind each stream ID
pub const STREAM_ID_BYTES: usize = 16;

const EPHEMERAL: Range<usize> = 0..X25519_KEY_SIZE;
const SIG_KEY: Range<usize> = EPHEMERAL.end..EPHEMERAL.end + ED25519_KEY_SIZE;
const NODE_ID: Range<usize> = SIG_KEY.end..SIG_KEY.end + NODE_ID_SIZE;
const SIGNATURE: Range<usize> = NODE_ID.end..NODE_ID.end + ED25519_SIGNATURE_SIZE;

/// Signed part of a payload: ephemeral key ‖ node id
const SIGNED_SIZE: usize = X25519_KEY_SIZE + NODE_ID_SIZE;

/// Initiator state held between sending frame 0 and receiving frame 1.
pub struct InitiatorContext {
    ephemeral: x25519::PrivateKey,
    raw_payload: Vec<u8>,
}

impl fmt::Debug for InitiatorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitiatorContext").finish_non_exhaustive()
    }
}

/// Result of answering an initiator's frame 0.
#[derive(Debug)]
pub struct ResponderOutcome {
    /// Frame 1, to be sent back on the same stream
    pub response: Frame,
    /// Session derived from the exchange
    pub session: SessionState,
    /// Initiator identity recovered from the verified payload
    pub peer: NodeId,
}

struct HandshakeFields<'a> {
    ephemeral: [u8; X25519_KEY_SIZE],
    sig_key: &'a [u8],
    node_id: NodeId,
    signature: &'a [u8],
}

/// Builds, parses and verifies handshake payloads.
#[derive(Clone)]
pub struct HandshakeHandler {
    identity: Arc<LocalIdentity>,
    contacts: Arc<dyn ContactLookup>,
}

impl fmt::Debug for HandshakeHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeHandler")
            .field("node_id", &self.identity.node_id())
            .finish_non_exhaustive()
    }
}

impl HandshakeHandler {
    /// Create a handler for `identity`, trusting only keys from `contacts`.
    #[must_use]
    pub fn new(identity: Arc<LocalIdentity>, contacts: Arc<dyn ContactLookup>) -> Self {
        Self { identity, contacts }
    }

    /// Fresh random stream ID: Base58 of 16 random bytes.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Crypto`] if the OS CSPRNG fails.
    pub fn new_stream_id() -> Result<String, HandshakeError> {
        let raw: [u8; STREAM_ID_BYTES] = random_array()?;
        Ok(base58::encode(&raw))
    }

    /// Node ID claimed by a handshake payload, without any verification.
    ///
    /// Link adapters use this to label a fresh inbound connection; the
    /// protocol layer later checks it against the verified identity.
    #[must_use]
    pub fn claimed_node_id(payload: &[u8]) -> Option<NodeId> {
        if payload.len() != PAYLOAD_SIZE {
            return None;
        }
        NodeId::from_slice(&payload[NODE_ID])
    }

    /// Build frame 0 for a new stream.
    #[must_use]
    pub fn create_initiator_frame(&self, stream_id: &str) -> (Frame, InitiatorContext) {
        let ephemeral = x25519::PrivateKey::generate(&mut OsRng);
        let raw_payload = self.build_payload(&ephemeral.public_key());
        let frame = Frame::new(
            SCHEMA,
            stream_id,
            0,
            FrameType::Handshake,
            raw_payload.clone(),
        );
        (
            frame,
            InitiatorContext {
                ephemeral,
                raw_payload,
            },
        )
    }

    /// Verify frame 0 and build frame 1 plus the responder's session.
    ///
    /// The caller must check that the returned peer is the one it expects
    /// before committing the session.
    ///
    /// # Errors
    ///
    /// Any verification failure aborts the handshake.
    pub fn process_initiator_frame(
        &self,
        frame: &Frame,
    ) -> Result<ResponderOutcome, HandshakeError> {
        let payload0 = &frame.payload;
        let fields = self.parse_and_verify(payload0)?;

        let ephemeral = x25519::PrivateKey::generate(&mut OsRng);
        let payload1 = self.build_payload(&ephemeral.public_key());
        let session = derive_session(
            &ephemeral,
            &fields.ephemeral,
            payload0,
            &payload1,
            &frame.stream_id,
        )?;
        let response = Frame::new(
            SCHEMA,
            frame.stream_id.clone(),
            0,
            FrameType::Handshake,
            payload1,
        );

        Ok(ResponderOutcome {
            response,
            session,
            peer: fields.node_id,
        })
    }

    /// Verify frame 1 and derive the initiator's session.
    ///
    /// Returns the verified responder identity, which the caller must
    /// compare with the peer it meant to reach.
    ///
    /// # Errors
    ///
    /// Any verification failure aborts the handshake.
    pub fn complete_initiator_handshake(
        &self,
        ctx: &InitiatorContext,
        frame: &Frame,
    ) -> Result<(NodeId, SessionState), HandshakeError> {
        let payload1 = &frame.payload;
        let fields = self.parse_and_verify(payload1)?;
        let session = derive_session(
            &ctx.ephemeral,
            &fields.ephemeral,
            &ctx.raw_payload,
            payload1,
            &frame.stream_id,
        )?;
        Ok((fields.node_id, session))
    }

    fn build_payload(&self, ephemeral: &x25519::PublicKey) -> Vec<u8> {
        let node_id = self.identity.node_id();

        let mut signed = Vec::with_capacity(SIGNED_SIZE);
        signed.extend_from_slice(ephemeral.as_bytes());
        signed.extend_from_slice(node_id.as_bytes());
        let signature = self.identity.signing_key().sign(&signed);

        let mut payload = Vec::with_capacity(PAYLOAD_SIZE);
        payload.extend_from_slice(ephemeral.as_bytes());
        payload.extend_from_slice(self.identity.verifying_key().as_bytes());
        payload.extend_from_slice(node_id.as_bytes());
        payload.extend_from_slice(signature.as_bytes());
        payload
    }

    fn parse_and_verify<'a>(&self, payload: &'a [u8]) -> Result<HandshakeFields<'a>, HandshakeError> {
        if payload.len() != PAYLOAD_SIZE {
            return Err(HandshakeError::InvalidPayloadSize(payload.len()));
        }

        let mut ephemeral = [0u8; X25519_KEY_SIZE];
        ephemeral.copy_from_slice(&payload[EPHEMERAL]);
        let fields = HandshakeFields {
            ephemeral,
            sig_key: &payload[SIG_KEY],
            node_id: NodeId::from_slice(&payload[NODE_ID])
                .ok_or(HandshakeError::InvalidPayloadSize(payload.len()))?,
            signature: &payload[SIGNATURE],
        };

        let trusted = self
            .contacts
            .sig_key(&fields.node_id)
            .ok_or(HandshakeError::UnknownPeer)?;

        if fields.sig_key != trusted.as_bytes() {
            return Err(HandshakeError::SigningKeyMismatch);
        }

        let signature =
            Signature::from_slice(fields.signature).map_err(|_| HandshakeError::BadSignature)?;
        let mut signed = Vec::with_capacity(SIGNED_SIZE);
        signed.extend_from_slice(&fields.ephemeral);
        signed.extend_from_slice(fields.node_id.as_bytes());
        trusted
            .verify(&signed, &signature)
            .map_err(|_| HandshakeError::BadSignature)?;

        Ok(fields)
    }
}

fn derive_session(
    local_ephemeral: &x25519::PrivateKey,
    peer_ephemeral: &[u8; X25519_KEY_SIZE],
    payload0: &[u8],
    payload1: &[u8],
    stream_id: &str,
) -> Result<SessionState, HandshakeError> {
    let shared = local_ephemeral
        .exchange(&x25519::PublicKey::from_bytes(*peer_ephemeral))
        .map_err(|_| HandshakeError::LowOrderPoint)?;

    let mut info = Vec::with_capacity(payload0.len() + payload1.len());
    info.extend_from_slice(payload0);
    info.extend_from_slice(payload1);

    let mut key = derive_key(shared.as_bytes(), &ZERO_SALT, &info)?;
    let session = SessionState::new(stream_id, AeadKey::new(key));
    key.zeroize();
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ContactBook;

    struct Pair {
        alice: LocalIdentity,
        bob: LocalIdentity,
        alice_handler: HandshakeHandler,
        bob_handler: HandshakeHandler,
    }

    fn pair() -> Pair {
        let alice = LocalIdentity::generate();
        let bob = LocalIdentity::generate();

        let alice_contacts = ContactBook::new();
        alice_contacts.add(bob.contact_info());
        let bob_contacts = ContactBook::new();
        bob_contacts.add(alice.contact_info());

        Pair {
            alice_handler: HandshakeHandler::new(Arc::new(alice.clone()), Arc::new(alice_contacts)),
            bob_handler: HandshakeHandler::new(Arc::new(bob.clone()), Arc::new(bob_contacts)),
            alice,
            bob,
        }
    }

    #[test]
    fn test_payload_layout() {
        let p = pair();
        let (frame, _) = p.alice_handler.create_initiator_frame("s");
        assert_eq!(frame.payload.len(), PAYLOAD_SIZE);
        assert_eq!(frame.seq, 0);
        assert_eq!(frame.schema, SCHEMA);
        assert_eq!(frame.frame_type(), FrameType::Handshake);
        assert_eq!(&frame.payload[SIG_KEY], p.alice.verifying_key().as_bytes());
        assert_eq!(
            HandshakeHandler::claimed_node_id(&frame.payload),
            Some(p.alice.node_id())
        );
    }

    #[test]
    fn test_both_sides_derive_same_key() {
        let p = pair();
        let (frame0, ctx) = p.alice_handler.create_initiator_frame("stream-1");

        let outcome = p.bob_handler.process_initiator_frame(&frame0).unwrap();
        assert_eq!(outcome.peer, p.alice.node_id());
        assert_eq!(outcome.response.stream_id, "stream-1");

        let (peer, session) = p
            .alice_handler
            .complete_initiator_handshake(&ctx, &outcome.response)
            .unwrap();
        assert_eq!(peer, p.bob.node_id());
        assert_eq!(
            session.session_key().as_bytes(),
            outcome.session.session_key().as_bytes()
        );
        assert_eq!(session.stream_id(), outcome.session.stream_id());
    }

    #[test]
    fn test_distinct_handshakes_yield_distinct_keys() {
        let p = pair();
        let (f1, _) = p.alice_handler.create_initiator_frame("s");
        let (f2, _) = p.alice_handler.create_initiator_frame("s");
        let k1 = p.bob_handler.process_initiator_frame(&f1).unwrap();
        let k2 = p.bob_handler.process_initiator_frame(&f2).unwrap();
        assert_ne!(
            k1.session.session_key().as_bytes(),
            k2.session.session_key().as_bytes()
        );
    }

    #[test]
    fn test_unknown_peer_rejected() {
        let p = pair();
        let stranger = HandshakeHandler::new(
            Arc::new(LocalIdentity::generate()),
            Arc::new(ContactBook::new()),
        );
        let (frame0, _) = stranger.create_initiator_frame("s");
        assert_eq!(
            p.bob_handler.process_initiator_frame(&frame0).err(),
            Some(HandshakeError::UnknownPeer)
        );
    }

    #[test]
    fn test_wrong_payload_size_rejected() {
        let p = pair();
        let (mut frame0, _) = p.alice_handler.create_initiator_frame("s");
        frame0.payload.pop();
        assert_eq!(
            p.bob_handler.process_initiator_frame(&frame0).err(),
            Some(HandshakeError::InvalidPayloadSize(143))
        );
    }

    #[test]
    fn test_sig_key_mismatch_rejected_before_signature() {
        let p = pair();
        let (mut frame0, _) = p.alice_handler.create_initiator_frame("s");
        // Substitute an attacker key; the signature is left intact
        let mallory = LocalIdentity::generate();
        frame0.payload[SIG_KEY].copy_from_slice(mallory.verifying_key().as_bytes());
        assert_eq!(
            p.bob_handler.process_initiator_frame(&frame0).err(),
            Some(HandshakeError::SigningKeyMismatch)
        );
    }

    #[test]
    fn test_bad_signature_rejected() {
        let p = pair();
        let (mut frame0, _) = p.alice_handler.create_initiator_frame("s");
        frame0.payload[EPHEMERAL.start] ^= 0x01;
        assert_eq!(
            p.bob_handler.process_initiator_frame(&frame0).err(),
            Some(HandshakeError::BadSignature)
        );
    }

    #[test]
    fn test_forged_identity_with_own_signature_rejected() {
        // Mallory signs with her key but claims Alice's node id
        let p = pair();
        let mallory = LocalIdentity::generate();
        let contacts = ContactBook::new();
        contacts.add(p.bob.contact_info());
        let mallory_handler = HandshakeHandler::new(Arc::new(mallory), Arc::new(contacts));
        let (mut frame0, _) = mallory_handler.create_initiator_frame("s");
        frame0.payload[NODE_ID].copy_from_slice(p.alice.node_id().as_bytes());
        assert_eq!(
            p.bob_handler.process_initiator_frame(&frame0).err(),
            Some(HandshakeError::SigningKeyMismatch)
        );
    }

    #[test]
    fn test_payload_offsets() {
        assert_eq!(PAYLOAD_SIZE, 144);
        assert_eq!(SIG_KEY, 32..64);
        assert_eq!(NODE_ID, 64..80);
        assert_eq!(SIGNATURE, 80..144);
    }

    #[test]
    fn test_low_order_ephemeral_rejected() {
        let p = pair();
        // Correctly signed payload carrying an all-zero ephemeral key
        let zero = [0u8; 32];
        let mut signed = zero.to_vec();
        signed.extend_from_slice(p.alice.node_id().as_bytes());
        let signature = p.alice.signing_key().sign(&signed);

        let mut payload = zero.to_vec();
        payload.extend_from_slice(p.alice.verifying_key().as_bytes());
        payload.extend_from_slice(p.alice.node_id().as_bytes());
        payload.extend_from_slice(signature.as_bytes());

        let frame0 = Frame::new(SCHEMA, "s", 0, FrameType::Handshake, payload);
        assert_eq!(
            p.bob_handler.process_initiator_frame(&frame0).err(),
            Some(HandshakeError::LowOrderPoint)
        );
    }

    #[test]
    fn test_response_from_wrong_context_gives_different_key() {
        let p = pair();
        let (frame0, _ctx) = p.alice_handler.create_initiator_frame("s");
        let (_, other_ctx) = p.alice_handler.create_initiator_frame("s");
        let outcome = p.bob_handler.process_initiator_frame(&frame0).unwrap();

        let (_, session) = p
            .alice_handler
            .complete_initiator_handshake(&other_ctx, &outcome.response)
            .unwrap();
        assert_ne!(
            session.session_key().as_bytes(),
            outcome.session.session_key().as_bytes()
        );
    }

    #[test]
    fn test_stream_id_is_base58_of_16_bytes() {
        let id = HandshakeHandler::new_stream_id().unwrap();
        assert_eq!(base58::decode(&id).unwrap().len(), 16);
    }
}
