//! Stateless envelopes: self-contained, signed and encrypted messages that
//! need no session.
//!
//! Relays can route on `senderId`/`receiverId` and forward the encoded bytes
//! unchanged without being able to decrypt them.
//!
//! ```text
//! key  = HKDF-SHA256(X25519(enc_priv, peer_enc_pub), 0^32,
//!                    "freepath-stateless-v1" ‖ sender ‖ receiver)
//! aad  = schema(4) ‖ sender(16) ‖ receiver(16) ‖ timestamp(8) ‖ nonce(12)
//!        ‖ fragment_index(4) ‖ fragment_count(4)
//! sig  = Ed25519(sender_sig_priv, aad ‖ ciphertext)
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use freepath_crypto::aead::{AeadKey, NONCE_SIZE, Nonce};
use freepath_crypto::hash::{ZERO_SALT, derive_key};
use freepath_crypto::signatures::Signature;
use freepath_crypto::x25519;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::binary::{put_i32, put_i64};
use crate::error::{CodecError, EnvelopeError};
use crate::identity::{ContactLookup, LocalIdentity, NodeId};

/// Supported envelope schema
pub const SCHEMA: i32 = 1;

const HKDF_INFO_PREFIX: &[u8] = b"freepath-stateless-v1";

const AAD_SIZE: usize = 4 + 16 + 16 + 8 + NONCE_SIZE + 4 + 4;

/// A sealed stateless envelope, as exchanged in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatelessEnvelope {
    /// Schema version
    pub schema: i32,
    /// Base58 node ID of the sender
    pub sender_id: String,
    /// Base58 node ID of the intended receiver
    pub receiver_id: String,
    /// Unix epoch milliseconds
    pub timestamp: i64,
    /// Base64 12-byte nonce
    pub nonce: String,
    /// Zero-based fragment position
    pub fragment_index: i32,
    /// Total fragments in the message
    pub fragment_count: i32,
    /// Base64 ciphertext
    pub payload: String,
    /// Base64 Ed25519 signature over AAD and ciphertext
    pub signature: String,
}

impl StatelessEnvelope {
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
    /// Returns [`CodecError::Json`] for malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Fragment position of a sealed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    /// Zero-based index
    pub index: i32,
    /// Total count
    pub count: i32,
}

impl Default for Fragment {
    fn default() -> Self {
        Self { index: 0, count: 1 }
    }
}

/// Encrypt and sign `plaintext` for `receiver_id`.
///
/// # Errors
///
/// Rejects an invalid fragment position and an all-zero X25519 result.
pub fn seal(
    sender: &LocalIdentity,
    receiver_id: &NodeId,
    receiver_enc_key: &x25519::PublicKey,
    plaintext: &[u8],
    timestamp: i64,
    fragment: Fragment,
) -> Result<StatelessEnvelope, EnvelopeError> {
    check_fragment(fragment)?;

    let nonce = Nonce::generate(&mut OsRng);
    let sender_id = sender.node_id();

    let key = derive_envelope_key(sender.enc_key(), receiver_enc_key, &sender_id, receiver_id)?;
    let aad = build_aad(SCHEMA, &sender_id, receiver_id, timestamp, &nonce, fragment);
    let ciphertext = key
        .encrypt(&nonce, plaintext, &aad)
        .map_err(|_| EnvelopeError::Aead)?;

    let signature = sender.signing_key().sign(&signature_input(&aad, &ciphertext));

    Ok(StatelessEnvelope {
        schema: SCHEMA,
        sender_id: sender_id.to_base58(),
        receiver_id: receiver_id.to_base58(),
        timestamp,
        nonce: STANDARD.encode(nonce.as_bytes()),
        fragment_index: fragment.index,
        fragment_count: fragment.count,
        payload: STANDARD.encode(&ciphertext),
        signature: STANDARD.encode(signature.as_bytes()),
    })
}

/// Verify and decrypt an envelope addressed to `receiver`.
///
/// Structural checks run first, in a fixed order, and each has its own
/// error; the signature is verified with the sender's trusted key before
/// any decryption is attempted.
///
/// # Errors
///
/// One [`EnvelopeError`] variant per rejection reason.
pub fn open(
    envelope: &StatelessEnvelope,
    receiver: &LocalIdentity,
    contacts: &dyn ContactLookup,
) -> Result<Vec<u8>, EnvelopeError> {
    if envelope.schema != SCHEMA {
        return Err(EnvelopeError::UnsupportedSchema(envelope.schema));
    }
    let fragment = Fragment {
        index: envelope.fragment_index,
        count: envelope.fragment_count,
    };
    check_fragment(fragment)?;

    let receiver_id: NodeId = envelope
        .receiver_id
        .parse()
        .map_err(|_| EnvelopeError::InvalidReceiverId)?;
    if receiver_id != receiver.node_id() {
        return Err(EnvelopeError::ReceiverMismatch);
    }

    let sender_id: NodeId = envelope
        .sender_id
        .parse()
        .map_err(|_| EnvelopeError::InvalidSenderId)?;
    let contact = contacts
        .contact(&sender_id)
        .ok_or(EnvelopeError::UnknownSender)?;

    let nonce_bytes = decode_field(&envelope.nonce, "nonce")?;
    let nonce = Nonce::from_slice(&nonce_bytes)
        .ok_or(EnvelopeError::InvalidNonceLength(nonce_bytes.len()))?;
    let ciphertext = decode_field(&envelope.payload, "payload")?;
    let signature_bytes = decode_field(&envelope.signature, "signature")?;

    let aad = build_aad(
        envelope.schema,
        &sender_id,
        &receiver_id,
        envelope.timestamp,
        &nonce,
        fragment,
    );
    let signature =
        Signature::from_slice(&signature_bytes).map_err(|_| EnvelopeError::BadSignature)?;
    contact
        .sig_key_public
        .verify(&signature_input(&aad, &ciphertext), &signature)
        .map_err(|_| EnvelopeError::BadSignature)?;

    let key = derive_envelope_key(
        receiver.enc_key(),
        &contact.enc_key_public,
        &sender_id,
        &receiver_id,
    )?;
    key.decrypt(&nonce, &ciphertext, &aad)
        .map_err(|_| EnvelopeError::Aead)
}

fn check_fragment(fragment: Fragment) -> Result<(), EnvelopeError> {
    if fragment.count < 1 {
        return Err(EnvelopeError::InvalidFragmentCount(fragment.count));
    }
    if !(0..fragment.count).contains(&fragment.index) {
        return Err(EnvelopeError::FragmentIndexOutOfRange {
            index: fragment.index,
            count: fragment.count,
        });
    }
    Ok(())
}

fn decode_field(value: &str, name: &'static str) -> Result<Vec<u8>, EnvelopeError> {
    STANDARD
        .decode(value)
        .map_err(|_| EnvelopeError::InvalidBase64(name))
}

fn derive_envelope_key(
    local_enc_key: &x25519::PrivateKey,
    peer_enc_key: &x25519::PublicKey,
    sender_id: &NodeId,
    receiver_id: &NodeId,
) -> Result<AeadKey, EnvelopeError> {
    let shared = local_enc_key
        .exchange(peer_enc_key)
        .map_err(|_| EnvelopeError::LowOrderPoint)?;

    let mut info = Vec::with_capacity(HKDF_INFO_PREFIX.len() + 32);
    info.extend_from_slice(HKDF_INFO_PREFIX);
    info.extend_from_slice(sender_id.as_bytes());
    info.extend_from_slice(receiver_id.as_bytes());

    let mut key =
        derive_key(shared.as_bytes(), &ZERO_SALT, &info).map_err(|_| EnvelopeError::Aead)?;
    let aead_key = AeadKey::new(key);
    key.zeroize();
    Ok(aead_key)
}

fn build_aad(
    schema: i32,
    sender_id: &NodeId,
    receiver_id: &NodeId,
    timestamp: i64,
    nonce: &Nonce,
    fragment: Fragment,
) -> Vec<u8> {
    let mut aad = Vec::with_capacity(AAD_SIZE);
    put_i32(&mut aad, schema);
    aad.extend_from_slice(sender_id.as_bytes());
    aad.extend_from_slice(receiver_id.as_bytes());
    put_i64(&mut aad, timestamp);
    aad.extend_from_slice(nonce.as_bytes());
    put_i32(&mut aad, fragment.index);
    put_i32(&mut aad, fragment.count);
    aad
}

fn signature_input(aad: &[u8], ciphertext: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(aad.len() + ciphertext.len());
    input.extend_from_slice(aad);
    input.extend_from_slice(ciphertext);
    input
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{ContactBook, ContactInfo};

    const TIMESTAMP: i64 = 1_700_000_000_000;

    struct Fixture {
        alice: LocalIdentity,
        bob: LocalIdentity,
        bob_contacts: ContactBook,
    }

    fn fixture() -> Fixture {
        let alice = LocalIdentity::generate();
        let bob = LocalIdentity::generate();
        let bob_contacts = ContactBook::new();
        bob_contacts.add(alice.contact_info());
        Fixture {
            alice,
            bob,
            bob_contacts,
        }
    }

    fn seal_for_bob(f: &Fixture, plaintext: &[u8]) -> StatelessEnvelope {
        seal(
            &f.alice,
            &f.bob.node_id(),
            &f.bob.enc_public(),
            plaintext,
            TIMESTAMP,
            Fragment::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let f = fixture();
        let envelope = seal_for_bob(&f, b"hello bob");
        assert_eq!(envelope.sender_id, f.alice.node_id().to_base58());
        assert_eq!(envelope.receiver_id, f.bob.node_id().to_base58());
        assert_eq!(
            open(&envelope, &f.bob, &f.bob_contacts).unwrap(),
            b"hello bob"
        );
    }

    #[test]
    fn test_wrong_receiver_rejected() {
        let f = fixture();
        let carol = LocalIdentity::generate();
        let carol_contacts = ContactBook::new();
        carol_contacts.add(f.alice.contact_info());

        let envelope = seal_for_bob(&f, b"for bob only");
        assert_eq!(
            open(&envelope, &carol, &carol_contacts),
            Err(EnvelopeError::ReceiverMismatch)
        );
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let f = fixture();
        let mut envelope = seal_for_bob(&f, b"x");
        let mut sig = STANDARD.decode(&envelope.signature).unwrap();
        sig[10] ^= 0x01;
        envelope.signature = STANDARD.encode(sig);
        assert_eq!(
            open(&envelope, &f.bob, &f.bob_contacts),
            Err(EnvelopeError::BadSignature)
        );
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let f = fixture();
        let mut envelope = seal_for_bob(&f, b"payload");
        let mut ct = STANDARD.decode(&envelope.payload).unwrap();
        ct[0] ^= 0x80;
        envelope.payload = STANDARD.encode(ct);
        assert_eq!(
            open(&envelope, &f.bob, &f.bob_contacts),
            Err(EnvelopeError::BadSignature)
        );
    }

    #[test]
    fn test_tampered_timestamp_rejected() {
        let f = fixture();
        let mut envelope = seal_for_bob(&f, b"payload");
        envelope.timestamp += 1;
        assert_eq!(
            open(&envelope, &f.bob, &f.bob_contacts),
            Err(EnvelopeError::BadSignature)
        );
    }

    #[test]
    fn test_unsupported_schema_rejected_first() {
        let f = fixture();
        let mut envelope = seal_for_bob(&f, b"x");
        envelope.schema = 99;
        envelope.nonce = "not base64!".into();
        assert_eq!(
            open(&envelope, &f.bob, &f.bob_contacts),
            Err(EnvelopeError::UnsupportedSchema(99))
        );
    }

    #[test]
    fn test_fragment_bounds() {
        let f = fixture();
        let mut envelope = seal_for_bob(&f, b"x");
        envelope.fragment_count = 0;
        assert_eq!(
            open(&envelope, &f.bob, &f.bob_contacts),
            Err(EnvelopeError::InvalidFragmentCount(0))
        );

        envelope.fragment_count = 2;
        envelope.fragment_index = 2;
        assert_eq!(
            open(&envelope, &f.bob, &f.bob_contacts),
            Err(EnvelopeError::FragmentIndexOutOfRange { index: 2, count: 2 })
        );

        envelope.fragment_index = -1;
        assert!(matches!(
            open(&envelope, &f.bob, &f.bob_contacts),
            Err(EnvelopeError::FragmentIndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_seal_validates_fragment() {
        let f = fixture();
        let result = seal(
            &f.alice,
            &f.bob.node_id(),
            &f.bob.enc_public(),
            b"x",
            TIMESTAMP,
            Fragment { index: 0, count: 0 },
        );
        assert_eq!(result, Err(EnvelopeError::InvalidFragmentCount(0)));
    }

    #[test]
    fn test_fragment_position_is_authenticated() {
        let f = fixture();
        let envelope = seal(
            &f.alice,
            &f.bob.node_id(),
            &f.bob.enc_public(),
            b"part two",
            TIMESTAMP,
            Fragment { index: 1, count: 3 },
        )
        .unwrap();
        assert_eq!(
            open(&envelope, &f.bob, &f.bob_contacts).unwrap(),
            b"part two"
        );

        let mut moved = envelope;
        moved.fragment_index = 0;
        assert_eq!(
            open(&moved, &f.bob, &f.bob_contacts),
            Err(EnvelopeError::BadSignature)
        );
    }

    #[test]
    fn test_unknown_sender_rejected() {
        let f = fixture();
        let envelope = seal_for_bob(&f, b"x");
        assert_eq!(
            open(&envelope, &f.bob, &ContactBook::new()),
            Err(EnvelopeError::UnknownSender)
        );
    }

    #[test]
    fn test_malformed_ids_rejected() {
        let f = fixture();
        let mut envelope = seal_for_bob(&f, b"x");
        envelope.receiver_id = "0OIl".into();
        assert_eq!(
            open(&envelope, &f.bob, &f.bob_contacts),
            Err(EnvelopeError::InvalidReceiverId)
        );

        let mut envelope = seal_for_bob(&f, b"x");
        envelope.sender_id = "abc".into();
        assert_eq!(
            open(&envelope, &f.bob, &f.bob_contacts),
            Err(EnvelopeError::InvalidSenderId)
        );
    }

    #[test]
    fn test_malformed_base64_fields_named() {
        let f = fixture();
        for field in ["nonce", "payload", "signature"] {
            let mut envelope = seal_for_bob(&f, b"x");
            match field {
                "nonce" => envelope.nonce = "***".into(),
                "payload" => envelope.payload = "***".into(),
                _ => envelope.signature = "***".into(),
            }
            assert_eq!(
                open(&envelope, &f.bob, &f.bob_contacts),
                Err(EnvelopeError::InvalidBase64(field))
            );
        }
    }

    #[test]
    fn test_wrong_nonce_length_rejected() {
        let f = fixture();
        let mut envelope = seal_for_bob(&f, b"x");
        envelope.nonce = STANDARD.encode([0u8; 8]);
        assert_eq!(
            open(&envelope, &f.bob, &f.bob_contacts),
            Err(EnvelopeError::InvalidNonceLength(8))
        );
    }

    #[test]
    fn test_wrong_enc_key_fails_aead() {
        let f = fixture();
        let envelope = seal_for_bob(&f, b"x");

        // Bob holds Alice's correct signing key but a stale encryption key
        let stale = ContactBook::new();
        stale.add(ContactInfo {
            sig_key_public: f.alice.verifying_key(),
            enc_key_public: LocalIdentity::generate().enc_public(),
        });
        assert_eq!(open(&envelope, &f.bob, &stale), Err(EnvelopeError::Aead));
    }

    #[test]
    fn test_low_order_receiver_key_rejected() {
        let f = fixture();
        let result = seal(
            &f.alice,
            &f.bob.node_id(),
            &x25519::PublicKey::from_bytes([0u8; 32]),
            b"x",
            TIMESTAMP,
            Fragment::default(),
        );
        assert_eq!(result, Err(EnvelopeError::LowOrderPoint));
    }

    #[test]
    fn test_json_roundtrip_and_field_names() {
        let f = fixture();
        let envelope = seal_for_bob(&f, b"relay me");
        let bytes = envelope.encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        for key in [
            "schema",
            "senderId",
            "receiverId",
            "timestamp",
            "nonce",
            "fragmentIndex",
            "fragmentCount",
            "payload",
            "signature",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }

        let decoded = StatelessEnvelope::decode(&bytes).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(open(&decoded, &f.bob, &f.bob_contacts).unwrap(), b"relay me");
    }
}
