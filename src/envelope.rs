//! Envelope & sealed-sender sealing (C2).
//!
//! Wire format: `version(1) | ephemeralPublicKey(32) | nonce(24) |
//! ciphertext(var) | senderSignature(64)`. The ciphertext is AEAD over
//! `HKDF(X25519(ephemPriv, recipientPub))` with associated data =
//! recipient-public-key ‖ version ‖ timestamp. The signature covers
//! `version ‖ ephemeralPub ‖ nonce ‖ ciphertext` with the sender's Ed25519
//! key, so a receiver can attribute a sealed envelope to its sender without
//! the sender's identity ever appearing in the ciphertext's AAD.

use ed25519_dalek::{SigningKey, VerifyingKey};
use thiserror::Error;

use crate::crypto;

pub const ENVELOPE_VERSION: u8 = 0x01;
const NONCE_LEN: usize = 24;
const EPHEMERAL_PK_LEN: usize = 32;
const SIGNATURE_LEN: usize = 64;
const HEADER_LEN: usize = 1 + EPHEMERAL_PK_LEN + NONCE_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope too short or malformed")]
    InvalidEnvelope,
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),
    #[error("signature verification failed")]
    BadSignature,
    #[error("{0}")]
    Crypto(#[from] crypto::CryptoError),
}

pub struct Envelope {
    pub version: u8,
    pub ephemeral_public_key: [u8; 32],
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub sender_signature: [u8; SIGNATURE_LEN],
}

impl Envelope {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.ciphertext.len() + SIGNATURE_LEN);
        out.push(self.version);
        out.extend_from_slice(&self.ephemeral_public_key);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.sender_signature);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() < HEADER_LEN + SIGNATURE_LEN {
            return Err(EnvelopeError::InvalidEnvelope);
        }
        let version = bytes[0];
        if version != ENVELOPE_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(version));
        }
        let mut ephemeral_public_key = [0u8; EPHEMERAL_PK_LEN];
        ephemeral_public_key.copy_from_slice(&bytes[1..1 + EPHEMERAL_PK_LEN]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[1 + EPHEMERAL_PK_LEN..HEADER_LEN]);
        let ciphertext_end = bytes.len() - SIGNATURE_LEN;
        let ciphertext = bytes[HEADER_LEN..ciphertext_end].to_vec();
        let mut sender_signature = [0u8; SIGNATURE_LEN];
        sender_signature.copy_from_slice(&bytes[ciphertext_end..]);
        Ok(Self {
            version,
            ephemeral_public_key,
            nonce,
            ciphertext,
            sender_signature,
        })
    }

    fn signed_region(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.ciphertext.len());
        buf.push(self.version);
        buf.extend_from_slice(&self.ephemeral_public_key);
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.ciphertext);
        buf
    }
}

/// True if `bytes` looks like a sealed envelope (version byte matches and
/// length is at least the minimum framing size).
pub fn is_sealed(bytes: &[u8]) -> bool {
    bytes.len() >= HEADER_LEN + SIGNATURE_LEN && bytes[0] == ENVELOPE_VERSION
}

/// Seal `plaintext` for `recipient_enc_pub`, signed by `sender_sign_priv`.
pub fn seal(
    plaintext: &[u8],
    sender_sign_priv: &SigningKey,
    recipient_enc_pub: &x25519_dalek::PublicKey,
    timestamp_ms: u64,
) -> Result<Envelope, EnvelopeError> {
    let (ephemeral_secret, ephemeral_public) = crypto::generate_x25519();
    let shared = crypto::ecdh(&ephemeral_secret, recipient_enc_pub);
    let key = crypto::derive_aead_key(&shared, ephemeral_public.as_bytes(), b"mesh-envelope-v1");

    let mut nonce = [0u8; NONCE_LEN];
    crypto::random_bytes(&mut nonce);

    let mut aad = Vec::with_capacity(32 + 1 + 8);
    aad.extend_from_slice(recipient_enc_pub.as_bytes());
    aad.push(ENVELOPE_VERSION);
    aad.extend_from_slice(&timestamp_ms.to_be_bytes());

    let ciphertext = crypto::xaead_encrypt(&key, &nonce, &aad, plaintext)?;

    let mut envelope = Envelope {
        version: ENVELOPE_VERSION,
        ephemeral_public_key: *ephemeral_public.as_bytes(),
        nonce,
        ciphertext,
        sender_signature: [0u8; SIGNATURE_LEN],
    };
    envelope.sender_signature = crypto::sign(sender_sign_priv, &envelope.signed_region());
    Ok(envelope)
}

/// Open a sealed envelope addressed to `recipient_enc_priv`, verifying it was
/// signed by `sender_sign_pub`.
pub fn open(
    envelope: &Envelope,
    recipient_enc_priv: &x25519_dalek::StaticSecret,
    recipient_enc_pub: &x25519_dalek::PublicKey,
    sender_sign_pub: &VerifyingKey,
    timestamp_ms: u64,
) -> Result<Vec<u8>, EnvelopeError> {
    if envelope.version != ENVELOPE_VERSION {
        return Err(EnvelopeError::UnsupportedVersion(envelope.version));
    }
    if !crypto::verify(
        sender_sign_pub,
        &envelope.signed_region(),
        &envelope.sender_signature,
    ) {
        return Err(EnvelopeError::BadSignature);
    }

    let ephemeral_public = x25519_dalek::PublicKey::from(envelope.ephemeral_public_key);
    let shared = crypto::ecdh(recipient_enc_priv, &ephemeral_public);
    let key = crypto::derive_aead_key(&shared, &envelope.ephemeral_public_key, b"mesh-envelope-v1");

    let mut aad = Vec::with_capacity(32 + 1 + 8);
    aad.extend_from_slice(recipient_enc_pub.as_bytes());
    aad.push(ENVELOPE_VERSION);
    aad.extend_from_slice(&timestamp_ms.to_be_bytes());

    let plaintext = crypto::xaead_decrypt(&key, &envelope.nonce, &aad, &envelope.ciphertext)?;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    fn recipient_keys() -> (x25519_dalek::StaticSecret, x25519_dalek::PublicKey) {
        let secret = crypto::ed25519_seed_to_x25519(&[0x22; 32]);
        let public = x25519_dalek::PublicKey::from(&secret);
        (secret, public)
    }

    #[test]
    fn seal_and_open_roundtrip() {
        let sender = SigningKey::from_bytes(&[0x11; 32]);
        let (recipient_priv, recipient_pub) = recipient_keys();
        let ts = 1_700_000_000_000u64;

        let envelope = seal(b"Hello, World!", &sender, &recipient_pub, ts).unwrap();
        let plaintext = open(
            &envelope,
            &recipient_priv,
            &recipient_pub,
            &sender.verifying_key(),
            ts,
        )
        .unwrap();
        assert_eq!(plaintext, b"Hello, World!");
    }

    #[test]
    fn wrong_recipient_key_fails() {
        let sender = SigningKey::from_bytes(&[0x11; 32]);
        let (_recipient_priv, recipient_pub) = recipient_keys();
        let (wrong_priv, _wrong_pub) = crypto::generate_x25519();
        let ts = 1_700_000_000_000u64;

        let envelope = seal(b"Hello, World!", &sender, &recipient_pub, ts).unwrap();
        let result = open(
            &envelope,
            &wrong_priv,
            &recipient_pub,
            &sender.verifying_key(),
            ts,
        );
        assert!(result.is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let sender = SigningKey::from_bytes(&[0x11; 32]);
        let (recipient_priv, recipient_pub) = recipient_keys();
        let ts = 1_700_000_000_000u64;

        let mut envelope = seal(b"Hello, World!", &sender, &recipient_pub, ts).unwrap();
        let last = envelope.ciphertext.len() - 1;
        envelope.ciphertext[last] ^= 0x01;
        envelope.sender_signature = crypto::sign(&sender, &envelope.signed_region());

        let result = open(
            &envelope,
            &recipient_priv,
            &recipient_pub,
            &sender.verifying_key(),
            ts,
        );
        assert!(result.is_err());
    }

    #[test]
    fn tampered_signature_fails() {
        let sender = SigningKey::from_bytes(&[0x11; 32]);
        let (recipient_priv, recipient_pub) = recipient_keys();
        let ts = 1_700_000_000_000u64;

        let mut envelope = seal(b"Hello, World!", &sender, &recipient_pub, ts).unwrap();
        envelope.sender_signature[0] ^= 0x01;

        let result = open(
            &envelope,
            &recipient_priv,
            &recipient_pub,
            &sender.verifying_key(),
            ts,
        );
        assert_eq!(result, Err(EnvelopeError::BadSignature));
    }

    #[test]
    fn is_sealed_detects_version_byte() {
        let sender = SigningKey::from_bytes(&[0x11; 32]);
        let (_recipient_priv, recipient_pub) = recipient_keys();
        let envelope = seal(b"x", &sender, &recipient_pub, 0).unwrap();
        let bytes = envelope.to_bytes();
        assert!(is_sealed(&bytes));
        assert!(!is_sealed(b"not an envelope"));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let sender = SigningKey::from_bytes(&[0x11; 32]);
        let (_recipient_priv, recipient_pub) = recipient_keys();
        let envelope = seal(b"roundtrip", &sender, &recipient_pub, 42).unwrap();
        let bytes = envelope.to_bytes();
        let decoded = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.ephemeral_public_key, envelope.ephemeral_public_key);
        assert_eq!(decoded.nonce, envelope.nonce);
        assert_eq!(decoded.ciphertext, envelope.ciphertext);
    }
}
