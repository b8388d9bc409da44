//! Identity (C2): the local Ed25519 keypair, its fingerprint, and peerId.
//!
//! An Identity is created once per install and never mutated; it is loaded
//! from or saved to a [`crate::adapters::SecretStore`] by the caller.

use std::sync::RwLock;

use ed25519_dalek::{SigningKey, VerifyingKey};
use thiserror::Error;

use crate::crypto;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("invalid key encoding")]
    KeyFormat,
}

/// 16-character upper-hex peerId derived from the leading 8 bytes of the
/// fingerprint.
pub type PeerId = String;

/// Holds the signing key behind a lock so [`Identity::wipe`] can zero it in
/// place through `&self` — the facade's `shutdown()` only ever has a shared
/// reference to its identity, since other components may still hold a
/// clone of the surrounding `Arc`.
pub struct Identity {
    signing_key: RwLock<SigningKey>,
}

impl Identity {
    /// Generate a fresh Identity with a random Ed25519 keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: RwLock::new(crypto::generate_ed25519()),
        }
    }

    /// Load an Identity from a raw 32-byte Ed25519 seed, as read back from a
    /// `SecretStore`.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: RwLock::new(SigningKey::from_bytes(seed)),
        }
    }

    /// The raw 32-byte seed, for persistence through `SecretStore`.
    pub fn seed_bytes(&self) -> [u8; 32] {
        self.signing_key.read().expect("identity lock poisoned").to_bytes()
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.read().expect("identity lock poisoned").verifying_key()
    }

    /// A clone of the current signing key, valid until the next [`Identity::wipe`].
    pub fn signing_key(&self) -> SigningKey {
        self.signing_key.read().expect("identity lock poisoned").clone()
    }

    /// Full 64-character upper-hex SHA-256 of the public key.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.public_key())
    }

    /// 16-character upper-hex peerId: the leading 8 bytes of the fingerprint.
    pub fn peer_id(&self) -> PeerId {
        peer_id_of(&self.public_key())
    }

    /// Zero the signing key in place. Called explicitly by `shutdown()` and
    /// again by `Drop` for callers that never shut down cleanly.
    pub fn wipe(&self) {
        let mut key = self.signing_key.write().expect("identity lock poisoned");
        let mut seed = key.to_bytes();
        crypto::wipe(&mut seed);
        *key = SigningKey::from_bytes(&seed);
    }
}

impl Drop for Identity {
    fn drop(&mut self) {
        self.wipe();
    }
}

pub fn fingerprint_of(public: &VerifyingKey) -> String {
    let digest = crypto::sha256(public.as_bytes());
    hex::encode_upper(digest)
}

pub fn peer_id_of(public: &VerifyingKey) -> PeerId {
    fingerprint_of(public)[..16].to_string()
}

/// Normalize a peerId for comparison: upper-case, whitespace stripped.
/// Equality checks between peerIds MUST go through this first.
pub fn normalize_peer_id(raw: &str) -> PeerId {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

pub fn parse_public_key(bytes: &[u8]) -> Result<VerifyingKey, IdentityError> {
    let arr: [u8; 32] = bytes.try_into().map_err(|_| IdentityError::KeyFormat)?;
    VerifyingKey::from_bytes(&arr).map_err(|_| IdentityError::KeyFormat)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_is_deterministic_from_public_key() {
        let identity = Identity::generate();
        let a = identity.peer_id();
        let b = peer_id_of(&identity.public_key());
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn fingerprint_is_64_hex_chars() {
        let identity = Identity::generate();
        let fp = identity.fingerprint();
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn from_seed_is_reproducible() {
        let seed = [0x42; 32];
        let a = Identity::from_seed(&seed);
        let b = Identity::from_seed(&seed);
        assert_eq!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn normalize_is_idempotent_and_equality_preserving() {
        let a = normalize_peer_id(" ab12 CD34 ");
        let b = normalize_peer_id("AB12CD34");
        assert_eq!(a, b);
        assert_eq!(normalize_peer_id(&a), a);
    }
}
