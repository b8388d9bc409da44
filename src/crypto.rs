//! Crypto primitives (C1): Ed25519 sign/verify, X25519 ECDH, AEAD, HKDF-SHA256,
//! digests, constant-time compare, and secure wipe.
//!
//! Every private key or shared secret that touches a stack buffer in this
//! module is wiped before the buffer drops.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

/// Largest plaintext a single AEAD call accepts (§4.1).
pub const MAX_AEAD_PLAINTEXT: usize = 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("random generation failed")]
    Random,
    #[error("invalid key encoding")]
    KeyFormat,
    #[error("signing failed")]
    SignFailed,
    #[error("signature verification failed")]
    VerifyFailed,
    #[error("AEAD authentication tag mismatch")]
    AuthTag,
    #[error("invalid length")]
    Size,
}

/// Convert a 32-byte Ed25519 seed to an X25519 static secret.
/// Uses SHA-512/clamp derivation (RFC 7748 §5).
pub fn ed25519_seed_to_x25519(seed_bytes: &[u8; 32]) -> StaticSecret {
    let hash = sha2::Sha512::digest(seed_bytes);
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash[..32]);
    key[0] &= 248;
    key[31] &= 127;
    key[31] |= 64;
    let secret = StaticSecret::from(key);
    key.zeroize();
    secret
}

/// Convert a 32-byte Ed25519 compressed public key to X25519 Montgomery form.
pub fn ed25519_pubkey_to_x25519(pubkey_bytes: &[u8; 32]) -> Result<X25519Public, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;
    let compressed = CompressedEdwardsY(*pubkey_bytes);
    let point = compressed.decompress().ok_or(CryptoError::KeyFormat)?;
    Ok(X25519Public::from(point.to_montgomery().to_bytes()))
}

/// Generate a fresh Ed25519 signing keypair.
pub fn generate_ed25519() -> SigningKey {
    SigningKey::generate(&mut rand::rngs::OsRng)
}

/// Generate a fresh X25519 keypair, returning (secret, public).
pub fn generate_x25519() -> (StaticSecret, X25519Public) {
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = X25519Public::from(&secret);
    (secret, public)
}

/// Detached-sign `message` with `key`.
pub fn sign(key: &SigningKey, message: &[u8]) -> [u8; 64] {
    key.sign(message).to_bytes()
}

/// Verify a detached signature. Never panics on malformed input.
pub fn verify(public: &VerifyingKey, message: &[u8], signature: &[u8; 64]) -> bool {
    match Signature::try_from(signature.as_slice()) {
        Ok(sig) => public.verify(message, &sig).is_ok(),
        Err(_) => false,
    }
}

/// X25519 Diffie-Hellman. Symmetric: `ecdh(a.priv, b.pub) == ecdh(b.priv, a.pub)`.
pub fn ecdh(our_secret: &StaticSecret, their_public: &X25519Public) -> [u8; 32] {
    our_secret.diffie_hellman(their_public).to_bytes()
}

/// HKDF-SHA256 extract-then-expand, matching the teacher's
/// ephemeral-pubkey-as-salt binding.
pub fn derive_aead_key(shared: &[u8; 32], salt: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared);
    let mut key = [0u8; 32];
    hk.expand(info, &mut key)
        .expect("HKDF output length is always valid for a 32-byte key");
    key
}

/// ChaCha20-Poly1305 AEAD encrypt with an explicit 12-byte nonce.
pub fn aead_encrypt(
    key: &[u8; 32],
    nonce: &[u8; 12],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if plaintext.len() > MAX_AEAD_PLAINTEXT {
        return Err(CryptoError::Size);
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload { msg: plaintext, aad },
        )
        .map_err(|_| CryptoError::AuthTag)
}

/// ChaCha20-Poly1305 AEAD decrypt with an explicit 12-byte nonce.
pub fn aead_decrypt(
    key: &[u8; 32],
    nonce: &[u8; 12],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AuthTag)
}

/// XChaCha20-Poly1305 AEAD encrypt with a 24-byte nonce, used for envelopes.
pub fn xaead_encrypt(
    key: &[u8; 32],
    nonce: &[u8; 24],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if plaintext.len() > MAX_AEAD_PLAINTEXT {
        return Err(CryptoError::Size);
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload { msg: plaintext, aad },
        )
        .map_err(|_| CryptoError::AuthTag)
}

/// XChaCha20-Poly1305 AEAD decrypt with a 24-byte nonce.
pub fn xaead_decrypt(
    key: &[u8; 32],
    nonce: &[u8; 24],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AuthTag)
}

/// SHA-256 digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Constant-time byte equality.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Fill `out` with cryptographically secure random bytes.
pub fn random_bytes(out: &mut [u8]) {
    use rand::RngCore;
    rand::rngs::OsRng.fill_bytes(out);
}

/// Zero a private-key-shaped buffer in place. Called explicitly after every
/// use of a raw private key or shared secret that isn't already wrapped in a
/// `Zeroize`-on-drop type.
pub fn wipe(buf: &mut [u8]) {
    buf.zeroize();
}
