//! Wire protocol (C3): the fixed 109-byte signed header, message-type enum,
//! fragmentation/reassembly, and deduplication hashing.
//!
//! Encoding is bit-exact and big-endian throughout (§3, §6). The signed
//! region is the header's first 44 bytes (everything but the signature)
//! concatenated with the payload.

use std::collections::HashMap;
use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use thiserror::Error;

use crate::crypto;

pub const HEADER_LEN: usize = 109;
pub const SIGNED_HEADER_LEN: usize = 44;
pub const SIGNATURE_LEN: usize = 65;
pub const CURRENT_VERSION: u8 = 0x01;
pub const MAX_TTL: u8 = 64;
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;
pub const MAX_FRAGMENT_SIZE: usize = 60 * 1024;
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(60);
const CLOCK_SKEW_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    FileMetadata,
    FileChunk,
    Voice,
    ControlAck,
    ControlPing,
    ControlPong,
    PeerDiscovery,
    PeerIntroduction,
    KeyExchange,
    SessionKey,
}

impl MessageType {
    pub fn to_byte(self) -> u8 {
        match self {
            MessageType::Text => 0x01,
            MessageType::FileMetadata => 0x02,
            MessageType::FileChunk => 0x03,
            MessageType::Voice => 0x04,
            MessageType::ControlAck => 0x10,
            MessageType::ControlPing => 0x11,
            MessageType::ControlPong => 0x12,
            MessageType::PeerDiscovery => 0x20,
            MessageType::PeerIntroduction => 0x21,
            MessageType::KeyExchange => 0x30,
            MessageType::SessionKey => 0x31,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x01 => MessageType::Text,
            0x02 => MessageType::FileMetadata,
            0x03 => MessageType::FileChunk,
            0x04 => MessageType::Voice,
            0x10 => MessageType::ControlAck,
            0x11 => MessageType::ControlPing,
            0x12 => MessageType::ControlPong,
            0x20 => MessageType::PeerDiscovery,
            0x21 => MessageType::PeerIntroduction,
            0x30 => MessageType::KeyExchange,
            0x31 => MessageType::SessionKey,
            _ => return None,
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unsupported protocol version")]
    Version,
    #[error("unknown message type")]
    Type,
    #[error("TTL exceeds maximum")]
    Ttl,
    #[error("timestamp outside clock-skew window")]
    Timestamp,
    #[error("malformed sender id")]
    SenderId,
    #[error("signature verification failed")]
    Signature,
    #[error("payload exceeds MAX_PAYLOAD_SIZE")]
    PayloadTooLarge,
    #[error("per-peer rate limit exceeded")]
    RateLimited,
    #[error("malformed fragment")]
    MalformedFragment,
    #[error("reassembly timed out")]
    ReassemblyTimeout,
}

/// Decoded message header (§3). `payload` is carried alongside for signing
/// but is not part of the fixed 109-byte region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub message_type: u8,
    pub ttl: u8,
    pub timestamp_ms: u64,
    pub sender_public_key: [u8; 32],
    pub signature: [u8; SIGNATURE_LEN],
}

impl Header {
    /// Encode to the fixed 109-byte wire layout.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.version;
        out[1] = self.message_type;
        out[2] = self.ttl;
        out[3] = 0; // reserved
        out[4..12].copy_from_slice(&self.timestamp_ms.to_be_bytes());
        out[12..44].copy_from_slice(&self.sender_public_key);
        out[44..109].copy_from_slice(&self.signature);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != HEADER_LEN {
            return Err(ProtocolError::SenderId);
        }
        let mut timestamp_bytes = [0u8; 8];
        timestamp_bytes.copy_from_slice(&bytes[4..12]);
        let mut sender_public_key = [0u8; 32];
        sender_public_key.copy_from_slice(&bytes[12..44]);
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&bytes[44..109]);
        Ok(Header {
            version: bytes[0],
            message_type: bytes[1],
            ttl: bytes[2],
            timestamp_ms: u64::from_be_bytes(timestamp_bytes),
            sender_public_key,
            signature,
        })
    }

    /// The signed region: header bytes 0..44 concatenated with the payload.
    /// The 65-byte signature field is excluded.
    fn signed_region(&self, payload: &[u8]) -> Vec<u8> {
        let encoded = self.to_bytes();
        let mut buf = Vec::with_capacity(SIGNED_HEADER_LEN + payload.len());
        buf.extend_from_slice(&encoded[..SIGNED_HEADER_LEN]);
        buf.extend_from_slice(payload);
        buf
    }
}

/// Sign `header` (with its signature field ignored) over header‖payload.
pub fn sign_header(
    mut header: Header,
    payload: &[u8],
    signing_key: &ed25519_dalek::SigningKey,
) -> Header {
    header.signature = [0u8; SIGNATURE_LEN];
    let region = header.signed_region(payload);
    let sig65 = sign_65(signing_key, &region);
    header.signature = sig65;
    header
}

/// Ed25519 signatures are 64 bytes; the wire field is 65. The extra trailing
/// byte is reserved (always 0) and kept so the header's signed-region
/// bookkeeping lines up with the §3 byte table.
fn sign_65(signing_key: &ed25519_dalek::SigningKey, message: &[u8]) -> [u8; SIGNATURE_LEN] {
    let sig64 = crypto::sign(signing_key, message);
    let mut out = [0u8; SIGNATURE_LEN];
    out[..64].copy_from_slice(&sig64);
    out
}

/// Verify `header`'s signature over header‖payload.
pub fn verify_header(header: &Header, payload: &[u8], sender: &VerifyingKey) -> bool {
    let region = header.signed_region(payload);
    let mut sig64 = [0u8; 64];
    sig64.copy_from_slice(&header.signature[..64]);
    crypto::verify(sender, &region, &sig64)
}

/// Validate a decoded header + payload against the policy in §4.3. Does not
/// check the signature; callers verify separately after this passes so a
/// malformed-but-well-signed packet is still rejected with the right
/// subkind. `max_ttl`/`clock_skew_ms` are caller-supplied (from `Config`)
/// rather than hardcoded, so a host app can retune both per §4.12.
pub fn validate(
    header: &Header,
    payload: &[u8],
    now_ms: i64,
    max_ttl: u8,
    clock_skew_ms: i64,
) -> Result<(), ProtocolError> {
    if header.version != CURRENT_VERSION {
        return Err(ProtocolError::Version);
    }
    if MessageType::from_byte(header.message_type).is_none() {
        return Err(ProtocolError::Type);
    }
    if header.ttl > max_ttl {
        return Err(ProtocolError::Ttl);
    }
    let ts = header.timestamp_ms as i64;
    if ts < 0 || (ts - now_ms).abs() > clock_skew_ms {
        return Err(ProtocolError::Timestamp);
    }
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge);
    }
    Ok(())
}

/// `messageHash(packet) = SHA-256(encoded packet)`. Used for deduplication
/// and as a log identifier. SHA-256 is mandated (not a rolling hash) to
/// avoid collision-based replay.
pub fn message_hash(header: &Header, payload: &[u8]) -> [u8; 32] {
    let mut buf = header.to_bytes().to_vec();
    buf.extend_from_slice(payload);
    crypto::sha256(&buf)
}

// ─── Fragmentation ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub message_id: [u8; 16],
    pub index: u16,
    pub total: u16,
    pub data: Vec<u8>,
}

/// Split `payload` into fragments of at most `MAX_FRAGMENT_SIZE` bytes,
/// sharing a random `message_id`.
pub fn fragment(payload: &[u8]) -> Vec<Fragment> {
    let mut message_id = [0u8; 16];
    crypto::random_bytes(&mut message_id);

    let chunks: Vec<&[u8]> = payload.chunks(MAX_FRAGMENT_SIZE).collect();
    let total = chunks.len().max(1) as u16;
    if payload.is_empty() {
        return vec![Fragment {
            message_id,
            index: 0,
            total: 1,
            data: Vec::new(),
        }];
    }
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| Fragment {
            message_id,
            index: i as u16,
            total,
            data: chunk.to_vec(),
        })
        .collect()
}

struct PendingReassembly {
    total: u16,
    received: HashMap<u16, Vec<u8>>,
    last_activity: std::time::Instant,
}

/// Reassembles fragments arriving out of order; duplicates are idempotent.
/// Entries inactive for longer than [`REASSEMBLY_TIMEOUT`] are purged by
/// [`Reassembler::sweep`].
pub struct Reassembler {
    pending: HashMap<[u8; 16], PendingReassembly>,
    timeout: Duration,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_timeout(REASSEMBLY_TIMEOUT)
    }

    /// Construct with a reassembly idle timeout read from `Config` rather
    /// than the hardcoded default, per §4.12.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
        }
    }

    /// Feed one fragment in. Returns `Some(payload)` once every fragment for
    /// that messageId has arrived.
    pub fn accept(&mut self, fragment: Fragment) -> Result<Option<Vec<u8>>, ProtocolError> {
        if fragment.total == 0 || fragment.index >= fragment.total {
            return Err(ProtocolError::MalformedFragment);
        }
        let entry = self
            .pending
            .entry(fragment.message_id)
            .or_insert_with(|| PendingReassembly {
                total: fragment.total,
                received: HashMap::new(),
                last_activity: std::time::Instant::now(),
            });
        if entry.total != fragment.total {
            return Err(ProtocolError::MalformedFragment);
        }
        entry.last_activity = std::time::Instant::now();
        entry.received.insert(fragment.index, fragment.data);

        if entry.received.len() as u16 == entry.total {
            let entry = self.pending.remove(&fragment.message_id).unwrap();
            let mut out = Vec::new();
            for i in 0..entry.total {
                out.extend_from_slice(
                    entry
                        .received
                        .get(&i)
                        .expect("all indices present when total reached"),
                );
            }
            return Ok(Some(out));
        }
        Ok(None)
    }

    /// Remove reassembly buffers idle longer than this reassembler's timeout.
    pub fn sweep(&mut self) {
        let now = std::time::Instant::now();
        let timeout = self.timeout;
        self.pending
            .retain(|_, entry| now.duration_since(entry.last_activity) < timeout);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}
