//! Per-peer message rate limiting (§5, §6): default 60/min and 3600/hour,
//! rejected packets never enter the outbox.
//!
//! Adapted from the handshake rate limiter's per-IP token-bucket pattern,
//! re-keyed on peerId and carrying two simultaneous quotas (minute + hour)
//! instead of one.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::RwLock;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorRateLimiter};

use crate::identity::PeerId;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub per_minute: u32,
    pub per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 60,
            per_hour: 3600,
        }
    }
}

struct PeerLimiters {
    minute: DefaultDirectRateLimiter,
    hour: DefaultDirectRateLimiter,
}

/// Per-peer dual-window token bucket. `check` rejects with
/// `ProtocolError::RateLimited` semantics left to the caller — this type
/// only reports allowed/denied.
pub struct RateLimiter {
    limiters: RwLock<HashMap<PeerId, PeerLimiters>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            limiters: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Returns `true` if a message from `peer_id` is allowed right now.
    pub fn check(&self, peer_id: &PeerId) -> bool {
        let mut limiters = self.limiters.write().expect("rate limiter lock poisoned");
        let entry = limiters.entry(peer_id.clone()).or_insert_with(|| {
            let per_minute = NonZeroU32::new(self.config.per_minute).unwrap_or(NonZeroU32::MIN);
            let per_hour = NonZeroU32::new(self.config.per_hour).unwrap_or(NonZeroU32::MIN);
            PeerLimiters {
                minute: GovernorRateLimiter::direct(Quota::per_minute(per_minute)),
                hour: GovernorRateLimiter::direct(Quota::per_hour(per_hour)),
            }
        });
        entry.minute.check().is_ok() && entry.hour.check().is_ok()
    }

    pub fn tracked_peers(&self) -> usize {
        self.limiters.read().map(|l| l.len()).unwrap_or(0)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
