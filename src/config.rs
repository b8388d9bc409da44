//! Configuration (§6, §4.12): every recognized option plus the transport
//! timeouts and clock-skew window named in §5/§4.3. `Config::default()`
//! matches the spec's listed defaults exactly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_peers: usize,
    pub default_ttl: u8,
    pub max_ttl: u8,
    pub k: usize,
    pub alpha: usize,
    pub replication_factor: usize,
    pub dht_value_max_bytes: usize,
    pub dht_quota_bytes_per_publisher: usize,
    pub outbox_capacity: usize,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    pub gossip_interval_ms: u64,
    pub seen_hash_lru_size: usize,
    pub seen_hash_retention_ms: u64,
    pub reassembly_timeout_ms: u64,
    pub rate_limit_per_minute: u32,
    pub rate_limit_per_hour: u32,

    /// Transport connect deadline (§5: defaults 10/15/30s).
    pub connect_timeout_ms: u64,
    /// DHT round-trip deadline.
    pub dht_round_timeout_ms: u64,
    /// Rendezvous poll deadline.
    pub rendezvous_poll_timeout_ms: u64,
    /// Clock-skew window for header timestamp validation (§4.3).
    pub clock_skew_ms: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_peers: 50,
            default_ttl: 10,
            max_ttl: 64,
            k: 20,
            alpha: 3,
            replication_factor: 3,
            dht_value_max_bytes: 65_536,
            dht_quota_bytes_per_publisher: 1_048_576,
            outbox_capacity: 100,
            max_retries: 3,
            retry_base_ms: 5_000,
            retry_cap_ms: 600_000,
            gossip_interval_ms: 30_000,
            seen_hash_lru_size: 8192,
            seen_hash_retention_ms: 600_000,
            reassembly_timeout_ms: 60_000,
            rate_limit_per_minute: 60,
            rate_limit_per_hour: 3600,
            connect_timeout_ms: 10_000,
            dht_round_timeout_ms: 15_000,
            rendezvous_poll_timeout_ms: 30_000,
            clock_skew_ms: 24 * 60 * 60 * 1000,
        }
    }
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn dht_round_timeout(&self) -> Duration {
        Duration::from_millis(self.dht_round_timeout_ms)
    }

    pub fn rendezvous_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.rendezvous_poll_timeout_ms)
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn seen_hash_retention(&self) -> Duration {
        Duration::from_millis(self.seen_hash_retention_ms)
    }

    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_millis(self.reassembly_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let config = Config::default();
        assert_eq!(config.max_peers, 50);
        assert_eq!(config.default_ttl, 10);
        assert_eq!(config.max_ttl, 64);
        assert_eq!(config.k, 20);
        assert_eq!(config.alpha, 3);
        assert_eq!(config.replication_factor, 3);
        assert_eq!(config.dht_value_max_bytes, 65_536);
        assert_eq!(config.dht_quota_bytes_per_publisher, 1_048_576);
        assert_eq!(config.outbox_capacity, 100);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_base_ms, 5_000);
        assert_eq!(config.retry_cap_ms, 600_000);
        assert_eq!(config.gossip_interval_ms, 30_000);
        assert_eq!(config.seen_hash_lru_size, 8192);
        assert_eq!(config.seen_hash_retention_ms, 600_000);
        assert_eq!(config.reassembly_timeout_ms, 60_000);
        assert_eq!(config.rate_limit_per_minute, 60);
        assert_eq!(config.rate_limit_per_hour, 3600);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_peers, Config::default().max_peers);
    }
}
