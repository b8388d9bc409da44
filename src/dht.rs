//! DHT (C6): Kademlia store / find-value / find-node with replication,
//! quorum, TTL, and per-publisher storage quotas.
//!
//! Local storage quota/validation logic lives here; the iterative network
//! round-trips (`store`/`findValue`/`findNode`) are expressed against a
//! [`DhtRpc`] capability so this module stays transport-agnostic — a real
//! deployment wires it to [`crate::transport::Transport`] via the wire
//! protocol, tests wire it to an in-process stub.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::identity::PeerId;
use crate::routing::{NodeKey, RoutingEntry, RoutingTable};

pub const DEFAULT_ALPHA: usize = 3;
pub const DEFAULT_REPLICATION_FACTOR: usize = 3;
pub const DEFAULT_QUOTA_BYTES_PER_PUBLISHER: usize = 1024 * 1024;
pub const DEFAULT_QUOTA_KEYS_PER_PUBLISHER: usize = 256;
pub const MAX_VALUE_SIZE: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DhtError {
    #[error("key not found")]
    NotFound,
    #[error("publisher quota exceeded")]
    QuotaExceeded,
    #[error("value exceeds MAX_VALUE_SIZE")]
    ValueTooLarge,
    #[error("no closer peers to continue the lookup")]
    NoCloserPeers,
    #[error("lookup timed out")]
    LookupTimeout,
}

#[derive(Debug, Clone)]
pub struct DhtRecord {
    pub key: [u8; 32],
    pub value: Vec<u8>,
    pub stored_at_ms: u64,
    pub expires_at_ms: u64,
    pub publisher_id: PeerId,
}

/// The network-facing half of a DHT round: send a STORE / FIND_VALUE /
/// FIND_NODE request to one peer and await its reply. A production
/// implementation frames these through `wire`/`transport`; tests use a
/// fully in-process stub.
#[async_trait]
pub trait DhtRpc: Send + Sync {
    async fn store_at(&self, peer: &RoutingEntry, record: &DhtRecord) -> bool;
    async fn find_value_at(&self, peer: &RoutingEntry, key: &[u8; 32]) -> FindValueReply;
    async fn find_node_at(&self, peer: &RoutingEntry, target: &NodeKey) -> Vec<RoutingEntry>;
}

pub enum FindValueReply {
    Value(DhtRecord),
    CloserPeers(Vec<RoutingEntry>),
    Timeout,
}

struct PublisherUsage {
    bytes: usize,
    keys: usize,
}

/// Local record storage with per-publisher quotas and lazy + periodic
/// expiry pruning.
pub struct LocalStore {
    records: RwLock<HashMap<[u8; 32], DhtRecord>>,
    usage: RwLock<HashMap<PeerId, PublisherUsage>>,
    quota_bytes: usize,
    quota_keys: usize,
    max_value_size: usize,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::with_quotas(
            DEFAULT_QUOTA_BYTES_PER_PUBLISHER,
            DEFAULT_QUOTA_KEYS_PER_PUBLISHER,
        )
    }

    pub fn with_quotas(quota_bytes: usize, quota_keys: usize) -> Self {
        Self::with_limits(quota_bytes, quota_keys, MAX_VALUE_SIZE)
    }

    /// Construct with every limit read from `Config` rather than the
    /// hardcoded defaults, per §4.12.
    pub fn with_limits(quota_bytes: usize, quota_keys: usize, max_value_size: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            usage: RwLock::new(HashMap::new()),
            quota_bytes,
            quota_keys,
            max_value_size,
        }
    }

    /// Insert/overwrite a record locally, enforcing the publisher quota and
    /// `max_value_size`. On key collision from a different storedAt, the
    /// record with the later `storedAt` wins, ties broken by
    /// lexicographically smaller publisher id. A legitimate overwrite nets
    /// the old occupant's footprint out of its publisher's usage before
    /// charging the new one, so repeated updates to the same key don't
    /// inflate usage indefinitely.
    pub async fn put(&self, record: DhtRecord) -> Result<(), DhtError> {
        if record.value.len() > self.max_value_size {
            return Err(DhtError::ValueTooLarge);
        }

        let mut records = self.records.write().await;
        let existing = records.get(&record.key).cloned();
        if let Some(existing) = &existing {
            let incoming_wins = match record.stored_at_ms.cmp(&existing.stored_at_ms) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Less => false,
                std::cmp::Ordering::Equal => record.publisher_id < existing.publisher_id,
            };
            if !incoming_wins {
                return Ok(());
            }
        }

        let mut usage = self.usage.write().await;
        if let Some(old) = &existing {
            if let Some(old_usage) = usage.get_mut(&old.publisher_id) {
                old_usage.bytes = old_usage.bytes.saturating_sub(old.value.len());
                old_usage.keys = old_usage.keys.saturating_sub(1);
            }
        }

        let current = usage
            .get(&record.publisher_id)
            .map(|u| (u.bytes, u.keys))
            .unwrap_or((0, 0));
        let projected_bytes = current.0 + record.value.len();
        let projected_keys = current.1 + 1;
        if projected_bytes > self.quota_bytes || projected_keys > self.quota_keys {
            if let Some(old) = &existing {
                let old_usage = usage.entry(old.publisher_id.clone()).or_insert(PublisherUsage {
                    bytes: 0,
                    keys: 0,
                });
                old_usage.bytes += old.value.len();
                old_usage.keys += 1;
            }
            return Err(DhtError::QuotaExceeded);
        }
        let entry = usage.entry(record.publisher_id.clone()).or_insert(PublisherUsage {
            bytes: 0,
            keys: 0,
        });
        entry.bytes = projected_bytes;
        entry.keys = projected_keys;

        records.insert(record.key, record);
        Ok(())
    }

    /// Returns the record if present and unexpired; expired entries are
    /// pruned on read (lazy expiry).
    pub async fn get(&self, key: &[u8; 32], now_ms: u64) -> Option<DhtRecord> {
        let mut records = self.records.write().await;
        match records.get(key) {
            Some(record) if record.expires_at_ms > now_ms => Some(record.clone()),
            Some(_) => {
                records.remove(key);
                None
            }
            None => None,
        }
    }

    /// Eagerly sweep all expired records, for the periodic maintenance
    /// timer.
    pub async fn sweep_expired(&self, now_ms: u64) {
        self.records.write().await.retain(|_, r| r.expires_at_ms > now_ms);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Dht {
    routing_table: Arc<RoutingTable>,
    local_store: LocalStore,
    rpc: Arc<dyn DhtRpc>,
    alpha: usize,
    replication_factor: usize,
    max_value_size: usize,
}

impl Dht {
    pub fn new(routing_table: Arc<RoutingTable>, rpc: Arc<dyn DhtRpc>) -> Self {
        Self {
            routing_table,
            local_store: LocalStore::new(),
            rpc,
            alpha: DEFAULT_ALPHA,
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            max_value_size: MAX_VALUE_SIZE,
        }
    }

    /// Construct with alpha, replication factor, and storage limits read
    /// from `Config` rather than the hardcoded defaults, per §4.12.
    pub fn with_config(
        routing_table: Arc<RoutingTable>,
        rpc: Arc<dyn DhtRpc>,
        config: &crate::config::Config,
    ) -> Self {
        Self {
            routing_table,
            local_store: LocalStore::with_limits(
                config.dht_quota_bytes_per_publisher,
                DEFAULT_QUOTA_KEYS_PER_PUBLISHER,
                config.dht_value_max_bytes,
            ),
            rpc,
            alpha: config.alpha,
            replication_factor: config.replication_factor,
            max_value_size: config.dht_value_max_bytes,
        }
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local_store
    }

    /// Find the alpha closest peers, send each a STORE, and acknowledge
    /// once at least `replication_factor` confirm or the alpha-set is
    /// exhausted.
    pub async fn store(
        &self,
        key: [u8; 32],
        value: Vec<u8>,
        ttl: Duration,
        publisher_id: PeerId,
    ) -> Result<usize, DhtError> {
        if value.len() > self.max_value_size {
            return Err(DhtError::ValueTooLarge);
        }
        let now = now_ms();
        let record = DhtRecord {
            key,
            value,
            stored_at_ms: now,
            expires_at_ms: now + ttl.as_millis() as u64,
            publisher_id,
        };

        let closest = self.routing_table.closest(&key, self.alpha).await;
        let mut confirmations = 0usize;
        for peer in &closest {
            if self.rpc.store_at(peer, &record).await {
                confirmations += 1;
                if confirmations >= self.replication_factor {
                    break;
                }
            }
        }
        Ok(confirmations)
    }

    /// Iterative lookup: start from the alpha closest known peers, query
    /// each round, merge returned peers, and continue on the new alpha
    /// closest until no progress is made or the value is found.
    pub async fn find_value(&self, key: [u8; 32]) -> Result<DhtRecord, DhtError> {
        if let Some(record) = self.local_store.get(&key, now_ms()).await {
            return Ok(record);
        }

        let mut frontier = self.routing_table.closest(&key, self.alpha).await;
        let mut queried: std::collections::HashSet<PeerId> = std::collections::HashSet::new();

        loop {
            let round: Vec<&RoutingEntry> = frontier
                .iter()
                .filter(|p| !queried.contains(&p.peer_id))
                .take(self.alpha)
                .collect();
            if round.is_empty() {
                return Err(DhtError::NotFound);
            }

            let mut next_candidates = Vec::new();
            let mut found = None;
            for peer in &round {
                queried.insert(peer.peer_id.clone());
                match self.rpc.find_value_at(peer, &key).await {
                    FindValueReply::Value(record) => {
                        found = Some(record);
                        break;
                    }
                    FindValueReply::CloserPeers(peers) => next_candidates.extend(peers),
                    FindValueReply::Timeout => {}
                }
            }
            if let Some(record) = found {
                return Ok(record);
            }

            let before_len = frontier.len();
            for candidate in next_candidates {
                if !frontier.iter().any(|p| p.peer_id == candidate.peer_id) {
                    frontier.push(candidate);
                }
            }
            frontier.sort_by_key(|p| crate::routing::xor_distance(&key, &p.node_key));
            frontier.truncate(DEFAULT_ALPHA.max(20));

            if frontier.len() == before_len && frontier.iter().all(|p| queried.contains(&p.peer_id)) {
                return Err(DhtError::NotFound);
            }
        }
    }

    /// Same iterative process as `find_value` but without early termination
    /// on finding a value — used to locate node contacts near `target`.
    pub async fn find_node(&self, target: NodeKey) -> Vec<RoutingEntry> {
        let mut frontier = self.routing_table.closest(&target, self.alpha).await;
        let mut queried: std::collections::HashSet<PeerId> = std::collections::HashSet::new();

        loop {
            let round: Vec<&RoutingEntry> = frontier
                .iter()
                .filter(|p| !queried.contains(&p.peer_id))
                .take(self.alpha)
                .collect();
            if round.is_empty() {
                break;
            }
            let mut next_candidates = Vec::new();
            for peer in &round {
                queried.insert(peer.peer_id.clone());
                next_candidates.extend(self.rpc.find_node_at(peer, &target).await);
            }
            let before_len = frontier.len();
            for candidate in next_candidates {
                if !frontier.iter().any(|p| p.peer_id == candidate.peer_id) {
                    frontier.push(candidate);
                }
            }
            frontier.sort_by_key(|p| crate::routing::xor_distance(&target, &p.node_key));
            frontier.truncate(20);
            if frontier.len() == before_len {
                break;
            }
        }
        frontier
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::RoutingEntry;

    fn record(key: [u8; 32], value: &[u8], publisher: &str) -> DhtRecord {
        let now = now_ms();
        DhtRecord {
            key,
            value: value.to_vec(),
            stored_at_ms: now,
            expires_at_ms: now + 60_000,
            publisher_id: publisher.to_string(),
        }
    }

    #[tokio::test]
    async fn quota_exceeded_on_bytes() {
        let store = LocalStore::with_quotas(10, 256);
        let r1 = record([1u8; 32], &[0u8; 8], "PUB0001");
        assert!(store.put(r1).await.is_ok());
        let r2 = record([2u8; 32], &[0u8; 8], "PUB0001");
        assert_eq!(store.put(r2).await, Err(DhtError::QuotaExceeded));
    }

    #[tokio::test]
    async fn value_too_large_rejected() {
        let store = LocalStore::new();
        let r = record([1u8; 32], &vec![0u8; MAX_VALUE_SIZE + 1], "PUB0001");
        assert_eq!(store.put(r).await, Err(DhtError::ValueTooLarge));
    }

    #[tokio::test]
    async fn expired_record_pruned_on_read() {
        let store = LocalStore::new();
        let mut r = record([1u8; 32], b"value", "PUB0001");
        r.expires_at_ms = now_ms(); // already expired relative to "later" reads
        store.put(r).await.unwrap();
        let later = now_ms() + 1000;
        assert!(store.get(&[1u8; 32], later).await.is_none());
    }

    #[tokio::test]
    async fn later_stored_at_wins_on_collision() {
        let store = LocalStore::new();
        let mut older = record([1u8; 32], b"old", "PUB0001");
        older.stored_at_ms = 100;
        older.expires_at_ms = u64::MAX;
        store.put(older).await.unwrap();

        let mut newer = record([1u8; 32], b"new", "PUB0002");
        newer.stored_at_ms = 200;
        newer.expires_at_ms = u64::MAX;
        store.put(newer).await.unwrap();

        let got = store.get(&[1u8; 32], 0).await.unwrap();
        assert_eq!(got.value, b"new");
    }

    struct StubRpc {
        values: HashMap<PeerId, DhtRecord>,
    }

    #[async_trait]
    impl DhtRpc for StubRpc {
        async fn store_at(&self, _peer: &RoutingEntry, _record: &DhtRecord) -> bool {
            true
        }
        async fn find_value_at(&self, peer: &RoutingEntry, _key: &[u8; 32]) -> FindValueReply {
            match self.values.get(&peer.peer_id) {
                Some(record) => FindValueReply::Value(record.clone()),
                None => FindValueReply::CloserPeers(vec![]),
            }
        }
        async fn find_node_at(&self, _peer: &RoutingEntry, _target: &NodeKey) -> Vec<RoutingEntry> {
            vec![]
        }
    }

    #[tokio::test]
    async fn find_value_returns_not_found_on_empty_table() {
        let table = RoutingTable::new([0u8; 32]);
        let rpc = Arc::new(StubRpc {
            values: HashMap::new(),
        });
        let dht = Dht::new(table, rpc);
        assert!(matches!(dht.find_value([9u8; 32]).await, Err(DhtError::NotFound)));
    }
}
