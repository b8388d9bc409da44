//! Routing table (C5): Kademlia 256-bit XOR-distance k-buckets keyed on the
//! full 32-byte public key, with eviction-by-liveness.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::identity::PeerId;

pub const DEFAULT_K: usize = 20;
pub const BUCKET_COUNT: usize = 256;

pub type NodeKey = [u8; 32];

#[derive(Debug, Clone)]
pub struct RoutingEntry {
    pub peer_id: PeerId,
    pub node_key: NodeKey,
    pub last_seen_ms: u64,
}

/// XOR distance between two node keys, as a 256-bit big-endian value.
pub fn xor_distance(a: &NodeKey, b: &NodeKey) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Bucket index: number of leading zero bits in the XOR distance. A
/// distance of all zeros (identical keys) has no valid bucket and maps to
/// the last one, matching Kademlia's "own key never gets inserted" rule at
/// the routing-table boundary.
pub fn bucket_index(local: &NodeKey, other: &NodeKey) -> usize {
    let distance = xor_distance(local, other);
    let mut leading_zero_bits = 0usize;
    for byte in distance.iter() {
        if *byte == 0 {
            leading_zero_bits += 8;
            continue;
        }
        leading_zero_bits += byte.leading_zeros() as usize;
        break;
    }
    leading_zero_bits.min(BUCKET_COUNT - 1)
}

struct KBucket {
    entries: Vec<RoutingEntry>,
}

impl KBucket {
    fn new() -> Self {
        Self { entries: Vec::new() }
    }
}

/// A liveness prober consulted when a bucket is full and a new candidate
/// arrives — if the least-recently-seen entry still responds, the
/// candidate is discarded instead.
#[async_trait::async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn is_alive(&self, peer_id: &PeerId) -> bool;
}

pub struct RoutingTable {
    local_key: NodeKey,
    k: usize,
    buckets: RwLock<Vec<KBucket>>,
}

impl RoutingTable {
    pub fn new(local_key: NodeKey) -> Arc<Self> {
        Self::with_k(local_key, DEFAULT_K)
    }

    pub fn with_k(local_key: NodeKey, k: usize) -> Arc<Self> {
        Arc::new(Self {
            local_key,
            k,
            buckets: RwLock::new((0..BUCKET_COUNT).map(|_| KBucket::new()).collect()),
        })
    }

    /// Insert or refresh `entry`. If the owning bucket is full, `prober` is
    /// consulted on the least-recently-seen entry: alive → candidate
    /// dropped and LRU refreshed; dead → LRU evicted and candidate
    /// inserted. Returns the total entry count across all buckets, so
    /// callers can assert idempotence (inserting an existing peerId leaves
    /// the table size unchanged).
    pub async fn insert(&self, entry: RoutingEntry, prober: &dyn LivenessProbe) -> usize {
        if entry.node_key == self.local_key {
            return self.len().await;
        }
        let idx = bucket_index(&self.local_key, &entry.node_key);
        let mut buckets = self.buckets.write().await;
        let bucket = &mut buckets[idx];

        if let Some(pos) = bucket.entries.iter().position(|e| e.peer_id == entry.peer_id) {
            let mut refreshed = bucket.entries.remove(pos);
            refreshed.last_seen_ms = entry.last_seen_ms;
            refreshed.node_key = entry.node_key;
            bucket.entries.push(refreshed);
            return Self::count(&buckets);
        }

        if bucket.entries.len() < self.k {
            bucket.entries.push(entry);
            return Self::count(&buckets);
        }

        let lru_peer_id = bucket.entries[0].peer_id.clone();
        drop(buckets);
        let lru_alive = prober.is_alive(&lru_peer_id).await;
        let mut buckets = self.buckets.write().await;
        let bucket = &mut buckets[idx];
        if lru_alive {
            if let Some(lru) = bucket.entries.iter_mut().find(|e| e.peer_id == lru_peer_id) {
                lru.last_seen_ms = entry.last_seen_ms;
            }
        } else {
            bucket.entries.remove(0);
            bucket.entries.push(entry);
        }
        Self::count(&buckets)
    }

    fn count(buckets: &[KBucket]) -> usize {
        buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub async fn len(&self) -> usize {
        Self::count(&self.buckets.read().await)
    }

    /// Up to `n` peers sorted by ascending XOR distance to `target`.
    pub async fn closest(&self, target: &NodeKey, n: usize) -> Vec<RoutingEntry> {
        let buckets = self.buckets.read().await;
        let mut all: Vec<RoutingEntry> = buckets.iter().flat_map(|b| b.entries.clone()).collect();
        all.sort_by_key(|entry| xor_distance(target, &entry.node_key));
        all.truncate(n);
        all
    }

    pub async fn remove(&self, peer_id: &PeerId) {
        let mut buckets = self.buckets.write().await;
        for bucket in buckets.iter_mut() {
            bucket.entries.retain(|e| &e.peer_id != peer_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysAlive;
    #[async_trait::async_trait]
    impl LivenessProbe for AlwaysAlive {
        async fn is_alive(&self, _peer_id: &PeerId) -> bool {
            true
        }
    }

    struct AlwaysDead;
    #[async_trait::async_trait]
    impl LivenessProbe for AlwaysDead {
        async fn is_alive(&self, _peer_id: &PeerId) -> bool {
            false
        }
    }

    fn key(byte: u8) -> NodeKey {
        [byte; 32]
    }

    #[test]
    fn bucket_index_for_identical_keys_is_last() {
        let k = key(1);
        assert_eq!(bucket_index(&k, &k), BUCKET_COUNT - 1);
    }

    #[tokio::test]
    async fn insert_is_idempotent_for_existing_peer_id() {
        let table = RoutingTable::new(key(0));
        let entry = RoutingEntry {
            peer_id: "PEER0001".to_string(),
            node_key: key(1),
            last_seen_ms: 1,
        };
        let before = table.insert(entry.clone(), &AlwaysAlive).await;
        let after = table.insert(entry, &AlwaysAlive).await;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn full_bucket_evicts_lru_when_dead() {
        let table = RoutingTable::with_k(key(0), 2);
        for i in 1..=2u8 {
            table
                .insert(
                    RoutingEntry {
                        peer_id: format!("PEER{i:04}"),
                        node_key: {
                            let mut k = key(0xFF);
                            k[31] = i;
                            k
                        },
                        last_seen_ms: i as u64,
                    },
                    &AlwaysAlive,
                )
                .await;
        }
        let mut new_key = key(0xFF);
        new_key[31] = 3;
        let before = table.len().await;
        table
            .insert(
                RoutingEntry {
                    peer_id: "PEER0003".to_string(),
                    node_key: new_key,
                    last_seen_ms: 3,
                },
                &AlwaysDead,
            )
            .await;
        assert_eq!(table.len().await, before);
    }

    #[tokio::test]
    async fn closest_returns_ascending_xor_distance() {
        let table = RoutingTable::new(key(0));
        for i in 1..=5u8 {
            let mut node_key = key(0);
            node_key[31] = i;
            table
                .insert(
                    RoutingEntry {
                        peer_id: format!("PEER{i:04}"),
                        node_key,
                        last_seen_ms: i as u64,
                    },
                    &AlwaysAlive,
                )
                .await;
        }
        let mut target = key(0);
        target[31] = 1;
        let closest = table.closest(&target, 2).await;
        assert_eq!(closest[0].peer_id, "PEER0001");
    }
}
