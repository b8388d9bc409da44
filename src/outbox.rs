//! Store-and-forward queue (C9): persistent outbox keyed by recipient,
//! exponential backoff with jitter, capacity eviction, flush on reconnect.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::adapters::{Clock, KeyValueAdapter, StorageError};
use crate::identity::PeerId;

pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_MS: u64 = 5_000;
pub const DEFAULT_RETRY_CAP_MS: u64 = 600_000;
const NAMESPACE: &str = "outbox";

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("outbox is at capacity; oldest entry evicted")]
    Evicted,
    #[error("{0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: String,
    pub target_peer_id: PeerId,
    pub payload: Vec<u8>,
    pub enqueued_at_ms: u64,
    pub retry_count: u32,
    pub next_attempt_at_ms: u64,
}

/// Exponential backoff with jitter: base 5s, factor 2, capped at 10 min.
pub fn backoff_delay_ms(retry_count: u32, base_ms: u64, cap_ms: u64, jitter_fraction: f64) -> u64 {
    let exponential = base_ms.saturating_mul(1u64 << retry_count.min(20));
    let capped = exponential.min(cap_ms);
    let jitter = (capped as f64 * jitter_fraction) as u64;
    capped.saturating_sub(jitter / 2).saturating_add(jitter)
}

pub struct Outbox {
    adapter: Arc<dyn KeyValueAdapter>,
    clock: Arc<dyn Clock>,
    capacity: usize,
    max_retries: u32,
    retry_base_ms: u64,
    retry_cap_ms: u64,
    /// In-memory mirror of persisted entries, preserving relative enqueue
    /// order per recipient. Rehydrated from the adapter on construction.
    entries: RwLock<VecDeque<OutboxEntry>>,
}

impl Outbox {
    pub async fn new(adapter: Arc<dyn KeyValueAdapter>, clock: Arc<dyn Clock>) -> Result<Self, DeliveryError> {
        Self::with_config(
            adapter,
            clock,
            DEFAULT_CAPACITY,
            DEFAULT_MAX_RETRIES,
            DEFAULT_RETRY_BASE_MS,
            DEFAULT_RETRY_CAP_MS,
        )
        .await
    }

    pub async fn with_config(
        adapter: Arc<dyn KeyValueAdapter>,
        clock: Arc<dyn Clock>,
        capacity: usize,
        max_retries: u32,
        retry_base_ms: u64,
        retry_cap_ms: u64,
    ) -> Result<Self, DeliveryError> {
        let persisted = adapter.iterate(NAMESPACE).await?;
        let mut entries: Vec<OutboxEntry> = persisted
            .into_iter()
            .filter_map(|(_, bytes)| ciborium::de::from_reader(bytes.as_slice()).ok())
            .collect();
        entries.sort_by_key(|e| e.enqueued_at_ms);

        Ok(Self {
            adapter,
            clock,
            capacity,
            max_retries,
            retry_base_ms,
            retry_cap_ms,
            entries: RwLock::new(entries.into_iter().collect()),
        })
    }

    /// Persist then enqueue `{recipientId, payload}`. If the outbox is at
    /// capacity, the oldest entry (by enqueue order, regardless of
    /// recipient) is evicted first and `DeliveryError::Evicted` is
    /// returned alongside success of the new enqueue.
    pub async fn enqueue(&self, target_peer_id: PeerId, payload: Vec<u8>) -> Result<String, DeliveryError> {
        let mut id_bytes = [0u8; 16];
        crate::crypto::random_bytes(&mut id_bytes);
        let id = hex::encode(id_bytes);

        let now = self.clock.now_ms();
        let entry = OutboxEntry {
            id: id.clone(),
            target_peer_id,
            payload,
            enqueued_at_ms: now,
            retry_count: 0,
            next_attempt_at_ms: now,
        };

        self.persist(&entry).await?;

        let mut entries = self.entries.write().await;
        let mut evicted = None;
        if entries.len() >= self.capacity {
            if let Some(oldest) = entries.pop_front() {
                let _ = self.adapter.delete(NAMESPACE, &oldest.id).await;
                evicted = Some(oldest.id);
            }
        }
        entries.push_back(entry);
        drop(entries);

        if evicted.is_some() {
            return Err(DeliveryError::Evicted);
        }
        Ok(id)
    }

    async fn persist(&self, entry: &OutboxEntry) -> Result<(), DeliveryError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(entry, &mut buf)
            .map_err(|e| DeliveryError::Storage(StorageError::Corrupt(e.to_string())))?;
        self.adapter.set(NAMESPACE, &entry.id, &buf).await?;
        Ok(())
    }

    /// Entries whose `next_attempt_at_ms` has elapsed, in enqueue order.
    pub async fn due_entries(&self) -> Vec<OutboxEntry> {
        let now = self.clock.now_ms();
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.next_attempt_at_ms <= now)
            .cloned()
            .collect()
    }

    /// Every entry regardless of `next_attempt_at_ms`, in enqueue order —
    /// used for `shutdown()`'s full flush.
    pub async fn all_entries(&self) -> Vec<OutboxEntry> {
        self.entries.read().await.iter().cloned().collect()
    }

    /// All entries targeting `peer_id`, in enqueue order — used to schedule
    /// an immediate flush on `onPeerConnected`.
    pub async fn entries_for(&self, peer_id: &PeerId) -> Vec<OutboxEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| &e.target_peer_id == peer_id)
            .cloned()
            .collect()
    }

    /// Mark `id` as successfully delivered: removed from the queue and from
    /// persistent storage.
    pub async fn ack(&self, id: &str) -> Result<(), DeliveryError> {
        self.entries.write().await.retain(|e| e.id != id);
        self.adapter.delete(NAMESPACE, id).await?;
        Ok(())
    }

    /// Record a failed delivery attempt. Returns `true` if the entry is
    /// still pending (retry scheduled), `false` if `MAX_RETRIES` was
    /// exceeded and the entry was discarded — the caller should then emit
    /// `onDeliveryFailed`.
    pub async fn record_failure(&self, id: &str) -> Result<bool, DeliveryError> {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.iter_mut().find(|e| e.id == id) else {
            return Ok(false);
        };
        entry.retry_count += 1;
        if entry.retry_count > self.max_retries {
            let removed = entries.iter().position(|e| e.id == id).map(|i| entries.remove(i));
            drop(entries);
            if let Some(removed) = removed {
                self.adapter.delete(NAMESPACE, &removed.id).await?;
            }
            return Ok(false);
        }
        let delay = backoff_delay_ms(entry.retry_count, self.retry_base_ms, self.retry_cap_ms, 0.2);
        entry.next_attempt_at_ms = self.clock.now_ms() + delay;
        let entry_clone = entry.clone();
        drop(entries);
        self.persist(&entry_clone).await?;
        Ok(true)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FixedClock, InMemoryKeyValueAdapter};

    async fn fresh_outbox() -> (Outbox, Arc<FixedClock>) {
        let adapter = InMemoryKeyValueAdapter::new();
        let clock = Arc::new(FixedClock::new(0));
        let outbox = Outbox::with_config(adapter, clock.clone(), 3, 3, 1000, 60_000)
            .await
            .unwrap();
        (outbox, clock)
    }

    #[tokio::test]
    async fn capacity_eviction_is_oldest_first() {
        let (outbox, _clock) = fresh_outbox().await;
        let a = outbox.enqueue("A".into(), b"1".to_vec()).await.unwrap();
        outbox.enqueue("A".into(), b"2".to_vec()).await.unwrap();
        outbox.enqueue("A".into(), b"3".to_vec()).await.unwrap();
        // Fourth entry evicts the first (`a`).
        let result = outbox.enqueue("A".into(), b"4".to_vec()).await;
        assert!(matches!(result, Err(DeliveryError::Evicted)));
        let remaining_ids: Vec<String> = outbox.entries_for(&"A".to_string()).await.into_iter().map(|e| e.id).collect();
        assert!(!remaining_ids.contains(&a));
        assert_eq!(remaining_ids.len(), 3);
    }

    #[tokio::test]
    async fn same_recipient_preserves_enqueue_order() {
        let (outbox, _clock) = fresh_outbox().await;
        outbox.enqueue("B".into(), b"first".to_vec()).await.unwrap();
        outbox.enqueue("B".into(), b"second".to_vec()).await.unwrap();
        let entries = outbox.entries_for(&"B".to_string()).await;
        assert_eq!(entries[0].payload, b"first");
        assert_eq!(entries[1].payload, b"second");
    }

    #[tokio::test]
    async fn retries_exhausted_discards_entry() {
        let (outbox, _clock) = fresh_outbox().await;
        let id = outbox.enqueue("C".into(), b"x".to_vec()).await.unwrap();
        for _ in 0..3 {
            assert!(outbox.record_failure(&id).await.unwrap());
        }
        assert!(!outbox.record_failure(&id).await.unwrap());
        assert_eq!(outbox.len().await, 0);
    }

    #[tokio::test]
    async fn rehydrates_pending_entries_after_restart() {
        let adapter = InMemoryKeyValueAdapter::new();
        let clock = Arc::new(FixedClock::new(0));
        {
            let outbox = Outbox::with_config(adapter.clone(), clock.clone(), 10, 3, 1000, 60_000)
                .await
                .unwrap();
            for i in 0..5 {
                outbox
                    .enqueue("D".into(), format!("msg{i}").into_bytes())
                    .await
                    .unwrap();
            }
        }
        // Simulate restart: new Outbox over the same adapter.
        let restarted = Outbox::with_config(adapter, clock, 10, 3, 1000, 60_000)
            .await
            .unwrap();
        let entries = restarted.entries_for(&"D".to_string()).await;
        assert_eq!(entries.len(), 5);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.payload, format!("msg{i}").into_bytes());
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let first = backoff_delay_ms(1, 5000, 600_000, 0.0);
        let second = backoff_delay_ms(2, 5000, 600_000, 0.0);
        assert!(second > first);
        let capped = backoff_delay_ms(20, 5000, 600_000, 0.0);
        assert_eq!(capped, 600_000);
    }
}
