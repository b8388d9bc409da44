//! Gossip / discovery (C7): pluggable discovery providers and periodic
//! peer-announce gossip.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::identity::PeerId;

pub const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnouncedPeer {
    pub peer_id: PeerId,
    pub public_key: [u8; 32],
    pub capabilities: Vec<String>,
    pub last_seen_ms: u64,
}

/// A source of newly-discovered peers: a bootstrap list, a radio scan, a
/// rendezvous endpoint poll. Multiple providers may run side by side; each
/// pushes discoveries onto the same channel rather than calling back
/// directly into the facade, keeping the facade the sole owner of routing
/// table mutations.
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    async fn start(&self, found: mpsc::Sender<AnnouncedPeer>);
    async fn stop(&self);
}

/// Fixed bootstrap-node list provider: announces every configured peer once
/// at start.
pub struct BootstrapProvider {
    peers: Vec<AnnouncedPeer>,
}

impl BootstrapProvider {
    pub fn new(peers: Vec<AnnouncedPeer>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl DiscoveryProvider for BootstrapProvider {
    async fn start(&self, found: mpsc::Sender<AnnouncedPeer>) {
        for peer in &self.peers {
            let _ = found.send(peer.clone()).await;
        }
    }

    async fn stop(&self) {}
}

/// Tracks the last-announced timestamp per peerId so announcements are
/// merged into the routing table monotonically (§5: "gossip announcements
/// are monotonic per sender").
pub struct AnnounceLedger {
    last_seen: tokio::sync::RwLock<std::collections::HashMap<PeerId, u64>>,
}

impl AnnounceLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            last_seen: tokio::sync::RwLock::new(std::collections::HashMap::new()),
        })
    }

    /// Returns true if `peer.last_seen_ms` is newer than anything already
    /// recorded for that peerId (and records it), false if it's a stale or
    /// duplicate re-announcement that should be dropped.
    pub async fn merge(&self, peer: &AnnouncedPeer) -> bool {
        let mut last_seen = self.last_seen.write().await;
        let newer = match last_seen.get(&peer.peer_id) {
            Some(existing) => peer.last_seen_ms > *existing,
            None => true,
        };
        if newer {
            last_seen.insert(peer.peer_id.clone(), peer.last_seen_ms);
        }
        newer
    }
}

impl Default for AnnounceLedger {
    fn default() -> Self {
        Self {
            last_seen: tokio::sync::RwLock::new(std::collections::HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_provider_announces_every_peer_once() {
        let peers = vec![
            AnnouncedPeer {
                peer_id: "AAAA".into(),
                public_key: [1; 32],
                capabilities: vec![],
                last_seen_ms: 1,
            },
            AnnouncedPeer {
                peer_id: "BBBB".into(),
                public_key: [2; 32],
                capabilities: vec![],
                last_seen_ms: 1,
            },
        ];
        let provider = BootstrapProvider::new(peers);
        let (tx, mut rx) = mpsc::channel(8);
        provider.start(tx).await;
        drop(provider);

        let mut received = vec![];
        while let Ok(peer) = rx.try_recv() {
            received.push(peer.peer_id);
        }
        assert_eq!(received, vec!["AAAA", "BBBB"]);
    }

    #[tokio::test]
    async fn announce_ledger_is_monotonic_per_peer() {
        let ledger = AnnounceLedger::new();
        let mut peer = AnnouncedPeer {
            peer_id: "AAAA".into(),
            public_key: [1; 32],
            capabilities: vec![],
            last_seen_ms: 10,
        };
        assert!(ledger.merge(&peer).await);
        peer.last_seen_ms = 5; // stale re-announcement
        assert!(!ledger.merge(&peer).await);
        peer.last_seen_ms = 20;
        assert!(ledger.merge(&peer).await);
    }
}
