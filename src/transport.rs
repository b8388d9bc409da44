//! Transport abstraction (C4): a uniform peer-id-addressed send/broadcast/
//! connect capability over pluggable datagram transports.
//!
//! Concrete variants (direct "WebRTC-like" datagram, local radio,
//! serverless rendezvous relay) all satisfy the same [`Transport`] trait —
//! modeled as a capability interface with events, not an inheritance
//! hierarchy, per the design notes on callback-based transports.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::identity::PeerId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer is not connected")]
    NotConnected,
    #[error("operation timed out")]
    Timeout,
    #[error("send failed")]
    SendFailed,
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportKind {
    Direct,
    Radio,
    Rendezvous,
}

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub public_key: [u8; 32],
    pub transport_type: TransportKind,
    pub state: ConnectionState,
    pub last_seen_ms: u64,
    pub quality: u8,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl PeerInfo {
    /// `quality = clamp(100 - rtt_ms / 10, 0, 100)` (§4.4).
    pub fn quality_from_rtt(rtt_ms: u64) -> u8 {
        let raw = 100i64 - (rtt_ms / 10) as i64;
        raw.clamp(0, 100) as u8
    }
}

/// Events a transport emits back to its owner (the facade's dispatcher).
#[async_trait]
pub trait TransportEvents: Send + Sync {
    async fn on_message(&self, from: PeerId, bytes: Vec<u8>);
    async fn on_peer_connected(&self, info: PeerInfo);
    async fn on_peer_disconnected(&self, peer_id: PeerId);
    async fn on_state_change(&self, peer_id: PeerId, state: ConnectionState);
    async fn on_error(&self, error: TransportError, peer_id: Option<PeerId>);
}

/// A pluggable datagram transport. Implementors own their own connection
/// bookkeeping; the facade only ever sees this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn start(&self, events: Arc<dyn TransportEvents>) -> Result<(), TransportError>;
    async fn stop(&self) -> Result<(), TransportError>;

    async fn connect(&self, peer_id: &PeerId, signaling: Option<&[u8]>)
        -> Result<(), TransportError>;
    async fn disconnect(&self, peer_id: &PeerId) -> Result<(), TransportError>;

    async fn send(&self, peer_id: &PeerId, bytes: &[u8]) -> Result<(), TransportError>;
    async fn broadcast(&self, bytes: &[u8], excluding: Option<&PeerId>)
        -> Result<(), TransportError>;

    async fn connected_peers(&self) -> Vec<PeerId>;
    async fn peer_info(&self, peer_id: &PeerId) -> Option<PeerInfo>;
    async fn connection_state(&self, peer_id: &PeerId) -> Option<ConnectionState>;
}

/// In-process transport for tests and single-host simulation: messages are
/// handed directly to the peer transport registered under the same shared
/// [`InMemoryNetwork`], skipping real I/O entirely.
pub struct InMemoryNetwork {
    inboxes: RwLock<HashMap<PeerId, Arc<dyn TransportEvents>>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inboxes: RwLock::new(HashMap::new()),
        })
    }
}

impl Default for InMemoryNetwork {
    fn default() -> Self {
        Self {
            inboxes: RwLock::new(HashMap::new()),
        }
    }
}

pub struct InMemoryTransport {
    local_peer_id: PeerId,
    network: Arc<InMemoryNetwork>,
    peers: RwLock<HashMap<PeerId, PeerInfo>>,
}

impl InMemoryTransport {
    pub fn new(local_peer_id: PeerId, network: Arc<InMemoryNetwork>) -> Self {
        Self {
            local_peer_id,
            network,
            peers: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    async fn start(&self, events: Arc<dyn TransportEvents>) -> Result<(), TransportError> {
        self.network
            .inboxes
            .write()
            .await
            .insert(self.local_peer_id.clone(), events);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.network.inboxes.write().await.remove(&self.local_peer_id);
        Ok(())
    }

    async fn connect(
        &self,
        peer_id: &PeerId,
        _signaling: Option<&[u8]>,
    ) -> Result<(), TransportError> {
        if !self.network.inboxes.read().await.contains_key(peer_id) {
            return Err(TransportError::NotConnected);
        }
        self.peers.write().await.insert(
            peer_id.clone(),
            PeerInfo {
                peer_id: peer_id.clone(),
                public_key: [0u8; 32],
                transport_type: TransportKind::Direct,
                state: ConnectionState::Connected,
                last_seen_ms: 0,
                quality: 100,
                bytes_sent: 0,
                bytes_received: 0,
            },
        );
        Ok(())
    }

    async fn disconnect(&self, peer_id: &PeerId) -> Result<(), TransportError> {
        self.peers.write().await.remove(peer_id);
        Ok(())
    }

    async fn send(&self, peer_id: &PeerId, bytes: &[u8]) -> Result<(), TransportError> {
        let connected = self
            .peers
            .read()
            .await
            .get(peer_id)
            .map(|p| p.state == ConnectionState::Connected)
            .unwrap_or(false);
        if !connected {
            return Err(TransportError::NotConnected);
        }
        let inboxes = self.network.inboxes.read().await;
        let target = inboxes.get(peer_id).ok_or(TransportError::NotConnected)?;
        target.on_message(self.local_peer_id.clone(), bytes.to_vec()).await;
        if let Some(info) = self.peers.write().await.get_mut(peer_id) {
            info.bytes_sent += bytes.len() as u64;
        }
        Ok(())
    }

    async fn broadcast(
        &self,
        bytes: &[u8],
        excluding: Option<&PeerId>,
    ) -> Result<(), TransportError> {
        let peer_ids: Vec<PeerId> = self.peers.read().await.keys().cloned().collect();
        for peer_id in peer_ids {
            if Some(&peer_id) == excluding {
                continue;
            }
            let _ = self.send(&peer_id, bytes).await;
        }
        Ok(())
    }

    async fn connected_peers(&self) -> Vec<PeerId> {
        self.peers
            .read()
            .await
            .iter()
            .filter(|(_, info)| info.state == ConnectionState::Connected)
            .map(|(id, _)| id.clone())
            .collect()
    }

    async fn peer_info(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peers.read().await.get(peer_id).cloned()
    }

    async fn connection_state(&self, peer_id: &PeerId) -> Option<ConnectionState> {
        self.peers.read().await.get(peer_id).map(|p| p.state)
    }
}

impl Clone for PeerInfo {
    fn clone(&self) -> Self {
        Self {
            peer_id: self.peer_id.clone(),
            public_key: self.public_key,
            transport_type: self.transport_type.clone(),
            state: self.state,
            last_seen_ms: self.last_seen_ms,
            quality: self.quality,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEvents {
        messages: AtomicUsize,
    }

    #[async_trait]
    impl TransportEvents for CountingEvents {
        async fn on_message(&self, _from: PeerId, _bytes: Vec<u8>) {
            self.messages.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_peer_connected(&self, _info: PeerInfo) {}
        async fn on_peer_disconnected(&self, _peer_id: PeerId) {}
        async fn on_state_change(&self, _peer_id: PeerId, _state: ConnectionState) {}
        async fn on_error(&self, _error: TransportError, _peer_id: Option<PeerId>) {}
    }

    #[tokio::test]
    async fn send_delivers_to_connected_peer_only() {
        let network = InMemoryNetwork::new();
        let a = InMemoryTransport::new("AAAA".to_string(), network.clone());
        let b = InMemoryTransport::new("BBBB".to_string(), network.clone());

        let a_events = Arc::new(CountingEvents {
            messages: AtomicUsize::new(0),
        });
        let b_events = Arc::new(CountingEvents {
            messages: AtomicUsize::new(0),
        });
        a.start(a_events.clone()).await.unwrap();
        b.start(b_events.clone()).await.unwrap();

        assert_eq!(
            a.send(&"BBBB".to_string(), b"hi").await,
            Err(TransportError::NotConnected)
        );

        a.connect(&"BBBB".to_string(), None).await.unwrap();
        a.send(&"BBBB".to_string(), b"hi").await.unwrap();
        assert_eq!(b_events.messages.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn quality_from_rtt_clamps() {
        assert_eq!(PeerInfo::quality_from_rtt(0), 100);
        assert_eq!(PeerInfo::quality_from_rtt(2000), 0);
    }
}
