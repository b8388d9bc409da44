//! MeshNetwork facade (C10): wires C1-C9, owns identity, accepts inbound
//! packets, emits delivered-message events, exposes send/connect/join-room.
//!
//! A single dispatcher task owns every mutable component (routing table,
//! DHT, outbox, seen-hash cache) and drains a command channel serially, the
//! way `store.rs`'s `bootstrap()` wires a single `DeltaCore` together and
//! spawns its background tasks — generalized here from a process-wide
//! singleton to an owned, per-instance struct since this facade is
//! constructed per mesh instance, not once per process.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::adapters::{Clock, KeyValueAdapter, SystemClock};
use crate::config::Config;
use crate::dht::{Dht, DhtRpc};
use crate::envelope::{self, Envelope};
use crate::error::MeshError;
use crate::gossip::{AnnounceLedger, AnnouncedPeer, DiscoveryProvider};
use crate::identity::{Identity, PeerId};
use crate::outbox::Outbox;
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::relay::{Relay, RelayDecision, RelayError, RoutedPacket};
use crate::routing::{LivenessProbe, NodeKey, RoutingEntry, RoutingTable};
use crate::transport::{ConnectionState, PeerInfo, Transport, TransportEvents, TransportKind};
use crate::wire::{self, Header, MessageType, Reassembler};

/// Destination marker meaning "public room broadcast", used by
/// [`MeshNetwork::send_public_room_message`] — no real peer's node key can
/// collide with it since it is never a valid Ed25519 public key.
const PUBLIC_ROOM_DESTINATION: NodeKey = [0u8; 32];
const DESTINATION_LEN: usize = 32;

/// Outward events the facade surfaces to a host application (§6).
#[async_trait::async_trait]
pub trait MeshEvents: Send + Sync {
    async fn on_message_delivered(&self, sender_id: PeerId, plaintext: Vec<u8>, timestamp_ms: u64);
    async fn on_peer_connected(&self, info: PeerInfo);
    async fn on_peer_disconnected(&self, peer_id: PeerId);
    async fn on_delivery_failed(&self, id: String, recipient_id: PeerId, reason: String);
    async fn on_discovery_update(&self, discovered: usize);
    async fn on_error(&self, error: Arc<MeshError>, context: Option<String>);
    async fn on_fatal(&self, error: Arc<MeshError>);
}

struct PeerRecord {
    public_key: VerifyingKey,
}

/// Known peer public keys, the one piece of routing-adjacent state the
/// dispatcher needs that doesn't belong in the Kademlia table itself
/// (signature verification needs the full key, not just its XOR-distance
/// bucket position).
struct PeerDirectory {
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
}

impl PeerDirectory {
    fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    async fn insert(&self, peer_id: PeerId, public_key: VerifyingKey) {
        self.peers.write().await.insert(peer_id, PeerRecord { public_key });
    }

    async fn get(&self, peer_id: &PeerId) -> Option<VerifyingKey> {
        self.peers.read().await.get(peer_id).map(|r| r.public_key)
    }
}

/// Routing-table liveness probe backed by a transport's connection state.
struct TransportLivenessProbe {
    transport: Arc<dyn Transport>,
}

#[async_trait::async_trait]
impl LivenessProbe for TransportLivenessProbe {
    async fn is_alive(&self, peer_id: &PeerId) -> bool {
        matches!(
            self.transport.connection_state(peer_id).await,
            Some(ConnectionState::Connected)
        )
    }
}

pub struct MeshNetwork {
    identity: Arc<Identity>,
    config: Config,
    transports: Vec<Arc<dyn Transport>>,
    routing_table: Arc<RoutingTable>,
    dht: Arc<Dht>,
    relay: Arc<Relay>,
    outbox: Arc<Outbox>,
    rate_limiter: Arc<RateLimiter>,
    reassembler: Arc<tokio::sync::Mutex<Reassembler>>,
    peer_directory: Arc<PeerDirectory>,
    announce_ledger: Arc<AnnounceLedger>,
    discovery_providers: Vec<Arc<dyn DiscoveryProvider>>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn MeshEvents>,
    joined_rooms: RwLock<HashSet<String>>,
}

impl MeshNetwork {
    pub async fn new(
        identity: Identity,
        config: Config,
        transports: Vec<Arc<dyn Transport>>,
        dht_rpc: Arc<dyn DhtRpc>,
        kv_adapter: Arc<dyn KeyValueAdapter>,
        discovery_providers: Vec<Arc<dyn DiscoveryProvider>>,
        events: Arc<dyn MeshEvents>,
    ) -> Result<Self, MeshError> {
        let identity = Arc::new(identity);
        let local_key: NodeKey = identity.public_key().to_bytes();
        let routing_table = RoutingTable::with_k(local_key, config.k);
        let dht = Arc::new(Dht::with_config(routing_table.clone(), dht_rpc, &config));
        let relay = Arc::new(Relay::with_config(routing_table.clone(), &config));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let outbox = Arc::new(
            Outbox::with_config(
                kv_adapter,
                clock.clone(),
                config.outbox_capacity,
                config.max_retries,
                config.retry_base_ms,
                config.retry_cap_ms,
            )
            .await?,
        );
        let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            per_minute: config.rate_limit_per_minute,
            per_hour: config.rate_limit_per_hour,
        }));

        let reassembler = Reassembler::with_timeout(config.reassembly_timeout());

        Ok(Self {
            identity,
            config,
            transports,
            routing_table,
            dht,
            relay,
            outbox,
            rate_limiter,
            reassembler: Arc::new(tokio::sync::Mutex::new(reassembler)),
            peer_directory: Arc::new(PeerDirectory::new()),
            announce_ledger: AnnounceLedger::new(),
            discovery_providers,
            clock,
            events,
            joined_rooms: RwLock::new(HashSet::new()),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// Bring transports up and schedule gossip/discovery. Background tasks
    /// are spawned the way `store.rs::bootstrap` spawns the projector and
    /// republish loop — fire-and-forget tasks that talk back only through
    /// `events`.
    pub async fn start(self: &Arc<Self>) -> Result<(), MeshError> {
        for provider in &self.discovery_providers {
            let (tx, mut rx) = mpsc::channel(64);
            provider.start(tx).await;
            let this = self.clone();
            tokio::spawn(async move {
                let mut discovered = 0usize;
                while let Some(peer) = rx.recv().await {
                    if this.announce_ledger.merge(&peer).await {
                        this.merge_discovered_peer(peer).await;
                        discovered += 1;
                        this.events.on_discovery_update(discovered).await;
                    }
                }
            });
        }

        for transport in &self.transports {
            let sink = Arc::new(DispatcherSink {
                mesh: self.clone(),
            });
            if let Err(err) = transport.start(sink).await {
                let err = Arc::new(MeshError::Transport(err));
                error!(code = err.code(), "transport failed to start");
                self.events.on_error(err, Some("transport.start".into())).await;
            }
        }

        // Periodic peer-announce gossip broadcast (§4.7).
        {
            let this = self.clone();
            let interval = self.config.gossip_interval();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    this.broadcast_self_announce().await;
                }
            });
        }

        // Periodic outbox retry/backoff sweep (§4.9).
        {
            let this = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(1));
                loop {
                    ticker.tick().await;
                    this.flush_due_outbox_entries().await;
                }
            });
        }

        info!(peer_id = %self.peer_id(), "mesh network ready");
        Ok(())
    }

    /// Broadcast `{peerId, publicKey, capabilities, lastSeen}` over every
    /// connected transport (§4.7).
    async fn broadcast_self_announce(&self) {
        let announced = AnnouncedPeer {
            peer_id: self.peer_id(),
            public_key: self.identity.public_key().to_bytes(),
            capabilities: vec![],
            last_seen_ms: self.clock.now_ms(),
        };
        let mut payload = Vec::new();
        if let Err(err) = ciborium::ser::into_writer(&announced, &mut payload) {
            warn!(?err, "failed to encode self-announce gossip payload");
            return;
        }
        let header = wire::sign_header(
            Header {
                version: wire::CURRENT_VERSION,
                message_type: MessageType::PeerIntroduction.to_byte(),
                ttl: 1,
                timestamp_ms: announced.last_seen_ms,
                sender_public_key: announced.public_key,
                signature: [0u8; wire::SIGNATURE_LEN],
            },
            &payload,
            &self.identity.signing_key(),
        );
        let mut packet = header.to_bytes().to_vec();
        packet.extend_from_slice(&payload);
        for transport in &self.transports {
            let _ = transport.broadcast(&packet, None).await;
        }
    }

    /// Attempt delivery of every due outbox entry, recording failures with
    /// backoff and emitting `onDeliveryFailed` once `MAX_RETRIES` is
    /// exhausted (§4.9).
    async fn flush_due_outbox_entries(&self) {
        for entry in self.outbox.due_entries().await {
            let mut delivered = false;
            for transport in &self.transports {
                if transport.send(&entry.target_peer_id, &entry.payload).await.is_ok() {
                    delivered = true;
                    break;
                }
            }
            if delivered {
                let _ = self.outbox.ack(&entry.id).await;
                continue;
            }
            match self.outbox.record_failure(&entry.id).await {
                Ok(true) => {}
                Ok(false) => {
                    self.events
                        .on_delivery_failed(
                            entry.id.clone(),
                            entry.target_peer_id.clone(),
                            "max retries exceeded".to_string(),
                        )
                        .await;
                }
                Err(err) => {
                    warn!(id = %entry.id, %err, "failed to record outbox delivery failure");
                }
            }
        }
    }

    async fn merge_discovered_peer(&self, peer: AnnouncedPeer) {
        if let Ok(public_key) = crate::identity::parse_public_key(&peer.public_key) {
            self.peer_directory.insert(peer.peer_id.clone(), public_key).await;
        }
        let Some(transport) = self.transports.first().cloned() else {
            warn!(peer = %peer.peer_id, "discovered peer but no transport is registered");
            return;
        };
        let probe = TransportLivenessProbe { transport };
        self.routing_table
            .insert(
                RoutingEntry {
                    peer_id: peer.peer_id,
                    node_key: peer.public_key,
                    last_seen_ms: peer.last_seen_ms,
                },
                &probe,
            )
            .await;
    }

    /// `sendMessage(recipientId, payload)` (§4.10): encrypt, frame, attempt
    /// direct send; on failure route via relay; on failure enqueue.
    ///
    /// The destination node key is prepended to the envelope before signing
    /// so a relaying node can tell whether a packet is addressed to it
    /// without being able to decrypt it (§4.10).
    pub async fn send_message(
        &self,
        recipient_id: &PeerId,
        payload: &[u8],
    ) -> Result<SendOutcome, MeshError> {
        let recipient_public = self
            .peer_directory
            .get(recipient_id)
            .await
            .ok_or(MeshError::Dht(crate::dht::DhtError::NotFound))?;
        let recipient_enc_pub = crate::crypto::ed25519_pubkey_to_x25519(recipient_public.as_bytes())?;

        let now_ms = self.clock.now_ms();
        let envelope = envelope::seal(payload, &self.identity.signing_key(), &recipient_enc_pub, now_ms)?;
        let envelope_bytes = envelope.to_bytes();

        let destination = recipient_public.to_bytes();
        let mut signed_payload = Vec::with_capacity(DESTINATION_LEN + envelope_bytes.len());
        signed_payload.extend_from_slice(&destination);
        signed_payload.extend_from_slice(&envelope_bytes);

        let header = wire::sign_header(
            Header {
                version: wire::CURRENT_VERSION,
                message_type: MessageType::Text.to_byte(),
                ttl: self.config.default_ttl,
                timestamp_ms: now_ms,
                sender_public_key: self.identity.public_key().to_bytes(),
                signature: [0u8; wire::SIGNATURE_LEN],
            },
            &signed_payload,
            &self.identity.signing_key(),
        );
        let mut packet = header.to_bytes().to_vec();
        packet.extend_from_slice(&signed_payload);

        for transport in &self.transports {
            if transport.send(recipient_id, &packet).await.is_ok() {
                return Ok(SendOutcome::SentDirect);
            }
        }

        let has_closer_peer = !self.routing_table.closest(&destination, 1).await.is_empty();
        if has_closer_peer {
            let routed = RoutedPacket {
                message_hash: wire::message_hash(&header, &signed_payload),
                ttl: header.ttl,
                destination,
                relay_path: vec![],
            };
            let relay_result = self
                .relay
                .relay(routed, &self.peer_id(), &self.identity.public_key().to_bytes())
                .await;
            match relay_result {
                Ok((_, RelayDecision::Forward(next_hop))) => {
                    if let Some(transport) = self.transports.first() {
                        if transport.send(&next_hop, &packet).await.is_ok() {
                            return Ok(SendOutcome::Relayed);
                        }
                    }
                }
                Ok((_, RelayDecision::Broadcast)) => {
                    for transport in &self.transports {
                        if transport.broadcast(&packet, Some(&self.peer_id())).await.is_ok() {
                            return Ok(SendOutcome::Relayed);
                        }
                    }
                }
                Err(RelayError::TtlExpired) | Err(RelayError::LoopDetected) => {}
                Err(err) => return Err(MeshError::Relay(err)),
            }
        }

        self.outbox.enqueue(recipient_id.clone(), packet).await.ok();
        Ok(SendOutcome::Queued)
    }

    /// `handleIncomingPacket(fromPeerId, bytes)` (§4.10): gossip packets are
    /// merged into discovery state; packets addressed to this node are
    /// decrypted and delivered; everything else is relayed or broadcast
    /// onward per `Relay::relay`'s TTL/loop-path decision.
    pub async fn handle_incoming_packet(&self, from: &PeerId, bytes: &[u8]) -> Result<(), MeshError> {
        if !self.rate_limiter.check(from) {
            warn!(peer = %from, "rate limit exceeded");
            return Err(MeshError::Protocol(crate::wire::ProtocolError::RateLimited));
        }

        if bytes.len() < wire::HEADER_LEN {
            return Err(MeshError::Protocol(crate::wire::ProtocolError::SenderId));
        }
        let header = wire::Header::from_bytes(&bytes[..wire::HEADER_LEN])
            .map_err(MeshError::Protocol)?;
        let payload = &bytes[wire::HEADER_LEN..];

        if let Err(err) = wire::validate(
            &header,
            payload,
            self.clock.now_ms() as i64,
            self.config.max_ttl,
            self.config.clock_skew_ms,
        ) {
            warn!(peer = %from, ?err, "dropping invalid packet");
            return Err(MeshError::Protocol(err));
        }

        let sender_public = crate::identity::parse_public_key(&header.sender_public_key)
            .map_err(|_| MeshError::Protocol(crate::wire::ProtocolError::SenderId))?;
        if !wire::verify_header(&header, payload, &sender_public) {
            return Err(MeshError::Protocol(crate::wire::ProtocolError::Signature));
        }

        self.peer_directory
            .insert(from.clone(), sender_public)
            .await;

        let message_type = MessageType::from_byte(header.message_type);
        if matches!(message_type, Some(MessageType::PeerDiscovery) | Some(MessageType::PeerIntroduction)) {
            let hash = wire::message_hash(&header, payload);
            if !self.relay.seen_hash_cache().check_and_insert(hash) {
                debug!(peer = %from, "duplicate gossip packet dropped");
                return Ok(());
            }
            let announced: AnnouncedPeer = ciborium::de::from_reader(payload)
                .map_err(|_| MeshError::Protocol(crate::wire::ProtocolError::MalformedFragment))?;
            if self.announce_ledger.merge(&announced).await {
                self.merge_discovered_peer(announced).await;
            }
            return Ok(());
        }

        if payload.len() < DESTINATION_LEN {
            return Err(MeshError::Protocol(crate::wire::ProtocolError::SenderId));
        }
        let mut destination = [0u8; DESTINATION_LEN];
        destination.copy_from_slice(&payload[..DESTINATION_LEN]);
        let inner = &payload[DESTINATION_LEN..];

        if destination == PUBLIC_ROOM_DESTINATION {
            let hash = wire::message_hash(&header, payload);
            if !self.relay.seen_hash_cache().check_and_insert(hash) {
                return Ok(());
            }
            self.events
                .on_message_delivered(
                    crate::identity::peer_id_of(&sender_public),
                    inner.to_vec(),
                    header.timestamp_ms,
                )
                .await;
            return Ok(());
        }

        let local_key: NodeKey = self.identity.public_key().to_bytes();
        if destination == local_key {
            let hash = wire::message_hash(&header, payload);
            if !self.relay.seen_hash_cache().check_and_insert(hash) {
                debug!(peer = %from, "duplicate packet dropped");
                return Ok(());
            }
            let envelope = Envelope::from_bytes(inner).map_err(MeshError::Envelope)?;
            let recipient_secret = crate::crypto::ed25519_seed_to_x25519(&self.identity.seed_bytes());
            let recipient_public = x25519_dalek::PublicKey::from(&recipient_secret);
            let plaintext = envelope::open(
                &envelope,
                &recipient_secret,
                &recipient_public,
                &sender_public,
                header.timestamp_ms,
            )
            .map_err(MeshError::Envelope)?;
            self.events
                .on_message_delivered(self.peer_id(), plaintext, header.timestamp_ms)
                .await;
            return Ok(());
        }

        let routed = RoutedPacket {
            message_hash: wire::message_hash(&header, payload),
            ttl: header.ttl,
            destination,
            relay_path: vec![],
        };
        match self.relay.relay(routed, &self.peer_id(), &local_key).await {
            Ok((_, RelayDecision::Forward(next_hop))) => {
                if let Some(transport) = self.transports.first() {
                    let _ = transport.send(&next_hop, bytes).await;
                }
            }
            Ok((_, RelayDecision::Broadcast)) => {
                for transport in &self.transports {
                    let _ = transport.broadcast(bytes, Some(from)).await;
                }
            }
            Err(RelayError::TtlExpired) | Err(RelayError::LoopDetected) => {}
            Err(err) => return Err(MeshError::Relay(err)),
        }
        Ok(())
    }

    /// `joinPublicRoom(url)` (§4.10): a thin wrapper over any registered
    /// rendezvous discovery provider — marks `url` as joined so
    /// `sendPublicRoomMessage` will broadcast over rendezvous transports.
    pub async fn join_public_room(&self, url: &str) -> Result<(), MeshError> {
        self.joined_rooms.write().await.insert(url.to_string());
        Ok(())
    }

    /// `sendPublicRoomMessage(url, text)` (§4.10): broadcast an unsealed,
    /// signed packet tagged with [`PUBLIC_ROOM_DESTINATION`] over every
    /// rendezvous transport for a room this node has joined.
    pub async fn send_public_room_message(&self, url: &str, text: &str) -> Result<(), MeshError> {
        if !self.joined_rooms.read().await.contains(url) {
            return Err(MeshError::Transport(crate::transport::TransportError::NotConnected));
        }

        let now_ms = self.clock.now_ms();
        let mut signed_payload = Vec::with_capacity(DESTINATION_LEN + text.len());
        signed_payload.extend_from_slice(&PUBLIC_ROOM_DESTINATION);
        signed_payload.extend_from_slice(text.as_bytes());

        let header = wire::sign_header(
            Header {
                version: wire::CURRENT_VERSION,
                message_type: MessageType::Text.to_byte(),
                ttl: 1,
                timestamp_ms: now_ms,
                sender_public_key: self.identity.public_key().to_bytes(),
                signature: [0u8; wire::SIGNATURE_LEN],
            },
            &signed_payload,
            &self.identity.signing_key(),
        );
        let mut packet = header.to_bytes().to_vec();
        packet.extend_from_slice(&signed_payload);

        let mut sent = false;
        for transport in &self.transports {
            if transport.kind() == TransportKind::Rendezvous
                && transport.broadcast(&packet, None).await.is_ok()
            {
                sent = true;
            }
        }
        if sent {
            Ok(())
        } else {
            Err(MeshError::Transport(crate::transport::TransportError::NotConnected))
        }
    }

    /// `connectToPeer(peerId)` (§4.10).
    pub async fn connect_to_peer(&self, peer_id: &PeerId) -> Result<(), MeshError> {
        for transport in &self.transports {
            if transport.connect(peer_id, None).await.is_ok() {
                return Ok(());
            }
        }
        Err(MeshError::Transport(crate::transport::TransportError::NotConnected))
    }

    /// `shutdown()` (§4.10): best-effort flush every outbox entry, stop
    /// transports, then zero key material. Entries that still fail to send
    /// remain persisted for rehydration on the next `Outbox::with_config`.
    pub async fn shutdown(&self) -> Result<(), MeshError> {
        for entry in self.outbox.all_entries().await {
            for transport in &self.transports {
                if transport.send(&entry.target_peer_id, &entry.payload).await.is_ok() {
                    let _ = self.outbox.ack(&entry.id).await;
                    break;
                }
            }
        }

        for transport in &self.transports {
            let _ = transport.stop().await;
        }

        self.identity.wipe();
        Ok(())
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.routing_table
    }

    pub fn dht(&self) -> &Arc<Dht> {
        &self.dht
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    SentDirect,
    Relayed,
    Queued,
}

/// Adapts `TransportEvents` callbacks into dispatcher calls on the facade,
/// so every transport (however many are registered) funnels inbound
/// traffic through the same serialized entry point.
struct DispatcherSink {
    mesh: Arc<MeshNetwork>,
}

#[async_trait::async_trait]
impl TransportEvents for DispatcherSink {
    async fn on_message(&self, from: PeerId, bytes: Vec<u8>) {
        if let Err(err) = self.mesh.handle_incoming_packet(&from, &bytes).await {
            if err.recovers_locally() {
                debug!(peer = %from, code = err.code(), "inbound packet dropped");
            } else {
                let err = Arc::new(err);
                self.mesh.events.on_error(err.clone(), Some("handle_incoming_packet".into())).await;
                if err.is_fatal() {
                    self.mesh.events.on_fatal(err).await;
                }
            }
        }
    }

    async fn on_peer_connected(&self, info: PeerInfo) {
        let entries = self
            .mesh
            .outbox
            .entries_for(&info.peer_id)
            .await;
        for entry in entries {
            for transport in &self.mesh.transports {
                if transport.send(&info.peer_id, &entry.payload).await.is_ok() {
                    let _ = self.mesh.outbox.ack(&entry.id).await;
                    break;
                }
            }
        }
        self.mesh.events.on_peer_connected(info).await;
    }

    async fn on_peer_disconnected(&self, peer_id: PeerId) {
        self.mesh.events.on_peer_disconnected(peer_id).await;
    }

    async fn on_state_change(&self, _peer_id: PeerId, _state: ConnectionState) {}

    async fn on_error(&self, error: crate::transport::TransportError, peer_id: Option<PeerId>) {
        let err = Arc::new(MeshError::Transport(error));
        self.mesh.events.on_error(err, peer_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryKeyValueAdapter;
    use crate::dht::{DhtRpc, FindValueReply};
    use crate::transport::{InMemoryNetwork, InMemoryTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct NullDhtRpc;
    #[async_trait::async_trait]
    impl DhtRpc for NullDhtRpc {
        async fn store_at(&self, _peer: &RoutingEntry, _record: &crate::dht::DhtRecord) -> bool {
            false
        }
        async fn find_value_at(&self, _peer: &RoutingEntry, _key: &[u8; 32]) -> FindValueReply {
            FindValueReply::Timeout
        }
        async fn find_node_at(&self, _peer: &RoutingEntry, _target: &NodeKey) -> Vec<RoutingEntry> {
            vec![]
        }
    }

    struct RecordingEvents {
        delivered: AsyncMutex<Vec<Vec<u8>>>,
        errors: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MeshEvents for RecordingEvents {
        async fn on_message_delivered(&self, _sender_id: PeerId, plaintext: Vec<u8>, _timestamp_ms: u64) {
            self.delivered.lock().await.push(plaintext);
        }
        async fn on_peer_connected(&self, _info: PeerInfo) {}
        async fn on_peer_disconnected(&self, _peer_id: PeerId) {}
        async fn on_delivery_failed(&self, _id: String, _recipient_id: PeerId, _reason: String) {}
        async fn on_discovery_update(&self, _discovered: usize) {}
        async fn on_error(&self, _error: Arc<MeshError>, _context: Option<String>) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_fatal(&self, _error: Arc<MeshError>) {}
    }

    async fn build_node(seed: [u8; 32], network: Arc<InMemoryNetwork>) -> (Arc<MeshNetwork>, Arc<RecordingEvents>) {
        let identity = Identity::from_seed(&seed);
        let peer_id = identity.peer_id();
        let transport: Arc<dyn Transport> = Arc::new(InMemoryTransport::new(peer_id, network));
        let events = Arc::new(RecordingEvents {
            delivered: AsyncMutex::new(vec![]),
            errors: AtomicUsize::new(0),
        });
        let mesh = MeshNetwork::new(
            identity,
            Config::default(),
            vec![transport],
            Arc::new(NullDhtRpc),
            InMemoryKeyValueAdapter::new(),
            vec![],
            events.clone(),
        )
        .await
        .unwrap();
        let mesh = Arc::new(mesh);
        mesh.start().await.unwrap();
        (mesh, events)
    }

    #[tokio::test]
    async fn direct_send_delivers_plaintext_to_recipient() {
        let network = InMemoryNetwork::new();
        let (sender, _sender_events) = build_node([0x11; 32], network.clone()).await;
        let (recipient, recipient_events) = build_node([0x22; 32], network.clone()).await;

        sender
            .peer_directory
            .insert(recipient.peer_id(), recipient.identity.public_key())
            .await;
        recipient
            .peer_directory
            .insert(sender.peer_id(), sender.identity.public_key())
            .await;

        sender.connect_to_peer(&recipient.peer_id()).await.unwrap();

        let outcome = sender
            .send_message(&recipient.peer_id(), b"Hello, World!")
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::SentDirect);

        let delivered = recipient_events.delivered.lock().await;
        assert_eq!(delivered.last().map(|v| v.as_slice()), Some(&b"Hello, World!"[..]));
    }

    #[tokio::test]
    async fn unknown_recipient_queues_into_outbox() {
        let network = InMemoryNetwork::new();
        let (sender, _events) = build_node([0x33; 32], network).await;
        let unknown_peer = "DEADBEEFCAFEBABE".to_string();
        let result = sender.send_message(&unknown_peer, b"hi").await;
        assert!(matches!(result, Err(MeshError::Dht(_))));
    }
}
