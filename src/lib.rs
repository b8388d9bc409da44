pub mod adapters;
pub mod config;
pub mod crypto;
pub mod dht;
pub mod envelope;
pub mod error;
pub mod gossip;
pub mod identity;
pub mod mesh;
pub mod outbox;
pub mod rate_limit;
pub mod relay;
pub mod routing;
pub mod transport;
pub mod wire;

pub use adapters::{Clock, KeyValueAdapter, SecretStore, StorageError, SystemClock};
pub use config::Config;
pub use dht::{Dht, DhtError, DhtRecord, DhtRpc};
pub use envelope::{Envelope, EnvelopeError};
pub use error::MeshError;
pub use gossip::{AnnounceLedger, AnnouncedPeer, DiscoveryProvider};
pub use identity::{Identity, IdentityError, PeerId};
pub use mesh::{MeshEvents, MeshNetwork, SendOutcome};
pub use outbox::{DeliveryError, Outbox, OutboxEntry};
pub use rate_limit::RateLimiter;
pub use relay::{Relay, RelayError};
pub use routing::{LivenessProbe, NodeKey, RoutingEntry, RoutingTable};
pub use transport::{ConnectionState, PeerInfo, Transport, TransportError, TransportEvents, TransportKind};
pub use wire::{Header, MessageType, ProtocolError};
