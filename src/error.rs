//! Facade-level error taxonomy (§7): wraps each component's `thiserror`
//! enum and maps to the short numeric codes host UIs localize against.

use thiserror::Error;

use crate::adapters::StorageError;
use crate::crypto::CryptoError;
use crate::dht::DhtError;
use crate::envelope::EnvelopeError;
use crate::outbox::DeliveryError;
use crate::relay::RelayError;
use crate::transport::TransportError;
use crate::wire::ProtocolError;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("dht error: {0}")]
    Dht(#[from] DhtError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl MeshError {
    /// Short numeric code for host-UI localization (§7).
    pub fn code(&self) -> u32 {
        match self {
            MeshError::Transport(TransportError::NotConnected) => 1002,
            MeshError::Transport(TransportError::Timeout) => 1003,
            MeshError::Transport(TransportError::SendFailed) => 1004,
            MeshError::Transport(TransportError::Closed) => 1005,
            MeshError::Crypto(CryptoError::AuthTag) => 2003,
            MeshError::Crypto(_) => 2001,
            MeshError::Envelope(_) => 2003,
            MeshError::Protocol(ProtocolError::RateLimited) => 2010,
            MeshError::Protocol(_) => 2002,
            MeshError::Dht(DhtError::NotFound) => 3001,
            MeshError::Dht(DhtError::QuotaExceeded) => 3002,
            MeshError::Dht(_) => 3000,
            MeshError::Storage(_) => 4001,
            MeshError::Relay(RelayError::TtlExpired) => 5001,
            MeshError::Relay(RelayError::LoopDetected) => 5002,
            MeshError::Relay(RelayError::NoNextHop) => 5003,
            MeshError::Delivery(_) => 4002,
            MeshError::Fatal(_) => 9000,
        }
    }

    /// Whether this error recovers locally (per §7's propagation policy)
    /// rather than escalating through `onError`/`onFatal`.
    pub fn recovers_locally(&self) -> bool {
        matches!(
            self,
            MeshError::Transport(_) | MeshError::Protocol(_) | MeshError::Crypto(_) | MeshError::Envelope(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, MeshError::Fatal(_) | MeshError::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_not_connected_maps_to_1002() {
        let err = MeshError::Transport(TransportError::NotConnected);
        assert_eq!(err.code(), 1002);
    }

    #[test]
    fn decryption_failure_maps_to_2003() {
        let err = MeshError::Crypto(CryptoError::AuthTag);
        assert_eq!(err.code(), 2003);
    }

    #[test]
    fn storage_error_maps_to_4001_and_is_fatal() {
        let err = MeshError::Storage(StorageError::Corrupt("bad row".into()));
        assert_eq!(err.code(), 4001);
        assert!(err.is_fatal());
        assert!(!err.recovers_locally());
    }

    #[test]
    fn transport_and_protocol_errors_recover_locally() {
        assert!(MeshError::Transport(TransportError::Timeout).recovers_locally());
        assert!(MeshError::Protocol(ProtocolError::Ttl).recovers_locally());
    }
}
