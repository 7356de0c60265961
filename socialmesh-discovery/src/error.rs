//! Error types for the discovery module

use thiserror::Error;

use crate::coordinator::LeaseId;

/// Discovery error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Coordination service unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("Lease {0} expired")]
    LeaseExpired(LeaseId),

    #[error("Watch canceled: {0}")]
    WatchCanceled(String),

    #[error("Failed to initialize transport to {address}: {reason}")]
    TransportInit { address: String, reason: String },

    #[error("Address {address} is not registered for service {service}")]
    UnknownAddress { service: String, address: String },
}

impl From<etcd_client::Error> for Error {
    fn from(err: etcd_client::Error) -> Self {
        Self::CoordinationUnavailable(err.to_string())
    }
}

/// Result type for discovery operations
pub type Result<T> = std::result::Result<T, Error>;
