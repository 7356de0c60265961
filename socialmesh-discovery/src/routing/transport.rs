//! Connection construction for backends
//!
//! A [`Transport`] turns an announced address into a connection handle. The
//! pool stores whatever handle the transport returns, so alternative RPC
//! stacks plug in without touching the routing logic.

use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use crate::error::{Error, Result};

/// Protocol accepted by [`GrpcTransport`]
pub const GRPC_PROTOCOL: &str = "grpc";

/// Per-connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Per-request deadline; `None` waits indefinitely
    pub timeout: Option<Duration>,
    /// Deadline for establishing the connection; `None` uses the transport default
    pub connect_timeout: Option<Duration>,
    /// Retries a caller may attempt against the backend
    pub max_retry: u32,
    pub protocol: String,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            connect_timeout: None,
            max_retry: 3,
            protocol: GRPC_PROTOCOL.to_string(),
        }
    }
}

/// Builds connections to backend addresses
#[cfg_attr(test, mockall::automock(type Connection = String;))]
pub trait Transport: Send + Sync + 'static {
    /// Cheap-to-clone handle to one backend
    type Connection: Clone + Send + Sync + 'static;

    /// Initialize a connection to `address`. Must not block on network I/O.
    fn connect(&self, address: &str, options: &TransportOptions) -> Result<Self::Connection>;
}

/// gRPC transport producing lazily connected tonic channels
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcTransport;

impl GrpcTransport {
    fn endpoint(address: &str, options: &TransportOptions) -> Result<Endpoint> {
        if options.protocol != GRPC_PROTOCOL {
            return Err(Error::TransportInit {
                address: address.to_string(),
                reason: format!("unsupported protocol {}", options.protocol),
            });
        }

        let uri = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };

        let mut endpoint = Endpoint::from_shared(uri).map_err(|e| Error::TransportInit {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
        if let Some(timeout) = options.timeout {
            endpoint = endpoint.timeout(timeout);
        }
        if let Some(connect_timeout) = options.connect_timeout {
            endpoint = endpoint.connect_timeout(connect_timeout);
        }
        Ok(endpoint)
    }
}

impl Transport for GrpcTransport {
    type Connection = Channel;

    fn connect(&self, address: &str, options: &TransportOptions) -> Result<Channel> {
        Ok(Self::endpoint(address, options)?.connect_lazy())
    }
}
