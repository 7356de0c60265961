//! Service registration, discovery and client-side load balancing
//!
//! Instances announce themselves under a lease-backed key in a coordination
//! service. Followers watch the directory and keep one round-robin
//! [`ChannelPool`] per followed service in a [`RoutingTable`].

pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod node;
pub mod routing;

pub use config::{DiscoveryConfig, RegistrationConfig, TransportConfig};
pub use coordinator::{
    Coordinator, DirectoryEntry, DirectoryEvent, EtcdConnectOptions, EtcdCoordinator, LeaseId,
    Listing, MemoryCoordinator,
};
pub use discovery::{DirectoryHandler, DirectoryWatcher, LeaseRegistrar, WatcherOptions};
pub use error::{Error, Result};
pub use node::ServiceNode;
pub use routing::{
    service_name_of, Backend, ChannelPool, GrpcTransport, RoutingTable, Transport, TransportOptions,
};
