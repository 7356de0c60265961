//! Client-side routing: per-service backend pools and the table over them

pub mod channel_pool;
pub mod table;
pub mod transport;

pub use channel_pool::{Backend, ChannelPool};
pub use table::{service_name_of, RoutingTable};
pub use transport::{GrpcTransport, Transport, TransportOptions, GRPC_PROTOCOL};
