//! Coordination service abstraction
//!
//! The discovery layer talks to the coordination service only through the
//! [`Coordinator`] trait:
//! - leases with a TTL that must be renewed to keep attached keys alive
//! - key/value puts optionally bound to a lease
//! - prefix listing with the revision the snapshot was taken at
//! - recursive prefix watches resumable from a revision
//!
//! [`EtcdCoordinator`] is the production backend. [`MemoryCoordinator`] keeps
//! everything in-process for single-node deployments and tests.

pub mod etcd;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

pub use etcd::{EtcdConnectOptions, EtcdCoordinator};
pub use memory::MemoryCoordinator;

/// Lease handle issued by the coordination service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// One key/value pair under a watched directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub key: String,
    pub value: String,
}

impl DirectoryEntry {
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Snapshot of a prefix
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub entries: Vec<DirectoryEntry>,
    /// Store revision the snapshot reflects. A watch started at
    /// `revision + 1` observes exactly the changes after the snapshot.
    pub revision: i64,
}

/// A single change under a watched prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    /// Key created or updated
    Put { key: String, value: String },
    /// Key removed; the value it held before removal
    Delete { key: String, prev_value: String },
}

impl DirectoryEvent {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key, .. } => key,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Put { .. } => "put",
            Self::Delete { .. } => "delete",
        }
    }
}

/// Events of one watch response, all committed at `revision`
#[derive(Debug, Clone, Default)]
pub struct WatchBatch {
    pub revision: i64,
    pub events: Vec<DirectoryEvent>,
}

/// Stream of watch batches. An `Err` item affects only that batch; the
/// stream ending means the watch must be re-opened.
pub type WatchStream = BoxStream<'static, Result<WatchBatch>>;

/// Renewal handle for one lease
#[async_trait]
pub trait LeaseKeepAlive: Send {
    /// Renew the lease once, returning the remaining TTL in seconds.
    ///
    /// Returns `Error::LeaseExpired` if the service no longer knows the lease.
    async fn renew(&mut self) -> Result<i64>;
}

/// Hierarchical key/value store with leases and prefix watches
#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId>;

    async fn keep_alive(&self, lease: LeaseId) -> Result<Box<dyn LeaseKeepAlive>>;

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()>;

    /// Recursive listing of every key under `prefix`
    async fn list(&self, prefix: &str) -> Result<Listing>;

    /// Recursive watch of `prefix`. `start_revision <= 0` watches from the
    /// current revision.
    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchStream>;
}
