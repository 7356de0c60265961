//! Service registration and directory watching

pub mod registrar;
pub mod watcher;

pub use registrar::{LeaseRegistrar, DEFAULT_LEASE_TTL_SECS};
pub use watcher::{DirectoryHandler, DirectoryWatcher, WatcherOptions};
