//! Service name to channel pool mapping

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channel_pool::{Backend, ChannelPool};
use super::transport::{Transport, TransportOptions};
use crate::coordinator::DirectoryEvent;
use crate::discovery::DirectoryHandler;

/// Service part of an instance key: everything before the last `/`
///
/// `/service/chat-svc/node1` belongs to `/service/chat-svc`. A key without
/// any `/` is its own service name.
#[must_use]
pub fn service_name_of(key: &str) -> &str {
    key.rsplit_once('/').map_or(key, |(service, _)| service)
}

struct TableState<C> {
    followed: HashSet<String>,
    pools: HashMap<String, Arc<ChannelPool<C>>>,
    /// Address currently routed for each followed instance key
    instances: HashMap<String, String>,
}

/// Routing state for followed services
///
/// The table lock covers the follow set and the pool map and is only held
/// for lookups and inserts. Transport calls happen outside both locks.
pub struct RoutingTable<T: Transport> {
    transport: T,
    options: TransportOptions,
    state: Mutex<TableState<T::Connection>>,
}

impl<T: Transport> RoutingTable<T> {
    pub fn new(transport: T, options: TransportOptions) -> Self {
        Self {
            transport,
            options,
            state: Mutex::new(TableState {
                followed: HashSet::new(),
                pools: HashMap::new(),
                instances: HashMap::new(),
            }),
        }
    }

    pub const fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Start routing announcements for `service`
    pub fn follow(&self, service: impl Into<String>) {
        let service = service.into();
        if self.state.lock().followed.insert(service.clone()) {
            info!(service = %service, "Following service");
        }
    }

    pub fn is_followed(&self, service: &str) -> bool {
        self.state.lock().followed.contains(service)
    }

    /// An instance of some service announced `address`
    ///
    /// An instance that was routed at another address is withdrawn from it.
    pub fn on_announce(&self, instance_key: &str, address: &str) {
        let service = service_name_of(instance_key);

        let (pool, previous) = {
            let mut state = self.state.lock();
            if !state.followed.contains(service) {
                debug!(service = %service, key = %instance_key, "Ignoring announce for unfollowed service");
                return;
            }
            let pool = Arc::clone(
                state
                    .pools
                    .entry(service.to_string())
                    .or_insert_with(|| Arc::new(ChannelPool::new(service))),
            );
            let previous = state
                .instances
                .insert(instance_key.to_string(), address.to_string());
            (pool, previous)
        };

        if let Some(previous) = previous.filter(|previous| previous != address) {
            info!(key = %instance_key, from = %previous, to = %address, "Instance address changed");
            let _ = pool.remove(&previous);
        }

        // Failure is logged by the pool and leaves it unchanged
        let _ = pool.add(&self.transport, address, &self.options);
    }

    /// An instance of some service withdrew `address`
    pub fn on_withdraw(&self, instance_key: &str, address: &str) {
        let service = service_name_of(instance_key);

        let (pool, routed) = {
            let mut state = self.state.lock();
            if !state.followed.contains(service) {
                debug!(service = %service, key = %instance_key, "Ignoring withdraw for unfollowed service");
                return;
            }
            let routed = state.instances.remove(instance_key);
            match state.pools.get(service) {
                Some(pool) => (Arc::clone(pool), routed),
                None => {
                    debug!(service = %service, address = %address, "Withdraw for service without pool");
                    return;
                }
            }
        };

        // The routed address wins over a stale or missing previous value
        let address = match routed {
            Some(routed) if routed != address => {
                debug!(key = %instance_key, routed = %routed, reported = %address, "Withdrawing routed address");
                routed
            }
            _ => address.to_string(),
        };
        let _ = pool.remove(&address);
    }

    pub fn apply(&self, event: DirectoryEvent) {
        match event {
            DirectoryEvent::Put { key, value } => self.on_announce(&key, &value),
            DirectoryEvent::Delete { key, prev_value } => self.on_withdraw(&key, &prev_value),
        }
    }

    /// Next backend for `service`, `None` if unknown or empty
    pub fn resolve(&self, service: &str) -> Option<Backend<T::Connection>> {
        let pool = self.pool(service);
        match pool {
            Some(pool) => pool.choose(),
            None => {
                debug!(service = %service, "No pool for service");
                None
            }
        }
    }

    pub fn pool(&self, service: &str) -> Option<Arc<ChannelPool<T::Connection>>> {
        self.state.lock().pools.get(service).cloned()
    }

    /// Services that currently have a pool
    pub fn services(&self) -> Vec<String> {
        let mut services: Vec<String> = self.state.lock().pools.keys().cloned().collect();
        services.sort();
        services
    }

    /// Drain directory events into the table until cancelled or the queue closes
    pub fn run_event_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<DirectoryEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Routing event loop started");
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        info!("Routing event loop cancelled");
                        break;
                    }
                    event = rx.recv() => {
                        let Some(event) = event else {
                            warn!("Directory event queue closed");
                            break;
                        };
                        debug!(kind = event.kind(), key = %event.key(), "Applying directory event");
                        self.apply(event);
                    }
                }
            }
        })
    }
}

impl<T: Transport> DirectoryHandler for Arc<RoutingTable<T>> {
    fn handle(&self, event: DirectoryEvent) {
        self.apply(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::routing::transport::MockTransport;

    const CHAT: &str = "/service/chat-svc";

    fn transport() -> MockTransport {
        let mut transport = MockTransport::new();
        transport
            .expect_connect()
            .returning(|address, _| Ok(format!("conn-{address}")));
        transport
    }

    fn table() -> RoutingTable<MockTransport> {
        RoutingTable::new(transport(), TransportOptions::default())
    }

    fn resolved(table: &RoutingTable<MockTransport>, service: &str, n: usize) -> Vec<String> {
        (0..n)
            .map(|_| table.resolve(service).unwrap().address().to_string())
            .collect()
    }

    #[test]
    fn test_service_name_of() {
        assert_eq!(service_name_of("/service/chat-svc/node1"), "/service/chat-svc");
        assert_eq!(service_name_of("chat-svc/node1"), "chat-svc");
        assert_eq!(service_name_of("/node1"), "");
        assert_eq!(service_name_of("chat-svc"), "chat-svc");
    }

    #[test]
    fn test_announced_instances_are_resolved_in_turn() {
        let table = table();
        table.follow(CHAT);
        table.on_announce("/service/chat-svc/node1", "10.0.0.1:9000");
        table.on_announce("/service/chat-svc/node2", "10.0.0.2:9000");

        assert_eq!(
            resolved(&table, CHAT, 4),
            vec!["10.0.0.1:9000", "10.0.0.2:9000", "10.0.0.1:9000", "10.0.0.2:9000"]
        );
    }

    #[test]
    fn test_withdrawn_instance_is_no_longer_resolved() {
        let table = table();
        table.follow(CHAT);
        table.on_announce("/service/chat-svc/node1", "10.0.0.1:9000");
        table.on_announce("/service/chat-svc/node2", "10.0.0.2:9000");

        table.on_withdraw("/service/chat-svc/node1", "10.0.0.1:9000");

        assert_eq!(resolved(&table, CHAT, 3), vec!["10.0.0.2:9000"; 3]);
    }

    #[test]
    fn test_unfollowed_service_creates_no_pool() {
        let mut transport = MockTransport::new();
        transport.expect_connect().never();
        let table = RoutingTable::new(transport, TransportOptions::default());
        table.follow(CHAT);

        table.on_announce("/service/feed-svc/node1", "10.0.1.1:9000");

        assert!(table.pool("/service/feed-svc").is_none());
        assert!(table.services().is_empty());
    }

    #[test]
    fn test_resolve_unknown_service() {
        let table = table();
        assert!(table.resolve("/service/unknown").is_none());
    }

    #[test]
    fn test_withdraw_without_pool_is_noop() {
        let table = table();
        table.follow(CHAT);
        table.on_withdraw("/service/chat-svc/node1", "10.0.0.1:9000");
        assert!(table.services().is_empty());
    }

    #[test]
    fn test_follow_is_idempotent() {
        let table = table();
        table.follow(CHAT);
        table.follow(CHAT);
        assert!(table.is_followed(CHAT));
        assert!(!table.is_followed("/service/feed-svc"));
    }

    #[test]
    fn test_failed_connect_leaves_empty_pool() {
        let mut transport = MockTransport::new();
        transport.expect_connect().returning(|address, _| {
            Err(Error::TransportInit {
                address: address.to_string(),
                reason: "refused".to_string(),
            })
        });
        let table = RoutingTable::new(transport, TransportOptions::default());
        table.follow(CHAT);

        table.on_announce("/service/chat-svc/node1", "10.0.0.1:9000");

        assert!(table.pool(CHAT).unwrap().is_empty());
        assert!(table.resolve(CHAT).is_none());
    }

    #[test]
    fn test_apply_dispatches_events() {
        let table = table();
        table.follow(CHAT);

        table.apply(DirectoryEvent::Put {
            key: "/service/chat-svc/node1".to_string(),
            value: "10.0.0.1:9000".to_string(),
        });
        assert_eq!(table.pool(CHAT).unwrap().addresses(), vec!["10.0.0.1:9000"]);

        table.apply(DirectoryEvent::Delete {
            key: "/service/chat-svc/node1".to_string(),
            prev_value: "10.0.0.1:9000".to_string(),
        });
        assert!(table.pool(CHAT).unwrap().is_empty());
    }

    #[test]
    fn test_changed_address_replaces_old_backend() {
        let table = table();
        table.follow(CHAT);
        table.on_announce("/service/chat-svc/node1", "10.0.0.1:9000");
        table.on_announce("/service/chat-svc/node2", "10.0.0.2:9000");

        table.on_announce("/service/chat-svc/node1", "10.0.0.9:9000");
        assert_eq!(
            table.pool(CHAT).unwrap().addresses(),
            vec!["10.0.0.2:9000", "10.0.0.9:9000"]
        );

        table.on_withdraw("/service/chat-svc/node1", "10.0.0.9:9000");
        table.on_withdraw("/service/chat-svc/node2", "10.0.0.2:9000");
        assert!(table.pool(CHAT).unwrap().is_empty());
        assert!(table.resolve(CHAT).is_none());
    }

    #[test]
    fn test_reannounce_same_address_keeps_one_backend() {
        let table = table();
        table.follow(CHAT);
        table.on_announce("/service/chat-svc/node1", "10.0.0.1:9000");
        table.on_announce("/service/chat-svc/node1", "10.0.0.1:9000");

        assert_eq!(table.pool(CHAT).unwrap().addresses(), vec!["10.0.0.1:9000"]);
        table.on_withdraw("/service/chat-svc/node1", "10.0.0.1:9000");
        assert!(table.pool(CHAT).unwrap().is_empty());
    }

    #[test]
    fn test_withdraw_without_previous_value_removes_routed_address() {
        let table = table();
        table.follow(CHAT);
        table.on_announce("/service/chat-svc/node1", "10.0.0.1:9000");

        table.apply(DirectoryEvent::Delete {
            key: "/service/chat-svc/node1".to_string(),
            prev_value: String::new(),
        });
        assert!(table.pool(CHAT).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_event_loop_drains_queue_until_closed() {
        let table = Arc::new(table());
        table.follow(CHAT);
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = Arc::clone(&table).run_event_loop(rx, CancellationToken::new());
        tx.handle(DirectoryEvent::Put {
            key: "/service/chat-svc/node1".to_string(),
            value: "10.0.0.1:9000".to_string(),
        });
        tx.handle(DirectoryEvent::Put {
            key: "/service/chat-svc/node2".to_string(),
            value: "10.0.0.2:9000".to_string(),
        });
        drop(tx);
        handle.await.unwrap();

        assert_eq!(
            table.pool(CHAT).unwrap().addresses(),
            vec!["10.0.0.1:9000", "10.0.0.2:9000"]
        );
    }

    #[tokio::test]
    async fn test_event_loop_stops_on_cancel() {
        let table = Arc::new(table());
        let (tx, rx) = mpsc::unbounded_channel::<DirectoryEvent>();
        let cancel = CancellationToken::new();

        let handle = Arc::clone(&table).run_event_loop(rx, cancel.clone());
        cancel.cancel();
        handle.await.unwrap();

        // The loop ended on cancellation alone and dropped its receiver
        assert!(tx.is_closed());
    }
}
