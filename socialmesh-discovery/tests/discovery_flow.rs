use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socialmesh_discovery::{
    Coordinator, DirectoryWatcher, DiscoveryConfig, Error, GrpcTransport, MemoryCoordinator,
    RegistrationConfig, Result, RoutingTable, ServiceNode, Transport, TransportOptions,
    WatcherOptions,
};

/// Counts connections and hands back the address as the connection
#[derive(Default)]
struct RecordingTransport {
    connects: Arc<AtomicUsize>,
}

impl Transport for RecordingTransport {
    type Connection = Arc<str>;

    fn connect(&self, address: &str, _options: &TransportOptions) -> Result<Arc<str>> {
        if address.is_empty() {
            return Err(Error::TransportInit {
                address: String::new(),
                reason: "empty address".to_string(),
            });
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::from(address))
    }
}

fn node_config(service: &str, instance: &str, address: &str) -> DiscoveryConfig {
    DiscoveryConfig {
        follow: vec!["chat-svc".to_string()],
        registration: Some(RegistrationConfig {
            service: service.to_string(),
            instance: instance.to_string(),
            address: address.to_string(),
        }),
        ..DiscoveryConfig::default()
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn announce_discover_resolve_withdraw() {
    let coordinator = Arc::new(MemoryCoordinator::new());

    let node1 = ServiceNode::start(
        node_config("chat-svc", "node1", "10.0.0.1:9000"),
        Arc::clone(&coordinator),
        RecordingTransport::default(),
    )
    .await
    .unwrap();
    let node2 = ServiceNode::start(
        node_config("chat-svc", "node2", "10.0.0.2:9000"),
        Arc::clone(&coordinator),
        RecordingTransport::default(),
    )
    .await
    .unwrap();

    let client = ServiceNode::start(
        DiscoveryConfig {
            follow: vec!["chat-svc".to_string()],
            ..DiscoveryConfig::default()
        },
        Arc::clone(&coordinator),
        RecordingTransport::default(),
    )
    .await
    .unwrap();

    let pool_len = || {
        client
            .routing()
            .pool("/service/chat-svc")
            .map_or(0, |pool| pool.len())
    };
    wait_for(|| pool_len() == 2).await;

    let picks: Vec<String> = (0..4)
        .map(|_| client.resolve("chat-svc").unwrap().address().to_string())
        .collect();
    assert_eq!(picks[0], picks[2]);
    assert_eq!(picks[1], picks[3]);
    assert_ne!(picks[0], picks[1]);

    node1.shutdown().await;
    wait_for(|| pool_len() == 1).await;
    for _ in 0..3 {
        let backend = client.resolve("chat-svc").unwrap();
        assert_eq!(backend.address(), "10.0.0.2:9000");
        assert_eq!(&**backend.connection(), "10.0.0.2:9000");
    }
    assert!(client.resolve("feed-svc").is_none());

    node2.shutdown().await;
    wait_for(|| pool_len() == 0).await;
    assert!(client.resolve("chat-svc").is_none());

    client.shutdown().await;
    assert_eq!(coordinator.lease_count(), 0);
}

#[tokio::test]
async fn listing_is_applied_before_watcher_returns() {
    let coordinator = Arc::new(MemoryCoordinator::new());
    for i in 1..=3 {
        coordinator
            .put(&format!("/service/chat-svc/node{i}"), &format!("10.0.0.{i}:9000"), None)
            .await
            .unwrap();
    }

    let transport = RecordingTransport::default();
    let connects = Arc::clone(&transport.connects);
    let table = Arc::new(RoutingTable::new(transport, TransportOptions::default()));
    table.follow("/service/chat-svc");

    let watcher = DirectoryWatcher::start(
        Arc::clone(&coordinator),
        "/service/",
        Arc::clone(&table),
        WatcherOptions::default(),
    )
    .await;

    // Applied directly by the handler, no waiting needed
    assert_eq!(watcher.seeded(), 3);
    assert_eq!(connects.load(Ordering::SeqCst), 3);
    assert_eq!(
        table.pool("/service/chat-svc").unwrap().addresses(),
        vec!["10.0.0.1:9000", "10.0.0.2:9000", "10.0.0.3:9000"]
    );

    coordinator.delete("/service/chat-svc/node2");
    wait_for(|| table.pool("/service/chat-svc").unwrap().len() == 2).await;
    assert!(!table
        .pool("/service/chat-svc")
        .unwrap()
        .contains("10.0.0.2:9000"));

    watcher.shutdown().await;
}

#[tokio::test]
async fn grpc_channels_are_created_without_a_server() {
    let coordinator = Arc::new(MemoryCoordinator::new());
    coordinator
        .put("/service/chat-svc/node1", "127.0.0.1:1", None)
        .await
        .unwrap();

    let client = ServiceNode::start(
        DiscoveryConfig {
            follow: vec!["chat-svc".to_string()],
            ..DiscoveryConfig::default()
        },
        coordinator,
        GrpcTransport,
    )
    .await
    .unwrap();

    wait_for(|| client.resolve("chat-svc").is_some()).await;
    let backend = client.resolve("chat-svc").unwrap();
    assert_eq!(backend.address(), "127.0.0.1:1");
    assert_eq!(backend.max_retry(), 3);

    client.shutdown().await;
}

#[tokio::test]
async fn changed_address_does_not_leave_old_backend_behind() {
    let coordinator = Arc::new(MemoryCoordinator::new());
    coordinator
        .put("/service/chat-svc/node1", "10.0.0.1:9000", None)
        .await
        .unwrap();

    let table = Arc::new(RoutingTable::new(
        RecordingTransport::default(),
        TransportOptions::default(),
    ));
    table.follow("/service/chat-svc");
    let watcher = DirectoryWatcher::start(
        Arc::clone(&coordinator),
        "/service/",
        Arc::clone(&table),
        WatcherOptions::default(),
    )
    .await;
    wait_for(|| coordinator.watcher_count() == 1).await;

    coordinator
        .put("/service/chat-svc/node1", "10.0.0.9:9000", None)
        .await
        .unwrap();
    wait_for(|| {
        table.pool("/service/chat-svc").unwrap().addresses() == vec!["10.0.0.9:9000"]
    })
    .await;

    assert!(coordinator.delete("/service/chat-svc/node1"));
    wait_for(|| table.pool("/service/chat-svc").unwrap().is_empty()).await;
    assert!(table.resolve("/service/chat-svc").is_none());

    watcher.shutdown().await;
}
