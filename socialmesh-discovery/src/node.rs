//! Owned discovery lifecycle for one process

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::DiscoveryConfig;
use crate::coordinator::Coordinator;
use crate::discovery::{DirectoryWatcher, LeaseRegistrar};
use crate::error::{Error, Result};
use crate::routing::{Backend, RoutingTable, Transport};

/// Registration, directory watch and routing wired together
///
/// Services named in `follow` are routed from the initial listing on.
/// Services followed after `start` only pick up later announcements.
pub struct ServiceNode<C: Coordinator, T: Transport> {
    config: DiscoveryConfig,
    table: Arc<RoutingTable<T>>,
    registrar: Option<LeaseRegistrar<C>>,
    watcher: DirectoryWatcher,
    cancel: CancellationToken,
    event_loop: JoinHandle<()>,
}

impl<C: Coordinator, T: Transport> ServiceNode<C, T> {
    pub async fn start(config: DiscoveryConfig, coordinator: Arc<C>, transport: T) -> Result<Self> {
        let problems = config.validate();
        if !problems.is_empty() {
            return Err(Error::Configuration(problems.join("; ")));
        }

        let table = Arc::new(RoutingTable::new(transport, config.transport_options()));
        for service in &config.follow {
            table.follow(config.service_key(service));
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let event_loop = Arc::clone(&table).run_event_loop(rx, cancel.child_token());

        // Trailing slash keeps sibling prefixes such as `/services` out
        let watcher = DirectoryWatcher::start(
            Arc::clone(&coordinator),
            format!("{}/", config.prefix),
            tx,
            config.watcher_options(),
        )
        .await;

        let registrar = match &config.registration {
            Some(registration) => {
                let registrar = match LeaseRegistrar::new(coordinator, config.lease_ttl_secs).await {
                    Ok(registrar) => registrar,
                    Err(e) => {
                        error!(error = %e, "Failed to acquire registration lease");
                        watcher.shutdown().await;
                        cancel.cancel();
                        let _ = event_loop.await;
                        return Err(e);
                    }
                };

                let key = config.instance_key(registration);
                if !registrar.register(&key, &registration.address).await {
                    warn!(key = %key, "Running without registration");
                }
                Some(registrar)
            }
            None => None,
        };

        info!(
            prefix = %config.prefix,
            follow = ?config.follow,
            registered = registrar.is_some(),
            "Service node started"
        );

        Ok(Self {
            config,
            table,
            registrar,
            watcher,
            cancel,
            event_loop,
        })
    }

    pub const fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub const fn routing(&self) -> &Arc<RoutingTable<T>> {
        &self.table
    }

    pub const fn registrar(&self) -> Option<&LeaseRegistrar<C>> {
        self.registrar.as_ref()
    }

    /// Route to `service`, named relative to the prefix
    pub fn follow(&self, service: &str) {
        self.table.follow(self.config.service_key(service));
    }

    pub fn resolve(&self, service: &str) -> Option<Backend<T::Connection>> {
        self.table.resolve(&self.config.service_key(service))
    }

    /// Revoke the registration, then stop watching and routing
    pub async fn shutdown(self) {
        if let Some(registrar) = self.registrar {
            registrar.shutdown().await;
        }
        self.watcher.shutdown().await;
        self.cancel.cancel();
        if let Err(e) = self.event_loop.await {
            error!(error = %e, "Routing event loop failed");
        }
        info!("Service node stopped");
    }
}
