//! etcd v3 backend for [`Coordinator`]

use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use etcd_client::{
    Client, ConnectOptions, Event, EventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper,
    PutOptions, WatchOptions, WatchResponse,
};
use futures::StreamExt;
use tracing::{debug, info, trace, warn};

use super::{
    Coordinator, DirectoryEntry, DirectoryEvent, LeaseId, LeaseKeepAlive, Listing, WatchBatch,
    WatchStream,
};
use crate::error::{Error, Result};

/// Connection settings for [`EtcdCoordinator::connect`]
#[derive(Debug, Clone)]
pub struct EtcdConnectOptions {
    pub connect_timeout: Duration,
    /// Per-request timeout. Watches and keep-alive streams are long-lived and
    /// not subject to it.
    pub request_timeout: Option<Duration>,
    /// Connection attempts before giving up
    pub max_attempts: usize,
}

impl Default for EtcdConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: None,
            max_attempts: 5,
        }
    }
}

/// Coordinator backed by an etcd cluster
#[derive(Clone)]
pub struct EtcdCoordinator {
    client: Client,
}

impl EtcdCoordinator {
    /// Connect to etcd, retrying with exponential backoff
    pub async fn connect(endpoints: &[String], options: &EtcdConnectOptions) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::Configuration("no etcd endpoints configured".to_string()));
        }

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(options.max_attempts.saturating_sub(1))
            .with_jitter()
            .build();

        let mut last_err = None;
        for delay in std::iter::once(Duration::ZERO).chain(backoff) {
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }

            match Client::connect(endpoints, Some(connect_options(options))).await {
                Ok(client) => {
                    info!(endpoints = ?endpoints, "Connected to etcd");
                    return Ok(Self { client });
                }
                Err(e) => {
                    warn!(error = %e, endpoints = ?endpoints, "etcd connection failed, retrying");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.map_or_else(
            || Error::CoordinationUnavailable("etcd connection attempts exhausted".to_string()),
            Error::from,
        ))
    }
}

fn connect_options(options: &EtcdConnectOptions) -> ConnectOptions {
    let connect_options = ConnectOptions::new().with_connect_timeout(options.connect_timeout);
    match options.request_timeout {
        Some(timeout) => connect_options.with_timeout(timeout),
        None => connect_options,
    }
}

struct EtcdKeepAlive {
    lease: LeaseId,
    keeper: LeaseKeeper,
    stream: LeaseKeepAliveStream,
}

#[async_trait]
impl LeaseKeepAlive for EtcdKeepAlive {
    async fn renew(&mut self) -> Result<i64> {
        self.keeper.keep_alive().await?;

        match self.stream.message().await? {
            Some(resp) if resp.ttl() > 0 => {
                trace!(lease = %self.lease, ttl = resp.ttl(), "Keep-alive OK");
                Ok(resp.ttl())
            }
            Some(_) => Err(Error::LeaseExpired(self.lease)),
            None => Err(Error::CoordinationUnavailable(format!(
                "keep-alive stream for lease {} closed",
                self.lease
            ))),
        }
    }
}

#[async_trait]
impl Coordinator for EtcdCoordinator {
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl_secs, None).await?;
        debug!(lease = %LeaseId(resp.id()), ttl = resp.ttl(), "Lease granted");
        Ok(LeaseId(resp.id()))
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Box<dyn LeaseKeepAlive>> {
        let mut client = self.client.clone();
        let (keeper, stream) = client.lease_keep_alive(lease.0).await?;
        Ok(Box::new(EtcdKeepAlive {
            lease,
            keeper,
            stream,
        }))
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        client.lease_revoke(lease.0).await?;
        debug!(lease = %lease, "Lease revoked");
        Ok(())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let mut client = self.client.clone();
        let options = lease.map(|lease| PutOptions::new().with_lease(lease.0));
        client.put(key, value, options).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Listing> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        let mut entries = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match (kv.key_str(), kv.value_str()) {
                (Ok(key), Ok(value)) => entries.push(DirectoryEntry::new(key, value)),
                _ => warn!(prefix = %prefix, "Skipping entry with non UTF-8 key or value"),
            }
        }

        let revision = resp.header().map_or(0, |h| h.revision());
        Ok(Listing { entries, revision })
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchStream> {
        let mut client = self.client.clone();
        let mut options = WatchOptions::new().with_prefix().with_prev_key();
        if start_revision > 0 {
            options = options.with_start_revision(start_revision);
        }
        let (watcher, stream) = client.watch(prefix, Some(options)).await?;
        debug!(prefix = %prefix, start_revision, "etcd watch established");

        // The watcher owns the request side of the stream and is kept alive
        // alongside it. A transport error ends the stream.
        let batches = futures::stream::unfold(Some((watcher, stream)), |state| async move {
            let (watcher, mut stream) = state?;
            match stream.message().await {
                Ok(Some(resp)) if resp.canceled() => Some((
                    Err(Error::WatchCanceled(resp.cancel_reason().to_string())),
                    None,
                )),
                Ok(Some(resp)) => Some((Ok(convert_response(&resp)), Some((watcher, stream)))),
                Ok(None) => None,
                Err(e) => Some((Err(Error::from(e)), None)),
            }
        });

        Ok(batches.boxed())
    }
}

fn convert_response(resp: &WatchResponse) -> WatchBatch {
    let mut batch = WatchBatch::default();
    for event in resp.events() {
        if let Some(kv) = event.kv() {
            batch.revision = batch.revision.max(kv.mod_revision());
        }
        if let Some(converted) = convert_event(event) {
            batch.events.push(converted);
        }
    }
    batch
}

fn convert_event(event: &Event) -> Option<DirectoryEvent> {
    let kv = event.kv()?;
    let Ok(key) = kv.key_str() else {
        warn!("Skipping watch event with non UTF-8 key");
        return None;
    };

    match event.event_type() {
        EventType::Put => match kv.value_str() {
            Ok(value) => Some(DirectoryEvent::Put {
                key: key.to_string(),
                value: value.to_string(),
            }),
            Err(_) => {
                warn!(key = %key, "Skipping put with non UTF-8 value");
                None
            }
        },
        EventType::Delete => {
            let prev_value = event
                .prev_kv()
                .and_then(|prev| prev.value_str().ok())
                .map(str::to_string);
            if prev_value.is_none() {
                warn!(key = %key, "Delete event without previous value");
            }
            Some(DirectoryEvent::Delete {
                key: key.to_string(),
                prev_value: prev_value.unwrap_or_default(),
            })
        }
    }
}
