//! In-process coordinator
//!
//! Keeps a revisioned key space, leases and watchers behind one mutex.
//! Used for single-node deployments where no etcd cluster is available and
//! as the coordination service in tests. Lease deadlines follow tokio time,
//! so tests running with a paused clock control expiry precisely.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use super::{
    Coordinator, DirectoryEntry, DirectoryEvent, LeaseId, LeaseKeepAlive, Listing, WatchBatch,
    WatchStream,
};
use crate::error::{Error, Result};

/// Committed events retained for watches that resume from a past revision
const HISTORY_LIMIT: usize = 10_000;

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct LeaseState {
    ttl_secs: i64,
    deadline: Instant,
}

struct Subscriber {
    prefix: String,
    tx: mpsc::UnboundedSender<Result<WatchBatch>>,
}

#[derive(Default)]
struct MemoryState {
    revision: i64,
    next_lease: i64,
    keys: BTreeMap<String, StoredValue>,
    leases: HashMap<LeaseId, LeaseState>,
    history: VecDeque<(i64, DirectoryEvent)>,
    subscribers: Vec<Subscriber>,
    fail_next_list: bool,
}

impl MemoryState {
    /// Apply events as one revision and fan them out to matching watchers
    fn commit(&mut self, events: Vec<DirectoryEvent>) {
        if events.is_empty() {
            return;
        }
        self.revision += 1;
        let revision = self.revision;

        for event in &events {
            self.history.push_back((revision, event.clone()));
        }
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }

        self.subscribers.retain(|sub| {
            let matching: Vec<DirectoryEvent> = events
                .iter()
                .filter(|e| e.key().starts_with(&sub.prefix))
                .cloned()
                .collect();
            if matching.is_empty() {
                return !sub.tx.is_closed();
            }
            sub.tx
                .send(Ok(WatchBatch {
                    revision,
                    events: matching,
                }))
                .is_ok()
        });
    }

    fn remove_lease(&mut self, lease: LeaseId) {
        self.leases.remove(&lease);
        let attached: Vec<String> = self
            .keys
            .iter()
            .filter(|(_, v)| v.lease == Some(lease))
            .map(|(k, _)| k.clone())
            .collect();

        let events = attached
            .into_iter()
            .filter_map(|key| {
                self.keys.remove(&key).map(|prev| DirectoryEvent::Delete {
                    key,
                    prev_value: prev.value,
                })
            })
            .collect();
        self.commit(events);
    }

    fn reap_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, state)| state.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for lease in expired {
            debug!(lease = %lease, "Lease expired");
            self.remove_lease(lease);
        }
    }
}

/// Coordinator that lives entirely in this process
#[derive(Clone, Default)]
pub struct MemoryCoordinator {
    state: Arc<Mutex<MemoryState>>,
    keep_alives: Arc<AtomicU64>,
}

impl MemoryCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete leases whose deadline has passed, together with their keys.
    /// Every coordinator call does this first.
    pub fn reap_expired(&self) {
        self.state.lock().reap_expired();
    }

    /// Remove a key outside of any lease
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        state.reap_expired();
        let Some(prev) = state.keys.remove(key) else {
            return false;
        };
        state.commit(vec![DirectoryEvent::Delete {
            key: key.to_string(),
            prev_value: prev.value,
        }]);
        true
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        let mut state = self.state.lock();
        state.reap_expired();
        state.keys.get(key).map(|v| v.value.clone())
    }

    /// Lease the key is attached to, if any
    #[must_use]
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        let mut state = self.state.lock();
        state.reap_expired();
        state.keys.get(key).and_then(|v| v.lease)
    }

    #[must_use]
    pub fn lease_count(&self) -> usize {
        let mut state = self.state.lock();
        state.reap_expired();
        state.leases.len()
    }

    #[must_use]
    pub fn current_revision(&self) -> i64 {
        self.state.lock().revision
    }

    /// Total keep-alive renewals received
    #[must_use]
    pub fn keep_alive_count(&self) -> u64 {
        self.keep_alives.load(Ordering::SeqCst)
    }

    /// Make the next `list` call fail
    pub fn fail_next_list(&self) {
        self.state.lock().fail_next_list = true;
    }

    /// Deliver an error item to every open watch stream
    pub fn inject_watch_error(&self, reason: &str) {
        let state = self.state.lock();
        for sub in &state.subscribers {
            let _ = sub
                .tx
                .send(Err(Error::CoordinationUnavailable(reason.to_string())));
        }
    }

    /// Drop all retained history; watches resuming from a past revision are
    /// then canceled as compacted
    pub fn compact(&self) {
        self.state.lock().history.clear();
    }

    /// End every open watch stream
    pub fn close_watches(&self) {
        self.state.lock().subscribers.clear();
    }

    #[must_use]
    pub fn watcher_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|sub| !sub.tx.is_closed());
        state.subscribers.len()
    }
}

struct MemoryKeepAlive {
    lease: LeaseId,
    state: Arc<Mutex<MemoryState>>,
    keep_alives: Arc<AtomicU64>,
}

#[async_trait]
impl LeaseKeepAlive for MemoryKeepAlive {
    async fn renew(&mut self) -> Result<i64> {
        self.keep_alives.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        state.reap_expired();
        let lease = state
            .leases
            .get_mut(&self.lease)
            .ok_or(Error::LeaseExpired(self.lease))?;
        lease.deadline = Instant::now() + ttl_duration(lease.ttl_secs);
        Ok(lease.ttl_secs)
    }
}

fn ttl_duration(ttl_secs: i64) -> Duration {
    Duration::from_secs(u64::try_from(ttl_secs).unwrap_or(0))
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        if ttl_secs <= 0 {
            return Err(Error::CoordinationUnavailable(format!(
                "invalid lease ttl {ttl_secs}"
            )));
        }

        let mut state = self.state.lock();
        state.reap_expired();
        state.next_lease += 1;
        let lease = LeaseId(state.next_lease);
        state.leases.insert(
            lease,
            LeaseState {
                ttl_secs,
                deadline: Instant::now() + ttl_duration(ttl_secs),
            },
        );
        Ok(lease)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Box<dyn LeaseKeepAlive>> {
        let mut state = self.state.lock();
        state.reap_expired();
        if !state.leases.contains_key(&lease) {
            return Err(Error::LeaseExpired(lease));
        }
        Ok(Box::new(MemoryKeepAlive {
            lease,
            state: self.state.clone(),
            keep_alives: self.keep_alives.clone(),
        }))
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.state.lock();
        state.reap_expired();
        if !state.leases.contains_key(&lease) {
            return Err(Error::CoordinationUnavailable(format!(
                "lease {lease} not found"
            )));
        }
        state.remove_lease(lease);
        Ok(())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let mut state = self.state.lock();
        state.reap_expired();
        if let Some(lease) = lease {
            if !state.leases.contains_key(&lease) {
                return Err(Error::CoordinationUnavailable(format!(
                    "lease {lease} not found"
                )));
            }
        }

        state.keys.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                lease,
            },
        );
        state.commit(vec![DirectoryEvent::Put {
            key: key.to_string(),
            value: value.to_string(),
        }]);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Listing> {
        let mut state = self.state.lock();
        state.reap_expired();
        if std::mem::take(&mut state.fail_next_list) {
            return Err(Error::CoordinationUnavailable(
                "listing rejected".to_string(),
            ));
        }

        let entries = state
            .keys
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| DirectoryEntry::new(k.clone(), v.value.clone()))
            .collect();

        Ok(Listing {
            entries,
            revision: state.revision,
        })
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchStream> {
        let mut state = self.state.lock();
        state.reap_expired();
        let (tx, rx) = mpsc::unbounded_channel();

        if start_revision > 0 {
            let oldest = state.history.front().map_or(state.revision + 1, |(rev, _)| *rev);
            if start_revision < oldest && start_revision <= state.revision {
                let _ = tx.send(Err(Error::WatchCanceled(format!(
                    "required revision {start_revision} has been compacted"
                ))));
                return Ok(UnboundedReceiverStream::new(rx).boxed());
            }

            // Replay retained history one revision at a time
            let mut pending: Option<WatchBatch> = None;
            for (revision, event) in &state.history {
                if *revision < start_revision || !event.key().starts_with(prefix) {
                    continue;
                }
                match pending.as_mut() {
                    Some(batch) if batch.revision == *revision => batch.events.push(event.clone()),
                    _ => {
                        if let Some(batch) = pending.take() {
                            let _ = tx.send(Ok(batch));
                        }
                        pending = Some(WatchBatch {
                            revision: *revision,
                            events: vec![event.clone()],
                        });
                    }
                }
            }
            if let Some(batch) = pending {
                let _ = tx.send(Ok(batch));
            }
        }

        state.subscribers.push(Subscriber {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_list_prefix() {
        let coordinator = MemoryCoordinator::new();
        coordinator.put("/service/a/1", "10.0.0.1:80", None).await.unwrap();
        coordinator.put("/service/b/1", "10.0.0.2:80", None).await.unwrap();
        coordinator.put("/other/x", "nope", None).await.unwrap();

        let listing = coordinator.list("/service/").await.unwrap();
        assert_eq!(listing.entries.len(), 2);
        assert_eq!(listing.entries[0], DirectoryEntry::new("/service/a/1", "10.0.0.1:80"));
        assert_eq!(listing.revision, 3);
    }

    #[tokio::test]
    async fn test_fail_next_list_is_one_shot() {
        let coordinator = MemoryCoordinator::new();
        coordinator.fail_next_list();
        assert!(coordinator.list("/").await.is_err());
        assert!(coordinator.list("/").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_deletes_attached_keys() {
        let coordinator = MemoryCoordinator::new();
        let lease = coordinator.grant_lease(3).await.unwrap();
        coordinator.put("/service/a/1", "addr", Some(lease)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(coordinator.get("/service/a/1").as_deref(), Some("addr"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(coordinator.get("/service/a/1"), None);
        assert_eq!(coordinator.lease_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_extends_deadline() {
        let coordinator = MemoryCoordinator::new();
        let lease = coordinator.grant_lease(3).await.unwrap();
        coordinator.put("/k", "v", Some(lease)).await.unwrap();
        let mut keeper = coordinator.keep_alive(lease).await.unwrap();

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(2)).await;
            assert_eq!(keeper.renew().await.unwrap(), 3);
        }
        assert_eq!(coordinator.get("/k").as_deref(), Some("v"));
        assert_eq!(coordinator.keep_alive_count(), 5);
    }

    #[tokio::test]
    async fn test_revoke_emits_delete_with_previous_value() {
        let coordinator = MemoryCoordinator::new();
        let lease = coordinator.grant_lease(10).await.unwrap();
        coordinator.put("/service/a/1", "addr", Some(lease)).await.unwrap();

        let mut stream = coordinator.watch("/service/", 0).await.unwrap();
        coordinator.revoke_lease(lease).await.unwrap();

        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(
            batch.events,
            vec![DirectoryEvent::Delete {
                key: "/service/a/1".to_string(),
                prev_value: "addr".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_watch_replays_from_revision() {
        let coordinator = MemoryCoordinator::new();
        coordinator.put("/service/a/1", "one", None).await.unwrap();
        coordinator.put("/service/a/2", "two", None).await.unwrap();
        coordinator.put("/other", "skip", None).await.unwrap();

        let mut stream = coordinator.watch("/service/", 2).await.unwrap();
        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch.revision, 2);
        assert_eq!(batch.events[0].key(), "/service/a/2");

        coordinator.put("/service/a/3", "three", None).await.unwrap();
        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch.revision, 4);
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease_fails() {
        let coordinator = MemoryCoordinator::new();
        let result = coordinator.put("/k", "v", Some(LeaseId(42))).await;
        assert!(matches!(result, Err(Error::CoordinationUnavailable(_))));
        assert_eq!(coordinator.get("/k"), None);
    }
}
