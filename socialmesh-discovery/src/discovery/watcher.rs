//! Directory watching
//!
//! `DirectoryWatcher` seeds the caller with a full listing of a prefix and
//! then follows every change under it. The listing is delivered before
//! `start` returns, so a consumer never sees a delete for an entry it has
//! not yet been told about.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::{Coordinator, DirectoryEvent, Listing};
use crate::error::Error;

/// Receives directory events
///
/// Calls are never concurrent with each other but usually happen on a
/// runtime worker thread, not the thread that started the watcher.
pub trait DirectoryHandler: Send + Sync + 'static {
    fn handle(&self, event: DirectoryEvent);
}

impl<F> DirectoryHandler for F
where
    F: Fn(DirectoryEvent) + Send + Sync + 'static,
{
    fn handle(&self, event: DirectoryEvent) {
        self(event);
    }
}

/// Queue boundary: events are forwarded to whoever owns the receiver
impl DirectoryHandler for mpsc::UnboundedSender<DirectoryEvent> {
    fn handle(&self, event: DirectoryEvent) {
        if self.send(event).is_err() {
            warn!("Directory event queue closed, dropping event");
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    /// Pause before re-opening a watch stream that ended
    pub reconnect_delay: Duration,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Last known value of every key under the prefix
#[derive(Default)]
struct DirectoryView {
    entries: HashMap<String, String>,
}

impl DirectoryView {
    /// Record `event` and return what the handler should see for it
    ///
    /// A put that replaces a different value for the same key becomes a
    /// delete of the old value followed by the put.
    fn apply(&mut self, event: DirectoryEvent) -> Vec<DirectoryEvent> {
        match event {
            DirectoryEvent::Put { key, value } => {
                match self.entries.insert(key.clone(), value.clone()) {
                    Some(prev_value) if prev_value != value => vec![
                        DirectoryEvent::Delete {
                            key: key.clone(),
                            prev_value,
                        },
                        DirectoryEvent::Put { key, value },
                    ],
                    _ => vec![DirectoryEvent::Put { key, value }],
                }
            }
            DirectoryEvent::Delete { key, prev_value } => {
                self.entries.remove(&key);
                vec![DirectoryEvent::Delete { key, prev_value }]
            }
        }
    }

    /// Events turning the current view into `listing`
    fn reconcile(&self, listing: &Listing) -> Vec<DirectoryEvent> {
        let listed: HashMap<&str, &str> = listing
            .entries
            .iter()
            .map(|e| (e.key.as_str(), e.value.as_str()))
            .collect();

        let mut events: Vec<DirectoryEvent> = self
            .entries
            .iter()
            .filter(|(key, _)| !listed.contains_key(key.as_str()))
            .map(|(key, value)| DirectoryEvent::Delete {
                key: key.clone(),
                prev_value: value.clone(),
            })
            .collect();
        events.sort_by(|a, b| a.key().cmp(b.key()));

        for entry in &listing.entries {
            let known = self.entries.get(&entry.key);
            if known != Some(&entry.value) {
                if let Some(prev_value) = known {
                    events.push(DirectoryEvent::Delete {
                        key: entry.key.clone(),
                        prev_value: prev_value.clone(),
                    });
                }
                events.push(DirectoryEvent::Put {
                    key: entry.key.clone(),
                    value: entry.value.clone(),
                });
            }
        }
        events
    }
}

/// Follows one directory prefix
pub struct DirectoryWatcher {
    prefix: String,
    seeded: usize,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl DirectoryWatcher {
    /// List `prefix`, hand every entry to `handler`, then watch for changes
    ///
    /// All listing callbacks have run when this returns. A failed listing is
    /// logged and seeds nothing; the watch then starts at the current
    /// revision.
    pub async fn start<C, H>(
        coordinator: Arc<C>,
        prefix: impl Into<String>,
        handler: H,
        options: WatcherOptions,
    ) -> Self
    where
        C: Coordinator,
        H: DirectoryHandler,
    {
        let prefix = prefix.into();
        let mut view = DirectoryView::default();

        let (seeded, start_revision) = match coordinator.list(&prefix).await {
            Ok(listing) => {
                let count = listing.entries.len();
                for entry in listing.entries {
                    let event = DirectoryEvent::Put {
                        key: entry.key,
                        value: entry.value,
                    };
                    for event in view.apply(event) {
                        handler.handle(event);
                    }
                }
                (count, listing.revision + 1)
            }
            Err(e) => {
                error!(prefix = %prefix, error = %e, "Failed to list services");
                (0, 0)
            }
        };
        info!(prefix = %prefix, seeded, "Directory seeded");

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_watch(
            coordinator,
            prefix.clone(),
            handler,
            view,
            start_revision,
            options,
            cancel.clone(),
        ));

        Self {
            prefix,
            seeded,
            cancel,
            handle: Some(handle),
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Entries delivered from the initial listing
    #[must_use]
    pub const fn seeded(&self) -> usize {
        self.seeded
    }

    /// Cancel the watch and wait for the watch task
    ///
    /// A callback running when this is called completes first; none runs
    /// afterwards.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(prefix = %self.prefix, error = %e, "Directory watch task panicked");
                }
            }
        }
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Returns `true` if cancelled before the delay elapsed
async fn sleep_or_cancelled(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(delay) => false,
    }
}

async fn run_watch<C, H>(
    coordinator: Arc<C>,
    prefix: String,
    handler: H,
    mut view: DirectoryView,
    start_revision: i64,
    options: WatcherOptions,
    cancel: CancellationToken,
) where
    C: Coordinator,
    H: DirectoryHandler,
{
    let mut next_revision = start_revision;
    let mut resync = false;

    'watch: loop {
        if resync {
            let listing = tokio::select! {
                biased;
                () = cancel.cancelled() => break 'watch,
                listing = coordinator.list(&prefix) => listing,
            };
            match listing {
                Ok(listing) => {
                    let events = view.reconcile(&listing);
                    info!(prefix = %prefix, changes = events.len(), "Directory resynchronized");
                    for event in events.into_iter().flat_map(|event| view.apply(event)) {
                        handler.handle(event);
                    }
                    next_revision = listing.revision + 1;
                    resync = false;
                }
                Err(e) => {
                    error!(prefix = %prefix, error = %e, "Failed to relist services");
                    if sleep_or_cancelled(&cancel, options.reconnect_delay).await {
                        break 'watch;
                    }
                    continue 'watch;
                }
            }
        }

        let stream = tokio::select! {
            biased;
            () = cancel.cancelled() => break 'watch,
            stream = coordinator.watch(&prefix, next_revision) => stream,
        };

        match stream {
            Ok(mut stream) => {
                debug!(prefix = %prefix, revision = next_revision, "Directory watch opened");

                loop {
                    let item = tokio::select! {
                        biased;
                        () = cancel.cancelled() => break 'watch,
                        item = stream.next() => item,
                    };

                    match item {
                        Some(Ok(batch)) => {
                            if batch.revision >= next_revision {
                                next_revision = batch.revision + 1;
                            }
                            for event in batch.events {
                                debug!(kind = event.kind(), key = %event.key(), "Directory event");
                                for event in view.apply(event) {
                                    handler.handle(event);
                                }
                            }
                        }
                        Some(Err(Error::WatchCanceled(reason))) => {
                            warn!(prefix = %prefix, reason = %reason, "Directory watch canceled, resynchronizing");
                            resync = true;
                            break;
                        }
                        Some(Err(e)) => {
                            error!(prefix = %prefix, error = %e, "Failed to watch services, batch discarded");
                        }
                        None => {
                            warn!(prefix = %prefix, "Directory watch stream ended, reconnecting");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                error!(prefix = %prefix, error = %e, "Failed to open directory watch");
            }
        }

        if sleep_or_cancelled(&cancel, options.reconnect_delay).await {
            break;
        }
    }

    info!(prefix = %prefix, "Directory watch stopped");
}
