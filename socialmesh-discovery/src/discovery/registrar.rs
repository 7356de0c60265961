//! Lease-backed service registration
//!
//! An instance announces itself by attaching its directory key to a lease.
//! The lease is renewed in the background; if the process dies or is
//! partitioned away, renewal stops and the coordination service deletes the
//! key once the TTL runs out.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::coordinator::{Coordinator, LeaseId, LeaseKeepAlive};
use crate::error::{Error, Result};

/// Lease TTL used when the caller does not ask for one
pub const DEFAULT_LEASE_TTL_SECS: i64 = 3;

/// Lower bound for the renewal interval
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(500);

/// Renew three times per TTL so one lost round trip does not expire the lease
fn renew_interval(ttl_secs: i64) -> Duration {
    let ttl_ms = u64::try_from(ttl_secs).unwrap_or(0).saturating_mul(1000);
    Duration::from_millis(ttl_ms / 3).max(MIN_RENEW_INTERVAL)
}

/// A granted lease and the task renewing it
struct ActiveLease {
    id: LeaseId,
    ttl_secs: i64,
    expired: Arc<AtomicBool>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ActiveLease {
    async fn acquire<C: Coordinator>(coordinator: &Arc<C>, ttl_secs: i64) -> Result<Self> {
        let id = coordinator.grant_lease(ttl_secs).await?;

        let keeper = match coordinator.keep_alive(id).await {
            Ok(keeper) => keeper,
            Err(e) => {
                if let Err(revoke_err) = coordinator.revoke_lease(id).await {
                    debug!(lease = %id, error = %revoke_err, "Failed to revoke unused lease");
                }
                return Err(e);
            }
        };

        let expired = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_renewal(
            Arc::clone(coordinator),
            keeper,
            id,
            ttl_secs,
            expired.clone(),
            cancel.clone(),
        ));

        debug!(lease = %id, ttl = ttl_secs, "Lease acquired, renewal started");

        Ok(Self {
            id,
            ttl_secs,
            expired,
            cancel,
            handle,
        })
    }

    fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    /// Cancel renewal and wait for the task to finish
    async fn stop(&mut self) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.handle).await {
            if e.is_panic() {
                error!(lease = %self.id, error = %e, "Lease renewal task panicked");
            }
        }
    }
}

impl Drop for ActiveLease {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

fn ttl_duration(ttl_secs: i64) -> Duration {
    Duration::from_secs(u64::try_from(ttl_secs).unwrap_or(0))
}

/// Renew `lease` until cancelled or it can no longer be kept alive
///
/// A failed renewal reopens the keep-alive stream. Once the last granted TTL
/// has run out without a successful renewal the lease is marked expired.
async fn run_renewal<C: Coordinator>(
    coordinator: Arc<C>,
    mut keeper: Box<dyn LeaseKeepAlive>,
    lease: LeaseId,
    ttl_secs: i64,
    expired: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut deadline = Instant::now() + ttl_duration(ttl_secs);
    let mut timer = tokio::time::interval(renew_interval(ttl_secs));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = timer.tick() => {}
        }

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = keeper.renew() => result,
        };

        let error = match result {
            Ok(ttl) => {
                deadline = Instant::now() + ttl_duration(ttl);
                trace!(lease = %lease, ttl, "Lease renewed");
                continue;
            }
            Err(e) => e,
        };

        if matches!(error, Error::LeaseExpired(_)) || Instant::now() >= deadline {
            error!(lease = %lease, error = %error, "Lease expired, registered keys are gone until the next registration");
            expired.store(true, Ordering::Release);
            return;
        }
        warn!(lease = %lease, error = %error, "Lease renewal failed, reopening keep-alive");

        let reopened = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            reopened = coordinator.keep_alive(lease) => reopened,
        };
        match reopened {
            Ok(fresh) => {
                keeper = fresh;
                debug!(lease = %lease, "Keep-alive reopened");
            }
            Err(Error::LeaseExpired(_)) => {
                error!(lease = %lease, "Lease expired, registered keys are gone until the next registration");
                expired.store(true, Ordering::Release);
                return;
            }
            Err(e) => warn!(lease = %lease, error = %e, "Failed to reopen keep-alive, retrying"),
        }
    }

    debug!(lease = %lease, "Lease renewal cancelled");
}

struct RegistrarState {
    lease: ActiveLease,
    /// Every key registered so far, re-attached when the lease is replaced
    keys: BTreeMap<String, String>,
}

/// Registers directory keys under one automatically renewed lease
///
/// Lifecycle: `new` acquires the lease, `register*` attach keys to it,
/// `shutdown` cancels renewal and revokes the lease. Dropping the registrar
/// without `shutdown` stops renewal and leaves the keys to expire with the
/// TTL.
pub struct LeaseRegistrar<C: Coordinator> {
    coordinator: Arc<C>,
    default_ttl_secs: i64,
    state: Mutex<RegistrarState>,
}

impl<C: Coordinator> LeaseRegistrar<C> {
    /// Acquire a lease with `default_ttl_secs` and start renewing it
    pub async fn new(coordinator: Arc<C>, default_ttl_secs: i64) -> Result<Self> {
        let lease = ActiveLease::acquire(&coordinator, default_ttl_secs).await?;
        info!(lease = %lease.id, ttl = default_ttl_secs, "Service registrar ready");

        Ok(Self {
            coordinator,
            default_ttl_secs,
            state: Mutex::new(RegistrarState {
                lease,
                keys: BTreeMap::new(),
            }),
        })
    }

    /// Register `key -> value` under a lease with the default TTL
    pub async fn register(&self, key: &str, value: &str) -> bool {
        self.register_with_ttl(key, value, self.default_ttl_secs).await
    }

    /// Register `key -> value` under a lease with `ttl_secs`
    ///
    /// Switching TTL replaces the lease; keys registered earlier move to the
    /// new lease. Errors are logged and reported as `false`.
    pub async fn register_with_ttl(&self, key: &str, value: &str, ttl_secs: i64) -> bool {
        match self.try_register(key, value, ttl_secs).await {
            Ok(lease) => {
                info!(key = %key, value = %value, lease = %lease, "Service registered");
                true
            }
            Err(e) => {
                error!(key = %key, value = %value, error = %e, "Failed to register service");
                false
            }
        }
    }

    async fn try_register(&self, key: &str, value: &str, ttl_secs: i64) -> Result<LeaseId> {
        let mut state = self.state.lock().await;

        if state.lease.ttl_secs != ttl_secs || state.lease.is_expired() {
            self.replace_lease(&mut state, ttl_secs).await?;
        }

        let lease = state.lease.id;
        self.coordinator.put(key, value, Some(lease)).await?;
        state.keys.insert(key.to_string(), value.to_string());
        Ok(lease)
    }

    async fn replace_lease(&self, state: &mut RegistrarState, ttl_secs: i64) -> Result<()> {
        let mut replacement = ActiveLease::acquire(&self.coordinator, ttl_secs).await?;

        for (key, value) in &state.keys {
            if let Err(e) = self.coordinator.put(key, value, Some(replacement.id)).await {
                replacement.stop().await;
                if let Err(revoke_err) = self.coordinator.revoke_lease(replacement.id).await {
                    debug!(lease = %replacement.id, error = %revoke_err, "Failed to revoke unused lease");
                }
                return Err(e);
            }
        }

        let mut old = std::mem::replace(&mut state.lease, replacement);
        old.stop().await;
        if !old.is_expired() {
            if let Err(e) = self.coordinator.revoke_lease(old.id).await {
                warn!(lease = %old.id, error = %e, "Failed to revoke replaced lease");
            }
        }

        info!(
            old_lease = %old.id,
            new_lease = %state.lease.id,
            ttl = ttl_secs,
            keys = state.keys.len(),
            "Lease replaced"
        );
        Ok(())
    }

    /// Current lease handle
    pub async fn lease_id(&self) -> LeaseId {
        self.state.lock().await.lease.id
    }

    /// TTL of the current lease
    pub async fn ttl(&self) -> i64 {
        self.state.lock().await.lease.ttl_secs
    }

    /// Whether renewal has observed the lease expiring
    pub async fn is_expired(&self) -> bool {
        self.state.lock().await.lease.is_expired()
    }

    pub async fn registered_keys(&self) -> Vec<String> {
        self.state.lock().await.keys.keys().cloned().collect()
    }

    /// Stop renewal, wait for it, then revoke the lease
    ///
    /// No renewal request is issued once this returns.
    pub async fn shutdown(self) {
        let mut state = self.state.into_inner();
        state.lease.stop().await;

        if !state.lease.is_expired() {
            match self.coordinator.revoke_lease(state.lease.id).await {
                Ok(()) => info!(lease = %state.lease.id, keys = state.keys.len(), "Lease revoked, services unregistered"),
                Err(e) => warn!(lease = %state.lease.id, error = %e, "Failed to revoke lease on shutdown"),
            }
        }
    }
}
