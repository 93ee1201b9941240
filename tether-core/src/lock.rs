//! Distributed mutual exclusion over a shared store.
//!
//! A lock is a lease: a record keyed by resource name with an expiry. It is
//! taken with an atomic insert-if-absent, kept alive by a heartbeat task,
//! and removed on release. Leases left behind by crashed holders are cleaned
//! up once they expire.
//!
//! Reentrancy is scoped to a [`LockContext`], an explicit handle that a
//! logical call chain passes along. Acquiring a resource the context already
//! holds only bumps a counter; the lease is released when the outermost
//! guard goes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{LockError, StoreError};
use crate::infrastructure::CoordinationStore;
use crate::options::CoordinationOptions;
use crate::signal::{lock_key, NotificationChannel};
use crate::types::{duration_ms, now_ms};

/// Longest timeout `acquire` accepts.
pub const MAX_LOCK_TIMEOUT: Duration = Duration::from_secs(i32::MAX as u64);

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Acquires leases on named resources.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn CoordinationStore>,
    signal: Arc<NotificationChannel>,
    lifetime: Duration,
    heartbeat_interval: Duration,
}

impl DistributedLock {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        signal: Arc<NotificationChannel>,
        options: &CoordinationOptions,
    ) -> Self {
        Self {
            store,
            signal,
            lifetime: options.lock_lifetime,
            heartbeat_interval: options.heartbeat_interval(),
        }
    }

    /// Take the lock on `resource` within `timeout`.
    ///
    /// If `context` already holds `resource` this returns immediately without
    /// touching the store. Otherwise it waits for the current holder to
    /// release (or its lease to expire) for at most `timeout`.
    pub async fn acquire(
        &self,
        context: &LockContext,
        resource: &str,
        timeout: Duration,
    ) -> Result<LockGuard, LockError> {
        if resource.is_empty() {
            return Err(LockError::InvalidArgument(
                "the resource cannot be empty".to_string(),
            ));
        }
        if timeout > MAX_LOCK_TIMEOUT {
            return Err(LockError::InvalidArgument(format!(
                "the timeout specified is too large, supply a timeout of at most {} seconds",
                MAX_LOCK_TIMEOUT.as_secs()
            )));
        }

        if let Some(lease) = context.reenter(resource) {
            tracing::trace!(resource = %resource, "lock re-entered");
            return Ok(LockGuard::new(context.clone(), lease));
        }

        self.cleanup(resource);
        self.acquire_lease(resource, timeout).await?;

        let lease = Arc::new(HeldLease {
            resource: resource.to_string(),
            store: Arc::clone(&self.store),
            signal: Arc::clone(&self.signal),
            lifetime: self.lifetime,
            heartbeat: Mutex::new(Heartbeat {
                active: true,
                task: None,
            }),
        });
        context.enter(resource, Arc::clone(&lease));
        lease.start_heartbeat(self.heartbeat_interval);

        tracing::debug!(resource = %resource, "lock acquired");
        Ok(LockGuard::new(context.clone(), lease))
    }

    async fn acquire_lease(&self, resource: &str, timeout: Duration) -> Result<(), LockError> {
        let deadline = Instant::now() + timeout;
        let key = lock_key(resource);
        let acquisition = |source: StoreError| LockError::Acquisition {
            resource: resource.to_string(),
            source,
        };

        loop {
            let expire_at = now_ms().saturating_add(duration_ms(self.lifetime));
            let existing = self
                .store
                .insert_lock_if_absent(resource, expire_at)
                .map_err(acquisition)?;
            let Some(existing) = existing else {
                return Ok(());
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    resource: resource.to_string(),
                    timeout,
                });
            }
            let mut wait = deadline - now;

            let now_epoch = now_ms();
            if existing.is_expired(now_epoch) {
                // The holder stopped renewing. Clear the lease and retry at
                // once; if cleanup itself fails, back off for one heartbeat.
                if self.cleanup(resource).is_some() {
                    continue;
                }
                wait = wait.min(self.heartbeat_interval);
            } else {
                wait = wait.min(Duration::from_millis(existing.expire_at - now_epoch + 1));
            }

            tracing::trace!(resource = %resource, ?wait, "lock busy, waiting for release");
            self.signal.wait(&key, wait).await.map_err(acquisition)?;
        }
    }

    /// Delete the lease on `resource` if it has expired. Returns the number
    /// of records removed, or `None` if the store failed.
    fn cleanup(&self, resource: &str) -> Option<usize> {
        cleanup_expired(self.store.as_ref(), resource)
    }
}

fn cleanup_expired(store: &dyn CoordinationStore, resource: &str) -> Option<usize> {
    match store.delete_expired_locks(resource, now_ms()) {
        Ok(removed) => {
            if removed > 0 {
                tracing::info!(resource = %resource, "removed expired lock");
            }
            Some(removed)
        }
        Err(e) => {
            tracing::error!(resource = %resource, error = %e, "unable to clean up locks");
            None
        }
    }
}

// ─── Held Lease ─────────────────────────────────────────────────────────────

struct Heartbeat {
    /// Cleared on release; the heartbeat task checks it before every renewal
    active: bool,
    task: Option<JoinHandle<()>>,
}

/// A lease this process owns in the store.
struct HeldLease {
    resource: String,
    store: Arc<dyn CoordinationStore>,
    signal: Arc<NotificationChannel>,
    lifetime: Duration,
    heartbeat: Mutex<Heartbeat>,
}

impl HeldLease {
    fn start_heartbeat(self: &Arc<Self>, interval: Duration) {
        let lease = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !lease.renew() {
                    break;
                }
            }
        });
        lock_or_recover(&self.heartbeat).task = Some(task);
    }

    /// Push the expiry forward. Returns false once the lease was released.
    fn renew(&self) -> bool {
        let heartbeat = lock_or_recover(&self.heartbeat);
        if !heartbeat.active {
            return false;
        }
        let expire_at = now_ms().saturating_add(duration_ms(self.lifetime));
        match self.store.extend_lock(&self.resource, expire_at) {
            Ok(Some(_)) => {
                tracing::trace!(resource = %self.resource, expire_at, "lock heartbeat");
            }
            Ok(None) => {
                tracing::warn!(resource = %self.resource, "lock record missing during heartbeat");
            }
            Err(e) => {
                tracing::error!(
                    resource = %self.resource,
                    error = %e,
                    "unable to update heartbeat on the lock"
                );
            }
        }
        true
    }

    /// Stop the heartbeat, delete the record and wake waiters.
    fn release(&self) -> Result<(), StoreError> {
        let mut heartbeat = lock_or_recover(&self.heartbeat);
        heartbeat.active = false;
        if let Some(task) = heartbeat.task.take() {
            task.abort();
        }

        self.store.delete_lock(&self.resource)?;
        if let Err(e) = self.signal.set(&lock_key(&self.resource)) {
            tracing::warn!(resource = %self.resource, error = %e, "unable to signal lock release");
        }
        cleanup_expired(self.store.as_ref(), &self.resource);

        tracing::debug!(resource = %self.resource, "lock released");
        Ok(())
    }
}

// ─── Lock Context ───────────────────────────────────────────────────────────

struct Held {
    count: usize,
    lease: Arc<HeldLease>,
}

/// Reentrancy scope for one logical flow.
///
/// Clones share the same scope. Do not share a context between unrelated
/// concurrent flows: anything holding the context can re-enter its locks.
#[derive(Clone, Default)]
pub struct LockContext {
    held: Arc<Mutex<HashMap<String, Held>>>,
}

impl LockContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nesting depth of `resource` in this context (0 when not held).
    pub fn depth(&self, resource: &str) -> usize {
        lock_or_recover(&self.held)
            .get(resource)
            .map_or(0, |h| h.count)
    }

    fn reenter(&self, resource: &str) -> Option<Arc<HeldLease>> {
        let mut held = lock_or_recover(&self.held);
        held.get_mut(resource).map(|h| {
            h.count += 1;
            Arc::clone(&h.lease)
        })
    }

    fn enter(&self, resource: &str, lease: Arc<HeldLease>) {
        lock_or_recover(&self.held).insert(resource.to_string(), Held { count: 1, lease });
    }

    /// Drop one level for `resource`. Returns true when that was the last one.
    fn leave(&self, resource: &str) -> bool {
        let mut held = lock_or_recover(&self.held);
        match held.get_mut(resource) {
            Some(h) if h.count > 1 => {
                h.count -= 1;
                false
            }
            Some(_) => {
                held.remove(resource);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for LockContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let held = lock_or_recover(&self.held);
        f.debug_map()
            .entries(held.iter().map(|(resource, h)| (resource, h.count)))
            .finish()
    }
}

// ─── Guard ──────────────────────────────────────────────────────────────────

/// Proof of holding a lock. Released explicitly with [`LockGuard::release`]
/// or, failing that, on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    context: LockContext,
    lease: Arc<HeldLease>,
    released: bool,
}

impl LockGuard {
    fn new(context: LockContext, lease: Arc<HeldLease>) -> Self {
        Self {
            context,
            lease,
            released: false,
        }
    }

    pub fn resource(&self) -> &str {
        &self.lease.resource
    }

    /// Release this level of the lock. Only the outermost guard of a context
    /// touches the store. Calling this twice is a no-op.
    ///
    /// The context forgets the lock even when deleting the record fails.
    pub fn release(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        if !self.context.leave(&self.lease.resource) {
            return Ok(());
        }
        self.lease.release().map_err(|source| LockError::Release {
            resource: self.lease.resource.clone(),
            source,
        })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::error!(error = %e, "failed to release lock on drop");
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource", &self.lease.resource)
            .field("released", &self.released)
            .finish()
    }
}
