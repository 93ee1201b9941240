//! Keyed wake-ups shared by every process that talks to the same store.
//!
//! A signal is a latch persisted in the store: `set` raises it and the first
//! waiter that observes it lowers it again. Waiters in the same process are
//! woken immediately; waiters elsewhere notice the latch on their next poll.
//! Wake-ups are at-least-once and may be spurious, so callers always re-check
//! the condition they were waiting for.
//!
//! A latch is a single flag per key: several `set`s before anyone waits
//! collapse into one. Waiters that lose the race for the latch still return
//! [`WaitOutcome::Woken`], and callers that must not miss a local `set` pass
//! the [`NotificationChannel::generation`] they observed before checking
//! their condition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep_until, Instant};

use crate::error::StoreError;
use crate::infrastructure::CoordinationStore;

/// Why a wait returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// One of the awaited keys was signaled
    Signaled(String),
    /// A local `set` happened, possibly for another key or with the latch
    /// already taken by another waiter
    Woken,
    TimedOut,
    Cancelled,
}

/// Channel key used by lock releases for `resource`.
pub fn lock_key(resource: &str) -> String {
    format!("lock:{resource}")
}

/// Channel key used by enqueues on `queue`.
pub fn queue_key(queue: &str) -> String {
    format!("queue:{queue}")
}

pub struct NotificationChannel {
    store: Arc<dyn CoordinationStore>,
    poll_interval: Duration,
    local: Notify,
    generation: AtomicU64,
}

impl NotificationChannel {
    pub fn new(store: Arc<dyn CoordinationStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
            local: Notify::new(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Count of local `set` calls so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Raise the latch for `key` and wake local waiters.
    pub fn set(&self, key: &str) -> Result<(), StoreError> {
        self.store.set_signal(key)?;
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.local.notify_waiters();
        Ok(())
    }

    /// Wait for `key` to be signaled, for at most `timeout`.
    pub async fn wait(&self, key: &str, timeout: Duration) -> Result<WaitOutcome, StoreError> {
        let keys = [key.to_string()];
        self.wait_inner(&keys, None, Some(Instant::now() + timeout), None)
            .await
    }

    /// Wait until any of `keys` is signaled or `cancel` flips to `true`.
    ///
    /// A cancel channel whose sender is gone never fires.
    pub async fn wait_any(
        &self,
        keys: &[String],
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<WaitOutcome, StoreError> {
        self.wait_inner(keys, None, None, Some(cancel)).await
    }

    /// Like [`NotificationChannel::wait_any`], but gives up after `timeout`.
    pub async fn wait_any_timeout(
        &self,
        keys: &[String],
        timeout: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<WaitOutcome, StoreError> {
        self.wait_inner(keys, None, Some(Instant::now() + timeout), Some(cancel))
            .await
    }

    /// Like [`NotificationChannel::wait_any_timeout`], but returns
    /// [`WaitOutcome::Woken`] at once if any local `set` happened after
    /// `generation` was read.
    pub async fn wait_any_since(
        &self,
        keys: &[String],
        generation: u64,
        timeout: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<WaitOutcome, StoreError> {
        self.wait_inner(
            keys,
            Some(generation),
            Some(Instant::now() + timeout),
            Some(cancel),
        )
        .await
    }

    async fn wait_inner(
        &self,
        keys: &[String],
        since: Option<u64>,
        deadline: Option<Instant>,
        mut cancel: Option<&mut watch::Receiver<bool>>,
    ) -> Result<WaitOutcome, StoreError> {
        loop {
            // Register interest before reading the latch so a concurrent
            // `set` cannot slip between the read and the sleep.
            let notified = self.local.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.as_deref().is_some_and(|rx| *rx.borrow()) {
                return Ok(WaitOutcome::Cancelled);
            }
            if let Some(key) = self.store.take_signal(keys)? {
                return Ok(WaitOutcome::Signaled(key));
            }
            if since.is_some_and(|seen| seen != self.generation()) {
                return Ok(WaitOutcome::Woken);
            }

            let now = Instant::now();
            let mut wake_at = now + self.poll_interval;
            if let Some(deadline) = deadline {
                if now >= deadline {
                    return Ok(WaitOutcome::TimedOut);
                }
                wake_at = wake_at.min(deadline);
            }

            tokio::select! {
                _ = &mut notified => {
                    return Ok(match self.store.take_signal(keys)? {
                        Some(key) => WaitOutcome::Signaled(key),
                        None => WaitOutcome::Woken,
                    });
                }
                _ = sleep_until(wake_at) => {}
                _ = cancelled(cancel.as_deref_mut()) => {
                    return Ok(WaitOutcome::Cancelled);
                }
            }
        }
    }
}

async fn cancelled(cancel: Option<&mut watch::Receiver<bool>>) {
    if let Some(rx) = cancel {
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
    std::future::pending::<()>().await
}
