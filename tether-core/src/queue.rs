//! Persistent job queue with invisibility-timeout redelivery.
//!
//! Dequeue alternates between two fetch conditions: entries never delivered,
//! and entries delivered longer ago than the invisibility timeout (their
//! consumer is presumed dead). When neither yields anything on any requested
//! queue, the caller blocks on the notification channel until an enqueue
//! signals one of the queues or the caller cancels. Blocked callers also
//! re-fetch once per poll interval, since a latch raised by several
//! enqueues in other processes wakes only one of their consumers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{QueueError, StoreError};
use crate::infrastructure::CoordinationStore;
use crate::options::CoordinationOptions;
use crate::signal::{queue_key, NotificationChannel, WaitOutcome};
use crate::types::{duration_ms, now_ms, FetchCondition, QueueEntry, QueueStats};

/// Number of fetch conditions dequeue cycles through.
const FETCH_CONDITIONS: usize = 2;

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn CoordinationStore>,
    signal: Arc<NotificationChannel>,
    invisibility_timeout: Duration,
}

impl JobQueue {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        signal: Arc<NotificationChannel>,
        options: &CoordinationOptions,
    ) -> Self {
        Self {
            store,
            signal,
            invisibility_timeout: options.invisibility_timeout,
        }
    }

    /// Add `job_id` to `queue` and wake consumers blocked on it.
    pub fn enqueue(&self, queue: &str, job_id: &str) -> Result<QueueEntry, QueueError> {
        if queue.is_empty() {
            return Err(QueueError::InvalidArgument(
                "the queue name cannot be empty".to_string(),
            ));
        }
        let entry = QueueEntry::new(queue, job_id);
        self.store.insert_queue_entry(&entry)?;
        if let Err(e) = self.signal.set(&queue_key(queue)) {
            tracing::warn!(queue = %queue, error = %e, "unable to signal enqueue");
        }
        tracing::debug!(queue = %queue, job_id = %job_id, id = %entry.id, "job enqueued");
        Ok(entry)
    }

    /// Take the next available job from the first of `queues` that has one.
    ///
    /// Blocks until a job is available or `cancel` becomes `true`. Queues are
    /// tried in the given order. A blocked call re-reads its queues at least
    /// once per signal poll interval or invisibility timeout, whichever is
    /// shorter, so abandoned and missed entries are found without a signal.
    pub async fn dequeue(
        &self,
        queues: &[&str],
        mut cancel: watch::Receiver<bool>,
    ) -> Result<FetchedJob, QueueError> {
        if queues.is_empty() {
            return Err(QueueError::InvalidArgument(
                "the queue list must be non-empty".to_string(),
            ));
        }
        if queues.iter().any(|q| q.is_empty()) {
            return Err(QueueError::InvalidArgument(
                "queue names cannot be empty".to_string(),
            ));
        }

        let keys: Vec<String> = queues.iter().map(|q| queue_key(q)).collect();
        let recheck = self.signal.poll_interval().min(self.invisibility_timeout);
        let mut condition_index = 0;
        let mut generation = self.signal.generation();

        loop {
            if *cancel.borrow() {
                return Err(QueueError::Cancelled);
            }

            let condition = self.fetch_condition(condition_index);
            let now = now_ms();
            for queue in queues {
                if let Some(entry) = self.store.fetch_queue_entry(queue, condition, now)? {
                    tracing::debug!(
                        queue = %entry.queue,
                        job_id = %entry.job_id,
                        id = %entry.id,
                        redelivery = matches!(condition, FetchCondition::FetchedBefore { .. }),
                        "job fetched"
                    );
                    return Ok(FetchedJob::new(
                        Arc::clone(&self.store),
                        Arc::clone(&self.signal),
                        entry,
                    ));
                }
            }

            if condition_index == FETCH_CONDITIONS - 1 {
                // Nothing fresh and nothing abandoned anywhere: sleep until
                // some producer signals one of our queues. Abandoned entries
                // and latches taken by other consumers send no wake-up, so
                // look again after `recheck` regardless.
                let outcome = self
                    .signal
                    .wait_any_since(&keys, generation, recheck, &mut cancel)
                    .await?;
                if outcome == WaitOutcome::Cancelled {
                    return Err(QueueError::Cancelled);
                }
                // Any local enqueue after this point cuts the next wait short
                generation = self.signal.generation();
            }

            condition_index = (condition_index + 1) % FETCH_CONDITIONS;
        }
    }

    pub fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        Ok(self.store.queue_stats(queue)?)
    }

    fn fetch_condition(&self, index: usize) -> FetchCondition {
        match index {
            0 => FetchCondition::Unfetched,
            _ => FetchCondition::FetchedBefore {
                cutoff: now_ms().saturating_sub(duration_ms(self.invisibility_timeout)),
            },
        }
    }
}

// ─── Fetched Job ────────────────────────────────────────────────────────────

/// A job handed to this consumer.
///
/// Finish with [`FetchedJob::remove_from_queue`] once processed, or
/// [`FetchedJob::requeue`] to hand it back. Dropping the handle without
/// either requeues it.
#[must_use = "a fetched job is requeued as soon as the handle is dropped"]
pub struct FetchedJob {
    store: Arc<dyn CoordinationStore>,
    signal: Arc<NotificationChannel>,
    entry: QueueEntry,
    disposed: bool,
}

impl FetchedJob {
    fn new(
        store: Arc<dyn CoordinationStore>,
        signal: Arc<NotificationChannel>,
        entry: QueueEntry,
    ) -> Self {
        Self {
            store,
            signal,
            entry,
            disposed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.entry.id
    }

    pub fn job_id(&self) -> &str {
        &self.entry.job_id
    }

    pub fn queue(&self) -> &str {
        &self.entry.queue
    }

    pub fn fetched_at(&self) -> Option<u64> {
        self.entry.fetched_at
    }

    pub fn entry(&self) -> &QueueEntry {
        &self.entry
    }

    /// Acknowledge the job: delete it from the queue.
    pub fn remove_from_queue(mut self) -> Result<(), QueueError> {
        self.disposed = true;
        self.store.delete_queue_entry(&self.entry.id)?;
        tracing::debug!(queue = %self.entry.queue, id = %self.entry.id, "job removed from queue");
        Ok(())
    }

    /// Put the job back so any consumer can fetch it immediately.
    pub fn requeue(mut self) -> Result<(), QueueError> {
        self.disposed = true;
        Ok(self.requeue_entry()?)
    }

    fn requeue_entry(&self) -> Result<(), StoreError> {
        self.store.requeue_entry(&self.entry.id)?;
        if let Err(e) = self.signal.set(&queue_key(&self.entry.queue)) {
            tracing::warn!(queue = %self.entry.queue, error = %e, "unable to signal requeue");
        }
        tracing::debug!(queue = %self.entry.queue, id = %self.entry.id, "job requeued");
        Ok(())
    }
}

impl Drop for FetchedJob {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        if let Err(e) = self.requeue_entry() {
            tracing::error!(
                queue = %self.entry.queue,
                id = %self.entry.id,
                error = %e,
                "failed to requeue abandoned job"
            );
        }
    }
}

impl std::fmt::Debug for FetchedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedJob")
            .field("entry", &self.entry)
            .field("disposed", &self.disposed)
            .finish()
    }
}
