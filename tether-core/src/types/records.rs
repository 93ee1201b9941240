use serde::{Deserialize, Serialize};

use super::SchemaVersion;

/// A held lease on a named resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Unique resource key
    pub resource: String,
    /// When the lease lapses unless renewed (epoch ms)
    pub expire_at: u64,
}

impl LockRecord {
    pub fn new(resource: impl Into<String>, expire_at: u64) -> Self {
        Self {
            resource: resource.into(),
            expire_at,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expire_at < now
    }
}

/// One unit of work on a named queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub queue: String,
    /// Reference to the job payload, owned by the caller
    pub job_id: String,
    /// When the entry was last handed to a consumer (epoch ms)
    pub fetched_at: Option<u64>,
}

impl QueueEntry {
    /// A fresh, never-fetched entry with a generated id.
    pub fn new(queue: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            id: nanoid::nanoid!(),
            queue: queue.into(),
            job_id: job_id.into(),
            fetched_at: None,
        }
    }
}

/// The store's current layout generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersionRecord {
    pub version: SchemaVersion,
}

/// Per-queue counts for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue: String,
    /// Entries waiting for their first delivery
    pub enqueued: usize,
    /// Entries handed out and not yet acknowledged
    pub fetched: usize,
}
