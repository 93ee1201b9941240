use crate::error::StoreError;
use crate::infrastructure::CoordinationStore;
use crate::types::{FetchCondition, LockRecord, QueueEntry, QueueStats, SchemaVersion, SchemaVersionRecord};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Collections {
    // Map of resource -> lock record
    locks: HashMap<String, LockRecord>,
    // Insertion order doubles as FIFO order
    queue: Vec<QueueEntry>,
    schema: Option<SchemaVersionRecord>,
    signals: HashSet<String>,
}

/// Process-local store. One mutex covers every collection, so each trait
/// method is a single atomic step.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Collections>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn collections(&self) -> MutexGuard<'_, Collections> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CoordinationStore for InMemoryStore {
    fn insert_lock_if_absent(
        &self,
        resource: &str,
        expire_at: u64,
    ) -> Result<Option<LockRecord>, StoreError> {
        let mut c = self.collections();
        if let Some(existing) = c.locks.get(resource) {
            return Ok(Some(existing.clone()));
        }
        c.locks
            .insert(resource.to_string(), LockRecord::new(resource, expire_at));
        Ok(None)
    }

    fn extend_lock(
        &self,
        resource: &str,
        expire_at: u64,
    ) -> Result<Option<LockRecord>, StoreError> {
        let mut c = self.collections();
        Ok(c.locks.get_mut(resource).map(|record| {
            record.expire_at = expire_at;
            record.clone()
        }))
    }

    fn delete_lock(&self, resource: &str) -> Result<bool, StoreError> {
        Ok(self.collections().locks.remove(resource).is_some())
    }

    fn delete_expired_locks(&self, resource: &str, now: u64) -> Result<usize, StoreError> {
        let mut c = self.collections();
        match c.locks.get(resource) {
            Some(record) if record.is_expired(now) => {
                c.locks.remove(resource);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    fn find_lock(&self, resource: &str) -> Result<Option<LockRecord>, StoreError> {
        Ok(self.collections().locks.get(resource).cloned())
    }

    fn list_locks(&self) -> Result<Vec<LockRecord>, StoreError> {
        let mut locks: Vec<LockRecord> = self.collections().locks.values().cloned().collect();
        locks.sort_by(|a, b| a.resource.cmp(&b.resource));
        Ok(locks)
    }

    fn insert_queue_entry(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        let mut c = self.collections();
        if c.queue.iter().any(|e| e.id == entry.id) {
            return Err(StoreError::Backend(format!(
                "duplicate queue entry id '{}'",
                entry.id
            )));
        }
        c.queue.push(entry.clone());
        Ok(())
    }

    fn fetch_queue_entry(
        &self,
        queue: &str,
        condition: FetchCondition,
        now: u64,
    ) -> Result<Option<QueueEntry>, StoreError> {
        let mut c = self.collections();
        Ok(c.queue
            .iter_mut()
            .find(|e| e.queue == queue && condition.matches(e.fetched_at))
            .map(|entry| {
                entry.fetched_at = Some(now);
                entry.clone()
            }))
    }

    fn delete_queue_entry(&self, id: &str) -> Result<bool, StoreError> {
        let mut c = self.collections();
        let before = c.queue.len();
        c.queue.retain(|e| e.id != id);
        Ok(c.queue.len() != before)
    }

    fn requeue_entry(&self, id: &str) -> Result<bool, StoreError> {
        let mut c = self.collections();
        match c.queue.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.fetched_at = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn queue_stats(&self, queue: &str) -> Result<QueueStats, StoreError> {
        let c = self.collections();
        let mut stats = QueueStats {
            queue: queue.to_string(),
            ..QueueStats::default()
        };
        for entry in c.queue.iter().filter(|e| e.queue == queue) {
            match entry.fetched_at {
                None => stats.enqueued += 1,
                Some(_) => stats.fetched += 1,
            }
        }
        Ok(stats)
    }

    fn schema_version(&self) -> Result<Option<SchemaVersionRecord>, StoreError> {
        Ok(self.collections().schema)
    }

    fn set_schema_version(&self, version: SchemaVersion) -> Result<(), StoreError> {
        self.collections().schema = Some(SchemaVersionRecord { version });
        Ok(())
    }

    fn set_signal(&self, key: &str) -> Result<(), StoreError> {
        self.collections().signals.insert(key.to_string());
        Ok(())
    }

    fn take_signal(&self, keys: &[String]) -> Result<Option<String>, StoreError> {
        let mut c = self.collections();
        Ok(keys.iter().find(|k| c.signals.remove(k.as_str())).cloned())
    }

    fn drop_data(&self) -> Result<(), StoreError> {
        let mut c = self.collections();
        c.queue.clear();
        c.signals.clear();
        c.schema = None;
        Ok(())
    }

    fn ensure_layout(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
