use crate::error::StoreError;
use crate::types::{FetchCondition, LockRecord, QueueEntry, QueueStats, SchemaVersion, SchemaVersionRecord};

/// Defines the contract for coordination storage backends.
///
/// Each method must be atomic with respect to the document it touches; the
/// lock and queue protocols are built entirely on that guarantee. Backends
/// are shared between tasks, so every method takes `&self`.
pub trait CoordinationStore: Send + Sync {
    // ─── Locks ──────────────────────────────────────────────────────────────

    /// Insert a lock record for `resource` unless one exists.
    ///
    /// Returns the record that was already present (left untouched), or
    /// `None` when the insert happened and the caller now owns the lease.
    fn insert_lock_if_absent(
        &self,
        resource: &str,
        expire_at: u64,
    ) -> Result<Option<LockRecord>, StoreError>;

    /// Move the expiry of an existing lock record. Returns the updated record,
    /// or `None` if no record exists for `resource`.
    fn extend_lock(&self, resource: &str, expire_at: u64)
    -> Result<Option<LockRecord>, StoreError>;

    /// Delete the lock record for `resource`. Returns whether one existed.
    fn delete_lock(&self, resource: &str) -> Result<bool, StoreError>;

    /// Delete the record for `resource` if its expiry is before `now`.
    fn delete_expired_locks(&self, resource: &str, now: u64) -> Result<usize, StoreError>;

    fn find_lock(&self, resource: &str) -> Result<Option<LockRecord>, StoreError>;

    fn list_locks(&self) -> Result<Vec<LockRecord>, StoreError>;

    // ─── Queue ──────────────────────────────────────────────────────────────

    fn insert_queue_entry(&self, entry: &QueueEntry) -> Result<(), StoreError>;

    /// Claim the oldest entry of `queue` matching `condition` by setting its
    /// `fetched_at` to `now`. Returns the entry as updated.
    fn fetch_queue_entry(
        &self,
        queue: &str,
        condition: FetchCondition,
        now: u64,
    ) -> Result<Option<QueueEntry>, StoreError>;

    /// Remove an entry (acknowledge). Returns whether it existed.
    fn delete_queue_entry(&self, id: &str) -> Result<bool, StoreError>;

    /// Make a fetched entry immediately visible again. Returns whether it existed.
    fn requeue_entry(&self, id: &str) -> Result<bool, StoreError>;

    fn queue_stats(&self, queue: &str) -> Result<QueueStats, StoreError>;

    // ─── Schema ─────────────────────────────────────────────────────────────

    fn schema_version(&self) -> Result<Option<SchemaVersionRecord>, StoreError>;

    fn set_schema_version(&self, version: SchemaVersion) -> Result<(), StoreError>;

    // ─── Signals ────────────────────────────────────────────────────────────

    /// Raise the wake-up latch for `key`. Setting an already raised latch is a no-op.
    fn set_signal(&self, key: &str) -> Result<(), StoreError>;

    /// Lower and return the first raised latch among `keys`, if any.
    fn take_signal(&self, keys: &[String]) -> Result<Option<String>, StoreError>;

    // ─── Maintenance ────────────────────────────────────────────────────────

    /// Remove every queue entry, signal and the schema record. Lock records
    /// survive: the caller is expected to be holding one.
    fn drop_data(&self) -> Result<(), StoreError>;

    /// Create whatever collections or tables the backend needs. Idempotent.
    fn ensure_layout(&self) -> Result<(), StoreError>;
}
