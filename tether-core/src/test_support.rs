use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::client::TetherClient;
use crate::infrastructure_in_memory::InMemoryStore;
use crate::options::CoordinationOptions;

/// Options with timings short enough for tests.
pub fn fast_options() -> CoordinationOptions {
    CoordinationOptions::default()
        .with_lock_lifetime(Duration::from_millis(500))
        .with_invisibility_timeout(Duration::from_millis(300))
        .with_signal_poll_interval(Duration::from_millis(50))
}

pub fn client() -> TetherClient {
    client_with(fast_options())
}

pub fn client_with(options: CoordinationOptions) -> TetherClient {
    match TetherClient::new(Arc::new(InMemoryStore::new()), options) {
        Ok(client) => client,
        Err(e) => panic!("test options should be valid: {e}"),
    }
}

/// A cancel receiver that never fires.
pub fn never_cancel() -> watch::Receiver<bool> {
    watch::channel(false).1
}

/// Store wrapper whose lock writes can be made to fail on demand.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: InMemoryStore,
    pub fail_lock_inserts: std::sync::atomic::AtomicBool,
    pub fail_lock_deletes: std::sync::atomic::AtomicBool,
}

mod flaky {
    use std::sync::atomic::Ordering;

    use super::FlakyStore;
    use crate::error::StoreError;
    use crate::infrastructure::CoordinationStore;
    use crate::types::*;

    fn injected() -> StoreError {
        StoreError::Backend("injected failure".to_string())
    }

    impl CoordinationStore for FlakyStore {
        fn insert_lock_if_absent(
            &self,
            resource: &str,
            expire_at: u64,
        ) -> Result<Option<LockRecord>, StoreError> {
            if self.fail_lock_inserts.load(Ordering::SeqCst) {
                return Err(injected());
            }
            self.inner.insert_lock_if_absent(resource, expire_at)
        }

        fn extend_lock(
            &self,
            resource: &str,
            expire_at: u64,
        ) -> Result<Option<LockRecord>, StoreError> {
            self.inner.extend_lock(resource, expire_at)
        }

        fn delete_lock(&self, resource: &str) -> Result<bool, StoreError> {
            if self.fail_lock_deletes.load(Ordering::SeqCst) {
                return Err(injected());
            }
            self.inner.delete_lock(resource)
        }

        fn delete_expired_locks(&self, resource: &str, now: u64) -> Result<usize, StoreError> {
            if self.fail_lock_deletes.load(Ordering::SeqCst) {
                return Err(injected());
            }
            self.inner.delete_expired_locks(resource, now)
        }

        fn find_lock(&self, resource: &str) -> Result<Option<LockRecord>, StoreError> {
            self.inner.find_lock(resource)
        }

        fn list_locks(&self) -> Result<Vec<LockRecord>, StoreError> {
            self.inner.list_locks()
        }

        fn insert_queue_entry(&self, entry: &QueueEntry) -> Result<(), StoreError> {
            self.inner.insert_queue_entry(entry)
        }

        fn fetch_queue_entry(
            &self,
            queue: &str,
            condition: FetchCondition,
            now: u64,
        ) -> Result<Option<QueueEntry>, StoreError> {
            self.inner.fetch_queue_entry(queue, condition, now)
        }

        fn delete_queue_entry(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.delete_queue_entry(id)
        }

        fn requeue_entry(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.requeue_entry(id)
        }

        fn queue_stats(&self, queue: &str) -> Result<QueueStats, StoreError> {
            self.inner.queue_stats(queue)
        }

        fn schema_version(&self) -> Result<Option<SchemaVersionRecord>, StoreError> {
            self.inner.schema_version()
        }

        fn set_schema_version(&self, version: SchemaVersion) -> Result<(), StoreError> {
            self.inner.set_schema_version(version)
        }

        fn set_signal(&self, key: &str) -> Result<(), StoreError> {
            self.inner.set_signal(key)
        }

        fn take_signal(&self, keys: &[String]) -> Result<Option<String>, StoreError> {
            self.inner.take_signal(keys)
        }

        fn drop_data(&self) -> Result<(), StoreError> {
            self.inner.drop_data()
        }

        fn ensure_layout(&self) -> Result<(), StoreError> {
            self.inner.ensure_layout()
        }
    }
}
