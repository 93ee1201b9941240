//! High-level entry point that wires a store, the notification channel and
//! options into the lock, queue and migration components.

use std::sync::Arc;

use crate::error::ClientError;
use crate::infrastructure::CoordinationStore;
use crate::infrastructure_in_memory::InMemoryStore;
use crate::lock::DistributedLock;
use crate::migration::{MigrationManager, MigrationPlan};
use crate::options::CoordinationOptions;
use crate::queue::JobQueue;
use crate::signal::NotificationChannel;

/// Shared handle over one coordination store. Cheap to clone.
#[derive(Clone)]
pub struct TetherClient {
    store: Arc<dyn CoordinationStore>,
    signal: Arc<NotificationChannel>,
    options: CoordinationOptions,
}

impl TetherClient {
    /// Wrap an existing store.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        options: CoordinationOptions,
    ) -> Result<Self, ClientError> {
        options.validate()?;
        let signal = Arc::new(NotificationChannel::new(
            Arc::clone(&store),
            options.signal_poll_interval,
        ));
        Ok(Self {
            store,
            signal,
            options,
        })
    }

    /// A client over a fresh process-local store.
    pub fn in_memory(options: CoordinationOptions) -> Result<Self, ClientError> {
        Self::new(Arc::new(InMemoryStore::new()), options)
    }

    /// A client backed by the SQLite database at `path`. Every process that
    /// opens the same file with the same prefix shares locks and queues.
    #[cfg(feature = "sqlite")]
    pub fn with_sqlite(
        path: impl AsRef<std::path::Path>,
        options: CoordinationOptions,
    ) -> Result<Self, ClientError> {
        options.validate()?;
        let store = crate::infrastructure_sqlite::SqliteStore::open(path, &options.prefix)?;
        Self::new(Arc::new(store), options)
    }

    pub fn options(&self) -> &CoordinationOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn signal(&self) -> &Arc<NotificationChannel> {
        &self.signal
    }

    pub fn lock(&self) -> DistributedLock {
        DistributedLock::new(
            Arc::clone(&self.store),
            Arc::clone(&self.signal),
            &self.options,
        )
    }

    pub fn queue(&self) -> JobQueue {
        JobQueue::new(
            Arc::clone(&self.store),
            Arc::clone(&self.signal),
            &self.options,
        )
    }

    pub fn migration_manager(&self, plan: MigrationPlan) -> MigrationManager {
        MigrationManager::new(
            Arc::clone(&self.store),
            self.lock(),
            self.options.migration.clone(),
            plan,
        )
    }
}
