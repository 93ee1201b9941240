//! # tether-core
//!
//! Coordination primitives for processes that share a document store with
//! no native locking or pub/sub: a leased distributed lock with heartbeat
//! renewal, a persistent job queue with signal-driven blocking dequeue, and
//! a schema migration gate built on the lock.

pub mod client;
pub mod error;
pub mod infrastructure;
#[path = "infrastructure_in_memory.rs"]
pub mod infrastructure_in_memory;
#[cfg(feature = "sqlite")]
#[path = "infrastructure_sqlite.rs"]
pub mod infrastructure_sqlite;
pub mod lock;
pub mod migration;
pub mod options;
pub mod queue;
pub mod signal;
pub mod types;

pub use client::TetherClient;
pub use error::{ClientError, ConfigError, LockError, MigrationError, QueueError, StoreError};
pub use lock::{DistributedLock, LockContext, LockGuard};
pub use migration::{MigrationManager, MigrationOutcome, MigrationPlan, MigrationStep, MigrationStrategy};
pub use options::{CoordinationOptions, MigrationOptions};
pub use queue::{FetchedJob, JobQueue};
pub use signal::{NotificationChannel, WaitOutcome};

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod lock_test;
