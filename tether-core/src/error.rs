//! Error types for every layer of the coordination stack.

use std::time::Duration;
use thiserror::Error;

use crate::types::SchemaVersion;

/// Failure reported by a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("invalid lock argument: {0}")]
    InvalidArgument(String),

    #[error("could not place a lock on the resource '{resource}': the lock request timed out after {timeout:?}")]
    Timeout { resource: String, timeout: Duration },

    #[error("could not place a lock on the resource '{resource}'")]
    Acquisition {
        resource: String,
        #[source]
        source: StoreError,
    },

    #[error("could not release the lock on the resource '{resource}'")]
    Release {
        resource: String,
        #[source]
        source: StoreError,
    },
}

impl LockError {
    /// Whether retrying the same request later can succeed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LockError::Timeout { .. })
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid queue argument: {0}")]
    InvalidArgument(String),

    #[error("the operation was cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(
        "the store uses schema {current}, which is newer than the {required} this build supports; \
         backwards migration is not supported, resolve this manually (for example by dropping the store)"
    )]
    Downgrade {
        current: SchemaVersion,
        required: SchemaVersion,
    },

    #[error("the store must be migrated from {current} to {required}, but the migration strategy is 'skip'")]
    MigrationRequired {
        current: SchemaVersion,
        required: SchemaVersion,
    },

    #[error("migration step {version} ({description}) failed")]
    Step {
        version: SchemaVersion,
        description: String,
        #[source]
        source: StoreError,
    },

    #[error("invalid migration plan: {0}")]
    InvalidPlan(String),

    #[error("the migration task did not run to completion: {0}")]
    Aborted(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown migration strategy '{0}', expected one of: skip, drop, migrate")]
    UnknownMigrationStrategy(String),

    #[error("invalid option '{option}': {reason}")]
    Invalid { option: &'static str, reason: String },

    #[error("failed to read config file '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Error raised while building a client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
