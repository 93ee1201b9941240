//! Tunables shared by the lock, queue, notification channel and migration gate.
//!
//! Options deserialize from TOML with human-readable durations:
//!
//! ```toml
//! lock_lifetime = "30s"
//! invisibility_timeout = "30m"
//! signal_poll_interval = "1s"
//! prefix = "tether"
//!
//! [migration]
//! strategy = "migrate"
//! lock_timeout = "30s"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::migration::MigrationStrategy;

/// Number of heartbeats per lease lifetime.
const HEARTBEATS_PER_LIFETIME: u32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationOptions {
    /// How long a lock lease lives without a heartbeat
    #[serde(with = "humantime_serde")]
    pub lock_lifetime: Duration,
    /// How long a fetched, unacknowledged queue entry stays invisible
    #[serde(with = "humantime_serde")]
    pub invisibility_timeout: Duration,
    /// Upper bound on how long a waiter goes without re-reading the store
    #[serde(with = "humantime_serde")]
    pub signal_poll_interval: Duration,
    /// Table name prefix for persistent backends
    pub prefix: String,
    pub migration: MigrationOptions,
}

impl Default for CoordinationOptions {
    fn default() -> Self {
        Self {
            lock_lifetime: Duration::from_secs(30),
            invisibility_timeout: Duration::from_secs(30 * 60),
            signal_poll_interval: Duration::from_secs(1),
            prefix: "tether".to_string(),
            migration: MigrationOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationOptions {
    pub strategy: MigrationStrategy,
    /// How long to wait for another process's migration to finish
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            strategy: MigrationStrategy::Migrate,
            lock_timeout: Duration::from_secs(30),
        }
    }
}

impl CoordinationOptions {
    /// Parse and validate options from a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let options: CoordinationOptions = toml::from_str(input)?;
        options.validate()?;
        Ok(options)
    }

    /// Read, parse and validate options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    pub fn with_lock_lifetime(mut self, lifetime: Duration) -> Self {
        self.lock_lifetime = lifetime;
        self
    }

    pub fn with_invisibility_timeout(mut self, timeout: Duration) -> Self {
        self.invisibility_timeout = timeout;
        self
    }

    pub fn with_signal_poll_interval(mut self, interval: Duration) -> Self {
        self.signal_poll_interval = interval;
        self
    }

    pub fn with_migration_strategy(mut self, strategy: MigrationStrategy) -> Self {
        self.migration.strategy = strategy;
        self
    }

    /// Interval between lease renewals of a held lock.
    pub fn heartbeat_interval(&self) -> Duration {
        self.lock_lifetime / HEARTBEATS_PER_LIFETIME
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval().is_zero() {
            return Err(ConfigError::Invalid {
                option: "lock_lifetime",
                reason: format!(
                    "must be long enough for a non-zero heartbeat interval, got {:?}",
                    self.lock_lifetime
                ),
            });
        }
        if self.invisibility_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                option: "invisibility_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.signal_poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                option: "signal_poll_interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.prefix.is_empty()
            || !self
                .prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConfigError::Invalid {
                option: "prefix",
                reason: format!(
                    "'{}' must be non-empty and contain only ASCII letters, digits or '_'",
                    self.prefix
                ),
            });
        }
        Ok(())
    }
}
