//! Schema migration gated by the distributed lock.
//!
//! Every process calls [`MigrationManager::migrate`] on startup. The first to
//! take the `migrate` lock brings the store to the required version; the
//! rest wait on the lock and then find nothing left to do.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{ConfigError, MigrationError, StoreError};
use crate::infrastructure::CoordinationStore;
use crate::lock::{DistributedLock, LockContext};
use crate::options::MigrationOptions;
use crate::types::SchemaVersion;

/// Lock resource reserved for migrations.
pub const MIGRATION_LOCK_RESOURCE: &str = "migrate";

/// What to do when the store is behind the required schema version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MigrationStrategy {
    /// Refuse to touch the store; fail so an operator can migrate by hand
    Skip,
    /// Wipe queue, signal and schema data, then build the layout from scratch
    Drop,
    /// Apply each step between the current and the required version
    #[default]
    Migrate,
}

impl MigrationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStrategy::Skip => "skip",
            MigrationStrategy::Drop => "drop",
            MigrationStrategy::Migrate => "migrate",
        }
    }
}

impl FromStr for MigrationStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" | "none" => Ok(MigrationStrategy::Skip),
            "drop" | "reset" => Ok(MigrationStrategy::Drop),
            "migrate" | "incremental" => Ok(MigrationStrategy::Migrate),
            _ => Err(ConfigError::UnknownMigrationStrategy(s.to_string())),
        }
    }
}

impl TryFrom<String> for MigrationStrategy {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MigrationStrategy> for String {
    fn from(strategy: MigrationStrategy) -> Self {
        strategy.as_str().to_string()
    }
}

impl std::fmt::Display for MigrationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Steps ──────────────────────────────────────────────────────────────────

/// One schema transition. `apply` moves a store at the previous version to
/// `version()`; the manager records the new version afterwards.
pub trait MigrationStep: Send + Sync {
    fn version(&self) -> SchemaVersion;

    fn description(&self) -> &str;

    fn apply(&self, store: &dyn CoordinationStore) -> Result<(), StoreError>;
}

/// Creates the lock, queue, schema and signal collections.
struct CreateLayout;

impl MigrationStep for CreateLayout {
    fn version(&self) -> SchemaVersion {
        SchemaVersion::new(1)
    }

    fn description(&self) -> &str {
        "create coordination collections"
    }

    fn apply(&self, store: &dyn CoordinationStore) -> Result<(), StoreError> {
        store.ensure_layout()
    }
}

/// Ordered set of migration steps. The highest step version is the version
/// this build requires.
pub struct MigrationPlan {
    steps: Vec<Box<dyn MigrationStep>>,
}

impl MigrationPlan {
    /// Build a plan. Step versions must be unique and above `SchemaVersion::NONE`.
    pub fn new(mut steps: Vec<Box<dyn MigrationStep>>) -> Result<Self, MigrationError> {
        steps.sort_by_key(|s| s.version());
        if let Some(step) = steps.iter().find(|s| s.version() == SchemaVersion::NONE) {
            return Err(MigrationError::InvalidPlan(format!(
                "step '{}' targets {}, steps must target versions above it",
                step.description(),
                SchemaVersion::NONE
            )));
        }
        if let Some(pair) = steps.windows(2).find(|w| w[0].version() == w[1].version()) {
            return Err(MigrationError::InvalidPlan(format!(
                "steps '{}' and '{}' both target {}",
                pair[0].description(),
                pair[1].description(),
                pair[0].version()
            )));
        }
        Ok(Self { steps })
    }

    /// The layout this crate ships with.
    pub fn builtin() -> Self {
        Self {
            steps: vec![Box::new(CreateLayout)],
        }
    }

    pub fn required_version(&self) -> SchemaVersion {
        self.steps
            .last()
            .map_or(SchemaVersion::NONE, |s| s.version())
    }

    fn steps_between(
        &self,
        from: SchemaVersion,
        to: SchemaVersion,
    ) -> impl Iterator<Item = &dyn MigrationStep> {
        self.steps
            .iter()
            .map(|s| s.as_ref())
            .filter(move |s| s.version() > from && s.version() <= to)
    }
}

// ─── Manager ────────────────────────────────────────────────────────────────

/// What a migration run did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MigrationOutcome {
    /// The store had no schema record and was built from scratch
    Initialized { version: SchemaVersion },
    /// Nothing to do
    UpToDate { version: SchemaVersion },
    /// Steps were applied on top of the existing data
    Migrated { from: SchemaVersion, to: SchemaVersion },
    /// Existing data was dropped and the layout rebuilt
    Reset { from: SchemaVersion, to: SchemaVersion },
}

pub struct MigrationManager {
    store: Arc<dyn CoordinationStore>,
    lock: DistributedLock,
    options: MigrationOptions,
    plan: Arc<MigrationPlan>,
}

impl MigrationManager {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        lock: DistributedLock,
        options: MigrationOptions,
        plan: MigrationPlan,
    ) -> Self {
        Self {
            store,
            lock,
            options,
            plan: Arc::new(plan),
        }
    }

    pub fn required_version(&self) -> SchemaVersion {
        self.plan.required_version()
    }

    /// Bring the store to the required schema version under the migration lock.
    ///
    /// Steps run on the blocking pool so the lock heartbeat keeps renewing
    /// the lease however long they take.
    pub async fn migrate(&self) -> Result<MigrationOutcome, MigrationError> {
        let context = LockContext::new();
        let mut guard = self
            .lock
            .acquire(&context, MIGRATION_LOCK_RESOURCE, self.options.lock_timeout)
            .await?;

        let run = LockedRun {
            store: Arc::clone(&self.store),
            plan: Arc::clone(&self.plan),
            strategy: self.options.strategy,
        };
        let outcome = match tokio::task::spawn_blocking(move || run.migrate()).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(MigrationError::Aborted(e.to_string())),
        };
        let released = guard.release();

        let outcome = outcome?;
        released?;
        Ok(outcome)
    }
}

/// The part of a migration that runs while the lock is held.
struct LockedRun {
    store: Arc<dyn CoordinationStore>,
    plan: Arc<MigrationPlan>,
    strategy: MigrationStrategy,
}

impl LockedRun {
    fn migrate(&self) -> Result<MigrationOutcome, MigrationError> {
        let required = self.plan.required_version();

        let Some(record) = self.store.schema_version()? else {
            tracing::info!(%required, "no schema version found, running full migration");
            self.run_steps(SchemaVersion::NONE, required)?;
            return Ok(MigrationOutcome::Initialized { version: required });
        };

        let current = record.version;
        if current > required {
            return Err(MigrationError::Downgrade { current, required });
        }
        if current == required {
            tracing::debug!(version = %current, "schema is up to date");
            return Ok(MigrationOutcome::UpToDate { version: current });
        }

        tracing::info!(
            %current,
            %required,
            strategy = %self.strategy,
            "schema migration required"
        );
        match self.strategy {
            MigrationStrategy::Skip => Err(MigrationError::MigrationRequired { current, required }),
            MigrationStrategy::Drop => {
                self.store.drop_data()?;
                self.run_steps(SchemaVersion::NONE, required)?;
                Ok(MigrationOutcome::Reset {
                    from: current,
                    to: required,
                })
            }
            MigrationStrategy::Migrate => {
                self.run_steps(current, required)?;
                Ok(MigrationOutcome::Migrated {
                    from: current,
                    to: required,
                })
            }
        }
    }

    /// Apply every step in `(from, to]`, recording the version after each,
    /// and leave the schema record at exactly `to`.
    fn run_steps(&self, from: SchemaVersion, to: SchemaVersion) -> Result<(), MigrationError> {
        for step in self.plan.steps_between(from, to) {
            let version = step.version();
            step.apply(self.store.as_ref())
                .map_err(|source| MigrationError::Step {
                    version,
                    description: step.description().to_string(),
                    source,
                })?;
            self.store.set_schema_version(version)?;
            tracing::info!(%version, step = step.description(), "migration step applied");
        }
        self.store.set_schema_version(to)?;
        Ok(())
    }
}
