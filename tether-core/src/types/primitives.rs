use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. Every persisted instant uses this unit.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Saturating conversion for durations that get added to epoch milliseconds.
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Ordinal of the persisted layout generation.
///
/// `SchemaVersion::NONE` is the generation of an empty store; migration steps
/// always target versions above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaVersion(pub u32);

impl SchemaVersion {
    pub const NONE: SchemaVersion = SchemaVersion(0);

    pub fn new(version: u32) -> Self {
        Self(version)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Which queue entries a dequeue attempt may claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchCondition {
    /// Never delivered (`fetched_at` absent)
    Unfetched,
    /// Delivered before `cutoff` and never acknowledged
    FetchedBefore { cutoff: u64 },
}

impl FetchCondition {
    pub fn matches(&self, fetched_at: Option<u64>) -> bool {
        match (self, fetched_at) {
            (FetchCondition::Unfetched, None) => true,
            (FetchCondition::FetchedBefore { cutoff }, Some(at)) => at < *cutoff,
            _ => false,
        }
    }
}
