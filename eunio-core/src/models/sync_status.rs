use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

/// Where a local entity stands relative to the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Written locally, not yet confirmed by the remote store
    #[default]
    Pending,
    /// Local and remote agree as of the last push
    Synced,
    /// The last push failed; retried on the next pass
    Failed,
}

impl SyncStatus {
    /// Returns true if the entity still has to be pushed.
    pub fn needs_push(&self) -> bool {
        matches!(self, SyncStatus::Pending | SyncStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            _ => Err(format!("Invalid sync status: {}", s)),
        }
    }
}

/// The kinds of entity the engine keeps in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Profile,
    DailyLog,
    Cycle,
    Settings,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Profile => "profile",
            EntityKind::DailyLog => "daily_log",
            EntityKind::Cycle => "cycle",
            EntityKind::Settings => "settings",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "profile" => Ok(EntityKind::Profile),
            "daily_log" => Ok(EntityKind::DailyLog),
            "cycle" => Ok(EntityKind::Cycle),
            "settings" => Ok(EntityKind::Settings),
            _ => Err(format!("Invalid entity kind: {}", s)),
        }
    }
}

/// Sync bookkeeping carried by every syncable entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub sync_status: SyncStatus,
    pub last_modified: DateTime<Utc>,
    /// Schema version of the entity payload
    pub version: i32,
}

impl SyncMetadata {
    pub fn new(version: i32) -> Self {
        Self {
            sync_status: SyncStatus::Pending,
            last_modified: stamp_now(),
            version,
        }
    }

    /// Stamps a new modification time that is strictly later than the
    /// previous one, even if the wall clock went backwards.
    ///
    /// Stamps carry microsecond precision, the finest a stored record keeps,
    /// so a stamp read back from storage compares equal to the one written.
    pub fn touch(&mut self, previous: Option<DateTime<Utc>>) {
        let now = stamp_now();
        self.last_modified = match previous {
            Some(prev) if prev >= now => (prev + Duration::milliseconds(1)).trunc_subsecs(6),
            _ => now,
        };
    }
}

fn stamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// An entity that can be written locally and pushed to the remote store.
pub trait SyncEntity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    const KIND: EntityKind;

    /// Storage key, unique within the entity kind.
    fn id(&self) -> String;

    fn user_id(&self) -> &str;

    fn metadata(&self) -> &SyncMetadata;

    fn metadata_mut(&mut self) -> &mut SyncMetadata;

    fn validate(&self) -> Result<(), ValidationError>;
}
