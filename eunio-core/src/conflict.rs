//! Detection and resolution of diverged settings.
//!
//! A conflict exists when the local copy has unsynced changes and the remote
//! copy holds different content. Classification looks at how far apart the two
//! modification times are; the recommended strategy then falls out of the
//! classification and of which side the user actually customized.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::backup::BackupManager;
use crate::config::EngineConfig;
use crate::error::EunioError;
use crate::migration::MigrationService;
use crate::models::{EntityKind, SettingsSection, SyncStatus, UserSettings};
use crate::repository::{EntityRepository, RecordUpgrader};
use crate::store::{
    ChangeType, DeviceInfo, EntityRecord, HistoryRecord, RemoteStore, StoreError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides changed within the threshold of each other
    ConcurrentModifications,
    LocalNewerRemoteDifferent,
    RemoteNewerLocalDifferent,
    SameTimestampDifferentContent,
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictType::ConcurrentModifications => "concurrent modifications",
            ConflictType::LocalNewerRemoteDifferent => "local newer, remote different",
            ConflictType::RemoteNewerLocalDifferent => "remote newer, local different",
            ConflictType::SameTimestampDifferentContent => "same timestamp, different content",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    LocalWins,
    RemoteWins,
    /// Per group, take the side the user customized; remote on a tie
    MergeFields,
    /// The strictly later side wins; remote on a tie
    LastWriteWins,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::LocalWins => "local-wins",
            ResolutionStrategy::RemoteWins => "remote-wins",
            ResolutionStrategy::MergeFields => "merge-fields",
            ResolutionStrategy::LastWriteWins => "last-write-wins",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "local-wins" | "local" => Ok(ResolutionStrategy::LocalWins),
            "remote-wins" | "remote" => Ok(ResolutionStrategy::RemoteWins),
            "merge-fields" | "merge" => Ok(ResolutionStrategy::MergeFields),
            "last-write-wins" | "latest" => Ok(ResolutionStrategy::LastWriteWins),
            _ => Err(format!("Invalid resolution strategy: {}", s)),
        }
    }
}

/// Two diverged snapshots of one user's settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsConflict {
    pub user_id: String,
    pub local: UserSettings,
    pub remote: UserSettings,
    pub conflict_type: ConflictType,
    pub detected_at: DateTime<Utc>,
}

impl SettingsConflict {
    /// Classifies two snapshots, or returns `None` when their content agrees.
    pub fn between(local: UserSettings, remote: UserSettings, threshold: Duration) -> Option<Self> {
        if local.same_content(&remote) {
            return None;
        }

        let delta = local.meta.last_modified - remote.meta.last_modified;
        let conflict_type = if delta > threshold {
            ConflictType::LocalNewerRemoteDifferent
        } else if delta < -threshold {
            ConflictType::RemoteNewerLocalDifferent
        } else if delta.is_zero() {
            ConflictType::SameTimestampDifferentContent
        } else {
            ConflictType::ConcurrentModifications
        };

        Some(Self {
            user_id: local.user_id.clone(),
            local,
            remote,
            conflict_type,
            detected_at: Utc::now(),
        })
    }

    pub fn recommended_strategy(&self) -> ResolutionStrategy {
        match self.conflict_type {
            ConflictType::LocalNewerRemoteDifferent => ResolutionStrategy::LocalWins,
            ConflictType::RemoteNewerLocalDifferent => ResolutionStrategy::RemoteWins,
            ConflictType::ConcurrentModifications
            | ConflictType::SameTimestampDifferentContent => {
                match (
                    self.local.has_customizations(),
                    self.remote.has_customizations(),
                ) {
                    (true, false) => ResolutionStrategy::LocalWins,
                    (false, true) => ResolutionStrategy::RemoteWins,
                    (true, true) => ResolutionStrategy::MergeFields,
                    (false, false) => ResolutionStrategy::LastWriteWins,
                }
            }
        }
    }

    /// Builds the resolved settings without storing anything.
    pub fn resolve(&self, strategy: ResolutionStrategy) -> UserSettings {
        let mut resolved = match strategy {
            ResolutionStrategy::LocalWins => self.local.clone(),
            ResolutionStrategy::RemoteWins => self.remote.clone(),
            ResolutionStrategy::MergeFields => {
                let mut merged = self.remote.clone();
                for section in SettingsSection::ALL {
                    if self.local.is_customized(section) && !self.remote.is_customized(section) {
                        merged.copy_section_from(&self.local, section);
                    }
                }
                merged
            }
            ResolutionStrategy::LastWriteWins => {
                if self.local.meta.last_modified > self.remote.meta.last_modified {
                    self.local.clone()
                } else {
                    self.remote.clone()
                }
            }
        };

        // Stamped past both sides so the push is not rejected as stale
        resolved.user_id = self.user_id.clone();
        resolved.meta = self.local.meta.clone();
        resolved.meta.last_modified = self
            .local
            .meta
            .last_modified
            .max(self.remote.meta.last_modified);
        resolved
    }
}

/// Where a group of the resolved settings came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionSource {
    /// Both sides already agreed
    Unchanged,
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionChange {
    pub section: SettingsSection,
    pub source: SectionSource,
    pub differs_from_local: bool,
    pub differs_from_remote: bool,
}

/// What a resolution would produce, per group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionPreview {
    pub strategy: ResolutionStrategy,
    pub resolved: UserSettings,
    pub sections: Vec<SectionChange>,
}

impl ResolutionPreview {
    /// Groups whose local value would change.
    pub fn local_changes(&self) -> impl Iterator<Item = &SectionChange> {
        self.sections.iter().filter(|s| s.differs_from_local)
    }
}

pub struct ConflictResolver {
    settings: Arc<EntityRepository<UserSettings>>,
    remote: Arc<dyn RemoteStore>,
    backups: Option<Arc<BackupManager>>,
    migration: MigrationService,
    device: DeviceInfo,
    threshold: Duration,
}

impl ConflictResolver {
    pub fn new(
        settings: Arc<EntityRepository<UserSettings>>,
        remote: Arc<dyn RemoteStore>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            settings,
            remote,
            backups: None,
            migration: MigrationService::new(),
            device: config.device.clone(),
            threshold: config.conflict_threshold(),
        }
    }

    /// Takes an automatic backup after each resolution.
    pub fn with_backups(mut self, backups: Arc<BackupManager>) -> Self {
        self.backups = Some(backups);
        self
    }

    /// Compares the unsynced local settings with the remote copy.
    ///
    /// An unreachable remote is treated as no conflict; the next sync will
    /// try again.
    pub async fn detect_conflict(
        &self,
        user_id: &str,
    ) -> Result<Option<SettingsConflict>, EunioError> {
        let Some(local) = self.settings.get(user_id).await? else {
            return Ok(None);
        };
        if local.meta.sync_status == SyncStatus::Synced {
            return Ok(None);
        }

        let record = match self.remote.get(EntityKind::Settings, user_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Skipping conflict check, remote unavailable");
                return Ok(None);
            }
        };
        let remote = self.read_remote(record)?;

        let conflict = SettingsConflict::between(local, remote, self.threshold);
        if let Some(conflict) = &conflict {
            info!(user_id = %user_id, conflict_type = %conflict.conflict_type, "Detected settings conflict");
        }
        Ok(conflict)
    }

    pub fn get_recommended_strategy(&self, conflict: &SettingsConflict) -> ResolutionStrategy {
        conflict.recommended_strategy()
    }

    pub fn preview_resolution(
        &self,
        conflict: &SettingsConflict,
        strategy: ResolutionStrategy,
    ) -> ResolutionPreview {
        let resolved = conflict.resolve(strategy);
        let sections = SettingsSection::ALL
            .into_iter()
            .map(|section| {
                let differs_from_local = !resolved.section_equals(&conflict.local, section);
                let differs_from_remote = !resolved.section_equals(&conflict.remote, section);
                let source = if conflict.local.section_equals(&conflict.remote, section) {
                    SectionSource::Unchanged
                } else if differs_from_local {
                    SectionSource::Remote
                } else {
                    SectionSource::Local
                };
                SectionChange {
                    section,
                    source,
                    differs_from_local,
                    differs_from_remote,
                }
            })
            .collect();

        ResolutionPreview {
            strategy,
            resolved,
            sections,
        }
    }

    /// Stores the resolution locally and remotely, then records it.
    pub async fn resolve_conflict(
        &self,
        conflict: &SettingsConflict,
        strategy: ResolutionStrategy,
    ) -> Result<UserSettings, EunioError> {
        let resolved = conflict.resolve(strategy);
        let saved = self.settings.save(&resolved).await?;

        let history = HistoryRecord {
            user_id: conflict.user_id.clone(),
            change_type: ChangeType::ConflictResolved,
            snapshot: serde_json::to_value(&saved).map_err(StoreError::from)?,
            device: self.device.clone(),
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.remote.create_history_record(history).await {
            warn!(user_id = %conflict.user_id, error = %e, "Could not record resolution history");
        }

        if let Some(backups) = &self.backups {
            if let Err(e) = backups.create_automatic_backup(&saved).await {
                warn!(user_id = %conflict.user_id, error = %e, "Post-resolution backup failed");
            }
        }

        info!(
            user_id = %conflict.user_id,
            strategy = %strategy,
            sync_status = %saved.meta.sync_status,
            "Resolved settings conflict"
        );
        Ok(saved)
    }

    fn read_remote(&self, record: EntityRecord) -> Result<UserSettings, EunioError> {
        let record = match self.migration.upgrade(&record)? {
            Some(upgraded) => upgraded,
            None => record,
        };
        Ok(record.to_entity().map_err(StoreError::from)?)
    }
}
