//! Settings backups, exports and restores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{BackupError, EunioError};
use crate::migration::MigrationService;
use crate::models::{SettingsSection, UserSettings, CURRENT_SETTINGS_VERSION};
use crate::repository::EntityRepository;
use crate::store::{BackupRecord, BackupType, DeviceInfo, LocalStore, RemoteStore};

/// Format version of [`SettingsExport`] written by this build.
pub const EXPORT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub device: DeviceInfo,
    /// Hex SHA-256 of the serialized `settings` document
    pub checksum: String,
}

/// Serialized form of a backup or export.
///
/// `settings` stays a raw document so that exports written by older builds
/// can be migrated before they are read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsExport {
    pub export_version: u32,
    pub exported_at: DateTime<Utc>,
    pub settings_version: i32,
    pub settings: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ExportMetadata>,
}

impl SettingsExport {
    pub fn new(settings: &UserSettings, device: Option<&DeviceInfo>) -> Result<Self, BackupError> {
        let document = serde_json::to_value(settings)?;
        let metadata = match device {
            Some(device) => Some(ExportMetadata {
                device: device.clone(),
                checksum: checksum(&document)?,
            }),
            None => None,
        };

        Ok(Self {
            export_version: EXPORT_VERSION,
            exported_at: Utc::now(),
            settings_version: settings.meta.version,
            settings: document,
            metadata,
        })
    }

    /// Parses a payload and verifies its checksum when one is present.
    pub fn parse(payload: &str) -> Result<Self, BackupError> {
        let export: SettingsExport = serde_json::from_str(payload)?;
        if export.export_version == 0 || export.export_version > EXPORT_VERSION {
            return Err(BackupError::UnsupportedExportVersion(export.export_version));
        }
        if let Some(metadata) = &export.metadata {
            if checksum(&export.settings)? != metadata.checksum {
                return Err(BackupError::ChecksumMismatch);
            }
        }
        Ok(export)
    }

    pub fn to_json(&self) -> Result<String, BackupError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn checksum(document: &Value) -> Result<String, BackupError> {
    let bytes = serde_json::to_vec(document)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// How an import combines with the settings already on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStrategy {
    ReplaceAll,
    /// Keep groups the user customized locally, take the rest from the import
    MergeWithExisting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupOperation {
    Create,
    Export,
    Import,
    Restore,
    Cleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Started,
    InProgress,
    Completed,
    Failed,
}

/// Progress notification for a backup operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEvent {
    pub operation: BackupOperation,
    pub user_id: String,
    pub status: BackupStatus,
    /// 0.0 to 1.0
    pub progress: f32,
}

pub struct BackupManager {
    settings: Arc<EntityRepository<UserSettings>>,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    migration: MigrationService,
    device: DeviceInfo,
    keep_count: usize,
    events: broadcast::Sender<BackupEvent>,
}

impl BackupManager {
    pub fn new(
        settings: Arc<EntityRepository<UserSettings>>,
        remote: Arc<dyn RemoteStore>,
        config: &EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            local: settings.local_store().clone(),
            settings,
            remote,
            migration: MigrationService::new(),
            device: config.device.clone(),
            keep_count: config.backup_keep_count,
            events,
        }
    }

    /// Subscribes to progress events. Missing a subscriber never blocks an
    /// operation.
    pub fn observe_backup_operations(&self) -> broadcast::Receiver<BackupEvent> {
        self.events.subscribe()
    }

    /// Snapshots settings after a save and prunes old automatic backups.
    pub async fn create_automatic_backup(
        &self,
        settings: &UserSettings,
    ) -> Result<BackupRecord, EunioError> {
        let user_id = settings.user_id.as_str();
        self.emit(BackupOperation::Create, user_id, BackupStatus::Started, 0.0);

        let result = async {
            let record = self.store_backup(settings, BackupType::Automatic).await?;
            self.local
                .cleanup_old_backups(user_id, self.keep_count)
                .await
                .map_err(BackupError::from)?;
            Ok::<_, EunioError>(record)
        }
        .await;

        self.finish(BackupOperation::Create, user_id, result)
    }

    /// Snapshots the user's current settings on request. The snapshot is also
    /// uploaded, but a failed upload does not fail the backup.
    pub async fn create_manual_backup(&self, user_id: &str) -> Result<BackupRecord, EunioError> {
        self.emit(BackupOperation::Create, user_id, BackupStatus::Started, 0.0);

        let result = async {
            let settings = self.current_settings(user_id).await?;
            self.emit(BackupOperation::Create, user_id, BackupStatus::InProgress, 0.5);
            let record = self.store_backup(&settings, BackupType::Manual).await?;

            if let Err(e) = self.remote.upload_backup(&record).await {
                warn!(user_id = %user_id, error = %e, "Backup upload failed, kept locally");
            }
            Ok::<_, EunioError>(record)
        }
        .await;

        self.finish(BackupOperation::Create, user_id, result)
    }

    /// Serializes the user's settings for export and records the export.
    pub async fn export_settings(
        &self,
        user_id: &str,
        include_metadata: bool,
    ) -> Result<String, EunioError> {
        self.emit(BackupOperation::Export, user_id, BackupStatus::Started, 0.0);

        let result = async {
            let settings = self.current_settings(user_id).await?;
            let device = include_metadata.then_some(&self.device);
            let payload = SettingsExport::new(&settings, device)?.to_json()?;

            self.local
                .create_backup_record(BackupRecord::new(
                    user_id,
                    BackupType::Export,
                    payload.clone(),
                ))
                .await
                .map_err(BackupError::from)?;
            Ok::<_, EunioError>(payload)
        }
        .await;

        self.finish(BackupOperation::Export, user_id, result)
    }

    /// Publishes an export through the remote store and returns its link.
    pub async fn share_export(&self, user_id: &str) -> Result<String, EunioError> {
        let payload = self.export_settings(user_id, false).await?;
        let link = self
            .remote
            .create_shareable_export(user_id, &payload)
            .await?;
        info!(user_id = %user_id, "Shared settings export");
        Ok(link)
    }

    /// Restores settings from `payload`, or from the newest remote backup when
    /// no payload is given.
    ///
    /// The restored copy becomes the local truth and is left pending so the
    /// next sync pushes it.
    pub async fn restore_on_new_device(
        &self,
        user_id: &str,
        payload: Option<&str>,
    ) -> Result<UserSettings, EunioError> {
        self.emit(BackupOperation::Restore, user_id, BackupStatus::Started, 0.0);

        let result = async {
            let payload = match payload {
                Some(payload) => payload.to_string(),
                None => self.fetch_remote_backup(user_id).await?,
            };
            self.emit(BackupOperation::Restore, user_id, BackupStatus::InProgress, 0.3);

            let mut restored = self.read_export(&payload)?;
            restored.user_id = user_id.to_string();
            self.emit(BackupOperation::Restore, user_id, BackupStatus::InProgress, 0.7);

            self.settings.save_local(&restored).await
        }
        .await;

        let restored = self.finish(BackupOperation::Restore, user_id, result)?;
        info!(user_id = %user_id, version = restored.meta.version, "Restored settings");
        Ok(restored)
    }

    /// Restores one of the user's stored backups.
    pub async fn restore_backup(
        &self,
        user_id: &str,
        backup_id: Uuid,
    ) -> Result<UserSettings, EunioError> {
        let backup = self
            .list_backups(user_id)
            .await?
            .into_iter()
            .find(|b| b.id == backup_id)
            .ok_or_else(|| BackupError::NotFound(user_id.to_string()))?;
        self.restore_on_new_device(user_id, Some(&backup.payload))
            .await
    }

    /// Imports an export over the user's current settings.
    pub async fn import_settings(
        &self,
        user_id: &str,
        payload: &str,
        strategy: ImportStrategy,
    ) -> Result<UserSettings, EunioError> {
        self.emit(BackupOperation::Import, user_id, BackupStatus::Started, 0.0);

        let result = async {
            let mut imported = self.read_export(payload)?;
            imported.user_id = user_id.to_string();

            let merged = match strategy {
                ImportStrategy::ReplaceAll => imported,
                ImportStrategy::MergeWithExisting => {
                    let existing = self
                        .settings
                        .get(user_id)
                        .await?
                        .unwrap_or_else(|| UserSettings::new(user_id));
                    let mut merged = if self.migration.needs_migration(existing.meta.version) {
                        self.migration.migrate_settings(
                            &existing,
                            existing.meta.version,
                            CURRENT_SETTINGS_VERSION,
                        )?
                    } else {
                        existing
                    };
                    for section in SettingsSection::ALL {
                        if !merged.is_customized(section) {
                            merged.copy_section_from(&imported, section);
                        }
                    }
                    merged
                }
            };
            self.emit(BackupOperation::Import, user_id, BackupStatus::InProgress, 0.6);

            self.settings.save_local(&merged).await
        }
        .await;

        self.finish(BackupOperation::Import, user_id, result)
    }

    pub async fn list_backups(&self, user_id: &str) -> Result<Vec<BackupRecord>, EunioError> {
        Ok(self
            .local
            .list_backups(user_id)
            .await
            .map_err(BackupError::from)?)
    }

    /// Keeps the newest `keep_count` automatic backups.
    pub async fn cleanup_old_backups(
        &self,
        user_id: &str,
        keep_count: usize,
    ) -> Result<usize, EunioError> {
        self.emit(BackupOperation::Cleanup, user_id, BackupStatus::Started, 0.0);
        let result = self
            .local
            .cleanup_old_backups(user_id, keep_count)
            .await
            .map_err(|e| EunioError::from(BackupError::from(e)));
        let removed = self.finish(BackupOperation::Cleanup, user_id, result)?;
        if removed > 0 {
            info!(user_id = %user_id, removed, "Removed old automatic backups");
        }
        Ok(removed)
    }

    async fn current_settings(&self, user_id: &str) -> Result<UserSettings, EunioError> {
        self.settings
            .get(user_id)
            .await?
            .ok_or_else(|| BackupError::NothingToBackUp(user_id.to_string()).into())
    }

    async fn store_backup(
        &self,
        settings: &UserSettings,
        backup_type: BackupType,
    ) -> Result<BackupRecord, EunioError> {
        let payload = SettingsExport::new(settings, Some(&self.device))?.to_json()?;
        let record = BackupRecord::new(settings.user_id.clone(), backup_type, payload);
        self.local
            .create_backup_record(record.clone())
            .await
            .map_err(BackupError::from)?;
        info!(
            user_id = %settings.user_id,
            backup_type = %backup_type,
            size_bytes = record.size_bytes,
            "Created backup"
        );
        Ok(record)
    }

    async fn fetch_remote_backup(&self, user_id: &str) -> Result<String, EunioError> {
        match self.remote.latest_backup(user_id).await {
            Ok(Some(backup)) => Ok(backup.payload),
            Ok(None) => Err(BackupError::NotFound(user_id.to_string()).into()),
            Err(e) => Err(BackupError::Remote(e.to_string()).into()),
        }
    }

    /// Parses an export and migrates its settings to the current schema.
    fn read_export(&self, payload: &str) -> Result<UserSettings, EunioError> {
        let export = SettingsExport::parse(payload)?;
        let document =
            self.migration
                .migrate_value(export.settings, export.settings_version, CURRENT_SETTINGS_VERSION)?;
        let settings: UserSettings =
            serde_json::from_value(document).map_err(BackupError::from)?;
        Ok(settings)
    }

    fn finish<T>(
        &self,
        operation: BackupOperation,
        user_id: &str,
        result: Result<T, EunioError>,
    ) -> Result<T, EunioError> {
        match &result {
            Ok(_) => self.emit(operation, user_id, BackupStatus::Completed, 1.0),
            Err(e) => {
                warn!(user_id = %user_id, operation = ?operation, error = %e, "Backup operation failed");
                self.emit(operation, user_id, BackupStatus::Failed, 1.0);
            }
        }
        result
    }

    fn emit(&self, operation: BackupOperation, user_id: &str, status: BackupStatus, progress: f32) {
        // No subscribers is fine
        let _ = self.events.send(BackupEvent {
            operation,
            user_id: user_id.to_string(),
            status,
            progress,
        });
    }
}
