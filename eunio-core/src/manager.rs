//! Entry point for code that reads and edits a user's settings.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backup::{BackupManager, ImportStrategy};
use crate::cache::SettingsCache;
use crate::config::EngineConfig;
use crate::error::EunioError;
use crate::models::{SectionUpdate, SettingsSection, UserSettings};
use crate::repository::EntityRepository;
use crate::store::{ChangeType, DeviceInfo, HistoryRecord, LocalStore, RemoteStore};

pub struct SettingsManager {
    settings: Arc<EntityRepository<UserSettings>>,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    backups: Arc<BackupManager>,
    cache: SettingsCache,
    device: DeviceInfo,
}

impl SettingsManager {
    pub fn new(
        settings: Arc<EntityRepository<UserSettings>>,
        remote: Arc<dyn RemoteStore>,
        backups: Arc<BackupManager>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            local: settings.local_store().clone(),
            settings,
            remote,
            backups,
            cache: SettingsCache::new(config.cache_capacity),
            device: config.device.clone(),
        }
    }

    pub fn backups(&self) -> &Arc<BackupManager> {
        &self.backups
    }

    pub fn repository(&self) -> &Arc<EntityRepository<UserSettings>> {
        &self.settings
    }

    pub async fn get_entity(&self, user_id: &str) -> Result<Option<UserSettings>, EunioError> {
        if let Some(settings) = self.cache.get(user_id) {
            return Ok(Some(settings));
        }

        let settings = self.settings.get(user_id).await?;
        if settings.is_some() {
            let snapshot = self.settings.observe_changes(user_id).await?;
            self.cache.insert(user_id, snapshot);
        }
        Ok(settings)
    }

    /// Returns the user's settings, creating defaults on first use.
    pub async fn get_or_create(&self, user_id: &str) -> Result<UserSettings, EunioError> {
        if let Some(settings) = self.get_entity(user_id).await? {
            return Ok(settings);
        }
        info!(user_id = %user_id, "Creating default settings");
        self.settings.save(&UserSettings::new(user_id)).await
    }

    /// Replaces one group and marks it customized.
    pub async fn update_section(
        &self,
        user_id: &str,
        update: SectionUpdate,
    ) -> Result<UserSettings, EunioError> {
        let section = update.section();
        let mut settings = self.get_or_create(user_id).await?;
        settings.apply(update);

        let saved = self.settings.save(&settings).await?;
        info!(user_id = %user_id, section = %section, sync_status = %saved.meta.sync_status, "Updated settings");
        self.after_change(&saved, ChangeType::SectionUpdated).await;
        Ok(saved)
    }

    pub async fn reset_section(
        &self,
        user_id: &str,
        section: SettingsSection,
    ) -> Result<UserSettings, EunioError> {
        let mut settings = self.get_or_create(user_id).await?;
        settings.reset(section);

        let saved = self.settings.save(&settings).await?;
        info!(user_id = %user_id, section = %section, "Reset settings section");
        self.after_change(&saved, ChangeType::SectionReset).await;
        Ok(saved)
    }

    /// Latest settings, then every later change.
    pub async fn observe_changes(
        &self,
        user_id: &str,
    ) -> Result<watch::Receiver<Option<UserSettings>>, EunioError> {
        self.settings.observe_changes(user_id).await
    }

    pub async fn export_data(&self, user_id: &str) -> Result<String, EunioError> {
        self.backups.export_settings(user_id, true).await
    }

    pub async fn restore_on_new_device(
        &self,
        user_id: &str,
        payload: Option<&str>,
    ) -> Result<UserSettings, EunioError> {
        let restored = self.backups.restore_on_new_device(user_id, payload).await?;
        self.after_change(&restored, ChangeType::Restored).await;
        Ok(restored)
    }

    /// Restores one of the user's stored backups.
    pub async fn restore_backup(
        &self,
        user_id: &str,
        backup_id: Uuid,
    ) -> Result<UserSettings, EunioError> {
        let restored = self.backups.restore_backup(user_id, backup_id).await?;
        self.after_change(&restored, ChangeType::Restored).await;
        Ok(restored)
    }

    pub async fn import_settings(
        &self,
        user_id: &str,
        payload: &str,
        strategy: ImportStrategy,
    ) -> Result<UserSettings, EunioError> {
        let imported = self
            .backups
            .import_settings(user_id, payload, strategy)
            .await?;
        self.after_change(&imported, ChangeType::Imported).await;
        Ok(imported)
    }

    /// Removes the user's settings, their other local data and backups, and
    /// the remote settings copy.
    pub async fn delete_account(&self, user_id: &str) -> Result<(), EunioError> {
        self.settings.delete(user_id).await?;
        self.local.delete_user(user_id).await?;
        self.cache.invalidate(user_id);
        info!(user_id = %user_id, "Deleted account data");
        Ok(())
    }

    /// Records the change remotely and takes an automatic backup.
    async fn after_change(&self, saved: &UserSettings, change_type: ChangeType) {
        self.record_history(saved, change_type).await;
        if let Err(e) = self.backups.create_automatic_backup(saved).await {
            warn!(user_id = %saved.user_id, error = %e, "Automatic backup failed");
        }
    }

    async fn record_history(&self, settings: &UserSettings, change_type: ChangeType) {
        let snapshot = match serde_json::to_value(settings) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(user_id = %settings.user_id, error = %e, "Could not snapshot settings");
                return;
            }
        };
        let record = HistoryRecord {
            user_id: settings.user_id.clone(),
            change_type,
            snapshot,
            device: self.device.clone(),
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.remote.create_history_record(record).await {
            warn!(user_id = %settings.user_id, error = %e, "Could not record settings history");
        }
    }
}
