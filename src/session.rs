//! Wires the engine's collaborators together for one CLI invocation.

use std::sync::Arc;

use eunio_core::store::memory::StaticConnectivity;
use eunio_core::store::{Connectivity, LocalStore, RemoteStore};
use eunio_core::{
    BackupManager, ConflictResolver, CycleRecord, DailyLog, EntityRepository, MigrationService,
    PendingSync, SettingsManager, SyncCoordinator, SyncEntity, UserProfile, UserSettings,
};

use crate::config::Config;
use crate::db::{init_db, SqliteLocalStore};
use crate::remote::{HttpConnectivity, HttpRemoteStore, OfflineRemoteStore};

pub struct Session {
    pub user_id: String,
    pub settings: Arc<EntityRepository<UserSettings>>,
    pub profiles: Arc<EntityRepository<UserProfile>>,
    pub daily_logs: Arc<EntityRepository<DailyLog>>,
    pub cycles: Arc<EntityRepository<CycleRecord>>,
    pub coordinator: Arc<SyncCoordinator>,
    pub resolver: Arc<ConflictResolver>,
    pub manager: SettingsManager,
    pub migration: MigrationService,
    pub connectivity: Arc<dyn Connectivity>,
    auto_sync: bool,
}

impl Session {
    /// Opens the local database and connects to the configured sync server,
    /// if any.
    pub async fn open(config: &Config) -> Result<Self, Box<dyn std::error::Error>> {
        let pool = init_db(&config.database_path.value).await?;
        let local: Arc<dyn LocalStore> = Arc::new(SqliteLocalStore::new(pool));

        let (remote, connectivity): (Arc<dyn RemoteStore>, Arc<dyn Connectivity>) =
            match (&config.sync.server_url, HttpRemoteStore::from_config(&config.sync)?) {
                (Some(url), Some(remote)) => (
                    Arc::new(remote),
                    Arc::new(
                        HttpConnectivity::new(url, config.sync.metered)?
                            .with_poll_interval(config.engine.recovery_poll_interval()),
                    ),
                ),
                _ => (
                    Arc::new(OfflineRemoteStore),
                    Arc::new(StaticConnectivity::offline()),
                ),
            };

        Ok(Self::with_stores(config, local, remote, connectivity))
    }

    pub fn with_stores(
        config: &Config,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Self {
        let engine = &config.engine;
        let migration = MigrationService::new();

        let settings = Arc::new(
            repository::<UserSettings>(&local, &remote, engine.max_push_attempts)
                .with_upgrader(Arc::new(migration)),
        );
        let profiles = Arc::new(repository::<UserProfile>(
            &local,
            &remote,
            engine.max_push_attempts,
        ));
        let daily_logs = Arc::new(repository::<DailyLog>(
            &local,
            &remote,
            engine.max_push_attempts,
        ));
        let cycles = Arc::new(repository::<CycleRecord>(
            &local,
            &remote,
            engine.max_push_attempts,
        ));

        let backups = Arc::new(BackupManager::new(settings.clone(), remote.clone(), engine));
        let resolver = Arc::new(
            ConflictResolver::new(settings.clone(), remote.clone(), engine)
                .with_backups(backups.clone()),
        );
        let coordinator = Arc::new(
            SyncCoordinator::new(connectivity.clone(), engine)
                .with_repository(profiles.clone())
                .with_repository(settings.clone())
                .with_repository(daily_logs.clone())
                .with_repository(cycles.clone())
                .with_conflict_resolver(resolver.clone()),
        );
        let manager = SettingsManager::new(settings.clone(), remote, backups, engine);

        Self {
            user_id: config.user_id.value.clone(),
            settings,
            profiles,
            daily_logs,
            cycles,
            coordinator,
            resolver,
            manager,
            migration,
            connectivity,
            auto_sync: config.sync.auto_sync && config.sync.is_configured(),
        }
    }

    /// Every repository, in the order a sync pass visits them.
    pub fn repositories(&self) -> Vec<Arc<dyn PendingSync>> {
        let repositories: [Arc<dyn PendingSync>; 4] = [
            self.profiles.clone(),
            self.settings.clone(),
            self.daily_logs.clone(),
            self.cycles.clone(),
        ];
        Vec::from(repositories)
    }

    /// Pushes pending changes after a write when auto sync is enabled.
    ///
    /// Failures are logged and otherwise ignored; the changes stay queued
    /// for the next sync.
    pub async fn after_write(&self) {
        if !self.auto_sync {
            return;
        }
        match self.coordinator.perform_full_sync(&self.user_id).await {
            Ok(stats) => tracing::debug!(
                user_id = %self.user_id,
                items_synced = stats.items_synced,
                "Auto-sync finished"
            ),
            Err(e) => tracing::warn!(user_id = %self.user_id, error = %e, "Auto-sync failed"),
        }
    }
}

fn repository<E: SyncEntity>(
    local: &Arc<dyn LocalStore>,
    remote: &Arc<dyn RemoteStore>,
    max_push_attempts: u32,
) -> EntityRepository<E> {
    EntityRepository::new(local.clone(), remote.clone()).with_max_push_attempts(max_push_attempts)
}
