//! Sync passes across all registered repositories.
//!
//! Each user has an independent session with its own [`SyncState`]; a pass for
//! one user never waits on another's. Within a pass repositories are drained in
//! registration order.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::conflict::ConflictResolver;
use crate::error::{EunioError, SyncError};
use crate::models::EntityKind;
use crate::repository::{ItemOutcome, PendingSync, SyncReport};
use crate::store::{Connectivity, NetworkType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Completed,
    Error,
    Offline,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Idle => write!(f, "idle"),
            SyncState::Syncing => write!(f, "syncing"),
            SyncState::Completed => write!(f, "completed"),
            SyncState::Error => write!(f, "error"),
            SyncState::Offline => write!(f, "offline"),
        }
    }
}

/// Summary of one sync pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatistics {
    pub last_sync_time: DateTime<Utc>,
    pub duration: Duration,
    pub is_online: bool,
    pub network_type: NetworkType,
    pub repositories_synced: usize,
    pub repositories_failed: usize,
    pub items_synced: usize,
    pub items_failed: usize,
    pub conflicts_resolved: usize,
}

impl SyncStatistics {
    fn new(is_online: bool, network_type: NetworkType) -> Self {
        Self {
            last_sync_time: Utc::now(),
            duration: Duration::ZERO,
            is_online,
            network_type,
            repositories_synced: 0,
            repositories_failed: 0,
            items_synced: 0,
            items_failed: 0,
            conflicts_resolved: 0,
        }
    }
}

struct UserSession {
    state: watch::Sender<SyncState>,
    last_statistics: Option<SyncStatistics>,
}

impl UserSession {
    fn new() -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        Self {
            state,
            last_statistics: None,
        }
    }
}

/// Marks a user's session as syncing for as long as it lives. Dropping it
/// without [`PassGuard::finish`] puts the session back to idle.
struct PassGuard<'a> {
    coordinator: &'a SyncCoordinator,
    user_id: String,
    finished: bool,
}

impl PassGuard<'_> {
    fn finish(mut self, state: SyncState) {
        self.coordinator.set_state(&self.user_id, state);
        self.finished = true;
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(user_id = %self.user_id, "Sync pass abandoned");
            self.coordinator.set_state(&self.user_id, SyncState::Idle);
        }
    }
}

pub struct SyncCoordinator {
    repositories: Vec<Arc<dyn PendingSync>>,
    connectivity: Arc<dyn Connectivity>,
    resolver: Option<Arc<ConflictResolver>>,
    sessions: Mutex<HashMap<String, UserSession>>,
    poll_interval: Duration,
    recovery_timeout: Duration,
}

impl SyncCoordinator {
    pub fn new(connectivity: Arc<dyn Connectivity>, config: &EngineConfig) -> Self {
        Self {
            repositories: Vec::new(),
            connectivity,
            resolver: None,
            sessions: Mutex::new(HashMap::new()),
            poll_interval: config.recovery_poll_interval(),
            recovery_timeout: config.recovery_timeout(),
        }
    }

    /// Adds a repository; passes drain repositories in the order added.
    pub fn with_repository(mut self, repository: Arc<dyn PendingSync>) -> Self {
        self.repositories.push(repository);
        self
    }

    /// Resolves settings conflicts found during a pass.
    pub fn with_conflict_resolver(mut self, resolver: Arc<ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn state(&self, user_id: &str) -> SyncState {
        self.sessions()
            .get(user_id)
            .map(|session| *session.state.borrow())
            .unwrap_or_default()
    }

    pub fn observe_state(&self, user_id: &str) -> watch::Receiver<SyncState> {
        self.sessions()
            .entry(user_id.to_string())
            .or_insert_with(UserSession::new)
            .state
            .subscribe()
    }

    pub fn last_statistics(&self, user_id: &str) -> Option<SyncStatistics> {
        self.sessions()
            .get(user_id)
            .and_then(|session| session.last_statistics.clone())
    }

    /// Returns a finished session to idle. A running pass is left alone.
    pub fn reset(&self, user_id: &str) {
        if let Some(session) = self.sessions().get(user_id) {
            session.state.send_if_modified(|state| {
                if *state == SyncState::Syncing || *state == SyncState::Idle {
                    return false;
                }
                *state = SyncState::Idle;
                true
            });
        }
    }

    /// Pushes every repository's pending changes for the user.
    ///
    /// Skips the pass when nothing is pending. Partial failure is success;
    /// only a pass in which no repository made progress is an error.
    pub async fn perform_full_sync(&self, user_id: &str) -> Result<SyncStatistics, EunioError> {
        self.run_pass(user_id, false).await
    }

    /// Like [`perform_full_sync`](Self::perform_full_sync) but never skipped.
    pub async fn force_sync(&self, user_id: &str) -> Result<SyncStatistics, EunioError> {
        self.run_pass(user_id, true).await
    }

    /// Waits for connectivity, then runs one forced sync.
    pub async fn recover_from_sync_failure(
        &self,
        user_id: &str,
    ) -> Result<SyncStatistics, EunioError> {
        let deadline = Instant::now() + self.recovery_timeout;
        loop {
            if self.connectivity.is_connected().await {
                info!(user_id = %user_id, "Connectivity back, retrying sync");
                return self.force_sync(user_id).await;
            }
            if Instant::now() >= deadline {
                warn!(user_id = %user_id, timeout = ?self.recovery_timeout, "Gave up waiting for connectivity");
                self.set_state(user_id, SyncState::Offline);
                return Err(SyncError::RecoveryTimedOut(self.recovery_timeout).into());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Syncs the user whenever connectivity comes back.
    pub fn spawn_auto_sync(self: &Arc<Self>, user_id: impl Into<String>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let user_id = user_id.into();
        let mut changes = self.connectivity.observe_connectivity();

        tokio::spawn(async move {
            let mut was_online = false;
            while let Some(online) = changes.next().await {
                if online && !was_online {
                    match coordinator.perform_full_sync(&user_id).await {
                        Ok(stats) => debug!(
                            user_id = %user_id,
                            items_synced = stats.items_synced,
                            "Auto sync finished"
                        ),
                        Err(e) => warn!(user_id = %user_id, error = %e, "Auto sync failed"),
                    }
                }
                was_online = online;
            }
        })
    }

    async fn run_pass(&self, user_id: &str, force: bool) -> Result<SyncStatistics, EunioError> {
        let guard = self.begin_pass(user_id)?;
        let started = Instant::now();

        let is_online = self.connectivity.is_connected().await;
        let network_type = self.connectivity.network_type().await;
        let mut stats = SyncStatistics::new(is_online, network_type);

        if !is_online {
            info!(user_id = %user_id, "Device offline, sync skipped");
            self.store_statistics(user_id, stats);
            guard.finish(SyncState::Offline);
            return Err(SyncError::Offline.into());
        }

        if !force {
            match self.pending_count(user_id).await {
                Ok(0) => {
                    debug!(user_id = %user_id, "Nothing to sync");
                    stats.duration = started.elapsed();
                    self.store_statistics(user_id, stats.clone());
                    guard.finish(SyncState::Completed);
                    return Ok(stats);
                }
                Ok(_) => {}
                Err(e) => {
                    guard.finish(SyncState::Error);
                    return Err(e);
                }
            }
        }

        let mut failures = Vec::new();
        for repository in &self.repositories {
            let kind = repository.kind();
            match repository.sync_pending_changes(user_id).await {
                Ok(mut report) => {
                    if kind == EntityKind::Settings {
                        stats.conflicts_resolved += self.resolve_conflicts(user_id, &mut report).await;
                    }
                    tally(&report, &mut stats, &mut failures);
                }
                Err(e) => {
                    warn!(user_id = %user_id, kind = %kind, error = %e, "Repository sync failed");
                    stats.repositories_failed += 1;
                    failures.push(format!("{}: {}", kind, e));
                }
            }
        }

        stats.duration = started.elapsed();
        stats.last_sync_time = Utc::now();
        self.store_statistics(user_id, stats.clone());

        let total = stats.repositories_synced + stats.repositories_failed;
        if total > 0 && stats.repositories_synced == 0 {
            warn!(user_id = %user_id, failed = stats.repositories_failed, "Sync pass failed");
            guard.finish(SyncState::Error);
            return Err(SyncError::Failed {
                failed: stats.repositories_failed,
                total,
                failures,
            }
            .into());
        }

        info!(
            user_id = %user_id,
            items_synced = stats.items_synced,
            items_failed = stats.items_failed,
            conflicts_resolved = stats.conflicts_resolved,
            duration_ms = stats.duration.as_millis() as u64,
            "Sync pass completed"
        );
        guard.finish(SyncState::Completed);
        Ok(stats)
    }

    /// Hands a settings conflict to the resolver. Resolved items count as
    /// synced. Returns how many were resolved.
    async fn resolve_conflicts(&self, user_id: &str, report: &mut SyncReport) -> usize {
        let Some(resolver) = &self.resolver else {
            return 0;
        };
        if report.conflicts().next().is_none() {
            return 0;
        }

        let conflict = match resolver.detect_conflict(user_id).await {
            Ok(Some(conflict)) => conflict,
            Ok(None) => return 0,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Conflict check failed");
                return 0;
            }
        };

        let strategy = resolver.get_recommended_strategy(&conflict);
        match resolver.resolve_conflict(&conflict, strategy).await {
            Ok(_) => {
                let mut resolved = 0;
                for item in &mut report.items {
                    if matches!(item.outcome, ItemOutcome::Conflict { .. }) {
                        item.outcome = ItemOutcome::Synced { attempts: 1 };
                        resolved += 1;
                    }
                }
                resolved
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Conflict resolution failed");
                0
            }
        }
    }

    async fn pending_count(&self, user_id: &str) -> Result<usize, EunioError> {
        let mut pending = 0;
        for repository in &self.repositories {
            pending += repository.pending_count(user_id).await?;
        }
        Ok(pending)
    }

    fn begin_pass(&self, user_id: &str) -> Result<PassGuard<'_>, SyncError> {
        let mut sessions = self.sessions();
        let session = sessions
            .entry(user_id.to_string())
            .or_insert_with(UserSession::new);

        if *session.state.borrow() == SyncState::Syncing {
            return Err(SyncError::AlreadySyncing(user_id.to_string()));
        }
        session.state.send_replace(SyncState::Syncing);

        Ok(PassGuard {
            coordinator: self,
            user_id: user_id.to_string(),
            finished: false,
        })
    }

    fn set_state(&self, user_id: &str, state: SyncState) {
        self.sessions()
            .entry(user_id.to_string())
            .or_insert_with(UserSession::new)
            .state
            .send_replace(state);
    }

    fn store_statistics(&self, user_id: &str, stats: SyncStatistics) {
        if let Some(session) = self.sessions().get_mut(user_id) {
            session.last_statistics = Some(stats);
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, UserSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Folds one repository report into the pass statistics. Repositories with
/// nothing to push count as neither synced nor failed.
fn tally(report: &SyncReport, stats: &mut SyncStatistics, failures: &mut Vec<String>) {
    stats.items_synced += report.synced();
    stats.items_failed += report.failed();

    for item in &report.items {
        match &item.outcome {
            ItemOutcome::Synced { .. } => {}
            ItemOutcome::Failed { error, .. } => {
                failures.push(format!("{} {}: {}", report.kind, item.id, error))
            }
            ItemOutcome::Conflict { .. } => {
                failures.push(format!("{} {}: remote copy changed", report.kind, item.id))
            }
        }
    }

    if report.all_failed() {
        stats.repositories_failed += 1;
    } else if report.attempted() > 0 {
        stats.repositories_synced += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupManager;
    use crate::models::{DailyLog, SectionUpdate, SyncStatus, UnitPreferences, UserSettings};
    use crate::repository::EntityRepository;
    use crate::store::memory::{MemoryLocalStore, MemoryRemoteStore, StaticConnectivity};
    use crate::store::{EntityRecord, RemoteError};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use tokio::sync::Notify;

    struct Fixture {
        remote: Arc<MemoryRemoteStore>,
        connectivity: Arc<StaticConnectivity>,
        settings: Arc<EntityRepository<UserSettings>>,
        logs: Arc<EntityRepository<DailyLog>>,
        coordinator: Arc<SyncCoordinator>,
    }

    fn config() -> EngineConfig {
        EngineConfig {
            recovery_poll_interval_ms: 10,
            recovery_timeout_ms: 500,
            ..EngineConfig::default()
        }
    }

    fn fixture() -> Fixture {
        let local = Arc::new(MemoryLocalStore::new());
        let remote = Arc::new(MemoryRemoteStore::new());
        let connectivity = Arc::new(StaticConnectivity::online());
        let settings = Arc::new(EntityRepository::new(local.clone(), remote.clone()));
        let logs = Arc::new(EntityRepository::new(local.clone(), remote.clone()));
        let config = config();
        let backups = Arc::new(BackupManager::new(settings.clone(), remote.clone(), &config));
        let resolver = Arc::new(
            ConflictResolver::new(settings.clone(), remote.clone(), &config).with_backups(backups),
        );
        let coordinator = Arc::new(
            SyncCoordinator::new(connectivity.clone(), &config)
                .with_repository(settings.clone())
                .with_repository(logs.clone())
                .with_conflict_resolver(resolver),
        );
        Fixture {
            remote,
            connectivity,
            settings,
            logs,
            coordinator,
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    /// Saves while the remote is unreachable, leaving the entities failed.
    async fn save_offline(fx: &Fixture) {
        fx.remote.set_offline(true);
        fx.settings.save(&UserSettings::new("user1")).await.unwrap();
        fx.logs.save(&DailyLog::new("user1", day(1))).await.unwrap();
        fx.logs.save(&DailyLog::new("user1", day(2))).await.unwrap();
        fx.remote.set_offline(false);
    }

    #[tokio::test]
    async fn test_full_sync_pushes_everything() {
        let fx = fixture();
        save_offline(&fx).await;

        let stats = fx.coordinator.perform_full_sync("user1").await.unwrap();

        assert_eq!(stats.items_synced, 3);
        assert_eq!(stats.items_failed, 0);
        assert_eq!(stats.repositories_synced, 2);
        assert!(stats.is_online);
        assert_eq!(stats.network_type, NetworkType::Wifi);
        assert_eq!(fx.coordinator.state("user1"), SyncState::Completed);
        assert_eq!(fx.coordinator.last_statistics("user1"), Some(stats));
    }

    #[tokio::test]
    async fn test_nothing_pending_skips_pass() {
        let fx = fixture();
        let stats = fx.coordinator.perform_full_sync("user1").await.unwrap();

        assert_eq!(stats.items_synced, 0);
        assert_eq!(fx.remote.save_count(), 0);
        assert_eq!(fx.coordinator.state("user1"), SyncState::Completed);

        let forced = fx.coordinator.force_sync("user1").await.unwrap();
        assert_eq!(forced.repositories_synced, 0);
    }

    #[tokio::test]
    async fn test_offline_fails_fast() {
        let fx = fixture();
        save_offline(&fx).await;
        fx.connectivity.set_connected(false);

        let err = fx.coordinator.perform_full_sync("user1").await.unwrap_err();

        assert!(matches!(err, EunioError::Sync(SyncError::Offline)));
        assert_eq!(fx.coordinator.state("user1"), SyncState::Offline);
        assert_eq!(fx.remote.save_count(), 0);
    }

    #[tokio::test]
    async fn test_total_failure_is_an_error() {
        let fx = fixture();
        save_offline(&fx).await;
        fx.remote.set_offline(true);

        let err = fx.coordinator.perform_full_sync("user1").await.unwrap_err();

        match err {
            EunioError::Sync(SyncError::Failed {
                failed,
                total,
                failures,
            }) => {
                assert_eq!(failed, 2);
                assert_eq!(total, 2);
                assert_eq!(failures.len(), 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fx.coordinator.state("user1"), SyncState::Error);
    }

    #[tokio::test]
    async fn test_partial_failure_is_success() {
        let fx = fixture();
        save_offline(&fx).await;
        fx.remote
            .fail_with("user1", RemoteError::Network("timeout".into()));

        let stats = fx.coordinator.perform_full_sync("user1").await.unwrap();

        assert_eq!(stats.repositories_synced, 1);
        assert_eq!(stats.repositories_failed, 1);
        assert_eq!(stats.items_synced, 2);
        assert_eq!(stats.items_failed, 1);
        assert_eq!(fx.coordinator.state("user1"), SyncState::Completed);
        let settings = fx.settings.get("user1").await.unwrap().unwrap();
        assert_eq!(settings.meta.sync_status, SyncStatus::Failed);
    }

    #[tokio::test]
    async fn test_settings_conflict_is_resolved_during_pass() {
        let fx = fixture();
        fx.remote.set_offline(true);
        let mut mine = UserSettings::new("user1");
        mine.apply(SectionUpdate::Units(UnitPreferences::default()));
        fx.settings.save(&mine).await.unwrap();
        fx.remote.set_offline(false);

        let mut theirs = UserSettings::new("user1");
        theirs.cycle.average_cycle_length = 35;
        theirs.meta.last_modified = Utc::now() + chrono::Duration::minutes(10);
        fx.remote.insert(EntityRecord::from_entity(&theirs).unwrap());

        let stats = fx.coordinator.perform_full_sync("user1").await.unwrap();

        assert_eq!(stats.conflicts_resolved, 1);
        assert_eq!(stats.items_failed, 0);
        let settings = fx.settings.get("user1").await.unwrap().unwrap();
        assert_eq!(settings.meta.sync_status, SyncStatus::Synced);
        // Only the local side was customized
        assert!(settings.units.is_customized);
    }

    /// Blocks `user1` passes until released.
    struct GatedRepository {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl PendingSync for GatedRepository {
        fn kind(&self) -> EntityKind {
            EntityKind::Cycle
        }

        async fn pending_count(&self, _user_id: &str) -> Result<usize, EunioError> {
            Ok(1)
        }

        async fn sync_pending_changes(&self, user_id: &str) -> Result<SyncReport, EunioError> {
            if user_id == "user1" {
                self.gate.notified().await;
            }
            Ok(SyncReport::new(EntityKind::Cycle))
        }
    }

    fn gated() -> (Arc<SyncCoordinator>, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let coordinator = SyncCoordinator::new(Arc::new(StaticConnectivity::online()), &config())
            .with_repository(Arc::new(GatedRepository { gate: gate.clone() }));
        (Arc::new(coordinator), gate)
    }

    #[tokio::test]
    async fn test_second_pass_for_same_user_is_rejected() {
        let (coordinator, gate) = gated();
        let mut state = coordinator.observe_state("user1");

        let running = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.perform_full_sync("user1").await }
        });
        state
            .wait_for(|s| *s == SyncState::Syncing)
            .await
            .unwrap();

        let err = coordinator.perform_full_sync("user1").await.unwrap_err();
        assert!(matches!(
            err,
            EunioError::Sync(SyncError::AlreadySyncing(ref user)) if user == "user1"
        ));
        // Other users are not blocked
        assert!(coordinator.perform_full_sync("user2").await.is_ok());

        gate.notify_one();
        assert!(running.await.unwrap().is_ok());
        assert_eq!(coordinator.state("user1"), SyncState::Completed);
    }

    #[tokio::test]
    async fn test_abandoned_pass_returns_to_idle() {
        let (coordinator, _gate) = gated();

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            coordinator.perform_full_sync("user1"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(coordinator.state("user1"), SyncState::Idle);
    }

    #[tokio::test]
    async fn test_recovery_times_out_while_offline() {
        let fx = fixture();
        fx.connectivity.set_connected(false);

        let err = fx
            .coordinator
            .recover_from_sync_failure("user1")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EunioError::Sync(SyncError::RecoveryTimedOut(_))
        ));
        assert_eq!(fx.coordinator.state("user1"), SyncState::Offline);
    }

    #[tokio::test]
    async fn test_recovery_syncs_once_connectivity_returns() {
        let fx = fixture();
        save_offline(&fx).await;
        fx.connectivity.set_connected(false);

        let connectivity = fx.connectivity.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            connectivity.set_connected(true);
        });

        let stats = fx
            .coordinator
            .recover_from_sync_failure("user1")
            .await
            .unwrap();
        assert_eq!(stats.items_synced, 3);
    }

    #[tokio::test]
    async fn test_auto_sync_runs_when_back_online() {
        let fx = fixture();
        save_offline(&fx).await;
        fx.connectivity.set_connected(false);
        let mut state = fx.coordinator.observe_state("user1");

        let task = fx.coordinator.spawn_auto_sync("user1");
        fx.connectivity.set_connected(true);

        state
            .wait_for(|s| *s == SyncState::Completed)
            .await
            .unwrap();
        assert_eq!(fx.remote.save_count(), 3);
        task.abort();
    }

    #[tokio::test]
    async fn test_reset_returns_to_idle() {
        let fx = fixture();
        fx.connectivity.set_connected(false);
        let _ = fx.coordinator.perform_full_sync("user1").await;
        assert_eq!(fx.coordinator.state("user1"), SyncState::Offline);

        fx.coordinator.reset("user1");
        assert_eq!(fx.coordinator.state("user1"), SyncState::Idle);
    }
}
