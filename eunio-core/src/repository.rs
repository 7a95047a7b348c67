//! Local-first repository for one entity type.
//!
//! Writes land in the [`LocalStore`] first and are marked pending; the push
//! to the [`RemoteStore`] is best-effort and its outcome only ever changes the
//! record's sync status. Reads are served locally and fall back to the remote
//! store on a miss.

use async_trait::async_trait;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::EunioError;
use crate::models::{EntityKind, SyncEntity, SyncStatus};
use crate::store::{EntityRecord, LocalStore, RemoteError, RemoteStore, StoreError};

/// Brings stored records up to the current schema.
pub trait RecordUpgrader: Send + Sync {
    /// Returns the upgraded record, or `None` if it is already current.
    fn upgrade(&self, record: &EntityRecord) -> Result<Option<EntityRecord>, EunioError>;
}

/// Outcome of pushing one pending record.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Synced {
        attempts: u32,
    },
    Failed {
        attempts: u32,
        error: String,
        retryable: bool,
    },
    /// The remote copy moved on since this device last synced
    Conflict {
        remote: Box<EntityRecord>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemReport {
    pub id: String,
    pub outcome: ItemOutcome,
}

/// Per-item results of draining one repository.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub kind: EntityKind,
    pub items: Vec<ItemReport>,
}

impl SyncReport {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            items: Vec::new(),
        }
    }

    pub fn attempted(&self) -> usize {
        self.items.len()
    }

    pub fn synced(&self) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(item.outcome, ItemOutcome::Synced { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.attempted() - self.synced()
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &ItemReport> {
        self.items
            .iter()
            .filter(|item| matches!(item.outcome, ItemOutcome::Conflict { .. }))
    }

    /// True when items were attempted and none of them made it.
    pub fn all_failed(&self) -> bool {
        self.attempted() > 0 && self.synced() == 0
    }

    pub fn outcome(&self, id: &str) -> Option<&ItemOutcome> {
        self.items
            .iter()
            .find(|item| item.id == id)
            .map(|item| &item.outcome)
    }
}

/// The view of a repository the sync coordinator drives.
#[async_trait]
pub trait PendingSync: Send + Sync {
    fn kind(&self) -> EntityKind;

    async fn pending_count(&self, user_id: &str) -> Result<usize, EunioError>;

    async fn sync_pending_changes(&self, user_id: &str) -> Result<SyncReport, EunioError>;
}

/// One async mutex per entity key, so writes to the same key serialize.
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    fn for_key(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }
}

/// Local-first repository for entities of type `E`.
pub struct EntityRepository<E: SyncEntity> {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    max_push_attempts: u32,
    upgrader: Option<Arc<dyn RecordUpgrader>>,
    locks: KeyLocks,
    watchers: Mutex<HashMap<String, watch::Sender<Option<E>>>>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: SyncEntity> EntityRepository<E> {
    pub fn new(local: Arc<dyn LocalStore>, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            local,
            remote,
            max_push_attempts: 3,
            upgrader: None,
            locks: KeyLocks::default(),
            watchers: Mutex::new(HashMap::new()),
            _entity: PhantomData,
        }
    }

    /// Sets how many times a transient push failure is retried per item.
    pub fn with_max_push_attempts(mut self, attempts: u32) -> Self {
        self.max_push_attempts = attempts.max(1);
        self
    }

    pub fn with_upgrader(mut self, upgrader: Arc<dyn RecordUpgrader>) -> Self {
        self.upgrader = Some(upgrader);
        self
    }

    pub fn local_store(&self) -> &Arc<dyn LocalStore> {
        &self.local
    }

    /// Writes locally, then tries the remote store once.
    ///
    /// Succeeds as soon as the local write is durable. A remote failure only
    /// shows up as `SyncStatus::Failed` on the returned entity.
    pub async fn save(&self, entity: &E) -> Result<E, EunioError> {
        let record = self.write_local(entity).await?;
        let id = record.id.clone();

        let status = match self.remote.save(&record).await {
            Ok(()) => SyncStatus::Synced,
            Err(e) => {
                warn!(kind = %E::KIND, id = %id, error = %e, "Remote save failed, keeping local copy");
                SyncStatus::Failed
            }
        };

        let applied = match self.finish_push(&record, status).await {
            Ok(applied) => applied,
            Err(e) => {
                warn!(kind = %E::KIND, id = %id, error = %e, "Could not record sync status");
                false
            }
        };

        let mut saved: E = record.to_entity().map_err(StoreError::from)?;
        saved.metadata_mut().sync_status = if applied {
            status
        } else {
            SyncStatus::Pending
        };
        Ok(saved)
    }

    /// Writes locally and leaves the entity pending for the next sync.
    pub async fn save_local(&self, entity: &E) -> Result<E, EunioError> {
        let record = self.write_local(entity).await?;
        Ok(record.to_entity().map_err(StoreError::from)?)
    }

    async fn write_local(&self, entity: &E) -> Result<EntityRecord, EunioError> {
        entity.validate()?;

        let id = entity.id();
        let record = {
            let lock = self.locks.for_key(&id);
            let _guard = lock.lock().await;

            let stored = self
                .local
                .get(E::KIND, &id)
                .await?
                .map(|r| r.last_modified);
            let previous = stored.max(Some(entity.metadata().last_modified));

            let mut entity = entity.clone();
            let meta = entity.metadata_mut();
            meta.touch(previous);
            meta.sync_status = SyncStatus::Pending;

            let record = EntityRecord::from_entity(&entity).map_err(StoreError::from)?;
            self.local.upsert(record.clone()).await?;
            record
        };
        debug!(kind = %E::KIND, id = %id, "Saved locally");
        self.publish(&record);
        Ok(record)
    }

    /// Reads the local copy, falling back to the remote store on a miss.
    ///
    /// A remote copy found on a miss is cached locally as synced. Remote
    /// failures on a miss are logged and reported as absent.
    pub async fn get(&self, id: &str) -> Result<Option<E>, EunioError> {
        if let Some(record) = self.local.get(E::KIND, id).await? {
            let record = self.upgrade_local(record).await?;
            return Ok(Some(record.to_entity().map_err(StoreError::from)?));
        }

        let remote = match self.remote.get(E::KIND, id).await {
            Ok(Some(remote)) => remote,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(kind = %E::KIND, id = %id, error = %e, "Remote lookup failed");
                return Ok(None);
            }
        };

        let mut record = remote.with_status(SyncStatus::Synced);
        if let Some(upgraded) = self.upgrade(&record)? {
            record = upgraded;
        }
        self.local.upsert(record.clone()).await?;
        debug!(kind = %E::KIND, id = %id, "Cached remote copy");
        self.publish(&record);

        Ok(Some(record.to_entity().map_err(StoreError::from)?))
    }

    /// Pushes every pending or failed entity of the user.
    ///
    /// Per-item failures are reported, not returned: the call only fails if
    /// the local store cannot be read.
    pub async fn sync_pending_changes(&self, user_id: &str) -> Result<SyncReport, EunioError> {
        let pending = self.local.list_pending(E::KIND, user_id).await?;
        let mut report = SyncReport::new(E::KIND);

        for record in pending {
            let outcome = self.push_with_retry(&record).await;
            let status = match outcome {
                ItemOutcome::Synced { .. } => SyncStatus::Synced,
                _ => SyncStatus::Failed,
            };
            if let Err(e) = self.finish_push(&record, status).await {
                warn!(kind = %E::KIND, id = %record.id, error = %e, "Could not record sync status");
            }
            report.items.push(ItemReport {
                id: record.id.clone(),
                outcome,
            });
        }

        if report.attempted() > 0 {
            info!(
                kind = %E::KIND,
                user_id = %user_id,
                synced = report.synced(),
                failed = report.failed(),
                "Pushed pending changes"
            );
        }
        Ok(report)
    }

    /// Moves failed entities back to pending. Returns how many moved.
    pub async fn retry_failed(&self, user_id: &str) -> Result<usize, EunioError> {
        let failed: Vec<EntityRecord> = self
            .local
            .list_pending(E::KIND, user_id)
            .await?
            .into_iter()
            .filter(|r| r.sync_status == SyncStatus::Failed)
            .collect();

        for record in &failed {
            self.local
                .update_sync_status(E::KIND, &record.id, SyncStatus::Pending)
                .await?;
            self.publish(&record.clone().with_status(SyncStatus::Pending));
        }
        Ok(failed.len())
    }

    /// Removes the local copy and, best-effort, the remote one.
    pub async fn delete(&self, id: &str) -> Result<(), EunioError> {
        {
            let lock = self.locks.for_key(id);
            let _guard = lock.lock().await;
            self.local.delete(E::KIND, id).await?;
        }
        self.publish_value(id, None);

        if let Err(e) = self.remote.delete(E::KIND, id).await {
            warn!(kind = %E::KIND, id = %id, error = %e, "Remote delete failed");
        }
        Ok(())
    }

    /// Subscribes to snapshots of one entity.
    ///
    /// The receiver starts with the latest known value and then sees each
    /// later write; earlier values are not replayed.
    pub async fn observe_changes(&self, id: &str) -> Result<watch::Receiver<Option<E>>, EunioError> {
        if let Some(sender) = self.watchers_lock().get(id) {
            return Ok(sender.subscribe());
        }

        let current = match self.local.get(E::KIND, id).await? {
            Some(record) => Some(record.to_entity().map_err(StoreError::from)?),
            None => None,
        };

        let mut watchers = self.watchers_lock();
        let sender = watchers
            .entry(id.to_string())
            .or_insert_with(|| watch::channel(current).0);
        Ok(sender.subscribe())
    }

    /// Re-reads the local copy and notifies observers.
    pub async fn refresh(&self, id: &str) -> Result<Option<E>, EunioError> {
        let entity: Option<E> = match self.local.get(E::KIND, id).await? {
            Some(record) => Some(record.to_entity().map_err(StoreError::from)?),
            None => None,
        };
        self.publish_value(id, entity.clone());
        Ok(entity)
    }

    async fn push_with_retry(&self, record: &EntityRecord) -> ItemOutcome {
        match record.to_entity::<E>() {
            Ok(entity) => {
                if let Err(e) = entity.validate() {
                    return ItemOutcome::Failed {
                        attempts: 1,
                        error: e.to_string(),
                        retryable: false,
                    };
                }
            }
            Err(e) => {
                return ItemOutcome::Failed {
                    attempts: 1,
                    error: e.to_string(),
                    retryable: false,
                }
            }
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.remote.save(record).await {
                Ok(()) => return ItemOutcome::Synced { attempts },
                Err(RemoteError::Conflict { remote, .. }) => {
                    debug!(kind = %E::KIND, id = %record.id, "Remote copy changed");
                    return ItemOutcome::Conflict { remote };
                }
                Err(e) if e.is_retryable() && attempts < self.max_push_attempts => {
                    debug!(kind = %E::KIND, id = %record.id, attempts, error = %e, "Retrying push");
                }
                Err(e) => {
                    return ItemOutcome::Failed {
                        attempts,
                        retryable: e.is_retryable(),
                        error: e.to_string(),
                    }
                }
            }
        }
    }

    /// Records the result of a push, unless a later local write has
    /// replaced the pushed snapshot. Returns whether the status was applied.
    async fn finish_push(
        &self,
        pushed: &EntityRecord,
        status: SyncStatus,
    ) -> Result<bool, EunioError> {
        let lock = self.locks.for_key(&pushed.id);
        let _guard = lock.lock().await;

        match self.local.get(E::KIND, &pushed.id).await? {
            Some(current) if current.last_modified == pushed.last_modified => {
                self.local
                    .update_sync_status(E::KIND, &pushed.id, status)
                    .await?;
                self.publish(&current.with_status(status));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn upgrade(&self, record: &EntityRecord) -> Result<Option<EntityRecord>, EunioError> {
        match &self.upgrader {
            Some(upgrader) => Ok(upgrader
                .upgrade(record)?
                .map(|upgraded| upgraded.with_status(SyncStatus::Pending))),
            None => Ok(None),
        }
    }

    async fn upgrade_local(&self, record: EntityRecord) -> Result<EntityRecord, EunioError> {
        if self.upgrade(&record)?.is_none() {
            return Ok(record);
        }

        let lock = self.locks.for_key(&record.id);
        let _guard = lock.lock().await;

        // Upgrade what is stored now; a write may have landed since the read
        let Some(current) = self.local.get(E::KIND, &record.id).await? else {
            return Ok(record);
        };
        let Some(upgraded) = self.upgrade(&current)? else {
            return Ok(current);
        };
        self.local.upsert(upgraded.clone()).await?;
        info!(
            kind = %E::KIND,
            id = %current.id,
            from = current.version,
            to = upgraded.version,
            "Upgraded stored record"
        );
        self.publish(&upgraded);
        Ok(upgraded)
    }

    fn publish(&self, record: &EntityRecord) {
        match record.to_entity::<E>() {
            Ok(entity) => self.publish_value(&record.id, Some(entity)),
            Err(e) => warn!(kind = %E::KIND, id = %record.id, error = %e, "Unreadable record"),
        }
    }

    fn publish_value(&self, id: &str, value: Option<E>) {
        let mut watchers = self.watchers_lock();
        watchers.retain(|_, sender| sender.receiver_count() > 0);
        if let Some(sender) = watchers.get(id) {
            sender.send_replace(value);
        }
    }

    fn watchers_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, watch::Sender<Option<E>>>> {
        self.watchers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl<E: SyncEntity> PendingSync for EntityRepository<E> {
    fn kind(&self) -> EntityKind {
        E::KIND
    }

    async fn pending_count(&self, user_id: &str) -> Result<usize, EunioError> {
        Ok(self.local.list_pending(E::KIND, user_id).await?.len())
    }

    async fn sync_pending_changes(&self, user_id: &str) -> Result<SyncReport, EunioError> {
        EntityRepository::sync_pending_changes(self, user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DailyLog, UserSettings};
    use crate::store::memory::{MemoryLocalStore, MemoryRemoteStore};
    use chrono::{Duration, NaiveDate, Utc};

    struct Fixture {
        local: Arc<MemoryLocalStore>,
        remote: Arc<MemoryRemoteStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                local: Arc::new(MemoryLocalStore::new()),
                remote: Arc::new(MemoryRemoteStore::new()),
            }
        }

        fn repo<E: SyncEntity>(&self) -> EntityRepository<E> {
            EntityRepository::new(self.local.clone(), self.remote.clone())
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 2, d).unwrap()
    }

    #[tokio::test]
    async fn test_save_online_marks_synced() {
        let fx = Fixture::new();
        let repo = fx.repo::<UserSettings>();

        let saved = repo.save(&UserSettings::new("user1")).await.unwrap();

        assert_eq!(saved.meta.sync_status, SyncStatus::Synced);
        let local = fx.local.get(EntityKind::Settings, "user1").await.unwrap();
        assert_eq!(local.unwrap().sync_status, SyncStatus::Synced);
        assert!(fx.remote.record(EntityKind::Settings, "user1").is_some());
    }

    #[tokio::test]
    async fn test_save_with_remote_unreachable_still_succeeds() {
        let fx = Fixture::new();
        fx.remote.set_offline(true);
        let repo = fx.repo::<UserSettings>();

        let saved = repo.save(&UserSettings::new("user1")).await.unwrap();

        assert_eq!(saved.meta.sync_status, SyncStatus::Failed);
        let local = repo.get("user1").await.unwrap().unwrap();
        assert_eq!(local.meta.sync_status, SyncStatus::Failed);
    }

    #[tokio::test]
    async fn test_save_rejects_invalid_entity_without_writing() {
        let fx = Fixture::new();
        let repo = fx.repo::<UserSettings>();
        let mut settings = UserSettings::new("user1");
        settings.cycle.average_cycle_length = 46;

        let err = repo.save(&settings).await.unwrap_err();

        assert!(matches!(err, EunioError::Validation(ref v) if v.field == "cycle.average_cycle_length"));
        assert!(fx
            .local
            .get(EntityKind::Settings, "user1")
            .await
            .unwrap()
            .is_none());
        assert_eq!(fx.remote.save_count(), 0);
    }

    #[tokio::test]
    async fn test_save_fails_when_local_store_fails() {
        let fx = Fixture::new();
        fx.local.set_fail_writes(true);
        let repo = fx.repo::<UserSettings>();

        let err = repo.save(&UserSettings::new("user1")).await.unwrap_err();

        assert!(matches!(err, EunioError::Store(_)));
        assert_eq!(fx.remote.save_count(), 0);
    }

    #[tokio::test]
    async fn test_last_modified_only_increases() {
        let fx = Fixture::new();
        let repo = fx.repo::<UserSettings>();

        let first = repo.save(&UserSettings::new("user1")).await.unwrap();
        let mut stale = first.clone();
        stale.meta.last_modified = first.meta.last_modified - Duration::days(1);
        let second = repo.save(&stale).await.unwrap();

        assert!(second.meta.last_modified > first.meta.last_modified);
    }

    #[tokio::test]
    async fn test_get_caches_remote_copy_as_synced() {
        let fx = Fixture::new();
        let mut settings = UserSettings::new("user1");
        settings.cycle.average_cycle_length = 30;
        fx.remote
            .insert(EntityRecord::from_entity(&settings).unwrap());
        let repo = fx.repo::<UserSettings>();

        let fetched = repo.get("user1").await.unwrap().unwrap();

        assert_eq!(fetched.cycle.average_cycle_length, 30);
        assert_eq!(fetched.meta.sync_status, SyncStatus::Synced);
        let cached = fx.local.get(EntityKind::Settings, "user1").await.unwrap();
        assert_eq!(cached.unwrap().sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_get_absent_everywhere_is_none() {
        let fx = Fixture::new();
        let repo = fx.repo::<UserSettings>();
        assert!(repo.get("nobody").await.unwrap().is_none());

        fx.remote.set_offline(true);
        assert!(repo.get("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_sync_leaves_only_rejected_item_failed() {
        let fx = Fixture::new();
        fx.remote.set_offline(true);
        let repo = fx.repo::<DailyLog>();
        let logs = [
            DailyLog::new("user1", day(1)),
            DailyLog::new("user1", day(2)),
            DailyLog::new("user1", day(3)),
        ];
        for log in &logs {
            repo.save(log).await.unwrap();
        }

        fx.remote.set_offline(false);
        fx.remote
            .fail_with(&logs[1].id(), RemoteError::Network("connection reset".into()));

        let report = repo.sync_pending_changes("user1").await.unwrap();

        assert_eq!(report.attempted(), 3);
        assert_eq!(report.synced(), 2);
        let statuses: Vec<SyncStatus> = {
            let mut out = Vec::new();
            for log in &logs {
                out.push(repo.get(&log.id()).await.unwrap().unwrap().meta.sync_status);
            }
            out
        };
        assert_eq!(
            statuses,
            vec![SyncStatus::Synced, SyncStatus::Failed, SyncStatus::Synced]
        );
        assert!(matches!(
            report.outcome(&logs[1].id()),
            Some(ItemOutcome::Failed { attempts: 3, retryable: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_second_sync_performs_no_remote_writes() {
        let fx = Fixture::new();
        fx.remote.set_offline(true);
        let repo = fx.repo::<DailyLog>();
        repo.save(&DailyLog::new("user1", day(1))).await.unwrap();
        repo.save(&DailyLog::new("user1", day(2))).await.unwrap();
        fx.remote.set_offline(false);

        repo.sync_pending_changes("user1").await.unwrap();
        let after_first = fx.remote.save_count();
        let report = repo.sync_pending_changes("user1").await.unwrap();

        assert_eq!(after_first, 2);
        assert_eq!(report.attempted(), 0);
        assert_eq!(fx.remote.save_count(), after_first);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_within_call() {
        let fx = Fixture::new();
        fx.remote.set_offline(true);
        let repo = fx.repo::<UserSettings>();
        repo.save(&UserSettings::new("user1")).await.unwrap();
        fx.remote.set_offline(false);
        fx.remote
            .fail_times("user1", 2, RemoteError::Network("timeout".into()));

        let report = repo.sync_pending_changes("user1").await.unwrap();

        assert_eq!(
            report.outcome("user1"),
            Some(&ItemOutcome::Synced { attempts: 3 })
        );
    }

    #[tokio::test]
    async fn test_rejections_are_not_retried() {
        let fx = Fixture::new();
        fx.remote.set_offline(true);
        let repo = fx.repo::<UserSettings>();
        repo.save(&UserSettings::new("user1")).await.unwrap();
        fx.remote.set_offline(false);
        fx.remote.fail_times(
            "user1",
            5,
            RemoteError::Rejected {
                field: "cycle".into(),
                message: "bad".into(),
            },
        );

        let report = repo.sync_pending_changes("user1").await.unwrap();

        assert!(matches!(
            report.outcome("user1"),
            Some(ItemOutcome::Failed { attempts: 1, retryable: false, .. })
        ));
    }

    #[tokio::test]
    async fn test_remote_newer_copy_reports_conflict() {
        let fx = Fixture::new();
        fx.remote.set_offline(true);
        let repo = fx.repo::<UserSettings>();
        repo.save(&UserSettings::new("user1")).await.unwrap();

        let mut other_device = UserSettings::new("user1");
        other_device.meta.last_modified = Utc::now() + Duration::hours(2);
        fx.remote
            .insert(EntityRecord::from_entity(&other_device).unwrap());
        fx.remote.set_offline(false);

        let report = repo.sync_pending_changes("user1").await.unwrap();

        assert_eq!(report.conflicts().count(), 1);
        let local = repo.get("user1").await.unwrap().unwrap();
        assert_eq!(local.meta.sync_status, SyncStatus::Failed);
    }

    #[tokio::test]
    async fn test_retry_failed_moves_back_to_pending() {
        let fx = Fixture::new();
        fx.remote.set_offline(true);
        let repo = fx.repo::<UserSettings>();
        repo.save(&UserSettings::new("user1")).await.unwrap();

        assert_eq!(repo.retry_failed("user1").await.unwrap(), 1);
        let local = repo.get("user1").await.unwrap().unwrap();
        assert_eq!(local.meta.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_concurrent_saves_to_same_key_serialize() {
        let fx = Fixture::new();
        let repo = Arc::new(fx.repo::<UserSettings>());
        let mut a = UserSettings::new("user1");
        a.cycle.average_cycle_length = 30;
        let mut b = UserSettings::new("user1");
        b.cycle.average_cycle_length = 32;

        let (ra, rb) = tokio::join!(repo.save(&a), repo.save(&b));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert_ne!(ra.meta.last_modified, rb.meta.last_modified);
        let winner = if ra.meta.last_modified > rb.meta.last_modified {
            ra
        } else {
            rb
        };
        let stored = repo.get("user1").await.unwrap().unwrap();
        assert_eq!(stored.cycle, winner.cycle);
        assert_eq!(stored.meta.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_observe_changes_starts_with_latest_value() {
        let fx = Fixture::new();
        let repo = fx.repo::<UserSettings>();
        repo.save(&UserSettings::new("user1")).await.unwrap();

        let mut rx = repo.observe_changes("user1").await.unwrap();
        assert!(rx.borrow_and_update().is_some());

        let mut changed = UserSettings::new("user1");
        changed.display.text_scale_percent = 150;
        repo.save(&changed).await.unwrap();

        rx.changed().await.unwrap();
        let latest = rx.borrow_and_update().clone().unwrap();
        assert_eq!(latest.display.text_scale_percent, 150);

        repo.delete("user1").await.unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_none());
    }

    struct BumpVersion;

    impl RecordUpgrader for BumpVersion {
        fn upgrade(&self, record: &EntityRecord) -> Result<Option<EntityRecord>, EunioError> {
            if record.version >= 2 {
                return Ok(None);
            }
            let mut upgraded = record.clone();
            upgraded.version = 2;
            Ok(Some(upgraded))
        }
    }

    #[tokio::test]
    async fn test_get_upgrades_old_records() {
        let fx = Fixture::new();
        let mut old = UserSettings::new("user1");
        old.meta.version = 1;
        old.meta.sync_status = SyncStatus::Synced;
        fx.local
            .upsert(EntityRecord::from_entity(&old).unwrap())
            .await
            .unwrap();
        let repo = fx.repo::<UserSettings>().with_upgrader(Arc::new(BumpVersion));

        let upgraded = repo.get("user1").await.unwrap().unwrap();

        assert_eq!(upgraded.meta.version, 2);
        assert_eq!(upgraded.meta.sync_status, SyncStatus::Pending);
        assert_eq!(repo.pending_count("user1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upgrade_does_not_overwrite_a_newer_write() {
        let fx = Fixture::new();
        let mut old = UserSettings::new("user1");
        old.meta.version = 1;
        fx.local
            .upsert(EntityRecord::from_entity(&old).unwrap())
            .await
            .unwrap();
        let repo = Arc::new(fx.repo::<UserSettings>().with_upgrader(Arc::new(BumpVersion)));

        let lock = repo.locks.for_key("user1");
        let guard = lock.lock().await;
        let reader = {
            let repo = repo.clone();
            tokio::spawn(async move { repo.get("user1").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut newer = UserSettings::new("user1");
        newer.cycle.average_cycle_length = 31;
        newer.meta.last_modified = old.meta.last_modified + Duration::seconds(1);
        fx.local
            .upsert(EntityRecord::from_entity(&newer).unwrap())
            .await
            .unwrap();
        drop(guard);

        let read = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(read.cycle.average_cycle_length, 31);
        let stored = fx.local.get(EntityKind::Settings, "user1").await.unwrap().unwrap();
        assert_eq!(stored.last_modified, newer.meta.last_modified);
        assert_eq!(stored.payload["cycle"]["average_cycle_length"], 31);
    }

    #[tokio::test]
    async fn test_dropped_observers_are_forgotten() {
        let fx = Fixture::new();
        let repo = fx.repo::<UserSettings>();
        repo.save(&UserSettings::new("user1")).await.unwrap();

        let rx = repo.observe_changes("user1").await.unwrap();
        assert_eq!(repo.watchers_lock().len(), 1);
        drop(rx);

        repo.save(&UserSettings::new("user1")).await.unwrap();
        assert!(repo.watchers_lock().is_empty());
    }
}
