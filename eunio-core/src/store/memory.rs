//! In-memory collaborators.
//!
//! Used as the local store of short-lived sessions and as test doubles. The
//! remote store can be switched offline and told to fail specific records,
//! which is how partial-failure scenarios are driven.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

use super::{
    BackupRecord, BackupType, Connectivity, EntityRecord, HistoryRecord, LocalStore,
    NetworkType, RemoteError, RemoteStore, StoreError,
};
use crate::models::{EntityKind, SyncStatus};

type Key = (EntityKind, String);

#[derive(Default)]
struct LocalState {
    records: HashMap<Key, (u64, EntityRecord)>,
    next_seq: u64,
    backups: Vec<BackupRecord>,
}

/// Local store kept in process memory.
#[derive(Default)]
pub struct MemoryLocalStore {
    state: Mutex<LocalState>,
    fail_writes: AtomicBool,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write fail, as a full disk would.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database("local store is read-only".to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LocalState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Database("local store lock poisoned".to_string()))
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .records
            .get(&(kind, id.to_string()))
            .map(|(_, record)| record.clone()))
    }

    async fn upsert(&self, record: EntityRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut state = self.lock()?;
        let key = (record.kind, record.id.clone());
        let seq = match state.records.get(&key) {
            Some((seq, _)) => *seq,
            None => {
                state.next_seq += 1;
                state.next_seq
            }
        };
        state.records.insert(key, (seq, record));
        Ok(())
    }

    async fn update_sync_status(
        &self,
        kind: EntityKind,
        id: &str,
        status: SyncStatus,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut state = self.lock()?;
        if let Some((_, record)) = state.records.get_mut(&(kind, id.to_string())) {
            record.sync_status = status;
        }
        Ok(())
    }

    async fn list_pending(
        &self,
        kind: EntityKind,
        user_id: &str,
    ) -> Result<Vec<EntityRecord>, StoreError> {
        let state = self.lock()?;
        let mut pending: Vec<&(u64, EntityRecord)> = state
            .records
            .values()
            .filter(|(_, r)| r.kind == kind && r.user_id == user_id && r.sync_status.needs_push())
            .collect();
        pending.sort_by_key(|(seq, _)| *seq);
        Ok(pending.into_iter().map(|(_, r)| r.clone()).collect())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut state = self.lock()?;
        state.records.remove(&(kind, id.to_string()));
        Ok(())
    }

    async fn delete_user(&self, user_id: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut state = self.lock()?;
        state.records.retain(|_, (_, r)| r.user_id != user_id);
        state.backups.retain(|b| b.user_id != user_id);
        Ok(())
    }

    async fn create_backup_record(&self, record: BackupRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut state = self.lock()?;
        state.backups.push(record);
        Ok(())
    }

    async fn list_backups(&self, user_id: &str) -> Result<Vec<BackupRecord>, StoreError> {
        let state = self.lock()?;
        // Reverse insertion order breaks created_at ties newest-first
        let mut backups: Vec<BackupRecord> = state
            .backups
            .iter()
            .rev()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    async fn delete_backup(&self, id: Uuid) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut state = self.lock()?;
        state.backups.retain(|b| b.id != id);
        Ok(())
    }

    async fn cleanup_old_backups(
        &self,
        user_id: &str,
        keep_count: usize,
    ) -> Result<usize, StoreError> {
        let expired: Vec<Uuid> = self
            .list_backups(user_id)
            .await?
            .into_iter()
            .filter(|b| b.backup_type == BackupType::Automatic)
            .skip(keep_count)
            .map(|b| b.id)
            .collect();

        self.check_writable()?;
        let mut state = self.lock()?;
        state.backups.retain(|b| !expired.contains(&b.id));
        Ok(expired.len())
    }
}

#[derive(Default)]
struct RemoteState {
    records: HashMap<Key, EntityRecord>,
    history: Vec<HistoryRecord>,
    backups: Vec<BackupRecord>,
    exports: Vec<(String, String)>,
    /// Failures returned for a record id, consumed front to back
    scripted: HashMap<String, VecDeque<RemoteError>>,
    /// Failures returned for a record id on every save
    persistent: HashMap<String, RemoteError>,
}

/// Remote store kept in process memory, with failure injection.
#[derive(Default)]
pub struct MemoryRemoteStore {
    state: Mutex<RemoteState>,
    offline: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with a network error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every save of `id` fails with `error` until cleared.
    pub fn fail_with(&self, id: &str, error: RemoteError) {
        if let Ok(mut state) = self.state.lock() {
            state.persistent.insert(id.to_string(), error);
        }
    }

    /// The next `times` saves of `id` fail with `error`.
    pub fn fail_times(&self, id: &str, times: usize, error: RemoteError) {
        if let Ok(mut state) = self.state.lock() {
            let queue = state.scripted.entry(id.to_string()).or_default();
            for _ in 0..times {
                queue.push_back(error.clone());
            }
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.scripted.clear();
            state.persistent.clear();
        }
    }

    /// Seeds a record as if another device had written it.
    pub fn insert(&self, record: EntityRecord) {
        if let Ok(mut state) = self.state.lock() {
            state
                .records
                .insert((record.kind, record.id.clone()), record);
        }
    }

    pub fn record(&self, kind: EntityKind, id: &str) -> Option<EntityRecord> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.records.get(&(kind, id.to_string())).cloned())
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn history(&self) -> Vec<HistoryRecord> {
        self.state
            .lock()
            .map(|state| state.history.clone())
            .unwrap_or_default()
    }

    pub fn backups(&self) -> Vec<BackupRecord> {
        self.state
            .lock()
            .map(|state| state.backups.clone())
            .unwrap_or_default()
    }

    fn check_online(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("remote store unreachable".to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, RemoteState>, RemoteError> {
        self.state
            .lock()
            .map_err(|_| RemoteError::Network("remote store lock poisoned".to_string()))
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>, RemoteError> {
        self.check_online()?;
        let state = self.lock()?;
        Ok(state.records.get(&(kind, id.to_string())).cloned())
    }

    async fn save(&self, record: &EntityRecord) -> Result<(), RemoteError> {
        self.check_online()?;
        let mut state = self.lock()?;

        if let Some(error) = state
            .scripted
            .get_mut(&record.id)
            .and_then(|queue| queue.pop_front())
        {
            return Err(error);
        }
        if let Some(error) = state.persistent.get(&record.id) {
            return Err(error.clone());
        }

        let key = (record.kind, record.id.clone());
        if let Some(existing) = state.records.get(&key) {
            if existing.last_modified > record.last_modified {
                return Err(RemoteError::Conflict {
                    id: record.id.clone(),
                    remote: Box::new(existing.clone()),
                });
            }
        }

        state
            .records
            .insert(key, record.clone().with_status(SyncStatus::Synced));
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), RemoteError> {
        self.check_online()?;
        let mut state = self.lock()?;
        state.records.remove(&(kind, id.to_string()));
        Ok(())
    }

    async fn create_history_record(&self, record: HistoryRecord) -> Result<(), RemoteError> {
        self.check_online()?;
        let mut state = self.lock()?;
        state.history.push(record);
        Ok(())
    }

    async fn create_shareable_export(
        &self,
        user_id: &str,
        payload: &str,
    ) -> Result<String, RemoteError> {
        self.check_online()?;
        let mut state = self.lock()?;
        let link = format!("memory://exports/{}/{}", user_id, Uuid::new_v4());
        state.exports.push((link.clone(), payload.to_string()));
        Ok(link)
    }

    async fn upload_backup(&self, record: &BackupRecord) -> Result<(), RemoteError> {
        self.check_online()?;
        let mut state = self.lock()?;
        state.backups.push(record.clone());
        Ok(())
    }

    async fn latest_backup(&self, user_id: &str) -> Result<Option<BackupRecord>, RemoteError> {
        self.check_online()?;
        let state = self.lock()?;
        Ok(state
            .backups
            .iter()
            .filter(|b| b.user_id == user_id)
            .max_by_key(|b| b.created_at)
            .cloned())
    }
}

/// Connectivity that reports whatever it was last told.
pub struct StaticConnectivity {
    state: watch::Sender<bool>,
    network_type: Mutex<NetworkType>,
}

impl StaticConnectivity {
    pub fn new(connected: bool) -> Self {
        let (state, _) = watch::channel(connected);
        let network_type = if connected {
            NetworkType::Wifi
        } else {
            NetworkType::None
        };
        Self {
            state,
            network_type: Mutex::new(network_type),
        }
    }

    pub fn online() -> Self {
        Self::new(true)
    }

    pub fn offline() -> Self {
        Self::new(false)
    }

    pub fn set_connected(&self, connected: bool) {
        if let Ok(mut network_type) = self.network_type.lock() {
            *network_type = match (connected, *network_type) {
                (false, _) => NetworkType::None,
                (true, NetworkType::None) => NetworkType::Wifi,
                (true, current) => current,
            };
        }
        self.state.send_replace(connected);
    }

    pub fn set_network_type(&self, network_type: NetworkType) {
        if let Ok(mut current) = self.network_type.lock() {
            *current = network_type;
        }
        self.state.send_replace(network_type != NetworkType::None);
    }
}

#[async_trait]
impl Connectivity for StaticConnectivity {
    async fn is_connected(&self) -> bool {
        *self.state.borrow()
    }

    async fn network_type(&self) -> NetworkType {
        self.network_type
            .lock()
            .map(|t| *t)
            .unwrap_or(NetworkType::None)
    }

    fn observe_connectivity(&self) -> BoxStream<'static, bool> {
        let receiver = self.state.subscribe();
        stream::unfold((receiver, true), |(mut receiver, first)| async move {
            if !first {
                receiver.changed().await.ok()?;
            }
            let connected = *receiver.borrow_and_update();
            Some((connected, (receiver, false)))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserSettings;
    use chrono::{Duration, Utc};

    fn record(id: &str) -> EntityRecord {
        let mut settings = UserSettings::new(id);
        settings.user_id = "user1".to_string();
        let mut record = EntityRecord::from_entity(&settings).unwrap();
        record.id = id.to_string();
        record
    }

    #[tokio::test]
    async fn test_list_pending_keeps_discovery_order() {
        let store = MemoryLocalStore::new();
        for id in ["c", "a", "b"] {
            store.upsert(record(id)).await.unwrap();
        }
        // Replacing "c" must not move it to the back
        store.upsert(record("c")).await.unwrap();
        store
            .update_sync_status(EntityKind::Settings, "a", SyncStatus::Synced)
            .await
            .unwrap();

        let ids: Vec<String> = store
            .list_pending(EntityKind::Settings, "user1")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let store = MemoryLocalStore::new();
        store.set_fail_writes(true);
        assert!(store.upsert(record("a")).await.is_err());
        store.set_fail_writes(false);
        assert!(store.upsert(record("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_manual_and_export() {
        let store = MemoryLocalStore::new();
        let base = Utc::now();
        for i in 0..4 {
            let mut backup = BackupRecord::new("user1", BackupType::Automatic, format!("{}", i));
            backup.created_at = base + Duration::seconds(i);
            store.create_backup_record(backup).await.unwrap();
        }
        store
            .create_backup_record(BackupRecord::new("user1", BackupType::Manual, "m".into()))
            .await
            .unwrap();
        store
            .create_backup_record(BackupRecord::new("user1", BackupType::Export, "e".into()))
            .await
            .unwrap();

        let removed = store.cleanup_old_backups("user1", 2).await.unwrap();
        assert_eq!(removed, 2);

        let remaining = store.list_backups("user1").await.unwrap();
        let automatic: Vec<&str> = remaining
            .iter()
            .filter(|b| b.backup_type == BackupType::Automatic)
            .map(|b| b.payload.as_str())
            .collect();
        assert_eq!(automatic, vec!["3", "2"]);
        assert_eq!(remaining.len(), 4);
    }

    #[tokio::test]
    async fn test_remote_scripted_failures() {
        let remote = MemoryRemoteStore::new();
        remote.fail_times("a", 1, RemoteError::Network("reset".into()));

        assert!(remote.save(&record("a")).await.is_err());
        assert!(remote.save(&record("a")).await.is_ok());
        assert_eq!(remote.save_count(), 1);
    }

    #[tokio::test]
    async fn test_remote_rejects_stale_writes() {
        let remote = MemoryRemoteStore::new();
        let mut newer = record("a");
        newer.last_modified = Utc::now() + Duration::hours(1);
        remote.insert(newer);

        let err = remote.save(&record("a")).await.unwrap_err();
        assert!(matches!(err, RemoteError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_remote_offline() {
        let remote = MemoryRemoteStore::new();
        remote.set_offline(true);
        assert!(matches!(
            remote.get(EntityKind::Settings, "a").await,
            Err(RemoteError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_observe_connectivity_yields_current_then_changes() {
        let connectivity = StaticConnectivity::offline();
        let mut stream = connectivity.observe_connectivity();
        assert_eq!(stream.next().await, Some(false));

        connectivity.set_connected(true);
        assert_eq!(stream.next().await, Some(true));
        assert_eq!(connectivity.network_type().await, NetworkType::Wifi);

        // A fresh subscription starts from the latest value
        let mut again = connectivity.observe_connectivity();
        assert_eq!(again.next().await, Some(true));
    }
}
