use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use eunio_core::models::{EntityKind, SyncStatus};
use eunio_core::store::{BackupRecord, BackupType, EntityRecord, LocalStore, StoreError};

/// SQLite-backed local store.
pub struct SqliteLocalStore {
    pool: SqlitePool,
}

// Row types for database queries
#[derive(sqlx::FromRow)]
struct EntityRow {
    kind: String,
    id: String,
    user_id: String,
    sync_status: String,
    last_modified: String,
    version: i32,
    payload: String,
}

#[derive(sqlx::FromRow)]
struct BackupRow {
    id: String,
    user_id: String,
    backup_type: String,
    created_at: String,
    payload: String,
    size_bytes: i64,
}

impl SqliteLocalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

// Fixed-width timestamps so text ordering matches time ordering
fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(id: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(id, e))
}

fn corrupt(id: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        id: id.to_string(),
        message: e.to_string(),
    }
}

impl TryFrom<EntityRow> for EntityRecord {
    type Error = StoreError;

    fn try_from(row: EntityRow) -> Result<Self, Self::Error> {
        Ok(EntityRecord {
            kind: row.kind.parse().map_err(|e: String| corrupt(&row.id, e))?,
            sync_status: row
                .sync_status
                .parse::<SyncStatus>()
                .map_err(|e| corrupt(&row.id, e))?,
            last_modified: parse_time(&row.id, &row.last_modified)?,
            version: row.version,
            payload: serde_json::from_str(&row.payload).map_err(|e| corrupt(&row.id, e))?,
            user_id: row.user_id,
            id: row.id,
        })
    }
}

impl TryFrom<BackupRow> for BackupRecord {
    type Error = StoreError;

    fn try_from(row: BackupRow) -> Result<Self, Self::Error> {
        Ok(BackupRecord {
            id: Uuid::parse_str(&row.id).map_err(|e| corrupt(&row.id, e))?,
            backup_type: row
                .backup_type
                .parse::<BackupType>()
                .map_err(|e| corrupt(&row.id, e))?,
            created_at: parse_time(&row.id, &row.created_at)?,
            size_bytes: u64::try_from(row.size_bytes).map_err(|e| corrupt(&row.id, e))?,
            user_id: row.user_id,
            payload: row.payload,
        })
    }
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>, StoreError> {
        let row: Option<EntityRow> =
            sqlx::query_as("SELECT * FROM entities WHERE kind = ? AND id = ?")
                .bind(kind.as_str())
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;

        row.map(EntityRecord::try_from).transpose()
    }

    async fn upsert(&self, record: EntityRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&record.payload)?;

        // ON CONFLICT keeps the rowid, which is the discovery order
        sqlx::query(
            r#"
            INSERT INTO entities (kind, id, user_id, sync_status, last_modified, version, payload)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(kind, id) DO UPDATE SET
                user_id = excluded.user_id,
                sync_status = excluded.sync_status,
                last_modified = excluded.last_modified,
                version = excluded.version,
                payload = excluded.payload
            "#,
        )
        .bind(record.kind.as_str())
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(record.sync_status.as_str())
        .bind(format_time(&record.last_modified))
        .bind(record.version)
        .bind(&payload)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn update_sync_status(
        &self,
        kind: EntityKind,
        id: &str,
        status: SyncStatus,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE entities SET sync_status = ? WHERE kind = ? AND id = ?")
            .bind(status.as_str())
            .bind(kind.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_pending(
        &self,
        kind: EntityKind,
        user_id: &str,
    ) -> Result<Vec<EntityRecord>, StoreError> {
        let rows: Vec<EntityRow> = sqlx::query_as(
            r#"
            SELECT * FROM entities
            WHERE kind = ? AND user_id = ? AND sync_status IN ('pending', 'failed')
            ORDER BY rowid
            "#,
        )
        .bind(kind.as_str())
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(EntityRecord::try_from).collect()
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM entities WHERE kind = ? AND id = ?")
            .bind(kind.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete_user(&self, user_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("DELETE FROM entities WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM backups WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)
    }

    async fn create_backup_record(&self, record: BackupRecord) -> Result<(), StoreError> {
        let size = i64::try_from(record.size_bytes).map_err(|e| corrupt(&record.id.to_string(), e))?;

        sqlx::query(
            r#"
            INSERT INTO backups (id, user_id, backup_type, created_at, payload, size_bytes)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.user_id)
        .bind(record.backup_type.as_str())
        .bind(format_time(&record.created_at))
        .bind(&record.payload)
        .bind(size)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn list_backups(&self, user_id: &str) -> Result<Vec<BackupRecord>, StoreError> {
        let rows: Vec<BackupRow> = sqlx::query_as(
            "SELECT * FROM backups WHERE user_id = ? ORDER BY created_at DESC, rowid DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(BackupRecord::try_from).collect()
    }

    async fn delete_backup(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM backups WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn cleanup_old_backups(
        &self,
        user_id: &str,
        keep_count: usize,
    ) -> Result<usize, StoreError> {
        let keep = i64::try_from(keep_count).unwrap_or(i64::MAX);

        let result = sqlx::query(
            r#"
            DELETE FROM backups WHERE id IN (
                SELECT id FROM backups
                WHERE user_id = ? AND backup_type = 'automatic'
                ORDER BY created_at DESC, rowid DESC
                LIMIT -1 OFFSET ?
            )
            "#,
        )
        .bind(user_id)
        .bind(keep)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use chrono::Duration;
    use eunio_core::models::{DailyLog, UserSettings};
    use eunio_core::store::memory::MemoryRemoteStore;
    use eunio_core::EntityRepository;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    async fn setup() -> (TempDir, SqliteLocalStore) {
        let temp_dir = tempdir().unwrap();
        let pool = init_db(&temp_dir.path().join("test.db")).await.unwrap();
        (temp_dir, SqliteLocalStore::new(pool))
    }

    fn log_record(user_id: &str, day: u32) -> EntityRecord {
        let date = chrono::NaiveDate::from_ymd_opt(2024, 3, day).unwrap();
        EntityRecord::from_entity(&DailyLog::new(user_id, date)).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let (_dir, store) = setup().await;
        let settings = UserSettings::new("user1");
        let record = EntityRecord::from_entity(&settings).unwrap();

        store.upsert(record.clone()).await.unwrap();

        let loaded = store.get(EntityKind::Settings, "user1").await.unwrap().unwrap();
        assert_eq!(loaded.user_id, "user1");
        assert_eq!(loaded.sync_status, SyncStatus::Pending);
        assert_eq!(loaded.payload, record.payload);
        assert_eq!(
            loaded.last_modified.timestamp_micros(),
            record.last_modified.timestamp_micros()
        );
        assert!(store.get(EntityKind::Profile, "user1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_pending_keeps_discovery_order() {
        let (_dir, store) = setup().await;
        let first = log_record("user1", 1);
        let second = log_record("user1", 2);
        let third = log_record("user1", 3);
        store.upsert(first.clone()).await.unwrap();
        store.upsert(second.clone()).await.unwrap();
        store.upsert(third.clone()).await.unwrap();
        store.upsert(log_record("user2", 1)).await.unwrap();

        store
            .update_sync_status(EntityKind::DailyLog, &second.id, SyncStatus::Synced)
            .await
            .unwrap();
        store
            .update_sync_status(EntityKind::DailyLog, &third.id, SyncStatus::Failed)
            .await
            .unwrap();
        // Rewriting keeps the original position
        store.upsert(first.clone()).await.unwrap();

        let pending = store
            .list_pending(EntityKind::DailyLog, "user1")
            .await
            .unwrap();
        let ids: Vec<&str> = pending.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![first.id.as_str(), third.id.as_str()]);
    }

    #[tokio::test]
    async fn test_delete_user_removes_records_and_backups() {
        let (_dir, store) = setup().await;
        store.upsert(log_record("user1", 1)).await.unwrap();
        store.upsert(log_record("user2", 1)).await.unwrap();
        store
            .create_backup_record(BackupRecord::new("user1", BackupType::Manual, "{}".into()))
            .await
            .unwrap();

        store.delete_user("user1").await.unwrap();

        assert!(store
            .list_pending(EntityKind::DailyLog, "user1")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .list_pending(EntityKind::DailyLog, "user2")
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(store.list_backups("user1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backups_newest_first_and_cleanup_spares_manual() {
        let (_dir, store) = setup().await;
        let base = Utc::now();

        let mut manual = BackupRecord::new("user1", BackupType::Manual, "{}".into());
        manual.created_at = base - Duration::hours(10);
        store.create_backup_record(manual.clone()).await.unwrap();

        let mut automatic = Vec::new();
        for hours in 0..4 {
            let mut record = BackupRecord::new("user1", BackupType::Automatic, "{}".into());
            record.created_at = base - Duration::hours(hours);
            store.create_backup_record(record.clone()).await.unwrap();
            automatic.push(record);
        }

        let listed = store.list_backups("user1").await.unwrap();
        assert_eq!(listed.len(), 5);
        assert_eq!(listed[0].id, automatic[0].id);
        assert_eq!(listed[4].id, manual.id);

        let removed = store.cleanup_old_backups("user1", 2).await.unwrap();
        assert_eq!(removed, 2);

        let remaining: Vec<Uuid> = store
            .list_backups("user1")
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(remaining, vec![automatic[0].id, automatic[1].id, manual.id]);

        store.delete_backup(manual.id).await.unwrap();
        assert_eq!(store.list_backups("user1").await.unwrap().len(), 2);
    }

    async fn settings_repository(
        remote: &Arc<MemoryRemoteStore>,
    ) -> (TempDir, Arc<SqliteLocalStore>, EntityRepository<UserSettings>) {
        let (dir, store) = setup().await;
        let store = Arc::new(store);
        let repo = EntityRepository::new(store.clone(), remote.clone());
        (dir, store, repo)
    }

    #[tokio::test]
    async fn test_repository_save_offline_is_stored_failed() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.set_offline(true);
        let (_dir, store, repo) = settings_repository(&remote).await;

        let saved = repo.save(&UserSettings::new("user1")).await.unwrap();

        assert_eq!(saved.meta.sync_status, SyncStatus::Failed);
        let stored = store.get(EntityKind::Settings, "user1").await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Failed);
        assert_eq!(stored.last_modified, saved.meta.last_modified);
    }

    #[tokio::test]
    async fn test_repository_save_online_is_stored_synced() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let (_dir, store, repo) = settings_repository(&remote).await;

        let saved = repo.save(&UserSettings::new("user1")).await.unwrap();

        assert_eq!(saved.meta.sync_status, SyncStatus::Synced);
        let stored = store.get(EntityKind::Settings, "user1").await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert_eq!(remote.save_count(), 1);

        let report = repo.sync_pending_changes("user1").await.unwrap();
        assert_eq!(report.attempted(), 0);
        assert_eq!(remote.save_count(), 1);
    }

    #[tokio::test]
    async fn test_repository_sync_drains_failed_saves_once() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.set_offline(true);
        let (_dir, store, repo) = settings_repository(&remote).await;
        repo.save(&UserSettings::new("user1")).await.unwrap();

        remote.set_offline(false);
        let first = repo.sync_pending_changes("user1").await.unwrap();
        assert_eq!(first.synced(), 1);
        let stored = store.get(EntityKind::Settings, "user1").await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);

        let second = repo.sync_pending_changes("user1").await.unwrap();
        assert_eq!(second.attempted(), 0);
        assert_eq!(remote.save_count(), 1);
    }
}
