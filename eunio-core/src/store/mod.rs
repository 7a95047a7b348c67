//! Collaborator interfaces the engine is written against.
//!
//! - [`LocalStore`]: durable on-device persistence, the source of truth while
//!   offline.
//! - [`RemoteStore`]: the shared backend, reachable only when online.
//! - [`Connectivity`]: network reachability.
//!
//! Everything is stored as an [`EntityRecord`]: sync metadata in plain
//! columns plus the entity itself as a JSON payload. The record columns win
//! over whatever the payload says when an entity is rehydrated.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{EntityKind, SyncEntity, SyncStatus};

/// Storage form of any syncable entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub kind: EntityKind,
    pub id: String,
    pub user_id: String,
    pub sync_status: SyncStatus,
    pub last_modified: DateTime<Utc>,
    pub version: i32,
    pub payload: serde_json::Value,
}

impl EntityRecord {
    pub fn from_entity<E: SyncEntity>(entity: &E) -> Result<Self, serde_json::Error> {
        let meta = entity.metadata();
        Ok(Self {
            kind: E::KIND,
            id: entity.id(),
            user_id: entity.user_id().to_string(),
            sync_status: meta.sync_status,
            last_modified: meta.last_modified,
            version: meta.version,
            payload: serde_json::to_value(entity)?,
        })
    }

    /// Rehydrates the entity, taking sync metadata from the record columns.
    pub fn to_entity<E: SyncEntity>(&self) -> Result<E, serde_json::Error> {
        let mut entity: E = serde_json::from_value(self.payload.clone())?;
        let meta = entity.metadata_mut();
        meta.sync_status = self.sync_status;
        meta.last_modified = self.last_modified;
        meta.version = self.version;
        Ok(entity)
    }

    pub fn with_status(mut self, status: SyncStatus) -> Self {
        self.sync_status = status;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Automatic,
    Manual,
    Export,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Automatic => "automatic",
            BackupType::Manual => "manual",
            BackupType::Export => "export",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "automatic" => Ok(BackupType::Automatic),
            "manual" => Ok(BackupType::Manual),
            "export" => Ok(BackupType::Export),
            _ => Err(format!("Invalid backup type: {}", s)),
        }
    }
}

/// An immutable point-in-time snapshot of a user's settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: Uuid,
    pub user_id: String,
    pub backup_type: BackupType,
    pub created_at: DateTime<Utc>,
    /// Serialized export payload
    pub payload: String,
    pub size_bytes: u64,
}

impl BackupRecord {
    pub fn new(user_id: impl Into<String>, backup_type: BackupType, payload: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            backup_type,
            created_at: Utc::now(),
            size_bytes: payload.len() as u64,
            payload,
        }
    }
}

/// Identifies the device a change came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub platform: String,
}

impl DeviceInfo {
    pub fn new(device_id: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            platform: platform.into(),
        }
    }
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            device_id: Uuid::new_v4().to_string(),
            platform: std::env::consts::OS.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    SectionUpdated,
    SectionReset,
    ConflictResolved,
    Imported,
    Restored,
    Migrated,
}

/// Audit entry kept by the remote store for each settings change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub user_id: String,
    pub change_type: ChangeType,
    pub snapshot: serde_json::Value,
    pub device: DeviceInfo,
    pub recorded_at: DateTime<Utc>,
}

/// Failures of the local store. Fatal to the call that hit them.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record {id}: {message}")]
    Corrupt { id: String, message: String },
}

/// Failures reported by the remote store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// Transport failure; worth retrying
    #[error("network error: {0}")]
    Network(String),

    /// The backend refused the value; never retried
    #[error("rejected '{field}': {message}")]
    Rejected { field: String, message: String },

    /// The remote copy is newer than the one being written
    #[error("conflict on {id}")]
    Conflict {
        id: String,
        remote: Box<EntityRecord>,
    },
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Network(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Wifi,
    Cellular,
    None,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkType::Wifi => write!(f, "wifi"),
            NetworkType::Cellular => write!(f, "cellular"),
            NetworkType::None => write!(f, "none"),
        }
    }
}

/// Durable on-device persistence.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>, StoreError>;

    /// Inserts or replaces a record. Replacing keeps its discovery position.
    async fn upsert(&self, record: EntityRecord) -> Result<(), StoreError>;

    async fn update_sync_status(
        &self,
        kind: EntityKind,
        id: &str,
        status: SyncStatus,
    ) -> Result<(), StoreError>;

    /// Pending and failed records of one kind, in discovery order.
    async fn list_pending(
        &self,
        kind: EntityKind,
        user_id: &str,
    ) -> Result<Vec<EntityRecord>, StoreError>;

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError>;

    /// Removes every record and backup belonging to a user.
    async fn delete_user(&self, user_id: &str) -> Result<(), StoreError>;

    async fn create_backup_record(&self, record: BackupRecord) -> Result<(), StoreError>;

    /// Backups for a user, newest first.
    async fn list_backups(&self, user_id: &str) -> Result<Vec<BackupRecord>, StoreError>;

    async fn delete_backup(&self, id: Uuid) -> Result<(), StoreError>;

    /// Keeps the newest `keep_count` automatic backups. Manual and export
    /// backups are never removed. Returns how many were deleted.
    async fn cleanup_old_backups(
        &self,
        user_id: &str,
        keep_count: usize,
    ) -> Result<usize, StoreError>;
}

/// The shared backend.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>, RemoteError>;

    async fn save(&self, record: &EntityRecord) -> Result<(), RemoteError>;

    /// Deleting a missing record succeeds.
    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), RemoteError>;

    async fn create_history_record(&self, record: HistoryRecord) -> Result<(), RemoteError>;

    /// Publishes an export and returns a link to it.
    async fn create_shareable_export(
        &self,
        user_id: &str,
        payload: &str,
    ) -> Result<String, RemoteError>;

    async fn upload_backup(&self, record: &BackupRecord) -> Result<(), RemoteError>;

    async fn latest_backup(&self, user_id: &str) -> Result<Option<BackupRecord>, RemoteError>;
}

/// Network reachability.
#[async_trait]
pub trait Connectivity: Send + Sync {
    async fn is_connected(&self) -> bool;

    async fn network_type(&self) -> NetworkType;

    /// Reachability changes. Every call starts a fresh stream that first
    /// yields the current state.
    fn observe_connectivity(&self) -> BoxStream<'static, bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserSettings;

    #[test]
    fn test_record_columns_override_payload() {
        let settings = UserSettings::new("user1");
        let mut record = EntityRecord::from_entity(&settings).unwrap();
        assert_eq!(record.kind, EntityKind::Settings);
        assert_eq!(record.id, "user1");

        record.sync_status = SyncStatus::Synced;
        let restored: UserSettings = record.to_entity().unwrap();
        assert_eq!(restored.meta.sync_status, SyncStatus::Synced);
        assert_eq!(restored.cycle, settings.cycle);
    }

    #[test]
    fn test_backup_record_size() {
        let record = BackupRecord::new("user1", BackupType::Manual, "{\"a\":1}".to_string());
        assert_eq!(record.size_bytes, 7);
        assert_eq!(record.backup_type, BackupType::Manual);
    }

    #[test]
    fn test_backup_type_from_str() {
        assert_eq!(
            "AUTOMATIC".parse::<BackupType>().unwrap(),
            BackupType::Automatic
        );
        assert!("weekly".parse::<BackupType>().is_err());
    }

    #[test]
    fn test_only_network_remote_errors_retry() {
        assert!(RemoteError::Network("reset".into()).is_retryable());
        assert!(!RemoteError::Rejected {
            field: "f".into(),
            message: "m".into()
        }
        .is_retryable());
    }
}
