//! Error taxonomy for the sync engine.
//!
//! Every fallible engine operation returns [`EunioError`]. Only
//! [`EunioError::Network`] is retryable; everything else is terminal for the
//! call that produced it.

use std::fmt::Display;
use std::ops::RangeInclusive;
use std::time::Duration;

use thiserror::Error;

use crate::store::{RemoteError, StoreError};

/// Top-level engine error.
#[derive(Error, Debug)]
pub enum EunioError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Network error: {0}")]
    Network(String),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error("Local store error: {0}")]
    Store(#[from] StoreError),
}

impl EunioError {
    /// Returns true for transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EunioError::Network(_))
    }
}

impl From<RemoteError> for EunioError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Network(msg) => EunioError::Network(msg),
            RemoteError::Rejected { field, message } => {
                EunioError::Validation(ValidationError::new(field, message))
            }
            RemoteError::Conflict { id, .. } => EunioError::Sync(SyncError::RemoteConflict(id)),
        }
    }
}

/// A value outside its documented range or shape. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid value for '{field}': {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Checks that `value` lies in `range`, naming `field` otherwise.
    pub fn check_range<T>(field: &str, value: T, range: RangeInclusive<T>) -> Result<(), Self>
    where
        T: PartialOrd + Display,
    {
        if range.contains(&value) {
            Ok(())
        } else {
            Err(Self::new(
                field,
                format!(
                    "{} is outside the allowed range {}..={}",
                    value,
                    range.start(),
                    range.end()
                ),
            ))
        }
    }
}

/// Aggregate failures of a sync pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("A sync pass is already running for user {0}")]
    AlreadySyncing(String),

    #[error("Device is offline")]
    Offline,

    #[error("Remote copy of {0} changed since the last sync")]
    RemoteConflict(String),

    #[error("Sync failed: {failed} of {total} operations failed ({})", .failures.join("; "))]
    Failed {
        failed: usize,
        total: usize,
        failures: Vec<String>,
    },

    #[error("Connectivity did not return within {0:?}")]
    RecoveryTimedOut(Duration),
}

/// Why a migration was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationFailure {
    /// Older than the minimum supported version
    Unsupported,
    /// Newer than the current schema
    FutureVersion,
    /// Target version precedes the source version
    Downgrade,
    /// The stored document is not a settings object
    Malformed(String),
}

impl std::fmt::Display for MigrationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationFailure::Unsupported => write!(f, "version is no longer supported"),
            MigrationFailure::FutureVersion => write!(f, "version is newer than this app"),
            MigrationFailure::Downgrade => write!(f, "downgrades are not supported"),
            MigrationFailure::Malformed(e) => write!(f, "malformed settings document: {}", e),
        }
    }
}

/// A schema version outside the supported range. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cannot migrate settings from v{from_version} to v{to_version}: {reason}")]
pub struct MigrationError {
    pub from_version: i32,
    pub to_version: i32,
    pub reason: MigrationFailure,
}

impl MigrationError {
    pub fn new(from_version: i32, to_version: i32, reason: MigrationFailure) -> Self {
        Self {
            from_version,
            to_version,
            reason,
        }
    }
}

/// Failures while creating, restoring or importing backups.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Backup serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backup storage failed: {0}")]
    Store(#[from] StoreError),

    #[error("Remote backup unavailable: {0}")]
    Remote(String),

    #[error("No settings found for user {0}")]
    NothingToBackUp(String),

    #[error("No backup found for user {0}")]
    NotFound(String),

    #[error("Unsupported export version {0}")]
    UnsupportedExportVersion(u32),

    #[error("Backup checksum mismatch")]
    ChecksumMismatch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_range_names_field() {
        let err = ValidationError::check_range("cycle.average_cycle_length", 20, 21..=45)
            .unwrap_err();
        assert_eq!(err.field, "cycle.average_cycle_length");
        assert!(err.to_string().contains("cycle.average_cycle_length"));
        assert!(ValidationError::check_range("x", 21, 21..=45).is_ok());
        assert!(ValidationError::check_range("x", 45, 21..=45).is_ok());
    }

    #[test]
    fn test_only_network_errors_are_retryable() {
        assert!(EunioError::Network("timeout".into()).is_retryable());
        assert!(!EunioError::Validation(ValidationError::new("f", "bad")).is_retryable());
        assert!(!EunioError::Sync(SyncError::Offline).is_retryable());
        assert!(
            !EunioError::Migration(MigrationError::new(-1, 1, MigrationFailure::Unsupported))
                .is_retryable()
        );
    }

    #[test]
    fn test_remote_rejection_maps_to_validation() {
        let err: EunioError = RemoteError::Rejected {
            field: "cycle".into(),
            message: "bad".into(),
        }
        .into();
        assert!(matches!(err, EunioError::Validation(ref v) if v.field == "cycle"));
    }

    #[test]
    fn test_sync_failed_message_lists_failures() {
        let err = SyncError::Failed {
            failed: 2,
            total: 2,
            failures: vec!["settings: offline".into(), "profile: offline".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 of 2"));
        assert!(msg.contains("settings: offline"));
    }
}
