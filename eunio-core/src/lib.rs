//! Eunio Core Library
//!
//! Offline-first sync engine for Eunio health data: local-first repositories,
//! sync passes, settings conflict resolution, backups and schema migrations.

pub mod backup;
pub mod cache;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod error;
pub mod manager;
pub mod migration;
pub mod models;
pub mod repository;
pub mod store;

pub use backup::{BackupEvent, BackupManager, ImportStrategy, SettingsExport};
pub use config::EngineConfig;
pub use conflict::{
    ConflictResolver, ConflictType, ResolutionPreview, ResolutionStrategy, SettingsConflict,
};
pub use coordinator::{SyncCoordinator, SyncState, SyncStatistics};
pub use error::{BackupError, EunioError, MigrationError, SyncError, ValidationError};
pub use manager::SettingsManager;
pub use migration::{MigrationInfo, MigrationService};
pub use models::{
    CycleRecord, DailyLog, EntityKind, SettingsSection, SyncEntity, SyncStatus, UserProfile,
    UserSettings,
};
pub use repository::{EntityRepository, PendingSync, SyncReport};
pub use store::{Connectivity, LocalStore, RemoteStore};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
