//! Settings schema upgrades.
//!
//! Migrations operate on the JSON document so that documents written by older
//! builds (missing groups, renamed keys) can be read at all. Each step only
//! fills in what is missing; values already present, and in particular
//! anything the user customized, are never overwritten.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::error::{EunioError, MigrationError, MigrationFailure};
use crate::models::{
    EntityKind, UserSettings, CURRENT_SETTINGS_VERSION, MIN_SUPPORTED_SETTINGS_VERSION,
};
use crate::repository::RecordUpgrader;
use crate::store::EntityRecord;

/// What a migration between two versions will do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationInfo {
    pub from_version: i32,
    pub to_version: i32,
    pub changes: Vec<String>,
    pub breaking_changes: Vec<String>,
    /// Some new value needs the user's explicit consent
    pub requires_user_input: bool,
}

struct MigrationStep {
    from: i32,
    to: i32,
    changes: &'static [&'static str],
    breaking_changes: &'static [&'static str],
    requires_user_input: bool,
    apply: fn(&mut Map<String, Value>),
}

const STEPS: &[MigrationStep] = &[
    MigrationStep {
        from: 0,
        to: 1,
        changes: &[
            "Added sync preferences group",
            "Added cycle.luteal_phase_length (default 14)",
        ],
        breaking_changes: &[],
        requires_user_input: false,
        apply: v0_to_v1,
    },
    MigrationStep {
        from: 1,
        to: 2,
        changes: &[
            "Added display.haptic_feedback (default on)",
            "Added notifications.advance_notice_days (default 2)",
            "Added privacy.anonymous_insights (default off)",
        ],
        breaking_changes: &["Renamed units.temperature to units.temperature_unit"],
        requires_user_input: true,
        apply: v1_to_v2,
    },
];

fn v0_to_v1(doc: &mut Map<String, Value>) {
    insert_missing(doc, "sync", "auto_sync", json!(true));
    insert_missing(doc, "sync", "wifi_only", json!(false));
    insert_missing(doc, "sync", "interval_minutes", json!(60));
    insert_missing(doc, "sync", "is_customized", json!(false));
    insert_missing(doc, "cycle", "luteal_phase_length", json!(14));
}

fn v1_to_v2(doc: &mut Map<String, Value>) {
    if let Some(units) = doc.get_mut("units").and_then(Value::as_object_mut) {
        if let Some(old) = units.remove("temperature") {
            units.entry("temperature_unit").or_insert(old);
        }
    }
    insert_missing(doc, "display", "haptic_feedback", json!(true));
    insert_missing(doc, "notifications", "advance_notice_days", json!(2));
    insert_missing(doc, "privacy", "anonymous_insights", json!(false));
}

/// Sets `group.key` unless it already has a value. A group that exists but
/// is not an object is left for deserialization to reject.
fn insert_missing(doc: &mut Map<String, Value>, group: &str, key: &str, value: Value) {
    let slot = doc
        .entry(group)
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(map) = slot.as_object_mut() {
        map.entry(key).or_insert(value);
    }
}

/// Upgrades settings between schema versions.
#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationService;

impl MigrationService {
    pub fn new() -> Self {
        Self
    }

    pub fn needs_migration(&self, version: i32) -> bool {
        version < CURRENT_SETTINGS_VERSION
    }

    /// Checks that `version` can be read by this build.
    pub fn validate_settings_version(&self, version: i32) -> Result<(), MigrationError> {
        self.check_range(version, CURRENT_SETTINGS_VERSION)
    }

    pub fn get_migration_info(&self, from: i32, to: i32) -> Result<MigrationInfo, MigrationError> {
        self.check_range(from, to)?;

        let mut info = MigrationInfo {
            from_version: from,
            to_version: to,
            changes: Vec::new(),
            breaking_changes: Vec::new(),
            requires_user_input: false,
        };
        for step in steps_between(from, to) {
            info.changes
                .extend(step.changes.iter().map(|c| c.to_string()));
            info.breaking_changes
                .extend(step.breaking_changes.iter().map(|c| c.to_string()));
            info.requires_user_input |= step.requires_user_input;
        }
        Ok(info)
    }

    /// Upgrades typed settings and stamps a fresh modification time.
    pub fn migrate_settings(
        &self,
        settings: &UserSettings,
        from: i32,
        to: i32,
    ) -> Result<UserSettings, MigrationError> {
        let doc = serde_json::to_value(settings)
            .map_err(|e| MigrationError::new(from, to, MigrationFailure::Malformed(e.to_string())))?;
        let migrated = self.migrate_value(doc, from, to)?;

        let mut upgraded: UserSettings = serde_json::from_value(migrated)
            .map_err(|e| MigrationError::new(from, to, MigrationFailure::Malformed(e.to_string())))?;
        let previous = upgraded.meta.last_modified;
        upgraded.meta.touch(Some(previous));
        Ok(upgraded)
    }

    /// Upgrades a raw settings document from `from` to `to`.
    pub fn migrate_value(&self, doc: Value, from: i32, to: i32) -> Result<Value, MigrationError> {
        self.check_range(from, to)?;

        let Value::Object(mut doc) = doc else {
            return Err(MigrationError::new(
                from,
                to,
                MigrationFailure::Malformed("expected a JSON object".to_string()),
            ));
        };

        for step in steps_between(from, to) {
            debug!(from = step.from, to = step.to, "Applying settings migration step");
            (step.apply)(&mut doc);
        }
        doc.insert("version".to_string(), json!(to));

        if from != to {
            info!(from, to, "Migrated settings document");
        }
        Ok(Value::Object(doc))
    }

    /// Brings a settings document of any supported version up to date.
    /// Documents without a version are treated as version 0.
    pub fn upgrade_document(&self, doc: Value) -> Result<Value, MigrationError> {
        let version = document_version(&doc);
        self.migrate_value(doc, version, CURRENT_SETTINGS_VERSION)
    }

    fn check_range(&self, from: i32, to: i32) -> Result<(), MigrationError> {
        let reason = if from < MIN_SUPPORTED_SETTINGS_VERSION {
            MigrationFailure::Unsupported
        } else if from > CURRENT_SETTINGS_VERSION || to > CURRENT_SETTINGS_VERSION {
            MigrationFailure::FutureVersion
        } else if to < from {
            MigrationFailure::Downgrade
        } else {
            return Ok(());
        };
        Err(MigrationError::new(from, to, reason))
    }
}

impl RecordUpgrader for MigrationService {
    fn upgrade(&self, record: &EntityRecord) -> Result<Option<EntityRecord>, EunioError> {
        if record.kind != EntityKind::Settings {
            return Ok(None);
        }
        self.validate_settings_version(record.version)?;
        if !self.needs_migration(record.version) {
            return Ok(None);
        }

        let payload =
            self.migrate_value(record.payload.clone(), record.version, CURRENT_SETTINGS_VERSION)?;
        Ok(Some(EntityRecord {
            payload,
            version: CURRENT_SETTINGS_VERSION,
            ..record.clone()
        }))
    }
}

fn steps_between(from: i32, to: i32) -> impl Iterator<Item = &'static MigrationStep> {
    STEPS
        .iter()
        .filter(move |step| step.from >= from && step.to <= to)
}

/// The schema version recorded in a settings document, 0 when absent.
pub fn document_version(doc: &Value) -> i32 {
    doc.get("version")
        .and_then(Value::as_i64)
        .and_then(|v| i32::try_from(v).ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SyncStatus, TemperatureUnit};

    fn v0_document() -> Value {
        json!({
            "user_id": "user1",
            "units": {"temperature": "fahrenheit", "weight_unit": "pounds", "is_customized": true},
            "cycle": {"average_cycle_length": 32, "average_period_length": 6, "is_customized": true},
            "sync_status": "synced",
            "last_modified": "2024-06-01T00:00:00Z",
            "version": 0
        })
    }

    #[test]
    fn test_v0_to_v1_preserves_customizations_and_fills_defaults() {
        let service = MigrationService::new();
        let migrated = service.migrate_value(v0_document(), 0, 1).unwrap();

        assert_eq!(migrated["version"], 1);
        assert_eq!(migrated["cycle"]["average_cycle_length"], 32);
        assert_eq!(migrated["cycle"]["is_customized"], true);
        assert_eq!(migrated["cycle"]["luteal_phase_length"], 14);
        assert_eq!(migrated["sync"]["auto_sync"], true);
        assert_eq!(migrated["sync"]["interval_minutes"], 60);
        // Not this step's business
        assert_eq!(migrated["units"]["temperature"], "fahrenheit");
    }

    #[test]
    fn test_full_upgrade_renames_temperature_key() {
        let service = MigrationService::new();
        let migrated = service.upgrade_document(v0_document()).unwrap();

        let settings: UserSettings = serde_json::from_value(migrated).unwrap();
        assert_eq!(settings.meta.version, CURRENT_SETTINGS_VERSION);
        assert_eq!(settings.units.temperature_unit, TemperatureUnit::Fahrenheit);
        assert!(settings.units.is_customized);
        assert_eq!(settings.cycle.average_cycle_length, 32);
        assert!(settings.display.haptic_feedback);
        assert!(!settings.privacy.anonymous_insights);
        assert_eq!(settings.notifications.advance_notice_days, 2);
    }

    #[test]
    fn test_steps_never_overwrite_existing_values() {
        let service = MigrationService::new();
        let doc = json!({
            "user_id": "user1",
            "sync": {"auto_sync": false, "interval_minutes": 120, "is_customized": true},
            "privacy": {"anonymous_insights": true},
            "version": 0
        });
        let migrated = service.upgrade_document(doc).unwrap();

        assert_eq!(migrated["sync"]["auto_sync"], false);
        assert_eq!(migrated["sync"]["interval_minutes"], 120);
        assert_eq!(migrated["privacy"]["anonymous_insights"], true);
    }

    #[test]
    fn test_unsupported_version_is_rejected() {
        let service = MigrationService::new();
        let err = service
            .migrate_settings(&UserSettings::new("user1"), -1, 1)
            .unwrap_err();

        assert_eq!(err.from_version, -1);
        assert_eq!(err.to_version, 1);
        assert_eq!(err.reason, MigrationFailure::Unsupported);
    }

    #[test]
    fn test_future_and_downgrade_are_rejected() {
        let service = MigrationService::new();
        assert_eq!(
            service.validate_settings_version(3).unwrap_err().reason,
            MigrationFailure::FutureVersion
        );
        assert_eq!(
            service.migrate_value(json!({}), 2, 1).unwrap_err().reason,
            MigrationFailure::Downgrade
        );
        assert!(matches!(
            service.migrate_value(json!([1, 2]), 0, 2).unwrap_err().reason,
            MigrationFailure::Malformed(_)
        ));
    }

    #[test]
    fn test_migrate_settings_stamps_version_and_time() {
        let service = MigrationService::new();
        let mut old = UserSettings::new("user1");
        old.meta.version = 1;
        let before = old.meta.last_modified;

        let upgraded = service.migrate_settings(&old, 1, 2).unwrap();

        assert_eq!(upgraded.meta.version, 2);
        assert!(upgraded.meta.last_modified > before);
    }

    #[test]
    fn test_migration_info() {
        let service = MigrationService::new();

        let info = service.get_migration_info(0, 2).unwrap();
        assert_eq!(info.changes.len(), 5);
        assert_eq!(info.breaking_changes.len(), 1);
        assert!(info.requires_user_input);

        let info = service.get_migration_info(0, 1).unwrap();
        assert!(info.breaking_changes.is_empty());
        assert!(!info.requires_user_input);

        assert!(service.get_migration_info(2, 2).unwrap().changes.is_empty());
    }

    #[test]
    fn test_needs_migration() {
        let service = MigrationService::new();
        assert!(service.needs_migration(0));
        assert!(service.needs_migration(1));
        assert!(!service.needs_migration(CURRENT_SETTINGS_VERSION));
    }

    #[test]
    fn test_record_upgrader_only_touches_old_settings() {
        let service = MigrationService::new();
        let current = EntityRecord::from_entity(&UserSettings::new("user1")).unwrap();
        assert!(service.upgrade(&current).unwrap().is_none());

        let mut old = current.clone();
        old.version = 0;
        old.sync_status = SyncStatus::Synced;
        let upgraded = service.upgrade(&old).unwrap().unwrap();
        assert_eq!(upgraded.version, CURRENT_SETTINGS_VERSION);
        assert_eq!(upgraded.payload["version"], CURRENT_SETTINGS_VERSION);
        assert_eq!(upgraded.last_modified, old.last_modified);

        let mut future = current;
        future.version = 9;
        assert!(matches!(
            service.upgrade(&future),
            Err(EunioError::Migration(_))
        ));
    }

    #[test]
    fn test_document_version_defaults_to_zero() {
        assert_eq!(document_version(&json!({"user_id": "u"})), 0);
        assert_eq!(document_version(&json!({"version": 1})), 1);
    }
}
