//! User preferences aggregate.
//!
//! Settings are a composite of independent sub-preference groups. Each group
//! validates itself and carries an `is_customized` flag that distinguishes an
//! explicit user choice from a default. Conflict resolution, imports and
//! migrations all work group by group on that flag.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::sync_status::{EntityKind, SyncEntity, SyncMetadata};
use crate::error::ValidationError;

/// Schema version written by this build.
pub const CURRENT_SETTINGS_VERSION: i32 = 2;

/// Oldest schema version that can still be upgraded.
pub const MIN_SUPPORTED_SETTINGS_VERSION: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureUnit {
    #[default]
    Celsius,
    Fahrenheit,
}

impl FromStr for TemperatureUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "celsius" | "c" => Ok(TemperatureUnit::Celsius),
            "fahrenheit" | "f" => Ok(TemperatureUnit::Fahrenheit),
            _ => Err(format!("Invalid temperature unit: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WeightUnit {
    #[default]
    Kilograms,
    Pounds,
}

impl FromStr for WeightUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "kilograms" | "kg" => Ok(WeightUnit::Kilograms),
            "pounds" | "lb" | "lbs" => Ok(WeightUnit::Pounds),
            _ => Err(format!("Invalid weight unit: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    System,
    Light,
    Dark,
}

impl FromStr for Theme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "system" => Ok(Theme::System),
            "light" => Ok(Theme::Light),
            "dark" => Ok(Theme::Dark),
            _ => Err(format!("Invalid theme: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitPreferences {
    pub temperature_unit: TemperatureUnit,
    pub weight_unit: WeightUnit,
    pub is_customized: bool,
}

impl Default for UnitPreferences {
    fn default() -> Self {
        Self {
            temperature_unit: TemperatureUnit::Celsius,
            weight_unit: WeightUnit::Kilograms,
            is_customized: false,
        }
    }
}

impl UnitPreferences {
    pub fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationPreferences {
    pub daily_log_reminder: bool,
    pub reminder_time: NaiveTime,
    pub period_alerts: bool,
    pub ovulation_alerts: bool,
    /// Days ahead of a predicted period to notify, 1..=7
    pub advance_notice_days: u8,
    pub is_customized: bool,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            daily_log_reminder: true,
            reminder_time: NaiveTime::from_hms_opt(20, 0, 0).unwrap_or_default(),
            period_alerts: true,
            ovulation_alerts: false,
            advance_notice_days: 2,
            is_customized: false,
        }
    }
}

impl NotificationPreferences {
    pub fn validate(&self) -> Result<(), ValidationError> {
        ValidationError::check_range(
            "notifications.advance_notice_days",
            self.advance_notice_days,
            1..=7,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CyclePreferences {
    /// Typical cycle length in days, 21..=45
    pub average_cycle_length: u32,
    /// Typical period length in days, 2..=10
    pub average_period_length: u32,
    /// Luteal phase length in days, 10..=16
    pub luteal_phase_length: u32,
    pub is_customized: bool,
}

impl Default for CyclePreferences {
    fn default() -> Self {
        Self {
            average_cycle_length: 28,
            average_period_length: 5,
            luteal_phase_length: 14,
            is_customized: false,
        }
    }
}

impl CyclePreferences {
    pub fn validate(&self) -> Result<(), ValidationError> {
        ValidationError::check_range(
            "cycle.average_cycle_length",
            self.average_cycle_length,
            21..=45,
        )?;
        ValidationError::check_range(
            "cycle.average_period_length",
            self.average_period_length,
            2..=10,
        )?;
        ValidationError::check_range(
            "cycle.luteal_phase_length",
            self.luteal_phase_length,
            10..=16,
        )?;
        if self.average_period_length >= self.average_cycle_length {
            return Err(ValidationError::new(
                "cycle.average_period_length",
                "period length must be shorter than the cycle length",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PrivacyPreferences {
    pub data_sharing: bool,
    pub crash_reporting: bool,
    /// Opt-in only; never defaulted to true
    pub anonymous_insights: bool,
    pub is_customized: bool,
}

impl PrivacyPreferences {
    pub fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayPreferences {
    pub theme: Theme,
    /// Text scale in percent, 80..=200
    pub text_scale_percent: u16,
    pub high_contrast: bool,
    pub haptic_feedback: bool,
    pub is_customized: bool,
}

impl Default for DisplayPreferences {
    fn default() -> Self {
        Self {
            theme: Theme::System,
            text_scale_percent: 100,
            high_contrast: false,
            haptic_feedback: true,
            is_customized: false,
        }
    }
}

impl DisplayPreferences {
    pub fn validate(&self) -> Result<(), ValidationError> {
        ValidationError::check_range(
            "display.text_scale_percent",
            self.text_scale_percent,
            80..=200,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPreferences {
    pub auto_sync: bool,
    pub wifi_only: bool,
    /// Background sync interval, 15..=1440 minutes
    pub interval_minutes: u32,
    pub is_customized: bool,
}

impl Default for SyncPreferences {
    fn default() -> Self {
        Self {
            auto_sync: true,
            wifi_only: false,
            interval_minutes: 60,
            is_customized: false,
        }
    }
}

impl SyncPreferences {
    pub fn validate(&self) -> Result<(), ValidationError> {
        ValidationError::check_range("sync.interval_minutes", self.interval_minutes, 15..=1440)
    }
}

/// Names of the sub-preference groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingsSection {
    Units,
    Notifications,
    Cycle,
    Privacy,
    Display,
    Sync,
}

impl SettingsSection {
    pub const ALL: [SettingsSection; 6] = [
        SettingsSection::Units,
        SettingsSection::Notifications,
        SettingsSection::Cycle,
        SettingsSection::Privacy,
        SettingsSection::Display,
        SettingsSection::Sync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingsSection::Units => "units",
            SettingsSection::Notifications => "notifications",
            SettingsSection::Cycle => "cycle",
            SettingsSection::Privacy => "privacy",
            SettingsSection::Display => "display",
            SettingsSection::Sync => "sync",
        }
    }
}

impl fmt::Display for SettingsSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SettingsSection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SettingsSection::ALL
            .into_iter()
            .find(|section| section.as_str() == s.to_lowercase())
            .ok_or_else(|| format!("Invalid settings section: {}", s))
    }
}

/// A replacement value for one sub-preference group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionUpdate {
    Units(UnitPreferences),
    Notifications(NotificationPreferences),
    Cycle(CyclePreferences),
    Privacy(PrivacyPreferences),
    Display(DisplayPreferences),
    Sync(SyncPreferences),
}

impl SectionUpdate {
    pub fn section(&self) -> SettingsSection {
        match self {
            SectionUpdate::Units(_) => SettingsSection::Units,
            SectionUpdate::Notifications(_) => SettingsSection::Notifications,
            SectionUpdate::Cycle(_) => SettingsSection::Cycle,
            SectionUpdate::Privacy(_) => SettingsSection::Privacy,
            SectionUpdate::Display(_) => SettingsSection::Display,
            SectionUpdate::Sync(_) => SettingsSection::Sync,
        }
    }
}

/// The settings aggregate for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    pub user_id: String,
    #[serde(default)]
    pub units: UnitPreferences,
    #[serde(default)]
    pub notifications: NotificationPreferences,
    #[serde(default)]
    pub cycle: CyclePreferences,
    #[serde(default)]
    pub privacy: PrivacyPreferences,
    #[serde(default)]
    pub display: DisplayPreferences,
    #[serde(default)]
    pub sync: SyncPreferences,
    #[serde(flatten)]
    pub meta: SyncMetadata,
}

impl UserSettings {
    /// Default settings for a user, at the current schema version.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            units: UnitPreferences::default(),
            notifications: NotificationPreferences::default(),
            cycle: CyclePreferences::default(),
            privacy: PrivacyPreferences::default(),
            display: DisplayPreferences::default(),
            sync: SyncPreferences::default(),
            meta: SyncMetadata::new(CURRENT_SETTINGS_VERSION),
        }
    }

    pub fn is_customized(&self, section: SettingsSection) -> bool {
        match section {
            SettingsSection::Units => self.units.is_customized,
            SettingsSection::Notifications => self.notifications.is_customized,
            SettingsSection::Cycle => self.cycle.is_customized,
            SettingsSection::Privacy => self.privacy.is_customized,
            SettingsSection::Display => self.display.is_customized,
            SettingsSection::Sync => self.sync.is_customized,
        }
    }

    /// Groups the user explicitly changed.
    pub fn customized_sections(&self) -> Vec<SettingsSection> {
        SettingsSection::ALL
            .into_iter()
            .filter(|section| self.is_customized(*section))
            .collect()
    }

    pub fn has_customizations(&self) -> bool {
        SettingsSection::ALL
            .into_iter()
            .any(|section| self.is_customized(section))
    }

    /// Compares one group of two snapshots.
    pub fn section_equals(&self, other: &UserSettings, section: SettingsSection) -> bool {
        match section {
            SettingsSection::Units => self.units == other.units,
            SettingsSection::Notifications => self.notifications == other.notifications,
            SettingsSection::Cycle => self.cycle == other.cycle,
            SettingsSection::Privacy => self.privacy == other.privacy,
            SettingsSection::Display => self.display == other.display,
            SettingsSection::Sync => self.sync == other.sync,
        }
    }

    /// True when every group matches, ignoring sync metadata.
    pub fn same_content(&self, other: &UserSettings) -> bool {
        SettingsSection::ALL
            .into_iter()
            .all(|section| self.section_equals(other, section))
    }

    /// Copies one group from `source` into `self`.
    pub fn copy_section_from(&mut self, source: &UserSettings, section: SettingsSection) {
        match section {
            SettingsSection::Units => self.units = source.units.clone(),
            SettingsSection::Notifications => {
                self.notifications = source.notifications.clone()
            }
            SettingsSection::Cycle => self.cycle = source.cycle.clone(),
            SettingsSection::Privacy => self.privacy = source.privacy.clone(),
            SettingsSection::Display => self.display = source.display.clone(),
            SettingsSection::Sync => self.sync = source.sync.clone(),
        }
    }

    /// Replaces one group and marks it as an explicit user choice.
    pub fn apply(&mut self, update: SectionUpdate) {
        match update {
            SectionUpdate::Units(mut units) => {
                units.is_customized = true;
                self.units = units;
            }
            SectionUpdate::Notifications(mut notifications) => {
                notifications.is_customized = true;
                self.notifications = notifications;
            }
            SectionUpdate::Cycle(mut cycle) => {
                cycle.is_customized = true;
                self.cycle = cycle;
            }
            SectionUpdate::Privacy(mut privacy) => {
                privacy.is_customized = true;
                self.privacy = privacy;
            }
            SectionUpdate::Display(mut display) => {
                display.is_customized = true;
                self.display = display;
            }
            SectionUpdate::Sync(mut sync) => {
                sync.is_customized = true;
                self.sync = sync;
            }
        }
    }

    /// Restores one group to its defaults.
    pub fn reset(&mut self, section: SettingsSection) {
        let defaults = UserSettings::new(self.user_id.clone());
        self.copy_section_from(&defaults, section);
    }
}

impl SyncEntity for UserSettings {
    const KIND: EntityKind = EntityKind::Settings;

    fn id(&self) -> String {
        self.user_id.clone()
    }

    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn metadata(&self) -> &SyncMetadata {
        &self.meta
    }

    fn metadata_mut(&mut self) -> &mut SyncMetadata {
        &mut self.meta
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.user_id.trim().is_empty() {
            return Err(ValidationError::new("user_id", "must not be empty"));
        }
        self.units.validate()?;
        self.notifications.validate()?;
        self.cycle.validate()?;
        self.privacy.validate()?;
        self.display.validate()?;
        self.sync.validate()?;
        Ok(())
    }
}

impl fmt::Display for UserSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = |customized: bool| if customized { " (customized)" } else { "" };

        writeln!(f, "Settings for {}", self.user_id)?;
        writeln!(f, "{}", "=".repeat(30))?;
        writeln!(
            f,
            "Units{}: {:?}, {:?}",
            marker(self.units.is_customized),
            self.units.temperature_unit,
            self.units.weight_unit
        )?;
        writeln!(
            f,
            "Notifications{}: reminder {} at {}, notice {} day(s)",
            marker(self.notifications.is_customized),
            if self.notifications.daily_log_reminder {
                "on"
            } else {
                "off"
            },
            self.notifications.reminder_time.format("%H:%M"),
            self.notifications.advance_notice_days
        )?;
        writeln!(
            f,
            "Cycle{}: {} day cycle, {} day period, {} day luteal phase",
            marker(self.cycle.is_customized),
            self.cycle.average_cycle_length,
            self.cycle.average_period_length,
            self.cycle.luteal_phase_length
        )?;
        writeln!(
            f,
            "Privacy{}: sharing {}, crash reports {}, insights {}",
            marker(self.privacy.is_customized),
            self.privacy.data_sharing,
            self.privacy.crash_reporting,
            self.privacy.anonymous_insights
        )?;
        writeln!(
            f,
            "Display{}: {:?} theme, {}% text",
            marker(self.display.is_customized),
            self.display.theme,
            self.display.text_scale_percent
        )?;
        writeln!(
            f,
            "Sync{}: auto {}, wifi only {}, every {} min",
            marker(self.sync.is_customized),
            self.sync.auto_sync,
            self.sync.wifi_only,
            self.sync.interval_minutes
        )?;
        write!(
            f,
            "Status: {} (v{}, modified {})",
            self.meta.sync_status,
            self.meta.version,
            self.meta.last_modified.to_rfc3339()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SyncStatus;

    #[test]
    fn test_defaults_are_valid() {
        let settings = UserSettings::new("user1");
        assert!(settings.validate().is_ok());
        assert!(!settings.has_customizations());
        assert_eq!(settings.meta.version, CURRENT_SETTINGS_VERSION);
        assert_eq!(settings.meta.sync_status, SyncStatus::Pending);
    }

    #[test]
    fn test_cycle_length_boundaries() {
        let mut settings = UserSettings::new("user1");
        for length in [21, 28, 45] {
            settings.cycle.average_cycle_length = length;
            assert!(settings.validate().is_ok(), "length {} should pass", length);
        }
        for length in [20, 46] {
            settings.cycle.average_cycle_length = length;
            let err = settings.validate().unwrap_err();
            assert_eq!(err.field, "cycle.average_cycle_length");
        }
    }

    #[test]
    fn test_other_ranges_name_their_field() {
        let mut settings = UserSettings::new("user1");
        settings.notifications.advance_notice_days = 0;
        assert_eq!(
            settings.validate().unwrap_err().field,
            "notifications.advance_notice_days"
        );

        let mut settings = UserSettings::new("user1");
        settings.display.text_scale_percent = 250;
        assert_eq!(
            settings.validate().unwrap_err().field,
            "display.text_scale_percent"
        );

        let mut settings = UserSettings::new("user1");
        settings.sync.interval_minutes = 5;
        assert_eq!(
            settings.validate().unwrap_err().field,
            "sync.interval_minutes"
        );

        let mut settings = UserSettings::new("user1");
        settings.cycle.luteal_phase_length = 9;
        assert_eq!(
            settings.validate().unwrap_err().field,
            "cycle.luteal_phase_length"
        );
    }

    #[test]
    fn test_empty_user_id_rejected() {
        let settings = UserSettings::new(" ");
        assert_eq!(settings.validate().unwrap_err().field, "user_id");
    }

    #[test]
    fn test_apply_marks_section_customized() {
        let mut settings = UserSettings::new("user1");
        settings.apply(SectionUpdate::Units(UnitPreferences {
            temperature_unit: TemperatureUnit::Fahrenheit,
            ..UnitPreferences::default()
        }));

        assert!(settings.units.is_customized);
        assert_eq!(settings.units.temperature_unit, TemperatureUnit::Fahrenheit);
        assert_eq!(settings.customized_sections(), vec![SettingsSection::Units]);
    }

    #[test]
    fn test_reset_restores_defaults() {
        let mut settings = UserSettings::new("user1");
        settings.apply(SectionUpdate::Display(DisplayPreferences {
            theme: Theme::Dark,
            ..DisplayPreferences::default()
        }));
        settings.reset(SettingsSection::Display);

        assert_eq!(settings.display, DisplayPreferences::default());
        assert!(!settings.has_customizations());
    }

    #[test]
    fn test_same_content_ignores_metadata() {
        let a = UserSettings::new("user1");
        let mut b = a.clone();
        b.meta.sync_status = SyncStatus::Synced;
        b.meta.version = 0;
        assert!(a.same_content(&b));

        b.privacy.data_sharing = true;
        assert!(!a.same_content(&b));
        assert!(!a.section_equals(&b, SettingsSection::Privacy));
        assert!(a.section_equals(&b, SettingsSection::Units));
    }

    #[test]
    fn test_section_from_str() {
        assert_eq!(
            "Cycle".parse::<SettingsSection>().unwrap(),
            SettingsSection::Cycle
        );
        assert!("volume".parse::<SettingsSection>().is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let mut settings = UserSettings::new("user1");
        settings.cycle.average_cycle_length = 31;
        settings.cycle.is_customized = true;

        let json = serde_json::to_string(&settings).unwrap();
        let parsed: UserSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn test_missing_groups_deserialize_to_defaults() {
        let json = r#"{
            "user_id": "user1",
            "sync_status": "synced",
            "last_modified": "2025-01-01T00:00:00Z",
            "version": 2
        }"#;
        let parsed: UserSettings = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.cycle, CyclePreferences::default());
        assert_eq!(parsed.meta.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn test_display() {
        let settings = UserSettings::new("user1");
        let output = format!("{}", settings);
        assert!(output.contains("Settings for user1"));
        assert!(output.contains("28 day cycle"));
        assert!(output.contains("20:00"));
    }
}
