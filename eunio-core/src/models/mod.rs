mod cycle;
mod daily_log;
mod profile;
mod settings;
mod sync_status;

pub use cycle::{CycleRecord, CYCLE_VERSION};
pub use daily_log::{DailyLog, FlowIntensity, Mood, DAILY_LOG_VERSION};
pub use profile::{UserProfile, PROFILE_VERSION};
pub use settings::{
    CyclePreferences, DisplayPreferences, NotificationPreferences, PrivacyPreferences,
    SectionUpdate, SettingsSection, SyncPreferences, TemperatureUnit, Theme, UnitPreferences,
    UserSettings, WeightUnit, CURRENT_SETTINGS_VERSION, MIN_SUPPORTED_SETTINGS_VERSION,
};
pub use sync_status::{EntityKind, SyncEntity, SyncMetadata, SyncStatus};
