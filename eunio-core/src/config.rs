use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::store::DeviceInfo;

/// Tunables for the sync engine.
///
/// Every field has a default so a config file only needs to name the values
/// it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempts per item for transient push failures within one sync call
    pub max_push_attempts: u32,
    /// Timestamp gap beyond which the newer side of a conflict wins outright
    pub conflict_threshold_secs: i64,
    /// Automatic backups kept per user
    pub backup_keep_count: usize,
    pub recovery_poll_interval_ms: u64,
    pub recovery_timeout_ms: u64,
    /// Users whose settings stay cached in memory
    pub cache_capacity: usize,
    pub device: DeviceInfo,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_push_attempts: 3,
            conflict_threshold_secs: 3600,
            backup_keep_count: 5,
            recovery_poll_interval_ms: 2_000,
            recovery_timeout_ms: 30_000,
            cache_capacity: 32,
            device: DeviceInfo::default(),
        }
    }
}

impl EngineConfig {
    pub fn conflict_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.conflict_threshold_secs)
    }

    pub fn recovery_poll_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_poll_interval_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_push_attempts, 3);
        assert_eq!(config.conflict_threshold(), chrono::Duration::hours(1));
        assert_eq!(config.recovery_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"backup_keep_count": 10}"#).unwrap();
        assert_eq!(config.backup_keep_count, 10);
        assert_eq!(config.cache_capacity, 32);
    }
}
