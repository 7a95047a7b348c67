mod backup;
mod config_cmd;
mod conflict;
mod cycle;
mod log;
mod migrate;
mod profile;
mod settings;
mod sync_cmd;

pub use backup::BackupCommand;
pub use config_cmd::ConfigCommand;
pub use conflict::ConflictCommand;
pub use cycle::CycleCommand;
pub use log::LogCommand;
pub use migrate::MigrateCommand;
pub use profile::ProfileCommand;
pub use settings::SettingsCommand;
pub use sync_cmd::SyncCommand;

use chrono::NaiveDate;
use clap::ValueEnum;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Parses a YYYY-MM-DD date, defaulting to today.
fn parse_date(date: &Option<String>) -> Result<NaiveDate, String> {
    match date {
        Some(d) => NaiveDate::parse_from_str(d, "%Y-%m-%d")
            .map_err(|_| format!("Invalid date format: {}. Use YYYY-MM-DD", d)),
        None => Ok(chrono::Local::now().date_naive()),
    }
}
