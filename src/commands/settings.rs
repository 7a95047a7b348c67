use clap::{Args, Subcommand, ValueEnum};
use serde_json::Value;
use std::path::PathBuf;

use eunio_core::models::{SectionUpdate, SettingsSection, UserSettings};
use eunio_core::ImportStrategy;

use super::OutputFormat;
use crate::session::Session;

#[derive(Clone, Copy, ValueEnum)]
pub enum StrategyArg {
    /// Replace every group with the imported one
    Replace,
    /// Take imported groups only where they were customized
    Merge,
}

impl From<StrategyArg> for ImportStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Replace => ImportStrategy::ReplaceAll,
            StrategyArg::Merge => ImportStrategy::MergeWithExisting,
        }
    }
}

#[derive(Args)]
pub struct SettingsCommand {
    #[command(subcommand)]
    pub command: SettingsSubcommand,
}

#[derive(Subcommand)]
pub enum SettingsSubcommand {
    /// Show current settings
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Change values in one settings group
    Set {
        /// Group name (units, notifications, cycle, privacy, display, sync)
        section: SettingsSection,

        /// Values as key=value, e.g. temperature_unit=fahrenheit
        #[arg(required = true)]
        values: Vec<String>,
    },

    /// Restore one settings group to its defaults
    Reset {
        /// Group name
        section: SettingsSection,
    },

    /// Export settings as JSON
    Export {
        /// Write to a file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Upload the export and print a share link
        #[arg(long)]
        share: bool,
    },

    /// Import settings from an export file
    Import {
        file: PathBuf,

        #[arg(long, value_enum, default_value = "replace")]
        strategy: StrategyArg,
    },

    /// Restore settings on this device from an export file or the latest
    /// remote backup
    Restore {
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Delete all of this user's data
    DeleteAccount {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
}

impl SettingsCommand {
    pub async fn run(&self, session: &Session) -> Result<(), Box<dyn std::error::Error>> {
        let manager = &session.manager;
        let user_id = session.user_id.as_str();

        match &self.command {
            SettingsSubcommand::Show { format } => {
                let settings = manager.get_or_create(user_id).await?;
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&settings)?),
                    OutputFormat::Text => print_settings(&settings),
                }
            }
            SettingsSubcommand::Set { section, values } => {
                let current = manager.get_or_create(user_id).await?;
                let update = build_update(&current, *section, values)?;
                let saved = manager.update_section(user_id, update).await?;
                println!("Updated {} settings ({})", section, saved.meta.sync_status);
                session.after_write().await;
            }
            SettingsSubcommand::Reset { section } => {
                let saved = manager.reset_section(user_id, *section).await?;
                println!("Reset {} settings ({})", section, saved.meta.sync_status);
                session.after_write().await;
            }
            SettingsSubcommand::Export { output, share } => {
                if *share {
                    let link = manager.backups().share_export(user_id).await?;
                    println!("Share link: {}", link);
                    return Ok(());
                }
                let payload = manager.export_data(user_id).await?;
                match output {
                    Some(path) => {
                        std::fs::write(path, &payload)?;
                        println!("Exported settings to {}", path.display());
                    }
                    None => println!("{}", payload),
                }
            }
            SettingsSubcommand::Import { file, strategy } => {
                let payload = std::fs::read_to_string(file)?;
                let imported = manager
                    .import_settings(user_id, &payload, (*strategy).into())
                    .await?;
                println!(
                    "Imported settings from {} ({})",
                    file.display(),
                    imported.meta.sync_status
                );
                session.after_write().await;
            }
            SettingsSubcommand::Restore { file } => {
                let payload = file.as_ref().map(std::fs::read_to_string).transpose()?;
                let restored = manager
                    .restore_on_new_device(user_id, payload.as_deref())
                    .await?;
                println!("Restored settings ({})", restored.meta.sync_status);
                session.after_write().await;
            }
            SettingsSubcommand::DeleteAccount { yes } => {
                if !yes {
                    return Err("Refusing to delete account data without --yes".into());
                }
                manager.delete_account(user_id).await?;
                println!("Deleted all data for {}", user_id);
            }
        }
        Ok(())
    }
}

/// Builds a replacement for one group from `key=value` assignments applied
/// over its current values. Values are read as JSON where they parse, and as
/// plain strings otherwise.
fn build_update(
    settings: &UserSettings,
    section: SettingsSection,
    assignments: &[String],
) -> Result<SectionUpdate, String> {
    let doc = serde_json::to_value(settings).map_err(|e| e.to_string())?;
    let mut group = doc
        .get(section.as_str())
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| format!("Settings have no {} group", section))?;

    for assignment in assignments {
        let (key, raw) = assignment
            .split_once('=')
            .ok_or_else(|| format!("Expected key=value, got '{}'", assignment))?;
        let key = key.trim();
        if key == "is_customized" || !group.contains_key(key) {
            return Err(format!("Unknown {} setting: {}", section, key));
        }
        let value = serde_json::from_str(raw.trim())
            .unwrap_or_else(|_| Value::String(raw.trim().to_string()));
        group.insert(key.to_string(), value);
    }

    let group = Value::Object(group);
    let invalid = |e: serde_json::Error| format!("Invalid {} settings: {}", section, e);
    let update = match section {
        SettingsSection::Units => SectionUpdate::Units(serde_json::from_value(group).map_err(invalid)?),
        SettingsSection::Notifications => {
            SectionUpdate::Notifications(serde_json::from_value(group).map_err(invalid)?)
        }
        SettingsSection::Cycle => SectionUpdate::Cycle(serde_json::from_value(group).map_err(invalid)?),
        SettingsSection::Privacy => {
            SectionUpdate::Privacy(serde_json::from_value(group).map_err(invalid)?)
        }
        SettingsSection::Display => {
            SectionUpdate::Display(serde_json::from_value(group).map_err(invalid)?)
        }
        SettingsSection::Sync => SectionUpdate::Sync(serde_json::from_value(group).map_err(invalid)?),
    };
    Ok(update)
}

fn print_settings(settings: &UserSettings) {
    println!("Settings for {}", settings.user_id);
    println!(
        "Version {}, {} (modified {})",
        settings.meta.version,
        settings.meta.sync_status,
        settings.meta.last_modified.format("%Y-%m-%d %H:%M:%S")
    );

    let doc = serde_json::to_value(settings).unwrap_or(Value::Null);
    for section in SettingsSection::ALL {
        println!();
        let marker = if settings.is_customized(section) {
            " (customized)"
        } else {
            ""
        };
        println!("[{}]{}", section, marker);
        if let Some(group) = doc.get(section.as_str()).and_then(Value::as_object) {
            for (key, value) in group {
                if key != "is_customized" {
                    println!("  {}: {}", key, value);
                }
            }
        }
    }
}
