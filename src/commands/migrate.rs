use clap::{Args, Subcommand};
use std::path::PathBuf;

use eunio_core::migration::document_version;
use eunio_core::models::CURRENT_SETTINGS_VERSION;
use eunio_core::MigrationInfo;

use super::OutputFormat;
use crate::session::Session;

#[derive(Args)]
pub struct MigrateCommand {
    #[command(subcommand)]
    pub command: MigrateSubcommand,
}

#[derive(Subcommand)]
pub enum MigrateSubcommand {
    /// Describe the migration between two settings versions
    Info {
        #[arg(long)]
        from: i32,

        /// Defaults to the current version
        #[arg(long)]
        to: Option<i32>,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Upgrade a settings JSON document to the current version
    File {
        input: PathBuf,

        /// Write to a file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Show the schema version of the stored settings
    Status,
}

impl MigrateCommand {
    pub async fn run(&self, session: &Session) -> Result<(), Box<dyn std::error::Error>> {
        let migration = &session.migration;

        match &self.command {
            MigrateSubcommand::Info { from, to, format } => {
                let info = migration.get_migration_info(*from, to.unwrap_or(CURRENT_SETTINGS_VERSION))?;
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
                    OutputFormat::Text => print_info(&info),
                }
            }
            MigrateSubcommand::File { input, output } => {
                let contents = std::fs::read_to_string(input)?;
                let doc: serde_json::Value = serde_json::from_str(&contents)?;
                let from = document_version(&doc);
                let upgraded = migration.upgrade_document(doc)?;
                let json = serde_json::to_string_pretty(&upgraded)?;
                match output {
                    Some(path) => {
                        std::fs::write(path, json)?;
                        println!(
                            "Upgraded {} from version {} to {}",
                            input.display(),
                            from,
                            CURRENT_SETTINGS_VERSION
                        );
                    }
                    None => println!("{}", json),
                }
            }
            MigrateSubcommand::Status => {
                // Reading through the repository upgrades an outdated local copy
                match session.settings.get(&session.user_id).await? {
                    Some(settings) => {
                        println!("Settings version: {}", settings.meta.version);
                        println!("Current version:  {}", CURRENT_SETTINGS_VERSION);
                        if migration.needs_migration(settings.meta.version) {
                            println!("Migration needed");
                        } else {
                            println!("Up to date");
                        }
                    }
                    None => println!("No settings stored for {}", session.user_id),
                }
            }
        }
        Ok(())
    }
}

fn print_info(info: &MigrationInfo) {
    println!(
        "Migration from version {} to {}",
        info.from_version, info.to_version
    );
    if info.changes.is_empty() {
        println!("  No changes");
    }
    for change in &info.changes {
        println!("  - {}", change);
    }
    if !info.breaking_changes.is_empty() {
        println!();
        println!("Breaking changes:");
        for change in &info.breaking_changes {
            println!("  ! {}", change);
        }
    }
    if info.requires_user_input {
        println!();
        println!("Some new values need your confirmation after upgrading.");
    }
}
