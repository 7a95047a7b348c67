use clap::{Args, Subcommand};
use uuid::Uuid;

use super::OutputFormat;
use crate::config::Config;
use crate::session::Session;

#[derive(Args)]
pub struct BackupCommand {
    #[command(subcommand)]
    pub command: BackupSubcommand,
}

#[derive(Subcommand)]
pub enum BackupSubcommand {
    /// Take a manual backup of the current settings
    Create,

    /// List backups, newest first
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Restore settings from a backup
    Restore {
        /// Backup ID
        id: Uuid,
    },

    /// Remove old automatic backups
    Cleanup {
        /// Automatic backups to keep, defaults to engine.backup_keep_count
        #[arg(long)]
        keep: Option<usize>,
    },
}

impl BackupCommand {
    pub async fn run(
        &self,
        session: &Session,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let backups = session.manager.backups();
        let user_id = session.user_id.as_str();

        match &self.command {
            BackupSubcommand::Create => {
                let record = backups.create_manual_backup(user_id).await?;
                println!("Created backup {} ({} bytes)", record.id, record.size_bytes);
            }
            BackupSubcommand::List { format } => {
                let records = backups.list_backups(user_id).await?;
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
                    OutputFormat::Text => {
                        if records.is_empty() {
                            println!("No backups found.");
                            return Ok(());
                        }
                        println!("{:<36}  {:<9}  {:<19}  {:>8}", "ID", "TYPE", "CREATED", "BYTES");
                        for record in &records {
                            println!(
                                "{:<36}  {:<9}  {:<19}  {:>8}",
                                record.id.to_string(),
                                record.backup_type.as_str(),
                                record.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                                record.size_bytes
                            );
                        }
                    }
                }
            }
            BackupSubcommand::Restore { id } => {
                let restored = session.manager.restore_backup(user_id, *id).await?;
                println!("Restored backup {} ({})", id, restored.meta.sync_status);
                session.after_write().await;
            }
            BackupSubcommand::Cleanup { keep } => {
                let keep = keep.unwrap_or(config.engine.backup_keep_count);
                let removed = backups.cleanup_old_backups(user_id, keep).await?;
                println!("Removed {} old backup(s)", removed);
            }
        }
        Ok(())
    }
}
