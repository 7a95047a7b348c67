use clap::{Args, Subcommand};

use eunio_core::conflict::{ResolutionPreview, SectionSource};
use eunio_core::{ResolutionStrategy, SettingsConflict};

use super::OutputFormat;
use crate::session::Session;

#[derive(Args)]
pub struct ConflictCommand {
    #[command(subcommand)]
    pub command: ConflictSubcommand,
}

#[derive(Subcommand)]
pub enum ConflictSubcommand {
    /// Compare unsynced local settings with the server copy
    Check {
        /// Strategy to preview instead of the recommended one
        #[arg(long)]
        strategy: Option<ResolutionStrategy>,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Resolve a settings conflict
    Resolve {
        /// local-wins, remote-wins, merge-fields or last-write-wins;
        /// defaults to the recommended strategy
        #[arg(long)]
        strategy: Option<ResolutionStrategy>,
    },
}

impl ConflictCommand {
    pub async fn run(&self, session: &Session) -> Result<(), Box<dyn std::error::Error>> {
        let resolver = &session.resolver;
        let Some(conflict) = resolver.detect_conflict(&session.user_id).await? else {
            println!("No settings conflict.");
            return Ok(());
        };

        match &self.command {
            ConflictSubcommand::Check { strategy, format } => {
                let strategy =
                    strategy.unwrap_or_else(|| resolver.get_recommended_strategy(&conflict));
                let preview = resolver.preview_resolution(&conflict, strategy);
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&preview)?),
                    OutputFormat::Text => print_preview(&conflict, &preview),
                }
            }
            ConflictSubcommand::Resolve { strategy } => {
                let strategy =
                    strategy.unwrap_or_else(|| resolver.get_recommended_strategy(&conflict));
                let resolved = resolver.resolve_conflict(&conflict, strategy).await?;
                println!(
                    "Resolved settings conflict with {} ({})",
                    strategy, resolved.meta.sync_status
                );
            }
        }
        Ok(())
    }
}

fn print_preview(conflict: &SettingsConflict, preview: &ResolutionPreview) {
    println!("Settings conflict: {}", conflict.conflict_type);
    println!(
        "  Local modified:  {}",
        conflict.local.meta.last_modified.format("%Y-%m-%d %H:%M:%S")
    );
    println!(
        "  Remote modified: {}",
        conflict.remote.meta.last_modified.format("%Y-%m-%d %H:%M:%S")
    );
    println!(
        "  Recommended:     {}",
        conflict.recommended_strategy()
    );
    println!();
    println!("Preview ({}):", preview.strategy);
    for change in &preview.sections {
        let source = match change.source {
            SectionSource::Unchanged => "unchanged",
            SectionSource::Local => "keep local",
            SectionSource::Remote => "take remote",
        };
        println!("  {:<14} {}", change.section.as_str(), source);
    }

    let changed = preview.local_changes().count();
    println!();
    println!("{} group(s) would change on this device", changed);
}
