use clap::{Args, Subcommand};

use super::OutputFormat;
use crate::config::Config;

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        let mut config = config.clone();
                        if config.sync.api_key.is_some() {
                            config.sync.api_key = Some("********".to_string());
                        }
                        println!("{}", serde_json::to_string_pretty(&config)?);
                    }
                    OutputFormat::Text => print_text(config),
                }
                Ok(())
            }
        }
    }
}

fn print_text(config: &Config) {
    println!("Configuration");
    println!("=============\n");

    if let Some(path) = &config.config_file {
        println!("Config file: {}", path.display());
    } else {
        println!(
            "Config file: {} (not found)",
            Config::default_config_path().display()
        );
    }
    println!();

    println!("database_path: {}", config.database_path.value.display());
    println!("  source: {}", config.database_path.source);
    println!();

    println!("user_id: {}", config.user_id.value);
    println!("  source: {}", config.user_id.source);
    println!();

    println!("device_name: {}", config.device_name.value);
    println!("  source: {}", config.device_name.source);
    println!();

    println!(
        "sync.server_url: {}",
        config.sync.server_url.as_deref().unwrap_or("(not set)")
    );
    println!(
        "sync.api_key: {}",
        if config.sync.api_key.is_some() {
            "(set)"
        } else {
            "(not set)"
        }
    );
    println!("sync.auto_sync: {}", config.sync.auto_sync);
    println!("sync.metered: {}", config.sync.metered);
    println!();

    let engine = &config.engine;
    println!("engine.max_push_attempts: {}", engine.max_push_attempts);
    println!(
        "engine.conflict_threshold_secs: {}",
        engine.conflict_threshold_secs
    );
    println!("engine.backup_keep_count: {}", engine.backup_keep_count);
    println!(
        "engine.recovery_poll_interval_ms: {}",
        engine.recovery_poll_interval_ms
    );
    println!("engine.recovery_timeout_ms: {}", engine.recovery_timeout_ms);
    println!("engine.cache_capacity: {}", engine.cache_capacity);
}
