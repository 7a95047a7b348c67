use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod db;
mod remote;
mod session;

use commands::{
    BackupCommand, ConfigCommand, ConflictCommand, CycleCommand, LogCommand, MigrateCommand,
    ProfileCommand, SettingsCommand, SyncCommand,
};
use config::Config;
use session::Session;

#[derive(Parser)]
#[command(name = "eunio")]
#[command(version)]
#[command(about = "Offline-first cycle and health tracking", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// View and change settings, export and import them
    Settings(SettingsCommand),

    /// Manage the user profile
    Profile(ProfileCommand),

    /// Record daily health logs
    Log(LogCommand),

    /// Record cycles
    Cycle(CycleCommand),

    /// Sync with remote server
    Sync(SyncCommand),

    /// Inspect and resolve settings conflicts
    Conflict(ConflictCommand),

    /// Manage settings backups
    Backup(BackupCommand),

    /// Settings schema migrations
    Migrate(MigrateCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eunio=warn,eunio_core=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = Config::load(cli.config)?;

    let command = match cli.command {
        Some(Commands::Config(cmd)) => return cmd.run(&config),
        Some(command) => command,
        None => {
            println!("Use --help to see available commands");
            return Ok(());
        }
    };

    let session = Session::open(&config).await?;
    match command {
        Commands::Settings(cmd) => cmd.run(&session).await?,
        Commands::Profile(cmd) => cmd.run(&session).await?,
        Commands::Log(cmd) => cmd.run(&session).await?,
        Commands::Cycle(cmd) => cmd.run(&session).await?,
        Commands::Sync(cmd) => cmd.run(&session, &config).await?,
        Commands::Conflict(cmd) => cmd.run(&session).await?,
        Commands::Backup(cmd) => cmd.run(&session, &config).await?,
        Commands::Migrate(cmd) => cmd.run(&session).await?,
        Commands::Config(cmd) => cmd.run(&config)?,
    }

    Ok(())
}
