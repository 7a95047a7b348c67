//! Sync CLI commands for pushing local changes to the server.

use clap::{Args, Subcommand};

use eunio_core::{EunioError, SyncState, SyncStatistics};

use crate::config::Config;
use crate::session::Session;

/// Sync with remote server
#[derive(Debug, Args)]
pub struct SyncCommand {
    /// Sync even when nothing is pending
    #[arg(long)]
    force: bool,

    #[command(subcommand)]
    command: Option<SyncSubcommand>,
}

#[derive(Debug, Subcommand)]
enum SyncSubcommand {
    /// Show sync configuration, connectivity and pending changes
    Status,

    /// Queue failed changes for another attempt
    Retry,

    /// Wait for the server to become reachable, then sync
    Recover,

    /// Sync whenever the server becomes reachable, until interrupted
    Watch,
}

impl SyncCommand {
    pub async fn run(&self, session: &Session, config: &Config) -> Result<(), SyncCommandError> {
        match &self.command {
            Some(SyncSubcommand::Status) => return self.status(session, config).await,
            Some(SyncSubcommand::Retry) => return self.retry(session).await,
            _ => {}
        }

        if !config.sync.is_configured() {
            return Err(SyncCommandError::NotConfigured);
        }

        let user_id = session.user_id.as_str();
        match &self.command {
            Some(SyncSubcommand::Recover) => {
                println!("Waiting for the sync server...");
                let stats = session.coordinator.recover_from_sync_failure(user_id).await?;
                print_statistics(&stats);
            }
            Some(SyncSubcommand::Watch) => self.watch(session).await?,
            _ => {
                println!("Syncing with server...");
                println!();
                let stats = if self.force {
                    session.coordinator.force_sync(user_id).await?
                } else {
                    session.coordinator.perform_full_sync(user_id).await?
                };
                print_statistics(&stats);
            }
        }
        Ok(())
    }

    async fn status(&self, session: &Session, config: &Config) -> Result<(), SyncCommandError> {
        println!("Sync Configuration");
        println!("==================");
        println!();

        match &config.sync.server_url {
            None => {
                println!("Status: Not configured");
                println!();
                println!("To enable sync, add to your config file:");
                println!();
                println!("  sync:");
                println!("    server_url: \"https://sync.example.com\"");
                println!("    api_key: \"your-api-key\"");
                println!("    auto_sync: false");
                println!();
                println!("Or set environment variables:");
                println!("  EUNIO_SYNC_URL");
                println!("  EUNIO_SYNC_API_KEY");
            }
            Some(server_url) => {
                println!("Server:    {}", server_url);
                if let Some(api_key) = &config.sync.api_key {
                    let shown: String = api_key.chars().take(8).collect();
                    println!("API Key:   {}...", shown);
                }
                println!(
                    "Auto-sync: {}",
                    if config.sync.auto_sync {
                        "enabled"
                    } else {
                        "disabled"
                    }
                );
                println!();

                if session.connectivity.is_connected().await {
                    println!(
                        "Server status: ✓ connected ({})",
                        session.connectivity.network_type().await
                    );
                } else {
                    println!("Server status: ✗ unreachable");
                }
            }
        }

        println!();
        println!("Pending changes:");
        for repository in session.repositories() {
            let count = repository.pending_count(&session.user_id).await?;
            println!("  {:<10} {}", repository.kind().as_str(), count);
        }
        Ok(())
    }

    async fn retry(&self, session: &Session) -> Result<(), SyncCommandError> {
        let user_id = session.user_id.as_str();
        let retried = session.profiles.retry_failed(user_id).await?
            + session.settings.retry_failed(user_id).await?
            + session.daily_logs.retry_failed(user_id).await?
            + session.cycles.retry_failed(user_id).await?;
        println!("Queued {} failed change(s) for the next sync", retried);
        session.after_write().await;
        Ok(())
    }

    async fn watch(&self, session: &Session) -> Result<(), SyncCommandError> {
        let user_id = session.user_id.clone();
        let mut state = session.coordinator.observe_state(&user_id);
        let handle = session.coordinator.spawn_auto_sync(user_id.clone());
        println!("Watching connectivity for {} (Ctrl-C to stop)", user_id);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *state.borrow_and_update();
                    println!("Sync state: {}", current);
                    if current == SyncState::Completed {
                        if let Some(stats) = session.coordinator.last_statistics(&user_id) {
                            print_statistics(&stats);
                        }
                    }
                }
            }
        }

        handle.abort();
        Ok(())
    }
}

fn print_statistics(stats: &SyncStatistics) {
    println!(
        "  ✓ {} item(s) synced, {} failed",
        stats.items_synced, stats.items_failed
    );
    println!(
        "  Repositories: {} synced, {} failed",
        stats.repositories_synced, stats.repositories_failed
    );
    if stats.conflicts_resolved > 0 {
        println!("  Conflicts resolved: {}", stats.conflicts_resolved);
    }
    println!(
        "  Network: {}, took {} ms",
        stats.network_type,
        stats.duration.as_millis()
    );
}

/// Errors from sync commands
#[derive(Debug)]
pub enum SyncCommandError {
    NotConfigured,
    Engine(EunioError),
}

impl std::fmt::Display for SyncCommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncCommandError::NotConfigured => write!(
                f,
                "Sync not configured. Add sync.server_url to config or set EUNIO_SYNC_URL."
            ),
            SyncCommandError::Engine(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SyncCommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncCommandError::NotConfigured => None,
            SyncCommandError::Engine(e) => Some(e),
        }
    }
}

impl From<EunioError> for SyncCommandError {
    fn from(e: EunioError) -> Self {
        SyncCommandError::Engine(e)
    }
}
