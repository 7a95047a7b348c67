use clap::{Args, Subcommand};
use uuid::Uuid;

use eunio_core::CycleRecord;

use super::{parse_date, OutputFormat};
use crate::session::Session;

#[derive(Args)]
pub struct CycleCommand {
    #[command(subcommand)]
    pub command: CycleSubcommand,
}

#[derive(Subcommand)]
pub enum CycleSubcommand {
    /// Record the start of a cycle
    Start {
        /// Start date (YYYY-MM-DD), defaults to today
        #[arg(long, short)]
        date: Option<String>,

        /// Period length in days
        #[arg(long)]
        period_length: Option<u32>,
    },

    /// Record the end of a cycle
    End {
        /// Cycle ID
        id: Uuid,

        /// End date (YYYY-MM-DD), defaults to today
        #[arg(long, short)]
        date: Option<String>,
    },

    /// Show a recorded cycle
    Show {
        /// Cycle ID
        id: Uuid,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl CycleCommand {
    pub async fn run(&self, session: &Session) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            CycleSubcommand::Start {
                date,
                period_length,
            } => {
                let mut cycle = CycleRecord::new(session.user_id.clone(), parse_date(date)?);
                if let Some(days) = period_length {
                    cycle = cycle.with_period_length(*days);
                }
                let saved = session.cycles.save(&cycle).await?;
                println!(
                    "Started cycle {} on {} ({})",
                    saved.id, saved.start_date, saved.meta.sync_status
                );
                session.after_write().await;
            }
            CycleSubcommand::End { id, date } => {
                let cycle = self.load(session, id).await?;
                let saved = session
                    .cycles
                    .save(&cycle.with_end_date(parse_date(date)?))
                    .await?;
                if let Some(days) = saved.length_days() {
                    println!("Ended cycle {} after {} days", saved.id, days);
                }
                session.after_write().await;
            }
            CycleSubcommand::Show { id, format } => {
                let cycle = self.load(session, id).await?;
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&cycle)?),
                    OutputFormat::Text => {
                        println!("Cycle {}", cycle.id);
                        println!("  Start:  {}", cycle.start_date);
                        if let Some(end) = cycle.end_date {
                            println!("  End:    {}", end);
                        }
                        if let Some(days) = cycle.length_days() {
                            println!("  Length: {} days", days);
                        }
                        if let Some(days) = cycle.period_length_days {
                            println!("  Period: {} days", days);
                        }
                        println!("  Status: {}", cycle.meta.sync_status);
                    }
                }
            }
        }
        Ok(())
    }

    async fn load(
        &self,
        session: &Session,
        id: &Uuid,
    ) -> Result<CycleRecord, Box<dyn std::error::Error>> {
        let cycle = session
            .cycles
            .get(&id.to_string())
            .await?
            .ok_or_else(|| format!("Cycle not found: {}", id))?;
        if cycle.user_id != session.user_id {
            return Err(format!("Cycle not found: {}", id).into());
        }
        Ok(cycle)
    }
}
