use clap::{Args, Subcommand};

use eunio_core::models::{DailyLog, FlowIntensity, Mood, TemperatureUnit};

use super::{parse_date, OutputFormat};
use crate::session::Session;

#[derive(Args)]
pub struct LogCommand {
    #[command(subcommand)]
    pub command: LogSubcommand,
}

#[derive(Subcommand)]
pub enum LogSubcommand {
    /// Record or update the log for a day
    Add {
        /// Date (YYYY-MM-DD), defaults to today
        #[arg(long, short)]
        date: Option<String>,

        /// Flow (spotting, light, medium, heavy)
        #[arg(long)]
        flow: Option<FlowIntensity>,

        /// Mood (happy, calm, tired, anxious, irritable, sad)
        #[arg(long)]
        mood: Option<Mood>,

        /// Add a symptom (can be repeated)
        #[arg(long = "symptom", value_name = "SYMPTOM")]
        symptoms: Vec<String>,

        /// Basal body temperature in the unit chosen in settings
        #[arg(long)]
        temperature: Option<f64>,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Show the log for a day
    Show {
        /// Date (YYYY-MM-DD), defaults to today
        #[arg(long, short)]
        date: Option<String>,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Delete the log for a day
    Delete {
        /// Date (YYYY-MM-DD)
        #[arg(long, short)]
        date: String,
    },
}

impl LogCommand {
    pub async fn run(&self, session: &Session) -> Result<(), Box<dyn std::error::Error>> {
        let user_id = session.user_id.as_str();

        match &self.command {
            LogSubcommand::Add {
                date,
                flow,
                mood,
                symptoms,
                temperature,
                notes,
            } => {
                let date = parse_date(date)?;
                let mut log = session
                    .daily_logs
                    .get(&DailyLog::key(user_id, date))
                    .await?
                    .unwrap_or_else(|| DailyLog::new(user_id, date));

                if let Some(flow) = flow {
                    log.flow = Some(*flow);
                }
                if let Some(mood) = mood {
                    log.mood = Some(*mood);
                }
                for symptom in symptoms {
                    if !log.symptoms.contains(symptom) {
                        log.symptoms.push(symptom.clone());
                    }
                }
                if let Some(value) = temperature {
                    let unit = session.manager.get_or_create(user_id).await?.units.temperature_unit;
                    log.basal_temperature_c = Some(to_celsius(*value, unit));
                }
                if let Some(notes) = notes {
                    log.notes = Some(notes.clone());
                }

                let saved = session.daily_logs.save(&log).await?;
                println!("Logged {} ({})", saved.date, saved.meta.sync_status);
                session.after_write().await;
            }
            LogSubcommand::Show { date, format } => {
                let date = parse_date(date)?;
                let log = session
                    .daily_logs
                    .get(&DailyLog::key(user_id, date))
                    .await?
                    .ok_or_else(|| format!("No log for {}", date))?;
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&log)?),
                    OutputFormat::Text => println!("{}", log),
                }
            }
            LogSubcommand::Delete { date } => {
                let date = parse_date(&Some(date.clone()))?;
                session.daily_logs.delete(&DailyLog::key(user_id, date)).await?;
                println!("Deleted log for {}", date);
            }
        }
        Ok(())
    }
}

fn to_celsius(value: f64, unit: TemperatureUnit) -> f64 {
    match unit {
        TemperatureUnit::Celsius => value,
        TemperatureUnit::Fahrenheit => (value - 32.0) * 5.0 / 9.0,
    }
}
