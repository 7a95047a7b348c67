use chrono::NaiveDate;
use clap::{Args, Subcommand};

use eunio_core::UserProfile;

use super::OutputFormat;
use crate::session::Session;

#[derive(Args)]
pub struct ProfileCommand {
    #[command(subcommand)]
    pub command: ProfileSubcommand,
}

#[derive(Subcommand)]
pub enum ProfileSubcommand {
    /// Show the profile
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Create or update the profile
    Set {
        /// Display name
        #[arg(long)]
        name: Option<String>,

        /// Date of birth (YYYY-MM-DD)
        #[arg(long)]
        dob: Option<String>,

        /// Height in centimeters
        #[arg(long)]
        height: Option<u16>,
    },
}

impl ProfileCommand {
    pub async fn run(&self, session: &Session) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ProfileSubcommand::Show { format } => {
                let profile = session
                    .profiles
                    .get(&session.user_id)
                    .await?
                    .ok_or_else(|| format!("No profile for {}", session.user_id))?;
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&profile)?),
                    OutputFormat::Text => {
                        println!("Name:          {}", profile.display_name);
                        if let Some(dob) = profile.date_of_birth {
                            println!("Date of birth: {}", dob);
                        }
                        if let Some(height) = profile.height_cm {
                            println!("Height:        {} cm", height);
                        }
                        println!("Sync status:   {}", profile.meta.sync_status);
                    }
                }
            }
            ProfileSubcommand::Set { name, dob, height } => {
                let existing = session.profiles.get(&session.user_id).await?;
                let mut profile = match (existing, name) {
                    (Some(mut profile), name) => {
                        if let Some(name) = name {
                            profile.display_name = name.clone();
                        }
                        profile
                    }
                    (None, Some(name)) => UserProfile::new(session.user_id.clone(), name.clone()),
                    (None, None) => return Err("--name is required for a new profile".into()),
                };
                if let Some(dob) = dob {
                    let date = NaiveDate::parse_from_str(dob, "%Y-%m-%d")
                        .map_err(|_| format!("Invalid date format: {}. Use YYYY-MM-DD", dob))?;
                    profile.date_of_birth = Some(date);
                }
                if let Some(height) = height {
                    profile.height_cm = Some(*height);
                }

                let saved = session.profiles.save(&profile).await?;
                println!(
                    "Saved profile for {} ({})",
                    saved.display_name, saved.meta.sync_status
                );
                session.after_write().await;
            }
        }
        Ok(())
    }
}
