use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::sync_status::{EntityKind, SyncEntity, SyncMetadata};
use crate::error::ValidationError;

pub const DAILY_LOG_VERSION: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowIntensity {
    Spotting,
    Light,
    Medium,
    Heavy,
}

impl FromStr for FlowIntensity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "spotting" => Ok(FlowIntensity::Spotting),
            "light" => Ok(FlowIntensity::Light),
            "medium" => Ok(FlowIntensity::Medium),
            "heavy" => Ok(FlowIntensity::Heavy),
            _ => Err(format!("Invalid flow intensity: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Happy,
    Calm,
    Tired,
    Anxious,
    Irritable,
    Sad,
}

impl FromStr for Mood {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "happy" => Ok(Mood::Happy),
            "calm" => Ok(Mood::Calm),
            "tired" => Ok(Mood::Tired),
            "anxious" => Ok(Mood::Anxious),
            "irritable" => Ok(Mood::Irritable),
            "sad" => Ok(Mood::Sad),
            _ => Err(format!("Invalid mood: {}", s)),
        }
    }
}

/// One day's health log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyLog {
    pub user_id: String,
    pub date: NaiveDate,
    pub flow: Option<FlowIntensity>,
    #[serde(default)]
    pub symptoms: Vec<String>,
    pub mood: Option<Mood>,
    /// Basal body temperature in Celsius
    pub basal_temperature_c: Option<f64>,
    pub notes: Option<String>,
    #[serde(flatten)]
    pub meta: SyncMetadata,
}

impl DailyLog {
    pub fn new(user_id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            user_id: user_id.into(),
            date,
            flow: None,
            symptoms: Vec::new(),
            mood: None,
            basal_temperature_c: None,
            notes: None,
            meta: SyncMetadata::new(DAILY_LOG_VERSION),
        }
    }

    /// Storage key for a user's log on a given day.
    pub fn key(user_id: &str, date: NaiveDate) -> String {
        format!("{}:{}", user_id, date)
    }

    pub fn with_flow(mut self, flow: FlowIntensity) -> Self {
        self.flow = Some(flow);
        self
    }

    pub fn with_mood(mut self, mood: Mood) -> Self {
        self.mood = Some(mood);
        self
    }

    pub fn with_symptom(mut self, symptom: impl Into<String>) -> Self {
        self.symptoms.push(symptom.into());
        self
    }

    pub fn with_temperature(mut self, celsius: f64) -> Self {
        self.basal_temperature_c = Some(celsius);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

impl SyncEntity for DailyLog {
    const KIND: EntityKind = EntityKind::DailyLog;

    fn id(&self) -> String {
        DailyLog::key(&self.user_id, self.date)
    }

    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn metadata(&self) -> &SyncMetadata {
        &self.meta
    }

    fn metadata_mut(&mut self) -> &mut SyncMetadata {
        &mut self.meta
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if let Some(temp) = self.basal_temperature_c {
            ValidationError::check_range("basal_temperature_c", temp, 35.0..=38.5)?;
        }
        if let Some(notes) = &self.notes {
            if notes.chars().count() > 1000 {
                return Err(ValidationError::new(
                    "notes",
                    "must be at most 1000 characters",
                ));
            }
        }
        if self.symptoms.iter().any(|s| s.trim().is_empty()) {
            return Err(ValidationError::new("symptoms", "must not contain blanks"));
        }
        Ok(())
    }
}

impl fmt::Display for DailyLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Daily Log: {}", self.date)?;
        writeln!(f, "{}", "=".repeat(30))?;

        if let Some(flow) = &self.flow {
            writeln!(f, "Flow: {:?}", flow)?;
        }
        if let Some(mood) = &self.mood {
            writeln!(f, "Mood: {:?}", mood)?;
        }
        if let Some(temp) = self.basal_temperature_c {
            writeln!(f, "Temperature: {:.2} °C", temp)?;
        }
        if !self.symptoms.is_empty() {
            writeln!(f, "Symptoms: {}", self.symptoms.join(", "))?;
        }
        if let Some(notes) = &self.notes {
            writeln!(f, "\nNotes: {}", notes)?;
        }
        write!(f, "Status: {}", self.meta.sync_status)
    }
}
