use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::sync_status::{EntityKind, SyncEntity, SyncMetadata};
use crate::error::ValidationError;

pub const CYCLE_VERSION: i32 = 1;

/// A recorded menstrual cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub id: Uuid,
    pub user_id: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub period_length_days: Option<u32>,
    #[serde(flatten)]
    pub meta: SyncMetadata,
}

impl CycleRecord {
    pub fn new(user_id: impl Into<String>, start_date: NaiveDate) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            start_date,
            end_date: None,
            period_length_days: None,
            meta: SyncMetadata::new(CYCLE_VERSION),
        }
    }

    pub fn with_end_date(mut self, end_date: NaiveDate) -> Self {
        self.end_date = Some(end_date);
        self
    }

    pub fn with_period_length(mut self, days: u32) -> Self {
        self.period_length_days = Some(days);
        self
    }

    /// Length of a finished cycle in days, inclusive of both ends.
    pub fn length_days(&self) -> Option<i64> {
        self.end_date
            .map(|end| (end - self.start_date).num_days() + 1)
    }
}

impl SyncEntity for CycleRecord {
    const KIND: EntityKind = EntityKind::Cycle;

    fn id(&self) -> String {
        self.id.to_string()
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
        if let Some(end) = self.end_date {
            if end < self.start_date {
                return Err(ValidationError::new(
                    "end_date",
                    "must not be before the start date",
                ));
            }
        }
        if let Some(days) = self.period_length_days {
            ValidationError::check_range("period_length_days", days, 1..=15)?;
        }
        Ok(())
    }
}
