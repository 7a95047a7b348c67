use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::sync_status::{EntityKind, SyncEntity, SyncMetadata};
use crate::error::ValidationError;

pub const PROFILE_VERSION: i32 = 1;

/// Basic account profile, one per user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub display_name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub height_cm: Option<u16>,
    #[serde(flatten)]
    pub meta: SyncMetadata,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            date_of_birth: None,
            height_cm: None,
            meta: SyncMetadata::new(PROFILE_VERSION),
        }
    }

    pub fn with_date_of_birth(mut self, date: NaiveDate) -> Self {
        self.date_of_birth = Some(date);
        self
    }

    pub fn with_height_cm(mut self, height: u16) -> Self {
        self.height_cm = Some(height);
        self
    }
}

impl SyncEntity for UserProfile {
    const KIND: EntityKind = EntityKind::Profile;

    fn id(&self) -> String {
        self.user_id.clone()
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
        let name_len = self.display_name.trim().chars().count();
        if name_len == 0 || name_len > 64 {
            return Err(ValidationError::new(
                "display_name",
                "must be between 1 and 64 characters",
            ));
        }
        if let Some(height) = self.height_cm {
            ValidationError::check_range("height_cm", height, 100..=250)?;
        }
        if let Some(dob) = self.date_of_birth {
            if dob > chrono::Utc::now().date_naive() {
                return Err(ValidationError::new(
                    "date_of_birth",
                    "must not be in the future",
                ));
            }
        }
        Ok(())
    }
}
