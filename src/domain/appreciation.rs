//! Legacy appreciation (clap) records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::transaction::string_enum;
use crate::validation::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AppreciationPurpose {
    Appreciate,
    AppreciateComment,
    AppreciateSubsidy,
}

string_enum!(AppreciationPurpose, "purpose", {
    Appreciate => "appreciate",
    AppreciateComment => "appreciateComment",
    AppreciateSubsidy => "appreciateSubsidy",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appreciation {
    /// Sequence id, assigned by the database.
    pub id: i64,
    pub uuid: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub amount: i32,
    pub purpose: AppreciationPurpose,
    pub reference_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAppreciation {
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub amount: i32,
    pub purpose: AppreciationPurpose,
    pub reference_id: Option<Uuid>,
}

impl NewAppreciation {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.amount <= 0 {
            return Err(ValidationError::new("amount", "must be greater than zero"));
        }
        if self.sender_id == self.recipient_id {
            return Err(ValidationError::new(
                "recipient_id",
                "cannot appreciate your own content",
            ));
        }
        if self.purpose != AppreciationPurpose::AppreciateSubsidy && self.reference_id.is_none() {
            return Err(ValidationError::new("reference_id", "is required"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_appreciation() {
        let mut input = NewAppreciation {
            sender_id: Uuid::new_v4(),
            recipient_id: Uuid::new_v4(),
            amount: 3,
            purpose: AppreciationPurpose::Appreciate,
            reference_id: Some(Uuid::new_v4()),
        };
        assert!(input.validate().is_ok());

        input.reference_id = None;
        assert_eq!(input.validate().unwrap_err().field, "reference_id");

        input.purpose = AppreciationPurpose::AppreciateSubsidy;
        assert!(input.validate().is_ok());

        input.amount = 0;
        assert!(input.validate().is_err());
    }
}
