use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::transaction::{Currency, ProviderKind};

/// The slice of a user account this subsystem needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    pub id: Uuid,
    pub has_password: bool,
    pub currency: Currency,
    pub is_admin: bool,
}

/// Payer identity at a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: ProviderKind,
    pub customer_ref: String,
    pub card_last4: Option<String>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
}

/// Payee identity at a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutAccount {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: ProviderKind,
    pub account_ref: String,
    pub country: Option<String>,
    pub currency: Currency,
    pub capabilities_transfers: bool,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
}

impl PayoutAccount {
    pub fn can_receive(&self) -> bool {
        !self.archived && self.capabilities_transfers
    }
}
