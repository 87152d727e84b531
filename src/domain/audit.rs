use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ENTITY_TRANSACTION: &str = "transaction";
pub const ENTITY_SUBSCRIPTION: &str = "circle_subscription";
pub const ENTITY_SUBSCRIPTION_ITEM: &str = "circle_subscription_item";
pub const ENTITY_CIRCLE_PRICE: &str = "circle_price";
pub const ENTITY_INVOICE: &str = "circle_invoice";
pub const ENTITY_CRYPTO_WALLET: &str = "crypto_wallet";
pub const ENTITY_CUSTOMER: &str = "customer";
pub const ENTITY_PAYOUT_ACCOUNT: &str = "payout_account";

/// One append-only entry in `audit_logs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub entity_type: String,
    pub action: String,
    pub old_val: Option<serde_json::Value>,
    pub new_val: Option<serde_json::Value>,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(entity_id: Uuid, entity_type: &str, action: &str, actor: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id,
            entity_type: entity_type.to_string(),
            action: action.to_string(),
            old_val: None,
            new_val: None,
            actor: actor.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn change(mut self, old_val: serde_json::Value, new_val: serde_json::Value) -> Self {
        self.old_val = Some(old_val);
        self.new_val = Some(new_val);
        self
    }

    pub fn with_new(mut self, new_val: serde_json::Value) -> Self {
        self.new_val = Some(new_val);
        self
    }
}
