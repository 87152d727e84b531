use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::transaction::string_enum;

pub const FLAG_PAYMENT: &str = "payment";
pub const FLAG_PAYOUT: &str = "payout";

/// Who a flag is open to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagMode {
    On,
    Off,
    Admin,
    Seeding,
}

string_enum!(FlagMode, "mode", {
    On => "on",
    Off => "off",
    Admin => "admin",
    Seeding => "seeding",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub name: String,
    pub mode: FlagMode,
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}
