use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockchainTransaction {
    pub id: Uuid,
    pub chain_id: i64,
    pub tx_hash: String,
    pub from_address: String,
    pub to_address: Option<String>,
    pub block_number: i64,
    pub transaction_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A `Curation` log emitted by the curation contract. `creator_id` is filled in once
/// the creator address maps to a platform user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockchainCurationEvent {
    pub id: Uuid,
    pub blockchain_transaction_id: Uuid,
    pub curator_address: String,
    pub creator_address: String,
    pub creator_id: Option<Uuid>,
    pub token_address: Option<String>,
    pub uri: String,
    /// Raw token amount in the token's smallest unit.
    pub amount: BigDecimal,
    pub created_at: DateTime<Utc>,
}
