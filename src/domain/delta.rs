//! Per-participant view of the ledger.
//!
//! A transaction contributes one row per non-null participant: `+amount` for the
//! recipient and `-amount` for the sender. This is the same definition as the
//! `transaction_delta_view` SQL view; [`delta_rows`] is used wherever the ledger is
//! read without Postgres and by the reconciliation checks.

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::transaction::{Currency, Purpose, Transaction, TransactionState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaRow {
    pub transaction_id: Uuid,
    pub user_id: Uuid,
    pub delta: BigDecimal,
    pub currency: Currency,
    pub purpose: Purpose,
    pub state: TransactionState,
    pub created_at: DateTime<Utc>,
}

pub fn delta_rows(tx: &Transaction) -> Vec<DeltaRow> {
    let row = |user_id: Uuid, delta: BigDecimal| DeltaRow {
        transaction_id: tx.id,
        user_id,
        delta,
        currency: tx.currency,
        purpose: tx.purpose,
        state: tx.state,
        created_at: tx.created_at,
    };

    let mut rows = Vec::with_capacity(2);
    if let Some(recipient) = tx.recipient_id {
        rows.push(row(recipient, tx.amount.clone()));
    }
    if let Some(sender) = tx.sender_id {
        rows.push(row(sender, -tx.amount.clone()));
    }
    rows
}

/// Sum of succeeded deltas for one user and currency.
pub fn balance<'a>(
    rows: impl IntoIterator<Item = &'a DeltaRow>,
    user_id: Uuid,
    currency: Currency,
) -> BigDecimal {
    rows.into_iter()
        .filter(|row| {
            row.user_id == user_id
                && row.currency == currency
                && row.state == TransactionState::Succeeded
        })
        .fold(BigDecimal::zero(), |acc, row| acc + &row.delta)
}

/// Spendable balance: succeeded deltas minus outgoing amounts still pending.
pub fn available_balance<'a>(
    rows: impl IntoIterator<Item = &'a DeltaRow>,
    user_id: Uuid,
    currency: Currency,
) -> BigDecimal {
    let zero = BigDecimal::zero();
    rows.into_iter()
        .filter(|row| row.user_id == user_id && row.currency == currency)
        .filter(|row| match row.state {
            TransactionState::Succeeded => true,
            TransactionState::Pending => row.delta < zero,
            _ => false,
        })
        .fold(BigDecimal::zero(), |acc, row| acc + &row.delta)
}

/// Net of succeeded two-party transactions per currency. Every entry should be zero;
/// anything else is ledger drift.
pub fn two_party_net<'a>(
    transactions: impl IntoIterator<Item = &'a Transaction>,
) -> HashMap<Currency, BigDecimal> {
    let mut net: HashMap<Currency, BigDecimal> = HashMap::new();
    for tx in transactions {
        if tx.state != TransactionState::Succeeded
            || tx.sender_id.is_none()
            || tx.recipient_id.is_none()
        {
            continue;
        }
        let entry = net.entry(tx.currency).or_insert_with(BigDecimal::zero);
        for row in delta_rows(tx) {
            *entry += row.delta;
        }
    }
    net
}
