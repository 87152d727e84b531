//! One capability interface per settlement rail. Clients are constructed once at
//! startup and injected through [`Providers`].

pub mod blockchain;
pub mod exchange_rate;
pub mod matters;
pub mod retry;
pub mod stripe;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{Currency, ProviderKind, Purpose, SettlementOutcome, Transaction};
use crate::error::ErrorClass;

pub use retry::{RetryPolicy, Retryable};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider timed out: {0}")]
    Timeout(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider rate limited the request")]
    RateLimited,

    #[error("declined by provider: {0}")]
    Declined(String),

    #[error("not found at provider: {0}")]
    NotFound(String),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(String),

    #[error("provider misconfigured: {0}")]
    Misconfigured(String),

    #[error("{have} of {need} confirmations")]
    InsufficientConfirmations { have: u64, need: u64 },
}

impl ProviderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::Timeout(_)
            | ProviderError::Unavailable(_)
            | ProviderError::RateLimited
            | ProviderError::InsufficientConfirmations { .. } => {
                ErrorClass::Provider { retryable: true }
            }
            ProviderError::Declined(_)
            | ProviderError::NotFound(_)
            | ProviderError::InvalidResponse(_) => ErrorClass::Provider { retryable: false },
            ProviderError::Misconfigured(_) => ErrorClass::Fatal,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            ProviderError::Unavailable(err.to_string())
        } else {
            ProviderError::InvalidResponse(err.to_string())
        }
    }
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Provider { retryable: true })
    }
}

/// Provider-side state of a charge, payout or refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderOutcome {
    Pending,
    Succeeded,
    Failed,
    Canceled,
}

impl ProviderOutcome {
    /// The ledger outcome this maps to, if the provider has reached a terminal state.
    pub fn settlement(&self) -> Option<SettlementOutcome> {
        match self {
            ProviderOutcome::Pending => None,
            ProviderOutcome::Succeeded => Some(SettlementOutcome::Succeeded),
            ProviderOutcome::Failed => Some(SettlementOutcome::Failed),
            ProviderOutcome::Canceled => Some(SettlementOutcome::Canceled),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChargeDirection {
    /// Money flows from the payer into the platform.
    Collect { customer_ref: Option<String> },
    /// Money flows out to a connected account.
    Disburse { destination: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeRequest {
    /// Internal transaction id, echoed back to the provider as metadata.
    pub correlation_id: Uuid,
    pub amount: BigDecimal,
    pub currency: Currency,
    pub direction: ChargeDirection,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeReceipt {
    pub provider_ref: Option<String>,
    pub outcome: ProviderOutcome,
    pub client_secret: Option<String>,
}

/// Which provider object a transaction became. Without a stored reference the
/// provider is searched by correlation id among objects of this kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    Charge,
    Payout,
    Refund,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmLookup {
    pub correlation_id: Uuid,
    pub provider_ref: Option<String>,
    pub kind: LookupKind,
}

impl ConfirmLookup {
    pub fn for_transaction(tx: &Transaction) -> Self {
        let kind = match tx.purpose {
            Purpose::Payout => LookupKind::Payout,
            Purpose::Refund => LookupKind::Refund,
            _ => LookupKind::Charge,
        };
        Self {
            correlation_id: tx.id,
            provider_ref: tx.provider_tx_id.clone(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundRequest {
    /// The refund transaction's id; doubles as the idempotency key.
    pub correlation_id: Uuid,
    /// Provider reference of the charge being reversed.
    pub charge_ref: String,
    pub amount: BigDecimal,
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CurationLog {
    pub curator: String,
    pub creator: String,
    pub token: Option<String>,
    pub uri: String,
    /// Raw token units.
    pub amount: BigDecimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainReceipt {
    pub chain_id: i64,
    pub tx_hash: String,
    pub from: String,
    pub to: Option<String>,
    pub block_number: i64,
    pub curations: Vec<CurationLog>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Confirmation {
    pub provider_ref: Option<String>,
    pub outcome: ProviderOutcome,
    pub chain: Option<ChainReceipt>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, ProviderError>;

    async fn confirm(&self, lookup: &ConfirmLookup) -> Result<Confirmation, ProviderError>;

    async fn refund(&self, request: &RefundRequest) -> Result<ChargeReceipt, ProviderError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSubscription {
    pub subscription_ref: String,
    pub item_ref: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceCharge {
    pub invoice_id: Uuid,
    pub subscription_ref: String,
    pub customer_ref: String,
    pub amount: BigDecimal,
    pub discount: BigDecimal,
    pub currency: Currency,
}

/// Recurring-billing side of the card processor.
#[async_trait]
pub trait SubscriptionGateway: Send + Sync {
    async fn create_customer(&self, user_id: Uuid) -> Result<String, ProviderError>;

    async fn create_subscription(
        &self,
        customer_ref: &str,
        price_ref: &str,
        trial_end: Option<DateTime<Utc>>,
    ) -> Result<ProviderSubscription, ProviderError>;

    async fn add_item(&self, subscription_ref: &str, price_ref: &str)
        -> Result<String, ProviderError>;

    async fn swap_item(&self, item_ref: &str, price_ref: &str) -> Result<String, ProviderError>;

    async fn remove_item(&self, item_ref: &str) -> Result<(), ProviderError>;

    async fn cancel_subscription(&self, subscription_ref: &str) -> Result<(), ProviderError>;

    async fn create_price(
        &self,
        circle_id: Uuid,
        amount: &BigDecimal,
        currency: Currency,
    ) -> Result<String, ProviderError>;

    /// Opens the provider invoice for a finalized local invoice.
    async fn create_invoice(&self, charge: &InvoiceCharge) -> Result<String, ProviderError>;
}

/// Injected provider clients, one per rail.
#[derive(Clone)]
pub struct Providers {
    pub stripe: Arc<dyn PaymentProvider>,
    pub blockchain: Arc<dyn PaymentProvider>,
    pub matters: Arc<dyn PaymentProvider>,
}

impl Providers {
    pub fn get(&self, kind: ProviderKind) -> Arc<dyn PaymentProvider> {
        match kind {
            ProviderKind::Stripe => self.stripe.clone(),
            ProviderKind::Blockchain => self.blockchain.clone(),
            ProviderKind::Matters => self.matters.clone(),
        }
    }
}

/// Runs a provider call under the bounded provider timeout.
pub async fn with_timeout<T, F>(timeout: std::time::Duration, what: &str, call: F) -> Result<T, ProviderError>
where
    F: std::future::Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(format!(
            "{} exceeded {}s",
            what,
            timeout.as_secs()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn classifies_provider_errors() {
        assert!(ProviderError::RateLimited.is_retryable());
        assert!(ProviderError::InsufficientConfirmations { have: 1, need: 3 }.is_retryable());
        assert!(!ProviderError::Declined("card_declined".into()).is_retryable());
        assert_eq!(ProviderError::Misconfigured("key".into()).class(), ErrorClass::Fatal);
    }

    #[test]
    fn pending_outcome_has_no_settlement() {
        assert_eq!(ProviderOutcome::Pending.settlement(), None);
        assert_eq!(
            ProviderOutcome::Canceled.settlement(),
            Some(SettlementOutcome::Canceled)
        );
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let result: Result<(), ProviderError> = with_timeout(
            Duration::from_millis(10),
            "charge",
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            },
        )
        .await;
        assert!(matches!(result, Err(ProviderError::Timeout(_))));
    }
}
