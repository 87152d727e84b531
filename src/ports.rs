//! Repository ports. Services depend on these traits; `adapters` provides the
//! Postgres and in-memory implementations.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    Appreciation, BlockchainCurationEvent, BlockchainTransaction, Circle, CircleCoupon,
    CircleInvoice, CirclePrice, CircleSubscription, CircleSubscriptionItem, CryptoWallet,
    CryptoWalletSignature, Currency, Customer, DeltaRow, FeatureFlag, FlagMode, InvoiceState,
    NewAppreciation, NewTransaction, PayoutAccount, ProviderKind, SignaturePurpose,
    SubscriptionState, Transaction, TransactionState, UserAccount,
};
use crate::validation::ValidationError;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance {
        available: BigDecimal,
        requested: BigDecimal,
    },

    #[error("invalid stored value: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("row".to_string()),
            sqlx::Error::Database(ref db) if db.is_unique_violation() => RepositoryError::Conflict(
                db.constraint().unwrap_or("unique constraint").to_string(),
            ),
            other => RepositoryError::Database(other),
        }
    }
}

impl From<ValidationError> for RepositoryError {
    fn from(err: ValidationError) -> Self {
        RepositoryError::Corrupt(err.to_string())
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Checked inside the insert: the debited user's available balance must cover the
/// amount, with concurrent debits of the same user serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceGuard {
    pub user_id: Uuid,
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceDrift {
    pub user_id: Uuid,
    pub currency: Currency,
    pub materialized: BigDecimal,
    pub computed: BigDecimal,
}

#[async_trait]
pub trait LedgerRepository: Send + Sync {
    async fn insert_transaction(
        &self,
        tx: &NewTransaction,
        state: TransactionState,
        guard: Option<BalanceGuard>,
    ) -> RepositoryResult<Transaction>;

    /// Writes a split parent and its optional fee child atomically.
    async fn insert_split(
        &self,
        parent: &NewTransaction,
        child: Option<&NewTransaction>,
    ) -> RepositoryResult<(Transaction, Option<Transaction>)>;

    async fn get_transaction(&self, id: Uuid) -> RepositoryResult<Transaction>;

    async fn find_by_provider_ref(
        &self,
        provider: ProviderKind,
        provider_tx_id: &str,
    ) -> RepositoryResult<Option<Transaction>>;

    /// Records the provider reference of a still-pending transaction that has none.
    async fn attach_provider_ref(&self, id: Uuid, provider_tx_id: &str) -> RepositoryResult<bool>;

    /// `pending -> state`. Returns false when the row was no longer pending.
    async fn settle(&self, id: Uuid, state: TransactionState) -> RepositoryResult<bool>;

    async fn deltas_for(
        &self,
        user_id: Uuid,
        currency: Option<Currency>,
    ) -> RepositoryResult<Vec<DeltaRow>>;

    async fn balance_of(&self, user_id: Uuid, currency: Currency) -> RepositoryResult<BigDecimal>;

    async fn available_balance(
        &self,
        user_id: Uuid,
        currency: Currency,
    ) -> RepositoryResult<BigDecimal>;

    /// Sum of refunds that are pending or succeeded against `original_id`.
    async fn refunded_total(&self, original_id: Uuid) -> RepositoryResult<BigDecimal>;

    async fn stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<Transaction>>;

    async fn two_party_net(&self) -> RepositoryResult<HashMap<Currency, BigDecimal>>;

    /// Refreshes the materialized balances and returns rows that disagree with a
    /// recomputation from the transaction rows.
    async fn balance_drift(&self) -> RepositoryResult<Vec<BalanceDrift>>;

    /// Idempotent on `(chain_id, tx_hash)`.
    async fn record_chain_receipt(
        &self,
        receipt: &BlockchainTransaction,
        events: &[BlockchainCurationEvent],
    ) -> RepositoryResult<()>;

    async fn insert_appreciation(&self, input: &NewAppreciation) -> RepositoryResult<Appreciation>;

    async fn appreciations_for(
        &self,
        recipient_id: Uuid,
        limit: i64,
    ) -> RepositoryResult<Vec<Appreciation>>;
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn get_circle(&self, id: Uuid) -> RepositoryResult<Circle>;

    async fn get_price(&self, id: Uuid) -> RepositoryResult<CirclePrice>;

    async fn active_price(&self, circle_id: Uuid) -> RepositoryResult<Option<CirclePrice>>;

    /// Inserts `price` as the active price and archives the previous one.
    async fn publish_price(&self, price: &CirclePrice) -> RepositoryResult<CirclePrice>;

    async fn get_subscription(&self, id: Uuid) -> RepositoryResult<CircleSubscription>;

    async fn open_subscription(&self, user_id: Uuid)
        -> RepositoryResult<Option<CircleSubscription>>;

    async fn find_subscription_by_provider_ref(
        &self,
        provider_subscription_id: &str,
    ) -> RepositoryResult<Option<CircleSubscription>>;

    async fn insert_subscription(
        &self,
        subscription: &CircleSubscription,
        item: &CircleSubscriptionItem,
    ) -> RepositoryResult<()>;

    async fn insert_item(&self, item: &CircleSubscriptionItem) -> RepositoryResult<()>;

    async fn active_items(&self, subscription_id: Uuid)
        -> RepositoryResult<Vec<CircleSubscriptionItem>>;

    /// Archives `old_item_id` with `canceled_at = at` and inserts `new_item`, atomically.
    async fn replace_item(
        &self,
        old_item_id: Uuid,
        new_item: &CircleSubscriptionItem,
        at: DateTime<Utc>,
    ) -> RepositoryResult<()>;

    async fn archive_item(&self, item_id: Uuid, at: DateTime<Utc>) -> RepositoryResult<bool>;

    /// Conditional `from -> to`.
    async fn transition_subscription(
        &self,
        id: Uuid,
        from: SubscriptionState,
        to: SubscriptionState,
    ) -> RepositoryResult<bool>;

    /// Cancels the subscription and archives its items with the same `canceled_at`.
    async fn cancel_subscription(&self, id: Uuid, at: DateTime<Utc>) -> RepositoryResult<bool>;

    async fn trials_ending_before(
        &self,
        before: DateTime<Utc>,
    ) -> RepositoryResult<Vec<CircleSubscription>>;

    /// Returns `None` when an invoice already exists for the same period.
    async fn insert_invoice(&self, invoice: &CircleInvoice)
        -> RepositoryResult<Option<CircleInvoice>>;

    async fn get_invoice(&self, id: Uuid) -> RepositoryResult<CircleInvoice>;

    async fn latest_invoice(&self, subscription_id: Uuid)
        -> RepositoryResult<Option<CircleInvoice>>;

    async fn find_invoice_by_provider_ref(
        &self,
        provider_invoice_id: &str,
    ) -> RepositoryResult<Option<CircleInvoice>>;

    async fn get_coupon(&self, id: Uuid) -> RepositoryResult<CircleCoupon>;

    /// Sets coupon, discount and amount due on a draft invoice without a coupon.
    async fn apply_coupon(
        &self,
        invoice_id: Uuid,
        coupon_id: Uuid,
        discount: &BigDecimal,
        amount: &BigDecimal,
    ) -> RepositoryResult<bool>;

    async fn transition_invoice(
        &self,
        id: Uuid,
        from: InvoiceState,
        to: InvoiceState,
        provider_invoice_id: Option<&str>,
    ) -> RepositoryResult<bool>;

    async fn drafts_created_before(
        &self,
        before: DateTime<Utc>,
    ) -> RepositoryResult<Vec<CircleInvoice>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkOutcome {
    Linked(CryptoWallet),
    /// The signature had already been consumed.
    Replayed,
    /// Another non-archived wallet holds the address, or the user already has one.
    AddressTaken,
}

#[async_trait]
pub trait WalletRepository: Send + Sync {
    async fn insert_signature(&self, signature: &CryptoWalletSignature) -> RepositoryResult<()>;

    async fn find_signature(
        &self,
        address: &str,
        nonce: &str,
    ) -> RepositoryResult<Option<CryptoWalletSignature>>;

    /// `active -> expired`.
    async fn expire_signature(&self, id: Uuid) -> RepositoryResult<bool>;

    /// `active -> used`, back-filling `user_id`.
    async fn consume_signature(
        &self,
        id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> RepositoryResult<bool>;

    async fn expire_stale_signatures(&self, now: DateTime<Utc>) -> RepositoryResult<u64>;

    /// `active -> inactive` for every open challenge of `address` and `purpose`.
    async fn deactivate_signatures(
        &self,
        address: &str,
        purpose: SignaturePurpose,
    ) -> RepositoryResult<u64>;

    /// Consumes the signature and creates the wallet in one unit of work.
    async fn link_wallet(
        &self,
        signature_id: Uuid,
        user_id: Uuid,
        address: &str,
        at: DateTime<Utc>,
    ) -> RepositoryResult<LinkOutcome>;

    async fn get_wallet(&self, id: Uuid) -> RepositoryResult<CryptoWallet>;

    async fn active_wallet_by_address(&self, address: &str)
        -> RepositoryResult<Option<CryptoWallet>>;

    async fn active_wallet_for_user(&self, user_id: Uuid) -> RepositoryResult<Option<CryptoWallet>>;

    async fn archive_wallet(&self, id: Uuid, actor: &str) -> RepositoryResult<bool>;
}

#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn get_account(&self, user_id: Uuid) -> RepositoryResult<UserAccount>;

    async fn set_currency(&self, user_id: Uuid, currency: Currency) -> RepositoryResult<UserAccount>;

    async fn active_customer(
        &self,
        user_id: Uuid,
        provider: ProviderKind,
    ) -> RepositoryResult<Option<Customer>>;

    async fn insert_customer(&self, customer: &Customer) -> RepositoryResult<Customer>;

    async fn archive_customer(&self, id: Uuid) -> RepositoryResult<bool>;

    async fn active_payout_account(
        &self,
        user_id: Uuid,
        provider: ProviderKind,
    ) -> RepositoryResult<Option<PayoutAccount>>;
}

#[async_trait]
pub trait FeatureFlagRepository: Send + Sync {
    async fn list_flags(&self) -> RepositoryResult<Vec<FeatureFlag>>;

    async fn set_mode(&self, name: &str, mode: FlagMode) -> RepositoryResult<FeatureFlag>;

    async fn seeding_users(&self) -> RepositoryResult<Vec<Uuid>>;
}
