//! The ledger's write paths. Every money movement enters through
//! [`LedgerService::record_transaction`] and leaves `pending` only through
//! [`LedgerService::settle`].

use bigdecimal::{BigDecimal, Zero};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::feature_flag::{FLAG_PAYMENT, FLAG_PAYOUT};
use crate::domain::{
    Appreciation, Currency, DeltaRow, NewAppreciation, NewTransaction, ProviderKind, Purpose,
    SettlementOutcome, Target, Transaction, TransactionState, UserAccount,
};
use crate::error::AppError;
use crate::ports::{AccountRepository, BalanceGuard, LedgerRepository};
use crate::providers::{
    with_timeout, ChargeDirection, ChargeReceipt, ChargeRequest, ProviderError, Providers,
    RefundRequest,
};
use crate::queue::Queue;
use crate::services::feature_flags::FeatureFlagService;
use crate::validation::{normalize_tx_hash, ValidationError};

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub provider_timeout: Duration,
    pub payout_min_amount: BigDecimal,
    pub payout_currency: Currency,
    pub settlement_queue: String,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(30),
            payout_min_amount: BigDecimal::from(500),
            payout_currency: Currency::Hkd,
            settlement_queue: "blockchain-settlement".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettleResult {
    Settled(Transaction),
    /// The row had already left `pending`; nothing changed.
    AlreadyTerminal(Transaction),
}

impl SettleResult {
    pub fn transaction(&self) -> &Transaction {
        match self {
            SettleResult::Settled(tx) | SettleResult::AlreadyTerminal(tx) => tx,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddCredit {
    pub client_secret: Option<String>,
    pub transaction: Transaction,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationRequest {
    pub recipient_id: Uuid,
    pub article_id: Uuid,
    pub amount: BigDecimal,
    pub currency: Currency,
    /// Required for on-chain donations: the hash of the transfer the sender broadcast.
    pub tx_hash: Option<String>,
    pub remark: Option<String>,
}

pub struct LedgerService {
    ledger: Arc<dyn LedgerRepository>,
    accounts: Arc<dyn AccountRepository>,
    providers: Providers,
    queue: Arc<dyn Queue>,
    flags: FeatureFlagService,
    settings: LedgerSettings,
}

impl LedgerService {
    pub fn new(
        ledger: Arc<dyn LedgerRepository>,
        accounts: Arc<dyn AccountRepository>,
        providers: Providers,
        queue: Arc<dyn Queue>,
        flags: FeatureFlagService,
        settings: LedgerSettings,
    ) -> Self {
        Self {
            ledger,
            accounts,
            providers,
            queue,
            flags,
            settings,
        }
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    /// Validates and writes one transaction in its initial state.
    pub async fn record_transaction(
        &self,
        input: NewTransaction,
        guard: Option<BalanceGuard>,
    ) -> Result<Transaction, AppError> {
        input.validate()?;
        let tx = self
            .ledger
            .insert_transaction(&input, input.initial_state(), guard)
            .await?;

        info!(
            transaction_id = %tx.id,
            purpose = %tx.purpose,
            provider = %tx.provider,
            currency = %tx.currency,
            amount = %tx.amount,
            state = %tx.state,
            "Recorded transaction"
        );
        Ok(tx)
    }

    /// `pending -> outcome`. Settling a transaction that already left `pending` is a
    /// logged no-op.
    pub async fn settle(&self, id: Uuid, outcome: SettlementOutcome) -> Result<SettleResult, AppError> {
        let current = self.ledger.get_transaction(id).await?;
        if current.state.is_terminal() {
            info!(transaction_id = %id, state = %current.state, requested = ?outcome, "Transaction already settled");
            return Ok(SettleResult::AlreadyTerminal(current));
        }

        let moved = self.ledger.settle(id, outcome.state()).await?;
        let tx = self.ledger.get_transaction(id).await?;
        if !moved {
            info!(transaction_id = %id, state = %tx.state, requested = ?outcome, "Lost settle race, transaction already settled");
            return Ok(SettleResult::AlreadyTerminal(tx));
        }

        info!(transaction_id = %id, state = %tx.state, "Settled transaction");
        Ok(SettleResult::Settled(tx))
    }

    pub async fn get_transaction(&self, id: Uuid) -> Result<Transaction, AppError> {
        Ok(self.ledger.get_transaction(id).await?)
    }

    pub async fn balance_of(&self, user_id: Uuid, currency: Currency) -> Result<BigDecimal, AppError> {
        Ok(self.ledger.balance_of(user_id, currency).await?)
    }

    pub async fn available_balance(
        &self,
        user_id: Uuid,
        currency: Currency,
    ) -> Result<BigDecimal, AppError> {
        Ok(self.ledger.available_balance(user_id, currency).await?)
    }

    pub async fn deltas_for(
        &self,
        user_id: Uuid,
        currency: Option<Currency>,
    ) -> Result<Vec<DeltaRow>, AppError> {
        Ok(self.ledger.deltas_for(user_id, currency).await?)
    }

    pub async fn set_currency(&self, user_id: Uuid, currency: Currency) -> Result<UserAccount, AppError> {
        if !currency.is_fiat() {
            return Err(ValidationError::new("currency", "display currency must be fiat").into());
        }
        let account = self.accounts.set_currency(user_id, currency).await?;
        info!(user_id = %user_id, currency = %currency, "Updated display currency");
        Ok(account)
    }

    /// Tops up a user's balance by card. The returned client secret completes the
    /// payment on the client; the webhook settles the transaction.
    pub async fn add_credit(
        &self,
        user_id: Uuid,
        amount: BigDecimal,
        currency: Currency,
    ) -> Result<AddCredit, AppError> {
        self.require_flag(FLAG_PAYMENT, user_id).await?;
        if !currency.is_fiat() {
            return Err(ValidationError::new("currency", "credit can only be bought in fiat").into());
        }

        let customer_ref = self
            .accounts
            .active_customer(user_id, ProviderKind::Stripe)
            .await?
            .map(|customer| customer.customer_ref);

        let input = NewTransaction::new(Purpose::AddCredit, ProviderKind::Stripe, amount, currency)
            .recipient(user_id);
        let tx = self.record_transaction(input, None).await?;

        let request = ChargeRequest {
            correlation_id: tx.id,
            amount: tx.amount.clone(),
            currency,
            direction: ChargeDirection::Collect { customer_ref },
            description: Some("add credit".to_string()),
        };
        let receipt = self.charge(&tx, &request).await?;

        let transaction = self.ledger.get_transaction(tx.id).await?;
        Ok(AddCredit {
            client_secret: receipt.client_secret,
            transaction,
        })
    }

    /// Tips an article's author. Points and fiat balances move instantly inside the
    /// platform; LIKE donations wait for the on-chain transfer to confirm.
    pub async fn donate(&self, sender_id: Uuid, request: DonationRequest) -> Result<Transaction, AppError> {
        self.require_flag(FLAG_PAYMENT, sender_id).await?;

        let provider = request.currency.transfer_provider();
        let mut input = NewTransaction::new(Purpose::Donation, provider, request.amount, request.currency)
            .sender(sender_id)
            .recipient(request.recipient_id)
            .target(Target::Article(request.article_id));
        if let Some(remark) = request.remark {
            input = input.remark(remark);
        }

        if provider != ProviderKind::Blockchain {
            let guard = BalanceGuard {
                user_id: sender_id,
                currency: request.currency,
            };
            return self.record_transaction(input, Some(guard)).await;
        }

        let hash = request
            .tx_hash
            .as_deref()
            .ok_or_else(|| ValidationError::new("tx_hash", "is required for on-chain donations"))?;
        let hash = normalize_tx_hash(hash)?;
        if self
            .ledger
            .find_by_provider_ref(ProviderKind::Blockchain, &hash)
            .await?
            .is_some()
        {
            return Err(AppError::Conflict(format!("transaction {} already recorded", hash)));
        }

        let tx = self.record_transaction(input.provider_tx_id(hash), None).await?;
        self.queue
            .publish(&self.settings.settlement_queue, json!({ "txId": tx.id }))
            .await?;
        Ok(tx)
    }

    /// Withdraws fiat balance to the user's connected payout account.
    pub async fn payout(&self, user_id: Uuid, amount: BigDecimal) -> Result<Transaction, AppError> {
        self.require_flag(FLAG_PAYOUT, user_id).await?;

        let currency = self.settings.payout_currency;
        if amount < self.settings.payout_min_amount {
            return Err(ValidationError::new(
                "amount",
                format!(
                    "payout must be at least {} {}",
                    self.settings.payout_min_amount, currency
                ),
            )
            .into());
        }

        let account = self
            .accounts
            .active_payout_account(user_id, ProviderKind::Stripe)
            .await?
            .filter(|account| account.can_receive())
            .ok_or_else(|| ValidationError::new("payout_account", "no payout account can receive transfers"))?;

        let input = NewTransaction::new(Purpose::Payout, ProviderKind::Stripe, amount, currency)
            .sender(user_id);
        let guard = BalanceGuard { user_id, currency };
        let tx = self.record_transaction(input, Some(guard)).await?;

        let request = ChargeRequest {
            correlation_id: tx.id,
            amount: tx.amount.clone(),
            currency,
            direction: ChargeDirection::Disburse {
                destination: account.account_ref,
            },
            description: Some("payout".to_string()),
        };
        self.charge(&tx, &request).await?;

        Ok(self.ledger.get_transaction(tx.id).await?)
    }

    /// Reverses all or part of a succeeded donation or credit purchase. The refund is a
    /// new transaction pointing at the original; the original is never touched.
    pub async fn refund(
        &self,
        original_id: Uuid,
        amount: Option<BigDecimal>,
    ) -> Result<Transaction, AppError> {
        let original = self.ledger.get_transaction(original_id).await?;
        if original.state != TransactionState::Succeeded {
            return Err(ValidationError::new("transaction", "only succeeded transactions can be refunded").into());
        }
        if !matches!(original.purpose, Purpose::Donation | Purpose::AddCredit) {
            return Err(ValidationError::new(
                "transaction",
                format!("{} transactions cannot be refunded", original.purpose),
            )
            .into());
        }
        if original.provider == ProviderKind::Blockchain {
            return Err(ValidationError::new("transaction", "on-chain transfers cannot be refunded").into());
        }

        let already = self.ledger.refunded_total(original.id).await?;
        let remaining = refundable(&original, &already);
        let amount = amount.unwrap_or_else(|| remaining.clone());
        if amount > remaining {
            return Err(ValidationError::new(
                "amount",
                format!("at most {} {} is refundable", remaining, original.currency),
            )
            .into());
        }

        // The money flows back: the original recipient pays.
        let payer = original
            .recipient_id
            .ok_or_else(|| AppError::Internal(format!("transaction {} has no recipient", original.id)))?;
        let mut input = NewTransaction::new(Purpose::Refund, original.provider, amount, original.currency)
            .sender(payer)
            .target(Target::Transaction(original.id))
            .parent(original.id);
        if let Some(sender) = original.sender_id {
            input = input.recipient(sender);
        }
        let guard = BalanceGuard {
            user_id: payer,
            currency: original.currency,
        };
        let tx = self.record_transaction(input, Some(guard)).await?;

        if tx.provider == ProviderKind::Stripe {
            let provider_ref = original.provider_tx_id.clone().ok_or_else(|| {
                AppError::Internal(format!("transaction {} has no provider reference", original.id))
            })?;
            let request = RefundRequest {
                correlation_id: tx.id,
                charge_ref: provider_ref,
                amount: tx.amount.clone(),
                currency: tx.currency,
            };
            let provider = self.providers.get(ProviderKind::Stripe);
            let result = with_timeout(
                self.settings.provider_timeout,
                "refund",
                provider.refund(&request),
            )
            .await;
            self.apply_receipt(&tx, result).await?;
        }

        Ok(self.ledger.get_transaction(tx.id).await?)
    }

    pub async fn record_appreciation(&self, input: NewAppreciation) -> Result<Appreciation, AppError> {
        input.validate()?;
        let appreciation = self.ledger.insert_appreciation(&input).await?;
        info!(
            appreciation_id = appreciation.id,
            purpose = %appreciation.purpose,
            amount = appreciation.amount,
            "Recorded appreciation"
        );
        Ok(appreciation)
    }

    pub async fn appreciations_for(&self, recipient_id: Uuid, limit: i64) -> Result<Vec<Appreciation>, AppError> {
        Ok(self.ledger.appreciations_for(recipient_id, limit).await?)
    }

    async fn require_flag(&self, flag: &str, user_id: Uuid) -> Result<(), AppError> {
        let account = self.accounts.get_account(user_id).await?;
        if self.flags.is_allowed(flag, user_id, account.is_admin).await {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!("{} is not enabled for this account", flag)))
        }
    }

    async fn charge(&self, tx: &Transaction, request: &ChargeRequest) -> Result<ChargeReceipt, AppError> {
        let provider = self.providers.get(tx.provider);
        let result = with_timeout(
            self.settings.provider_timeout,
            "create charge",
            provider.create_charge(request),
        )
        .await;
        self.apply_receipt(tx, result).await
    }

    /// Records what the provider said about a freshly written pending transaction.
    /// A retryable failure leaves the row pending for the reconciliation sweep.
    async fn apply_receipt(
        &self,
        tx: &Transaction,
        result: Result<ChargeReceipt, ProviderError>,
    ) -> Result<ChargeReceipt, AppError> {
        match result {
            Ok(receipt) => {
                if let Some(provider_ref) = &receipt.provider_ref {
                    self.ledger.attach_provider_ref(tx.id, provider_ref).await?;
                }
                if let Some(outcome) = receipt.outcome.settlement() {
                    self.settle(tx.id, outcome).await?;
                }
                Ok(receipt)
            }
            Err(e) if e.class() == crate::error::ErrorClass::Provider { retryable: true } => {
                warn!(transaction_id = %tx.id, error = %e, "Provider call failed, left pending for reconciliation");
                Err(e.into())
            }
            Err(e) => {
                warn!(transaction_id = %tx.id, error = %e, "Provider rejected transaction");
                self.settle(tx.id, SettlementOutcome::Failed).await?;
                Err(e.into())
            }
        }
    }
}

/// Remaining refundable amount, never negative.
pub fn refundable(original: &Transaction, refunded: &BigDecimal) -> BigDecimal {
    let remaining = &original.amount - refunded;
    if remaining < BigDecimal::zero() {
        BigDecimal::zero()
    } else {
        remaining
    }
}
