//! In-memory implementation of every repository port, with the same uniqueness and
//! conditional-update rules as the Postgres schema. Used by tests and local runs.

use async_trait::async_trait;
use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

use crate::domain::audit::{
    ENTITY_CIRCLE_PRICE, ENTITY_CRYPTO_WALLET, ENTITY_CUSTOMER, ENTITY_INVOICE,
    ENTITY_SUBSCRIPTION, ENTITY_SUBSCRIPTION_ITEM, ENTITY_TRANSACTION,
};
use crate::domain::delta::{self, delta_rows};
use crate::domain::{
    Appreciation, AuditEntry, BlockchainCurationEvent, BlockchainTransaction, Circle,
    CircleCoupon, CircleInvoice, CirclePrice, CircleSubscription, CircleSubscriptionItem,
    CryptoWallet, CryptoWalletSignature, Currency, Customer, DeltaRow, FeatureFlag, FlagMode,
    InvoiceState, NewAppreciation, NewTransaction, PayoutAccount, PriceState, ProviderKind,
    SignaturePurpose, SignatureStatus, SubscriptionState, Transaction, TransactionState, UserAccount,
};
use crate::domain::feature_flag::{FLAG_PAYMENT, FLAG_PAYOUT};
use crate::ports::{
    AccountRepository, BalanceDrift, BalanceGuard, FeatureFlagRepository, LedgerRepository,
    LinkOutcome, RepositoryError, RepositoryResult, SubscriptionRepository, WalletRepository,
};

#[derive(Default)]
struct State {
    transactions: Vec<Transaction>,
    chain_receipts: Vec<BlockchainTransaction>,
    curation_events: Vec<BlockchainCurationEvent>,
    appreciations: Vec<Appreciation>,
    audit: Vec<AuditEntry>,

    circles: HashMap<Uuid, Circle>,
    prices: HashMap<Uuid, CirclePrice>,
    subscriptions: HashMap<Uuid, CircleSubscription>,
    items: Vec<CircleSubscriptionItem>,
    invoices: HashMap<Uuid, CircleInvoice>,
    coupons: HashMap<Uuid, CircleCoupon>,

    signatures: HashMap<Uuid, CryptoWalletSignature>,
    wallets: Vec<CryptoWallet>,

    accounts: HashMap<Uuid, UserAccount>,
    customers: Vec<Customer>,
    payout_accounts: Vec<PayoutAccount>,

    flags: HashMap<String, FeatureFlag>,
    seeding: HashSet<Uuid>,
}

impl State {
    fn transaction_mut(&mut self, id: Uuid) -> RepositoryResult<&mut Transaction> {
        self.transactions
            .iter_mut()
            .find(|tx| tx.id == id)
            .ok_or_else(|| RepositoryError::NotFound(format!("transaction {}", id)))
    }

    fn deltas(&self) -> Vec<DeltaRow> {
        self.transactions.iter().flat_map(delta_rows).collect()
    }

    fn log(&mut self, entry: AuditEntry) {
        self.audit.push(entry);
    }

    fn insert_transaction(
        &mut self,
        input: &NewTransaction,
        state: TransactionState,
    ) -> RepositoryResult<Transaction> {
        if self.transactions.iter().any(|tx| tx.id == input.id) {
            return Err(RepositoryError::Conflict("transaction_pkey".to_string()));
        }
        if let Some(provider_ref) = &input.provider_tx_id {
            let taken = self.transactions.iter().any(|tx| {
                tx.provider == input.provider && tx.provider_tx_id.as_ref() == Some(provider_ref)
            });
            if taken {
                return Err(RepositoryError::Conflict(
                    "idx_transaction_provider_ref".to_string(),
                ));
            }
        }

        let now = Utc::now();
        let tx = Transaction {
            id: input.id,
            amount: input.amount.clone(),
            currency: input.currency,
            purpose: input.purpose,
            state,
            provider: input.provider,
            provider_tx_id: input.provider_tx_id.clone(),
            sender_id: input.sender_id,
            recipient_id: input.recipient_id,
            target: input.target,
            parent_id: input.parent_id,
            discount: input.discount.clone(),
            remark: input.remark.clone(),
            created_at: now,
            updated_at: now,
        };
        self.transactions.push(tx.clone());
        self.log(
            AuditEntry::new(tx.id, ENTITY_TRANSACTION, "created", "system").with_new(json!({
                "amount": tx.amount.to_string(),
                "currency": tx.currency,
                "purpose": tx.purpose,
                "state": tx.state,
                "provider": tx.provider,
            })),
        );
        Ok(tx)
    }

    fn archive_item(&mut self, item_id: Uuid, at: DateTime<Utc>) -> bool {
        let Some(item) = self
            .items
            .iter_mut()
            .find(|item| item.id == item_id && !item.archived)
        else {
            return false;
        };
        item.archived = true;
        item.canceled_at = Some(at);
        self.log(
            AuditEntry::new(item_id, ENTITY_SUBSCRIPTION_ITEM, "archived_updated", "system")
                .change(json!(false), json!(true)),
        );
        true
    }

    fn insert_item(&mut self, item: &CircleSubscriptionItem) -> RepositoryResult<()> {
        let duplicate = self.items.iter().any(|existing| {
            !existing.archived
                && existing.subscription_id == item.subscription_id
                && existing.circle_id == item.circle_id
        });
        if duplicate {
            return Err(RepositoryError::Conflict(
                "idx_circle_subscription_item_active".to_string(),
            ));
        }
        self.items.push(item.clone());
        self.log(
            AuditEntry::new(item.id, ENTITY_SUBSCRIPTION_ITEM, "created", "system").with_new(
                json!({ "subscription_id": item.subscription_id, "price_id": item.price_id }),
            ),
        );
        Ok(())
    }
}

/// Process-local store backing all repository ports.
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Starts with the same flag rows the migrations seed.
    pub fn new() -> Self {
        let store = Self {
            state: Mutex::new(State::default()),
        };
        store.set_flag(FLAG_PAYMENT, FlagMode::Admin);
        store.set_flag(FLAG_PAYOUT, FlagMode::Admin);
        store
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn set_flag(&self, name: &str, mode: FlagMode) {
        self.with(|state| {
            state.flags.insert(
                name.to_string(),
                FeatureFlag {
                    name: name.to_string(),
                    mode,
                    description: None,
                    updated_at: Utc::now(),
                },
            );
        });
    }

    pub fn add_seeding_user(&self, user_id: Uuid) {
        self.with(|state| state.seeding.insert(user_id));
    }

    pub fn add_account(&self, account: UserAccount) {
        self.with(|state| state.accounts.insert(account.id, account));
    }

    /// Registers a regular user with a password and HKD preference.
    pub fn add_user(&self, user_id: Uuid) {
        self.add_account(UserAccount {
            id: user_id,
            has_password: true,
            currency: Currency::Hkd,
            is_admin: false,
        });
    }

    pub fn add_circle(&self, circle: Circle) {
        self.with(|state| state.circles.insert(circle.id, circle));
    }

    pub fn add_coupon(&self, coupon: CircleCoupon) {
        self.with(|state| state.coupons.insert(coupon.id, coupon));
    }

    pub fn add_payout_account(&self, account: PayoutAccount) {
        self.with(|state| state.payout_accounts.push(account));
    }

    /// Links a wallet directly, bypassing the challenge flow.
    pub fn add_wallet(&self, user_id: Uuid, address: &str) -> CryptoWallet {
        let now = Utc::now();
        let wallet = CryptoWallet {
            id: Uuid::new_v4(),
            user_id,
            address: address.to_lowercase(),
            archived: false,
            created_at: now,
            updated_at: now,
        };
        self.with(|state| state.wallets.push(wallet.clone()));
        wallet
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.with(|state| state.transactions.clone())
    }

    pub fn chain_receipts(&self) -> Vec<BlockchainTransaction> {
        self.with(|state| state.chain_receipts.clone())
    }

    pub fn curation_events(&self) -> Vec<BlockchainCurationEvent> {
        self.with(|state| state.curation_events.clone())
    }

    pub fn audit_entries(&self, entity_id: Uuid) -> Vec<AuditEntry> {
        self.with(|state| {
            state
                .audit
                .iter()
                .filter(|entry| entry.entity_id == entity_id)
                .cloned()
                .collect()
        })
    }

    pub fn all_items(&self, subscription_id: Uuid) -> Vec<CircleSubscriptionItem> {
        self.with(|state| {
            state
                .items
                .iter()
                .filter(|item| item.subscription_id == subscription_id)
                .cloned()
                .collect()
        })
    }

    /// Moves a transaction's creation time into the past.
    pub fn backdate_transaction(&self, id: Uuid, by: Duration) {
        self.with(|state| {
            if let Ok(tx) = state.transaction_mut(id) {
                tx.created_at = tx.created_at - by;
            }
        });
    }

    pub fn backdate_invoice(&self, id: Uuid, by: Duration) {
        self.with(|state| {
            if let Some(invoice) = state.invoices.get_mut(&id) {
                invoice.created_at = invoice.created_at - by;
            }
        });
    }

    pub fn backdate_signature(&self, id: Uuid, by: Duration) {
        self.with(|state| {
            if let Some(signature) = state.signatures.get_mut(&id) {
                signature.expired_at = signature.expired_at - by;
            }
        });
    }
}

#[async_trait]
impl LedgerRepository for InMemoryStore {
    async fn insert_transaction(
        &self,
        tx: &NewTransaction,
        state: TransactionState,
        guard: Option<BalanceGuard>,
    ) -> RepositoryResult<Transaction> {
        self.with(|store| {
            if let Some(guard) = guard {
                let available =
                    delta::available_balance(&store.deltas(), guard.user_id, guard.currency);
                if available < tx.amount {
                    return Err(RepositoryError::InsufficientBalance {
                        available,
                        requested: tx.amount.clone(),
                    });
                }
            }
            store.insert_transaction(tx, state)
        })
    }

    async fn insert_split(
        &self,
        parent: &NewTransaction,
        child: Option<&NewTransaction>,
    ) -> RepositoryResult<(Transaction, Option<Transaction>)> {
        self.with(|store| {
            let before = (store.transactions.len(), store.audit.len());
            let result = store
                .insert_transaction(parent, parent.initial_state())
                .and_then(|parent| {
                    let child = child
                        .map(|child| store.insert_transaction(child, child.initial_state()))
                        .transpose()?;
                    Ok((parent, child))
                });
            if result.is_err() {
                store.transactions.truncate(before.0);
                store.audit.truncate(before.1);
            }
            result
        })
    }

    async fn get_transaction(&self, id: Uuid) -> RepositoryResult<Transaction> {
        self.with(|store| store.transaction_mut(id).map(|tx| tx.clone()))
    }

    async fn find_by_provider_ref(
        &self,
        provider: ProviderKind,
        provider_tx_id: &str,
    ) -> RepositoryResult<Option<Transaction>> {
        Ok(self.with(|store| {
            store
                .transactions
                .iter()
                .find(|tx| {
                    tx.provider == provider && tx.provider_tx_id.as_deref() == Some(provider_tx_id)
                })
                .cloned()
        }))
    }

    async fn attach_provider_ref(&self, id: Uuid, provider_tx_id: &str) -> RepositoryResult<bool> {
        self.with(|store| {
            let tx = store.transaction_mut(id)?;
            if tx.state != TransactionState::Pending || tx.provider_tx_id.is_some() {
                return Ok(false);
            }
            tx.provider_tx_id = Some(provider_tx_id.to_string());
            tx.updated_at = Utc::now();
            Ok(true)
        })
    }

    async fn settle(&self, id: Uuid, state: TransactionState) -> RepositoryResult<bool> {
        self.with(|store| {
            let tx = store.transaction_mut(id)?;
            if tx.state != TransactionState::Pending {
                return Ok(false);
            }
            tx.state = state;
            tx.updated_at = Utc::now();
            store.log(
                AuditEntry::new(id, ENTITY_TRANSACTION, "state_updated", "system")
                    .change(json!(TransactionState::Pending), json!(state)),
            );
            Ok(true)
        })
    }

    async fn deltas_for(
        &self,
        user_id: Uuid,
        currency: Option<Currency>,
    ) -> RepositoryResult<Vec<DeltaRow>> {
        Ok(self.with(|store| {
            let mut rows: Vec<DeltaRow> = store
                .deltas()
                .into_iter()
                .filter(|row| row.user_id == user_id)
                .filter(|row| currency.map_or(true, |c| row.currency == c))
                .collect();
            rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            rows
        }))
    }

    async fn balance_of(&self, user_id: Uuid, currency: Currency) -> RepositoryResult<BigDecimal> {
        Ok(self.with(|store| delta::balance(&store.deltas(), user_id, currency)))
    }

    async fn available_balance(
        &self,
        user_id: Uuid,
        currency: Currency,
    ) -> RepositoryResult<BigDecimal> {
        Ok(self.with(|store| delta::available_balance(&store.deltas(), user_id, currency)))
    }

    async fn refunded_total(&self, original_id: Uuid) -> RepositoryResult<BigDecimal> {
        Ok(self.with(|store| {
            store
                .transactions
                .iter()
                .filter(|tx| {
                    tx.parent_id == Some(original_id)
                        && tx.purpose == crate::domain::Purpose::Refund
                        && matches!(tx.state, TransactionState::Pending | TransactionState::Succeeded)
                })
                .fold(BigDecimal::zero(), |acc, tx| acc + &tx.amount)
        }))
    }

    async fn stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<Transaction>> {
        Ok(self.with(|store| {
            let mut stale: Vec<Transaction> = store
                .transactions
                .iter()
                .filter(|tx| tx.state == TransactionState::Pending && tx.created_at < older_than)
                .cloned()
                .collect();
            stale.sort_by_key(|tx| tx.created_at);
            stale.truncate(limit.max(0) as usize);
            stale
        }))
    }

    async fn two_party_net(&self) -> RepositoryResult<HashMap<Currency, BigDecimal>> {
        Ok(self.with(|store| delta::two_party_net(&store.transactions)))
    }

    async fn balance_drift(&self) -> RepositoryResult<Vec<BalanceDrift>> {
        Ok(self.with(|store| {
            let rows = store.deltas();
            let mut computed: HashMap<(Uuid, Currency), BigDecimal> = HashMap::new();
            for tx in store
                .transactions
                .iter()
                .filter(|tx| tx.state == TransactionState::Succeeded)
            {
                if let Some(recipient) = tx.recipient_id {
                    *computed
                        .entry((recipient, tx.currency))
                        .or_insert_with(BigDecimal::zero) += &tx.amount;
                }
                if let Some(sender) = tx.sender_id {
                    *computed
                        .entry((sender, tx.currency))
                        .or_insert_with(BigDecimal::zero) -= &tx.amount;
                }
            }

            computed
                .into_iter()
                .filter_map(|((user_id, currency), computed)| {
                    let materialized = delta::balance(&rows, user_id, currency);
                    (materialized != computed).then_some(BalanceDrift {
                        user_id,
                        currency,
                        materialized,
                        computed,
                    })
                })
                .collect()
        }))
    }

    async fn record_chain_receipt(
        &self,
        receipt: &BlockchainTransaction,
        events: &[BlockchainCurationEvent],
    ) -> RepositoryResult<()> {
        self.with(|store| {
            let existing = store
                .chain_receipts
                .iter()
                .position(|r| r.chain_id == receipt.chain_id && r.tx_hash == receipt.tx_hash);
            let receipt_id = match existing {
                Some(index) => {
                    let existing = &mut store.chain_receipts[index];
                    if existing.transaction_id.is_none() {
                        existing.transaction_id = receipt.transaction_id;
                    }
                    existing.id
                }
                None => {
                    store.chain_receipts.push(receipt.clone());
                    receipt.id
                }
            };

            for event in events {
                let duplicate = store.curation_events.iter().any(|e| {
                    e.blockchain_transaction_id == receipt_id
                        && e.curator_address == event.curator_address
                        && e.creator_address == event.creator_address
                        && e.uri == event.uri
                });
                if !duplicate {
                    store.curation_events.push(BlockchainCurationEvent {
                        blockchain_transaction_id: receipt_id,
                        ..event.clone()
                    });
                }
            }
            Ok(())
        })
    }

    async fn insert_appreciation(&self, input: &NewAppreciation) -> RepositoryResult<Appreciation> {
        Ok(self.with(|store| {
            let appreciation = Appreciation {
                id: store.appreciations.len() as i64 + 1,
                uuid: Uuid::new_v4(),
                sender_id: input.sender_id,
                recipient_id: input.recipient_id,
                amount: input.amount,
                purpose: input.purpose,
                reference_id: input.reference_id,
                created_at: Utc::now(),
            };
            store.appreciations.push(appreciation.clone());
            appreciation
        }))
    }

    async fn appreciations_for(
        &self,
        recipient_id: Uuid,
        limit: i64,
    ) -> RepositoryResult<Vec<Appreciation>> {
        Ok(self.with(|store| {
            store
                .appreciations
                .iter()
                .rev()
                .filter(|a| a.recipient_id == recipient_id)
                .take(limit.max(0) as usize)
                .cloned()
                .collect()
        }))
    }
}

#[async_trait]
impl SubscriptionRepository for InMemoryStore {
    async fn get_circle(&self, id: Uuid) -> RepositoryResult<Circle> {
        self.with(|store| store.circles.get(&id).cloned())
            .ok_or_else(|| RepositoryError::NotFound(format!("circle {}", id)))
    }

    async fn get_price(&self, id: Uuid) -> RepositoryResult<CirclePrice> {
        self.with(|store| store.prices.get(&id).cloned())
            .ok_or_else(|| RepositoryError::NotFound(format!("circle price {}", id)))
    }

    async fn active_price(&self, circle_id: Uuid) -> RepositoryResult<Option<CirclePrice>> {
        Ok(self.with(|store| {
            store
                .prices
                .values()
                .find(|p| p.circle_id == circle_id && p.state == PriceState::Active)
                .cloned()
        }))
    }

    async fn publish_price(&self, price: &CirclePrice) -> RepositoryResult<CirclePrice> {
        Ok(self.with(|store| {
            let mut archived = Vec::new();
            for existing in store.prices.values_mut() {
                if existing.circle_id == price.circle_id && existing.state == PriceState::Active {
                    existing.state = PriceState::Archived;
                    archived.push(existing.id);
                }
            }
            for id in archived {
                store.log(
                    AuditEntry::new(id, ENTITY_CIRCLE_PRICE, "state_updated", "system")
                        .change(json!("active"), json!("archived")),
                );
            }

            let published = CirclePrice {
                state: PriceState::Active,
                ..price.clone()
            };
            store.prices.insert(published.id, published.clone());
            store.log(
                AuditEntry::new(published.id, ENTITY_CIRCLE_PRICE, "created", "system").with_new(
                    json!({ "circle_id": published.circle_id, "amount": published.amount.to_string() }),
                ),
            );
            published
        }))
    }

    async fn get_subscription(&self, id: Uuid) -> RepositoryResult<CircleSubscription> {
        self.with(|store| store.subscriptions.get(&id).cloned())
            .ok_or_else(|| RepositoryError::NotFound(format!("subscription {}", id)))
    }

    async fn open_subscription(
        &self,
        user_id: Uuid,
    ) -> RepositoryResult<Option<CircleSubscription>> {
        Ok(self.with(|store| {
            store
                .subscriptions
                .values()
                .find(|s| s.user_id == user_id && s.state.is_open())
                .cloned()
        }))
    }

    async fn find_subscription_by_provider_ref(
        &self,
        provider_subscription_id: &str,
    ) -> RepositoryResult<Option<CircleSubscription>> {
        Ok(self.with(|store| {
            store
                .subscriptions
                .values()
                .find(|s| s.provider_subscription_id == provider_subscription_id)
                .cloned()
        }))
    }

    async fn insert_subscription(
        &self,
        subscription: &CircleSubscription,
        item: &CircleSubscriptionItem,
    ) -> RepositoryResult<()> {
        self.with(|store| {
            let open = store
                .subscriptions
                .values()
                .any(|s| s.user_id == subscription.user_id && s.state.is_open());
            if open {
                return Err(RepositoryError::Conflict(
                    "idx_circle_subscription_open_user".to_string(),
                ));
            }
            store.subscriptions.insert(subscription.id, subscription.clone());
            store.log(
                AuditEntry::new(subscription.id, ENTITY_SUBSCRIPTION, "created", "system")
                    .with_new(json!({ "user_id": subscription.user_id, "state": subscription.state })),
            );
            store.insert_item(item)
        })
    }

    async fn insert_item(&self, item: &CircleSubscriptionItem) -> RepositoryResult<()> {
        self.with(|store| store.insert_item(item))
    }

    async fn active_items(
        &self,
        subscription_id: Uuid,
    ) -> RepositoryResult<Vec<CircleSubscriptionItem>> {
        Ok(self.with(|store| {
            store
                .items
                .iter()
                .filter(|item| item.subscription_id == subscription_id && !item.archived)
                .cloned()
                .collect()
        }))
    }

    async fn replace_item(
        &self,
        old_item_id: Uuid,
        new_item: &CircleSubscriptionItem,
        at: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        self.with(|store| {
            if !store.archive_item(old_item_id, at) {
                return Err(RepositoryError::Conflict(format!(
                    "subscription item {} is already archived",
                    old_item_id
                )));
            }
            store.insert_item(new_item)
        })
    }

    async fn archive_item(&self, item_id: Uuid, at: DateTime<Utc>) -> RepositoryResult<bool> {
        Ok(self.with(|store| store.archive_item(item_id, at)))
    }

    async fn transition_subscription(
        &self,
        id: Uuid,
        from: SubscriptionState,
        to: SubscriptionState,
    ) -> RepositoryResult<bool> {
        if !from.can_transition_to(to) {
            return Err(RepositoryError::Conflict(format!(
                "subscription cannot move from {} to {}",
                from, to
            )));
        }
        self.with(|store| {
            let subscription = store
                .subscriptions
                .get_mut(&id)
                .ok_or_else(|| RepositoryError::NotFound(format!("subscription {}", id)))?;
            if subscription.state != from {
                return Ok(false);
            }
            subscription.state = to;
            if to == SubscriptionState::Canceled {
                subscription.canceled_at = Some(Utc::now());
            }
            store.log(
                AuditEntry::new(id, ENTITY_SUBSCRIPTION, "state_updated", "system")
                    .change(json!(from), json!(to)),
            );
            Ok(true)
        })
    }

    async fn cancel_subscription(&self, id: Uuid, at: DateTime<Utc>) -> RepositoryResult<bool> {
        self.with(|store| {
            let subscription = store
                .subscriptions
                .get_mut(&id)
                .ok_or_else(|| RepositoryError::NotFound(format!("subscription {}", id)))?;
            if !subscription.state.is_open() {
                return Ok(false);
            }
            let previous = subscription.state;
            subscription.state = SubscriptionState::Canceled;
            subscription.canceled_at = Some(at);
            store.log(
                AuditEntry::new(id, ENTITY_SUBSCRIPTION, "state_updated", "system")
                    .change(json!(previous), json!(SubscriptionState::Canceled)),
            );

            let items: Vec<Uuid> = store
                .items
                .iter()
                .filter(|item| item.subscription_id == id && !item.archived)
                .map(|item| item.id)
                .collect();
            for item_id in items {
                store.archive_item(item_id, at);
            }
            Ok(true)
        })
    }

    async fn trials_ending_before(
        &self,
        before: DateTime<Utc>,
    ) -> RepositoryResult<Vec<CircleSubscription>> {
        Ok(self.with(|store| {
            store
                .subscriptions
                .values()
                .filter(|s| {
                    s.state == SubscriptionState::Trialing
                        && s.trial_end_at.is_some_and(|end| end <= before)
                })
                .cloned()
                .collect()
        }))
    }

    async fn insert_invoice(
        &self,
        invoice: &CircleInvoice,
    ) -> RepositoryResult<Option<CircleInvoice>> {
        Ok(self.with(|store| {
            let exists = store.invoices.values().any(|existing| {
                existing.subscription_id == invoice.subscription_id
                    && existing.period_start == invoice.period_start
            });
            if exists {
                return None;
            }
            store.invoices.insert(invoice.id, invoice.clone());
            store.log(
                AuditEntry::new(invoice.id, ENTITY_INVOICE, "created", "system").with_new(json!({
                    "subscription_id": invoice.subscription_id,
                    "amount": invoice.amount.to_string(),
                })),
            );
            Some(invoice.clone())
        }))
    }

    async fn get_invoice(&self, id: Uuid) -> RepositoryResult<CircleInvoice> {
        self.with(|store| store.invoices.get(&id).cloned())
            .ok_or_else(|| RepositoryError::NotFound(format!("invoice {}", id)))
    }

    async fn latest_invoice(
        &self,
        subscription_id: Uuid,
    ) -> RepositoryResult<Option<CircleInvoice>> {
        Ok(self.with(|store| {
            store
                .invoices
                .values()
                .filter(|i| i.subscription_id == subscription_id)
                .max_by_key(|i| i.period_start)
                .cloned()
        }))
    }

    async fn find_invoice_by_provider_ref(
        &self,
        provider_invoice_id: &str,
    ) -> RepositoryResult<Option<CircleInvoice>> {
        Ok(self.with(|store| {
            store
                .invoices
                .values()
                .find(|i| i.provider_invoice_id.as_deref() == Some(provider_invoice_id))
                .cloned()
        }))
    }

    async fn get_coupon(&self, id: Uuid) -> RepositoryResult<CircleCoupon> {
        self.with(|store| store.coupons.get(&id).cloned())
            .ok_or_else(|| RepositoryError::NotFound(format!("coupon {}", id)))
    }

    async fn apply_coupon(
        &self,
        invoice_id: Uuid,
        coupon_id: Uuid,
        discount: &BigDecimal,
        amount: &BigDecimal,
    ) -> RepositoryResult<bool> {
        self.with(|store| {
            let invoice = store
                .invoices
                .get_mut(&invoice_id)
                .ok_or_else(|| RepositoryError::NotFound(format!("invoice {}", invoice_id)))?;
            if invoice.state != InvoiceState::Draft || invoice.coupon_id.is_some() {
                return Ok(false);
            }
            invoice.coupon_id = Some(coupon_id);
            invoice.discount = discount.clone();
            invoice.amount = amount.clone();
            store.log(
                AuditEntry::new(invoice_id, ENTITY_INVOICE, "coupon_id_updated", "system")
                    .change(serde_json::Value::Null, json!(coupon_id)),
            );
            Ok(true)
        })
    }

    async fn transition_invoice(
        &self,
        id: Uuid,
        from: InvoiceState,
        to: InvoiceState,
        provider_invoice_id: Option<&str>,
    ) -> RepositoryResult<bool> {
        self.with(|store| {
            let invoice = store
                .invoices
                .get_mut(&id)
                .ok_or_else(|| RepositoryError::NotFound(format!("invoice {}", id)))?;
            if invoice.state != from {
                return Ok(false);
            }
            invoice.state = to;
            if let Some(provider_ref) = provider_invoice_id {
                invoice.provider_invoice_id = Some(provider_ref.to_string());
            }
            store.log(
                AuditEntry::new(id, ENTITY_INVOICE, "state_updated", "system")
                    .change(json!(from), json!(to)),
            );
            Ok(true)
        })
    }

    async fn drafts_created_before(
        &self,
        before: DateTime<Utc>,
    ) -> RepositoryResult<Vec<CircleInvoice>> {
        Ok(self.with(|store| {
            let mut drafts: Vec<CircleInvoice> = store
                .invoices
                .values()
                .filter(|i| i.state == InvoiceState::Draft && i.created_at <= before)
                .cloned()
                .collect();
            drafts.sort_by_key(|i| i.created_at);
            drafts
        }))
    }
}

#[async_trait]
impl WalletRepository for InMemoryStore {
    async fn insert_signature(&self, signature: &CryptoWalletSignature) -> RepositoryResult<()> {
        self.with(|store| {
            if store.signatures.values().any(|s| s.nonce == signature.nonce) {
                return Err(RepositoryError::Conflict(
                    "crypto_wallet_signature_nonce_key".to_string(),
                ));
            }
            store.signatures.insert(signature.id, signature.clone());
            Ok(())
        })
    }

    async fn find_signature(
        &self,
        address: &str,
        nonce: &str,
    ) -> RepositoryResult<Option<CryptoWalletSignature>> {
        Ok(self.with(|store| {
            store
                .signatures
                .values()
                .find(|s| s.address == address && s.nonce == nonce)
                .cloned()
        }))
    }

    async fn expire_signature(&self, id: Uuid) -> RepositoryResult<bool> {
        Ok(self.with(|store| match store.signatures.get_mut(&id) {
            Some(s) if s.status.can_transition_to(SignatureStatus::Expired) => {
                s.status = SignatureStatus::Expired;
                true
            }
            _ => false,
        }))
    }

    async fn consume_signature(
        &self,
        id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        Ok(self.with(|store| match store.signatures.get_mut(&id) {
            Some(s) if s.status.can_transition_to(SignatureStatus::Used) => {
                s.status = SignatureStatus::Used;
                s.user_id = s.user_id.or(Some(user_id));
                s.used_at = Some(at);
                true
            }
            _ => false,
        }))
    }

    async fn expire_stale_signatures(&self, now: DateTime<Utc>) -> RepositoryResult<u64> {
        Ok(self.with(|store| {
            let mut expired = 0;
            for signature in store.signatures.values_mut() {
                if signature.status.can_transition_to(SignatureStatus::Expired)
                    && signature.expired_at <= now
                {
                    signature.status = SignatureStatus::Expired;
                    expired += 1;
                }
            }
            expired
        }))
    }

    async fn deactivate_signatures(
        &self,
        address: &str,
        purpose: SignaturePurpose,
    ) -> RepositoryResult<u64> {
        Ok(self.with(|store| {
            let mut deactivated = 0;
            for signature in store.signatures.values_mut() {
                if signature.address == address
                    && signature.purpose == purpose
                    && signature.status.can_transition_to(SignatureStatus::Inactive)
                {
                    signature.status = SignatureStatus::Inactive;
                    deactivated += 1;
                }
            }
            deactivated
        }))
    }

    async fn link_wallet(
        &self,
        signature_id: Uuid,
        user_id: Uuid,
        address: &str,
        at: DateTime<Utc>,
    ) -> RepositoryResult<LinkOutcome> {
        Ok(self.with(|store| {
            let active = store
                .signatures
                .get(&signature_id)
                .is_some_and(|s| s.status == SignatureStatus::Active);
            if !active {
                return LinkOutcome::Replayed;
            }

            let taken = store
                .wallets
                .iter()
                .any(|w| !w.archived && (w.address == address || w.user_id == user_id));
            if taken {
                return LinkOutcome::AddressTaken;
            }

            if let Some(signature) = store.signatures.get_mut(&signature_id) {
                signature.status = SignatureStatus::Used;
                signature.user_id = signature.user_id.or(Some(user_id));
                signature.used_at = Some(at);
            }

            let wallet = CryptoWallet {
                id: Uuid::new_v4(),
                user_id,
                address: address.to_string(),
                archived: false,
                created_at: at,
                updated_at: at,
            };
            store.wallets.push(wallet.clone());
            store.log(
                AuditEntry::new(wallet.id, ENTITY_CRYPTO_WALLET, "created", &user_id.to_string())
                    .with_new(json!({ "user_id": user_id, "address": address })),
            );
            LinkOutcome::Linked(wallet)
        }))
    }

    async fn get_wallet(&self, id: Uuid) -> RepositoryResult<CryptoWallet> {
        self.with(|store| store.wallets.iter().find(|w| w.id == id).cloned())
            .ok_or_else(|| RepositoryError::NotFound(format!("wallet {}", id)))
    }

    async fn active_wallet_by_address(
        &self,
        address: &str,
    ) -> RepositoryResult<Option<CryptoWallet>> {
        Ok(self.with(|store| {
            store
                .wallets
                .iter()
                .find(|w| !w.archived && w.address == address)
                .cloned()
        }))
    }

    async fn active_wallet_for_user(&self, user_id: Uuid) -> RepositoryResult<Option<CryptoWallet>> {
        Ok(self.with(|store| {
            store
                .wallets
                .iter()
                .find(|w| !w.archived && w.user_id == user_id)
                .cloned()
        }))
    }

    async fn archive_wallet(&self, id: Uuid, actor: &str) -> RepositoryResult<bool> {
        Ok(self.with(|store| {
            let Some(wallet) = store.wallets.iter_mut().find(|w| w.id == id && !w.archived) else {
                return false;
            };
            wallet.archived = true;
            wallet.updated_at = Utc::now();
            store.log(
                AuditEntry::new(id, ENTITY_CRYPTO_WALLET, "archived_updated", actor)
                    .change(json!(false), json!(true)),
            );
            true
        }))
    }
}

#[async_trait]
impl AccountRepository for InMemoryStore {
    async fn get_account(&self, user_id: Uuid) -> RepositoryResult<UserAccount> {
        self.with(|store| store.accounts.get(&user_id).cloned())
            .ok_or_else(|| RepositoryError::NotFound(format!("user {}", user_id)))
    }

    async fn set_currency(&self, user_id: Uuid, currency: Currency) -> RepositoryResult<UserAccount> {
        self.with(|store| {
            let account = store
                .accounts
                .get_mut(&user_id)
                .ok_or_else(|| RepositoryError::NotFound(format!("user {}", user_id)))?;
            account.currency = currency;
            Ok(account.clone())
        })
    }

    async fn active_customer(
        &self,
        user_id: Uuid,
        provider: ProviderKind,
    ) -> RepositoryResult<Option<Customer>> {
        Ok(self.with(|store| {
            store
                .customers
                .iter()
                .find(|c| c.user_id == user_id && c.provider == provider && !c.archived)
                .cloned()
        }))
    }

    async fn insert_customer(&self, customer: &Customer) -> RepositoryResult<Customer> {
        self.with(|store| {
            let exists = store.customers.iter().any(|c| {
                c.user_id == customer.user_id && c.provider == customer.provider && !c.archived
            });
            if exists && !customer.archived {
                return Err(RepositoryError::Conflict("idx_customer_active_user".to_string()));
            }
            store.customers.push(customer.clone());
            store.log(
                AuditEntry::new(customer.id, ENTITY_CUSTOMER, "created", "system")
                    .with_new(json!({ "user_id": customer.user_id, "provider": customer.provider })),
            );
            Ok(customer.clone())
        })
    }

    async fn archive_customer(&self, id: Uuid) -> RepositoryResult<bool> {
        Ok(self.with(|store| {
            let Some(customer) = store.customers.iter_mut().find(|c| c.id == id && !c.archived)
            else {
                return false;
            };
            customer.archived = true;
            store.log(
                AuditEntry::new(id, ENTITY_CUSTOMER, "archived_updated", "system")
                    .change(json!(false), json!(true)),
            );
            true
        }))
    }

    async fn active_payout_account(
        &self,
        user_id: Uuid,
        provider: ProviderKind,
    ) -> RepositoryResult<Option<PayoutAccount>> {
        Ok(self.with(|store| {
            store
                .payout_accounts
                .iter()
                .find(|a| a.user_id == user_id && a.provider == provider && !a.archived)
                .cloned()
        }))
    }
}

#[async_trait]
impl FeatureFlagRepository for InMemoryStore {
    async fn list_flags(&self) -> RepositoryResult<Vec<FeatureFlag>> {
        Ok(self.with(|store| {
            let mut flags: Vec<FeatureFlag> = store.flags.values().cloned().collect();
            flags.sort_by(|a, b| a.name.cmp(&b.name));
            flags
        }))
    }

    async fn set_mode(&self, name: &str, mode: FlagMode) -> RepositoryResult<FeatureFlag> {
        self.with(|store| {
            let flag = store
                .flags
                .get_mut(name)
                .ok_or_else(|| RepositoryError::NotFound(format!("feature flag {}", name)))?;
            flag.mode = mode;
            flag.updated_at = Utc::now();
            Ok(flag.clone())
        })
    }

    async fn seeding_users(&self) -> RepositoryResult<Vec<Uuid>> {
        Ok(self.with(|store| store.seeding.iter().copied().collect()))
    }
}
