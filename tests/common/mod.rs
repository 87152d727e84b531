#![allow(dead_code)]

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use settlement_core::adapters::{InMemoryStore, Repositories};
use settlement_core::domain::feature_flag::{FLAG_PAYMENT, FLAG_PAYOUT};
use settlement_core::domain::{Currency, FlagMode, ProviderKind};
use settlement_core::providers::exchange_rate::StaticRateSource;
use settlement_core::providers::matters::MattersProvider;
use settlement_core::providers::{
    ChargeReceipt, ChargeRequest, ConfirmLookup, Confirmation, InvoiceCharge, PaymentProvider,
    ProviderError, ProviderOutcome, ProviderSubscription, Providers, RefundRequest, RetryPolicy,
    SubscriptionGateway,
};
use settlement_core::queue::InMemoryQueue;
use settlement_core::services::{ServiceSettings, Services};

pub const SETTLEMENT_QUEUE: &str = "blockchain-settlement";

/// Scriptable card or chain rail.
pub struct FakeProvider {
    kind: ProviderKind,
    charge_outcome: Mutex<Result<ProviderOutcome, ProviderError>>,
    confirmations: Mutex<HashMap<String, Result<Confirmation, ProviderError>>>,
    pub charges: Mutex<Vec<ChargeRequest>>,
    pub lookups: Mutex<Vec<ConfirmLookup>>,
    pub refunds: Mutex<Vec<RefundRequest>>,
}

impl FakeProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            charge_outcome: Mutex::new(Ok(ProviderOutcome::Pending)),
            confirmations: Mutex::new(HashMap::new()),
            charges: Mutex::new(Vec::new()),
            lookups: Mutex::new(Vec::new()),
            refunds: Mutex::new(Vec::new()),
        }
    }

    pub fn charge_with(&self, outcome: Result<ProviderOutcome, ProviderError>) {
        *self.charge_outcome.lock().unwrap() = outcome;
    }

    /// What `confirm` answers for a provider reference (the tx hash on chain), or for
    /// the correlation id when no reference was stored.
    pub fn confirm_with(&self, provider_ref: &str, result: Result<Confirmation, ProviderError>) {
        self.confirmations
            .lock()
            .unwrap()
            .insert(provider_ref.to_string(), result);
    }

    pub fn charge_count(&self) -> usize {
        self.charges.lock().unwrap().len()
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, ProviderError> {
        self.charges.lock().unwrap().push(request.clone());
        let outcome = self.charge_outcome.lock().unwrap().clone()?;
        Ok(ChargeReceipt {
            provider_ref: Some(format!("pi_{}", request.correlation_id.simple())),
            outcome,
            client_secret: Some("secret_test".to_string()),
        })
    }

    async fn confirm(&self, lookup: &ConfirmLookup) -> Result<Confirmation, ProviderError> {
        self.lookups.lock().unwrap().push(lookup.clone());
        let key = lookup
            .provider_ref
            .clone()
            .unwrap_or_else(|| lookup.correlation_id.to_string());
        self.confirmations
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Err(ProviderError::NotFound(key)))
    }

    async fn refund(&self, request: &RefundRequest) -> Result<ChargeReceipt, ProviderError> {
        self.refunds.lock().unwrap().push(request.clone());
        Ok(ChargeReceipt {
            provider_ref: Some(format!("re_{}", request.charge_ref)),
            outcome: ProviderOutcome::Succeeded,
            client_secret: None,
        })
    }
}

/// Records every gateway call and hands out sequential references.
#[derive(Default)]
pub struct FakeGateway {
    counter: Mutex<u32>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeGateway {
    fn next(&self, prefix: &str) -> String {
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        format!("{}_{}", prefix, *counter)
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SubscriptionGateway for FakeGateway {
    async fn create_customer(&self, user_id: Uuid) -> Result<String, ProviderError> {
        self.log(format!("create_customer {}", user_id));
        Ok(self.next("cus"))
    }

    async fn create_subscription(
        &self,
        customer_ref: &str,
        price_ref: &str,
        _trial_end: Option<DateTime<Utc>>,
    ) -> Result<ProviderSubscription, ProviderError> {
        self.log(format!("create_subscription {} {}", customer_ref, price_ref));
        Ok(ProviderSubscription {
            subscription_ref: self.next("sub"),
            item_ref: self.next("si"),
        })
    }

    async fn add_item(&self, subscription_ref: &str, price_ref: &str) -> Result<String, ProviderError> {
        self.log(format!("add_item {} {}", subscription_ref, price_ref));
        Ok(self.next("si"))
    }

    async fn swap_item(&self, item_ref: &str, price_ref: &str) -> Result<String, ProviderError> {
        self.log(format!("swap_item {} {}", item_ref, price_ref));
        Ok(self.next("si"))
    }

    async fn remove_item(&self, item_ref: &str) -> Result<(), ProviderError> {
        self.log(format!("remove_item {}", item_ref));
        Ok(())
    }

    async fn cancel_subscription(&self, subscription_ref: &str) -> Result<(), ProviderError> {
        self.log(format!("cancel_subscription {}", subscription_ref));
        Ok(())
    }

    async fn create_price(
        &self,
        circle_id: Uuid,
        amount: &BigDecimal,
        currency: Currency,
    ) -> Result<String, ProviderError> {
        self.log(format!("create_price {} {} {}", circle_id, amount, currency));
        Ok(self.next("price"))
    }

    async fn create_invoice(&self, charge: &InvoiceCharge) -> Result<String, ProviderError> {
        self.log(format!("create_invoice {}", charge.invoice_id));
        Ok(self.next("in"))
    }
}

/// Every service wired over the in-memory store and fake rails.
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub repositories: Repositories,
    pub queue: Arc<InMemoryQueue>,
    pub stripe: Arc<FakeProvider>,
    pub chain: Arc<FakeProvider>,
    pub gateway: Arc<FakeGateway>,
    pub services: Services,
}

impl Harness {
    /// Payments and payouts are switched on for everyone.
    pub async fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        store.set_flag(FLAG_PAYMENT, FlagMode::On);
        store.set_flag(FLAG_PAYOUT, FlagMode::On);

        let repositories = Repositories::in_memory(store.clone());
        let queue = Arc::new(InMemoryQueue::new(3));
        let stripe = Arc::new(FakeProvider::new(ProviderKind::Stripe));
        let chain = Arc::new(FakeProvider::new(ProviderKind::Blockchain));
        let gateway = Arc::new(FakeGateway::default());

        let providers = Providers {
            stripe: stripe.clone(),
            blockchain: chain.clone(),
            matters: Arc::new(MattersProvider),
        };
        let settings = ServiceSettings {
            retry: RetryPolicy::no_retry(),
            ..ServiceSettings::default()
        };
        let services = Services::new(
            &repositories,
            providers,
            gateway.clone(),
            queue.clone(),
            Arc::new(StaticRateSource::default()),
            settings,
        );
        services.flags.refresh_cache().await.unwrap();

        Self {
            store,
            repositories,
            queue,
            stripe,
            chain,
            gateway,
            services,
        }
    }

    pub fn user(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.store.add_user(id);
        id
    }

    /// Gives `user_id` a settled HKD balance through a card top-up.
    pub async fn fund(&self, user_id: Uuid, amount: i64) {
        self.stripe.charge_with(Ok(ProviderOutcome::Succeeded));
        self.services
            .ledger
            .add_credit(user_id, BigDecimal::from(amount), Currency::Hkd)
            .await
            .unwrap();
        self.stripe.charge_with(Ok(ProviderOutcome::Pending));
    }
}

pub fn dec(value: &str) -> BigDecimal {
    value.parse().unwrap()
}
