pub mod billing;
pub mod exchange_rates;
pub mod feature_flags;
pub mod ledger;
pub mod reconciliation;
pub mod stripe_events;
pub mod wallet;

pub use billing::{BillingService, BillingSettings};
pub use exchange_rates::ExchangeRateService;
pub use feature_flags::FeatureFlagService;
pub use ledger::{AddCredit, DonationRequest, LedgerService, LedgerSettings, SettleResult};
pub use reconciliation::{ReconciliationReport, ReconciliationService, ReconciliationSettings};
pub use stripe_events::{EventDisposition, StripeEventRouter};
pub use wallet::{Challenge, WalletError, WalletService, WalletSettings};

use std::sync::Arc;

use crate::adapters::Repositories;
use crate::providers::exchange_rate::RateSource;
use crate::providers::{Providers, RetryPolicy, SubscriptionGateway};
use crate::queue::Queue;

#[derive(Debug, Clone, Default)]
pub struct ServiceSettings {
    pub ledger: LedgerSettings,
    pub billing: BillingSettings,
    pub wallet: WalletSettings,
    pub reconciliation: ReconciliationSettings,
    pub retry: RetryPolicy,
}

/// Every service, wired over one set of repositories and providers.
#[derive(Clone)]
pub struct Services {
    pub ledger: Arc<LedgerService>,
    pub billing: Arc<BillingService>,
    pub wallets: Arc<WalletService>,
    pub rates: Arc<ExchangeRateService>,
    pub reconciliation: Arc<ReconciliationService>,
    pub stripe_events: Arc<StripeEventRouter>,
    pub flags: FeatureFlagService,
}

impl Services {
    pub fn new(
        repositories: &Repositories,
        providers: Providers,
        gateway: Arc<dyn SubscriptionGateway>,
        queue: Arc<dyn Queue>,
        rate_source: Arc<dyn RateSource>,
        settings: ServiceSettings,
    ) -> Self {
        let flags = FeatureFlagService::new(repositories.flags.clone());
        let ledger = Arc::new(LedgerService::new(
            repositories.ledger.clone(),
            repositories.accounts.clone(),
            providers.clone(),
            queue.clone(),
            flags.clone(),
            settings.ledger,
        ));
        let billing = Arc::new(BillingService::new(
            repositories.subscriptions.clone(),
            repositories.ledger.clone(),
            repositories.accounts.clone(),
            gateway,
            settings.billing,
        ));
        let wallets = Arc::new(WalletService::new(
            repositories.wallets.clone(),
            repositories.accounts.clone(),
            settings.wallet,
        ));
        let reconciliation = Arc::new(ReconciliationService::new(
            repositories.ledger.clone(),
            ledger.clone(),
            providers,
            queue,
            settings.retry,
            settings.reconciliation,
        ));
        let stripe_events = Arc::new(StripeEventRouter::new(
            repositories.ledger.clone(),
            ledger.clone(),
            billing.clone(),
        ));

        Self {
            ledger,
            billing,
            wallets,
            rates: Arc::new(ExchangeRateService::new(rate_source)),
            reconciliation,
            stripe_events,
            flags,
        }
    }
}
