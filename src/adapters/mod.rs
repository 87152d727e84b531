pub mod memory;
pub mod postgres_account_repository;
pub mod postgres_feature_flag_repository;
pub mod postgres_ledger_repository;
pub mod postgres_subscription_repository;
pub mod postgres_wallet_repository;

pub use memory::InMemoryStore;
pub use postgres_account_repository::PostgresAccountRepository;
pub use postgres_feature_flag_repository::PostgresFeatureFlagRepository;
pub use postgres_ledger_repository::PostgresLedgerRepository;
pub use postgres_subscription_repository::PostgresSubscriptionRepository;
pub use postgres_wallet_repository::PostgresWalletRepository;

use sqlx::PgPool;
use std::sync::Arc;

use crate::ports::{
    AccountRepository, FeatureFlagRepository, LedgerRepository, SubscriptionRepository,
    WalletRepository,
};

/// One handle per port, shared by every service.
#[derive(Clone)]
pub struct Repositories {
    pub ledger: Arc<dyn LedgerRepository>,
    pub subscriptions: Arc<dyn SubscriptionRepository>,
    pub wallets: Arc<dyn WalletRepository>,
    pub accounts: Arc<dyn AccountRepository>,
    pub flags: Arc<dyn FeatureFlagRepository>,
}

impl Repositories {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            ledger: Arc::new(PostgresLedgerRepository::new(pool.clone())),
            subscriptions: Arc::new(PostgresSubscriptionRepository::new(pool.clone())),
            wallets: Arc::new(PostgresWalletRepository::new(pool.clone())),
            accounts: Arc::new(PostgresAccountRepository::new(pool.clone())),
            flags: Arc::new(PostgresFeatureFlagRepository::new(pool)),
        }
    }

    pub fn in_memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            ledger: store.clone(),
            subscriptions: store.clone(),
            wallets: store.clone(),
            accounts: store.clone(),
            flags: store,
        }
    }
}
