pub mod account;
pub mod appreciation;
pub mod audit;
pub mod blockchain;
pub mod circle;
pub mod delta;
pub mod feature_flag;
pub mod transaction;
pub mod wallet;

pub use account::{Customer, PayoutAccount, UserAccount};
pub use appreciation::{Appreciation, AppreciationPurpose, NewAppreciation};
pub use audit::AuditEntry;
pub use blockchain::{BlockchainCurationEvent, BlockchainTransaction};
pub use circle::{
    BillingPeriod, Circle, CircleCoupon, CircleInvoice, CirclePrice, CircleSubscription,
    CircleSubscriptionItem, InvoiceState, PriceState, SubscriptionState,
};
pub use delta::DeltaRow;
pub use feature_flag::{FeatureFlag, FlagMode};
pub use transaction::{
    Currency, NewTransaction, ProviderKind, Purpose, SettlementOutcome, Target, Transaction,
    TransactionState,
};
pub use wallet::{CryptoWallet, CryptoWalletSignature, SignaturePurpose, SignatureStatus};
