//! Periodic checks that keep the ledger honest: nothing stays pending forever, the
//! two-party ledger nets to zero and materialized balances match the delta view.

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::domain::{Currency, ProviderKind, SettlementOutcome, Transaction};
use crate::error::AppError;
use crate::ports::{BalanceDrift, LedgerRepository};
use crate::providers::{
    with_timeout, Confirmation, ConfirmLookup, ProviderError, Providers, RetryPolicy,
};
use crate::queue::Queue;
use crate::services::ledger::LedgerService;

#[derive(Debug, Clone)]
pub struct ReconciliationSettings {
    /// Pending rows older than this are looked up at their provider.
    pub pending_timeout: Duration,
    /// Pending rows older than this that the provider still reports pending are canceled.
    pub pending_expiry: Duration,
    pub batch_size: i64,
    pub provider_timeout: std::time::Duration,
    pub settlement_queue: String,
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self {
            pending_timeout: Duration::seconds(1800),
            pending_expiry: Duration::seconds(86_400),
            batch_size: 100,
            provider_timeout: std::time::Duration::from_secs(30),
            settlement_queue: "blockchain-settlement".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub settled: usize,
    pub canceled: usize,
    /// On-chain transfers failed after outliving the expiry.
    pub expired: usize,
    pub requeued: usize,
    pub still_pending: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub sweep: SweepReport,
    /// Two-party nets that are not zero.
    pub imbalances: HashMap<Currency, BigDecimal>,
    pub drift: Vec<BalanceDriftEntry>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.imbalances.is_empty() && self.drift.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceDriftEntry {
    pub user_id: uuid::Uuid,
    pub currency: Currency,
    pub materialized: BigDecimal,
    pub computed: BigDecimal,
}

impl From<BalanceDrift> for BalanceDriftEntry {
    fn from(drift: BalanceDrift) -> Self {
        Self {
            user_id: drift.user_id,
            currency: drift.currency,
            materialized: drift.materialized,
            computed: drift.computed,
        }
    }
}

pub struct ReconciliationService {
    ledger: Arc<dyn LedgerRepository>,
    ledger_service: Arc<LedgerService>,
    providers: Providers,
    queue: Arc<dyn Queue>,
    retry: RetryPolicy,
    settings: ReconciliationSettings,
}

impl ReconciliationService {
    pub fn new(
        ledger: Arc<dyn LedgerRepository>,
        ledger_service: Arc<LedgerService>,
        providers: Providers,
        queue: Arc<dyn Queue>,
        retry: RetryPolicy,
        settings: ReconciliationSettings,
    ) -> Self {
        Self {
            ledger,
            ledger_service,
            providers,
            queue,
            retry,
            settings,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<ReconciliationReport, AppError> {
        let sweep = self.sweep_stale_pending(now).await?;
        let imbalances = self.check_zero_sum().await?;
        let drift = self
            .check_balance_drift()
            .await?
            .into_iter()
            .map(BalanceDriftEntry::from)
            .collect();

        Ok(ReconciliationReport {
            sweep,
            imbalances,
            drift,
        })
    }

    /// Resolves pending transactions that outlived the provider timeout. The provider
    /// is asked by correlation id before anything is declared failed.
    pub async fn sweep_stale_pending(&self, now: DateTime<Utc>) -> Result<SweepReport, AppError> {
        let stale = self
            .ledger
            .stale_pending(now - self.settings.pending_timeout, self.settings.batch_size)
            .await?;

        let mut report = SweepReport {
            examined: stale.len(),
            ..SweepReport::default()
        };

        for tx in stale {
            match self.resolve(&tx, now).await {
                Ok(Resolution::Settled) => report.settled += 1,
                Ok(Resolution::Canceled) => report.canceled += 1,
                Ok(Resolution::Expired) => report.expired += 1,
                Ok(Resolution::Requeued) => report.requeued += 1,
                Ok(Resolution::StillPending) => report.still_pending += 1,
                Err(e) => {
                    report.errors += 1;
                    warn!(transaction_id = %tx.id, error = %e, "Failed to reconcile pending transaction");
                }
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                settled = report.settled,
                canceled = report.canceled,
                expired = report.expired,
                requeued = report.requeued,
                still_pending = report.still_pending,
                errors = report.errors,
                "Stale pending sweep finished"
            );
        }
        Ok(report)
    }

    async fn resolve(&self, tx: &Transaction, now: DateTime<Utc>) -> Result<Resolution, AppError> {
        let expired = tx.created_at < now - self.settings.pending_expiry;

        // On-chain settlement needs the worker's receipt checks until the row expires.
        if tx.provider == ProviderKind::Blockchain {
            if !expired {
                self.queue
                    .publish(&self.settings.settlement_queue, json!({ "txId": tx.id }))
                    .await?;
                return Ok(Resolution::Requeued);
            }
            return self.expire_chain_transfer(tx).await;
        }

        let outcome = match self.confirm(tx).await {
            Ok(confirmation) => {
                if let (None, Some(provider_ref)) = (&tx.provider_tx_id, &confirmation.provider_ref) {
                    self.ledger.attach_provider_ref(tx.id, provider_ref).await?;
                }
                confirmation.outcome.settlement()
            }
            Err(ProviderError::NotFound(_)) => Some(SettlementOutcome::Failed),
            Err(e) => return Err(e.into()),
        };

        match outcome {
            Some(outcome) => {
                self.ledger_service.settle(tx.id, outcome).await?;
                Ok(Resolution::Settled)
            }
            None if expired => {
                warn!(transaction_id = %tx.id, "Pending past expiry, canceling");
                self.ledger_service
                    .settle(tx.id, SettlementOutcome::Canceled)
                    .await?;
                Ok(Resolution::Canceled)
            }
            None => {
                warn!(transaction_id = %tx.id, created_at = %tx.created_at, "Provider still reports pending");
                Ok(Resolution::StillPending)
            }
        }
    }

    /// The worker never settled this transfer. A transfer the chain reports mined is
    /// left pending for an operator; anything else is failed.
    async fn expire_chain_transfer(&self, tx: &Transaction) -> Result<Resolution, AppError> {
        let outcome = match self.confirm(tx).await {
            Ok(confirmation) => confirmation.outcome.settlement(),
            Err(ProviderError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        if outcome == Some(SettlementOutcome::Succeeded) {
            error!(
                alert = true,
                transaction_id = %tx.id,
                provider_tx_id = ?tx.provider_tx_id,
                "Expired on-chain transfer is mined but was never settled"
            );
            return Ok(Resolution::StillPending);
        }

        warn!(transaction_id = %tx.id, created_at = %tx.created_at, "On-chain transfer expired, failing");
        self.ledger_service
            .settle(tx.id, SettlementOutcome::Failed)
            .await?;
        Ok(Resolution::Expired)
    }

    async fn confirm(&self, tx: &Transaction) -> Result<Confirmation, ProviderError> {
        let provider = self.providers.get(tx.provider);
        let lookup = ConfirmLookup::for_transaction(tx);
        let timeout = self.settings.provider_timeout;
        self.retry
            .run("confirm pending transaction", || {
                with_timeout(timeout, "confirm", provider.confirm(&lookup))
            })
            .await
    }

    /// Nets of succeeded two-party transactions that are not zero.
    pub async fn check_zero_sum(&self) -> Result<HashMap<Currency, BigDecimal>, AppError> {
        let imbalances: HashMap<Currency, BigDecimal> = self
            .ledger
            .two_party_net()
            .await?
            .into_iter()
            .filter(|(_, net)| !net.is_zero())
            .collect();

        for (currency, net) in &imbalances {
            error!(alert = true, currency = %currency, net = %net, "Two-party ledger does not net to zero");
        }
        Ok(imbalances)
    }

    pub async fn check_balance_drift(&self) -> Result<Vec<BalanceDrift>, AppError> {
        let drift = self.ledger.balance_drift().await?;
        for entry in &drift {
            error!(
                alert = true,
                user_id = %entry.user_id,
                currency = %entry.currency,
                materialized = %entry.materialized,
                computed = %entry.computed,
                "Materialized balance drifted from ledger"
            );
        }
        Ok(drift)
    }
}

enum Resolution {
    Settled,
    Canceled,
    Expired,
    Requeued,
    StillPending,
}
