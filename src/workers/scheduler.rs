//! Cron-driven jobs: trial conversion, invoice finalization, reconciliation, exchange
//! rate refresh and the wallet challenge sweep.

use async_trait::async_trait;
use chrono::Utc;
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::{AppError, ErrorClass};
use crate::services::{BillingService, ExchangeRateService, ReconciliationService, WalletService};

#[async_trait]
pub trait ScheduledJob: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self) -> Result<(), AppError>;
}

/// Runs each registered job on its own cron schedule. A run that fails is logged and
/// the job waits for its next tick.
pub struct Scheduler {
    jobs: Vec<(Schedule, Arc<dyn ScheduledJob>)>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    pub fn add(&mut self, expression: &str, job: Arc<dyn ScheduledJob>) -> anyhow::Result<()> {
        let schedule = Schedule::from_str(expression)
            .map_err(|e| anyhow::anyhow!("invalid schedule '{}' for {}: {}", expression, job.name(), e))?;
        info!(job = job.name(), schedule = expression, "Registered scheduled job");
        self.jobs.push((schedule, job));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn start(self) -> Vec<JoinHandle<()>> {
        self.jobs
            .into_iter()
            .map(|(schedule, job)| tokio::spawn(run_on_schedule(schedule, job)))
            .collect()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_on_schedule(schedule: Schedule, job: Arc<dyn ScheduledJob>) {
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            info!(job = job.name(), "Schedule has no further runs");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;
        run_once(job.as_ref()).await;
    }
}

pub async fn run_once(job: &dyn ScheduledJob) {
    let started = std::time::Instant::now();
    match job.run().await {
        Ok(()) => info!(
            job = job.name(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Scheduled job finished"
        ),
        Err(e) if e.class() == ErrorClass::Fatal => {
            error!(alert = true, job = job.name(), error = %e, "Scheduled job failed")
        }
        Err(e) => error!(job = job.name(), error = %e, "Scheduled job failed"),
    }
}

pub struct TrialEndJob(pub Arc<BillingService>);

#[async_trait]
impl ScheduledJob for TrialEndJob {
    fn name(&self) -> &'static str {
        "trial-end"
    }

    async fn run(&self) -> Result<(), AppError> {
        let activated = self.0.activate_ending_trials(Utc::now()).await?;
        info!(activated, "Trial end run complete");
        Ok(())
    }
}

pub struct InvoiceFinalizeJob(pub Arc<BillingService>);

#[async_trait]
impl ScheduledJob for InvoiceFinalizeJob {
    fn name(&self) -> &'static str {
        "invoice-finalize"
    }

    async fn run(&self) -> Result<(), AppError> {
        let finalized = self.0.finalize_due_invoices(Utc::now()).await?;
        info!(finalized, "Invoice finalization run complete");
        Ok(())
    }
}

pub struct ReconcileJob(pub Arc<ReconciliationService>);

#[async_trait]
impl ScheduledJob for ReconcileJob {
    fn name(&self) -> &'static str {
        "reconcile"
    }

    async fn run(&self) -> Result<(), AppError> {
        let report = self.0.run(Utc::now()).await?;
        if !report.is_clean() {
            error!(
                alert = true,
                imbalances = report.imbalances.len(),
                drift = report.drift.len(),
                "Reconciliation found discrepancies"
            );
        }
        Ok(())
    }
}

pub struct ExchangeRateJob(pub Arc<ExchangeRateService>);

#[async_trait]
impl ScheduledJob for ExchangeRateJob {
    fn name(&self) -> &'static str {
        "exchange-rates"
    }

    async fn run(&self) -> Result<(), AppError> {
        self.0.refresh().await?;
        Ok(())
    }
}

pub struct SignatureSweepJob(pub Arc<WalletService>);

#[async_trait]
impl ScheduledJob for SignatureSweepJob {
    fn name(&self) -> &'static str {
        "signature-sweep"
    }

    async fn run(&self) -> Result<(), AppError> {
        self.0.expire_stale_signatures().await?;
        Ok(())
    }
}
