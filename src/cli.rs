use clap::{Parser, Subcommand, ValueEnum};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::adapters::Repositories;
use crate::config::Config;
use crate::domain::SettlementOutcome;
use crate::health::{HealthChecks, PostgresChecker, RedisChecker, RpcChecker};
use crate::providers::blockchain::BlockchainClient;
use crate::providers::exchange_rate::{HttpRateSource, RateSource, StaticRateSource};
use crate::providers::matters::MattersProvider;
use crate::providers::stripe::{StripeClient, StripeWebhookVerifier};
use crate::providers::{Providers, RetryPolicy};
use crate::queue::redis::RedisQueue;
use crate::services::{SettleResult, Services};
use crate::workers::scheduler::{
    ExchangeRateJob, InvoiceFinalizeJob, ReconcileJob, SignatureSweepJob, TrialEndJob,
};
use crate::workers::{BlockchainSettlementHandler, QueueWorker, Scheduler};
use crate::{create_app, AppState, HttpSettings};

#[derive(Parser)]
#[command(name = "settlement-core")]
#[command(about = "Settlement Core - transaction ledger and multi-provider settlement", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server (default)
    Serve,

    /// Background workers
    #[command(subcommand)]
    Worker(WorkerCommands),

    /// Run one reconciliation pass and print the report
    Reconcile,

    /// Transaction management commands
    #[command(subcommand)]
    Tx(TxCommands),

    /// Database management commands
    #[command(subcommand)]
    Db(DbCommands),

    /// Configuration validation
    Config {
        /// Also check database, Redis and RPC connectivity
        #[arg(long)]
        check: bool,
    },
}

#[derive(Subcommand)]
pub enum WorkerCommands {
    /// Consume the blockchain settlement queue
    BlockchainSettlement,
    /// Run trial-end, invoice, reconciliation and signature jobs on their schedules
    Scheduler,
}

#[derive(Subcommand)]
pub enum TxCommands {
    /// Settle a pending transaction by ID
    Settle {
        /// Transaction UUID
        #[arg(value_name = "TX_ID")]
        tx_id: Uuid,
        #[arg(value_enum)]
        outcome: OutcomeArg,
    },
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutcomeArg {
    Succeeded,
    Failed,
    Canceled,
}

impl From<OutcomeArg> for SettlementOutcome {
    fn from(arg: OutcomeArg) -> Self {
        match arg {
            OutcomeArg::Succeeded => SettlementOutcome::Succeeded,
            OutcomeArg::Failed => SettlementOutcome::Failed,
            OutcomeArg::Canceled => SettlementOutcome::Canceled,
        }
    }
}

/// Everything a process needs, connected once from [`Config`].
pub struct Runtime {
    pub config: Config,
    pub pool: PgPool,
    pub repositories: Repositories,
    pub providers: Providers,
    pub blockchain: Arc<BlockchainClient>,
    pub queue: Arc<RedisQueue>,
    pub services: Services,
}

impl Runtime {
    pub async fn connect(config: Config) -> anyhow::Result<Self> {
        let pool = crate::db::create_pool(&config).await?;
        let queue = Arc::new(RedisQueue::connect(&config.redis_url, config.queue_max_attempts).await?);

        let stripe = Arc::new(StripeClient::new(
            config.stripe_api_url.clone(),
            config.stripe_secret_key.clone(),
            config.provider_timeout(),
        ));
        let blockchain = Arc::new(BlockchainClient::new(config.blockchain_settings()));
        let providers = Providers {
            stripe: stripe.clone(),
            blockchain: blockchain.clone(),
            matters: Arc::new(MattersProvider),
        };
        let rate_source: Arc<dyn RateSource> = match &config.exchange_rate_api_url {
            Some(url) => Arc::new(HttpRateSource::new(url.clone())),
            None => {
                tracing::warn!("EXCHANGE_RATE_API_URL not set, quotes are unavailable");
                Arc::new(StaticRateSource::new(Default::default()))
            }
        };

        let repositories = Repositories::postgres(pool.clone());
        let services = Services::new(
            &repositories,
            providers.clone(),
            stripe,
            queue.clone(),
            rate_source,
            config.service_settings(),
        );
        services.flags.refresh_cache().await?;

        Ok(Self {
            config,
            pool,
            repositories,
            providers,
            blockchain,
            queue,
            services,
        })
    }

    fn health_checks(&self) -> HealthChecks {
        HealthChecks {
            postgres: Arc::new(PostgresChecker::new(self.pool.clone())),
            redis: Arc::new(RedisChecker::new(self.config.redis_url.clone())),
            rpc: Arc::new(RpcChecker::new(self.blockchain.as_ref().clone())),
        }
    }
}

pub async fn handle_serve(runtime: Runtime) -> anyhow::Result<()> {
    let config = &runtime.config;
    runtime
        .services
        .flags
        .start(Duration::from_secs(config.flag_refresh_secs));

    if let Err(e) = runtime.services.rates.refresh().await {
        tracing::warn!(error = %e, "Initial exchange rate refresh failed");
    }
    let mut scheduler = Scheduler::new();
    scheduler.add(
        &config.schedule_exchange_rates,
        Arc::new(ExchangeRateJob(runtime.services.rates.clone())),
    )?;
    let _jobs = scheduler.start();

    let state = AppState::new(
        &runtime.services,
        runtime.repositories.accounts.clone(),
        StripeWebhookVerifier::new(config.stripe_webhook_secret.clone()),
        runtime.health_checks(),
        HttpSettings {
            cors_allowed_origins: config.cors_allowed_origins.clone(),
            log_request_body: config.log_request_body,
        },
    );
    let app = create_app(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub async fn handle_worker_blockchain_settlement(runtime: Runtime) -> anyhow::Result<()> {
    let config = &runtime.config;
    let recovered = runtime.queue.recover_inflight(&config.settlement_queue).await?;
    if recovered > 0 {
        tracing::warn!(recovered, queue = %config.settlement_queue, "Recovered in-flight messages");
    }

    let handler = BlockchainSettlementHandler::new(
        runtime.repositories.ledger.clone(),
        runtime.services.ledger.clone(),
        runtime.repositories.wallets.clone(),
        runtime.blockchain.clone(),
        RetryPolicy::default(),
        config.token_decimals,
        config.provider_timeout(),
    );
    let worker = QueueWorker::new(
        runtime.queue.clone(),
        config.settlement_queue.clone(),
        Arc::new(handler),
        config.queue_batch_size,
    );
    worker.run(shutdown_signal()).await
}

pub async fn handle_worker_scheduler(runtime: Runtime) -> anyhow::Result<()> {
    let config = &runtime.config;
    let services = &runtime.services;
    services
        .flags
        .start(Duration::from_secs(config.flag_refresh_secs));

    let mut scheduler = Scheduler::new();
    scheduler.add(&config.schedule_trial_end, Arc::new(TrialEndJob(services.billing.clone())))?;
    scheduler.add(
        &config.schedule_invoice_finalize,
        Arc::new(InvoiceFinalizeJob(services.billing.clone())),
    )?;
    scheduler.add(
        &config.schedule_reconcile,
        Arc::new(ReconcileJob(services.reconciliation.clone())),
    )?;
    scheduler.add(
        &config.schedule_signature_sweep,
        Arc::new(SignatureSweepJob(services.wallets.clone())),
    )?;

    let handles = scheduler.start();
    tracing::info!(jobs = handles.len(), "Scheduler started");
    shutdown_signal().await;
    for handle in handles {
        handle.abort();
    }
    tracing::info!("Scheduler stopped");
    Ok(())
}

pub async fn handle_reconcile(runtime: Runtime) -> anyhow::Result<()> {
    let report = runtime.services.reconciliation.run(chrono::Utc::now()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.is_clean() {
        println!("✓ Ledger is consistent");
        Ok(())
    } else {
        anyhow::bail!(
            "{} currency imbalances, {} drifting balances",
            report.imbalances.len(),
            report.drift.len()
        )
    }
}

pub async fn handle_tx_settle(
    runtime: Runtime,
    tx_id: Uuid,
    outcome: SettlementOutcome,
) -> anyhow::Result<()> {
    match runtime.services.ledger.settle(tx_id, outcome).await? {
        SettleResult::Settled(tx) => {
            tracing::info!(transaction_id = %tx_id, state = %tx.state, "Transaction settled from CLI");
            println!("✓ Transaction {} is now {}", tx_id, tx.state);
        }
        SettleResult::AlreadyTerminal(tx) => {
            println!("Transaction {} was already {}; nothing changed", tx_id, tx.state);
        }
    }
    Ok(())
}

pub async fn handle_db_migrate(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::create_pool(config).await?;

    tracing::info!("Running database migrations...");
    crate::db::run_migrations(&pool).await?;

    tracing::info!("Database migrations completed");
    println!("✓ Database migrations completed");

    Ok(())
}

pub async fn handle_config_validate(config: &Config, check: bool) -> anyhow::Result<()> {
    tracing::info!("Validating configuration...");

    println!("Configuration:");
    println!("  Server Port: {}", config.server_port);
    println!("  Database URL: {}", mask_password(&config.database_url));
    println!("  Redis URL: {}", mask_password(&config.redis_url));
    println!("  Stripe API URL: {}", config.stripe_api_url);
    println!("  Stripe Secret Key: {}", mask_secret(&config.stripe_secret_key));
    println!("  Chain RPC URL: {}", config.blockchain_rpc_url);
    println!("  Chain ID: {}", config.blockchain_chain_id);
    println!("  Settlement Queue: {}", config.settlement_queue);

    config.validate()?;

    if check {
        let pool = crate::db::create_pool(config).await?;
        let report = crate::startup::validate_environment(config, &pool).await;
        report.print();
        if !report.is_valid() {
            anyhow::bail!("startup validation failed");
        }
    }

    tracing::info!("Configuration is valid");
    println!("✓ Configuration is valid");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            if let Some(slash_pos) = url[..colon_pos].rfind("//") {
                let prefix = &url[..slash_pos + 2];
                let user = &url[slash_pos + 2..colon_pos];
                let suffix = &url[at_pos..];
                return format!("{}{}:****{}", prefix, user, suffix);
            }
        }
    }
    url.to_string()
}

fn mask_secret(secret: &str) -> String {
    match secret.get(..7) {
        Some(prefix) if secret.len() > 12 => format!("{}****", prefix),
        _ => "****".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_password() {
        assert_eq!(
            mask_password("postgres://settle:hunter2@db:5432/ledger"),
            "postgres://settle:****@db:5432/ledger"
        );
        assert_eq!(mask_password("redis://127.0.0.1:6379"), "redis://127.0.0.1:6379");
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("sk_live_abcdefghijkl"), "sk_live****");
        assert_eq!(mask_secret("short"), "****");
    }

    #[test]
    fn test_parse_tx_settle() {
        let id = Uuid::new_v4();
        let cli = Cli::try_parse_from(["settlement-core", "tx", "settle", &id.to_string(), "failed"])
            .unwrap();
        match cli.command {
            Some(Commands::Tx(TxCommands::Settle { tx_id, outcome })) => {
                assert_eq!(tx_id, id);
                assert_eq!(SettlementOutcome::from(outcome), SettlementOutcome::Failed);
            }
            _ => panic!("expected tx settle"),
        }
    }

    #[test]
    fn test_parse_worker_commands() {
        let cli = Cli::try_parse_from(["settlement-core", "worker", "blockchain-settlement"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Worker(WorkerCommands::BlockchainSettlement))
        ));
        let cli = Cli::try_parse_from(["settlement-core"]).unwrap();
        assert!(cli.command.is_none());
    }
}
