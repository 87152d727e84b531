//! Pre-flight checks for `config validate --check`.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::config::Config;
use crate::db::MIGRATOR;
use crate::health::{DependencyChecker, DependencyStatus, RedisChecker, RpcChecker};
use crate::providers::blockchain::BlockchainClient;

pub struct CheckOutcome {
    pub name: &'static str,
    pub error: Option<String>,
}

impl CheckOutcome {
    fn from_result(name: &'static str, result: Result<()>) -> Self {
        Self {
            name,
            error: result.err().map(|e| format!("{:#}", e)),
        }
    }
}

pub struct ValidationReport {
    pub checks: Vec<CheckOutcome>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.checks.iter().all(|check| check.error.is_none())
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.checks.iter().filter(|check| check.error.is_some())
    }

    pub fn print(&self) {
        println!("\n=== Startup Validation Report ===");
        for check in &self.checks {
            let mark = if check.error.is_none() { "✅ OK" } else { "❌ FAIL" };
            println!("{:<22} {}", format!("{}:", check.name), mark);
        }

        if !self.is_valid() {
            println!("\nErrors:");
            for check in self.failures() {
                if let Some(error) = &check.error {
                    println!("  ❌ {}: {}", check.name, error);
                }
            }
        }

        println!("\nOverall Status: {}", if self.is_valid() { "✅ PASS" } else { "❌ FAIL" });
        println!("=================================\n");
    }
}

pub async fn validate_environment(config: &Config, pool: &PgPool) -> ValidationReport {
    let redis = RedisChecker::new(config.redis_url.clone());
    let rpc = RpcChecker::new(BlockchainClient::new(config.blockchain_settings()));

    let (database, redis, rpc) = tokio::join!(
        validate_database(pool),
        reachable(&redis, "Redis"),
        reachable(&rpc, "Chain RPC"),
    );

    ValidationReport {
        checks: vec![
            CheckOutcome::from_result("Configuration", validate_env_vars(config)),
            CheckOutcome::from_result("Database", database),
            CheckOutcome::from_result("Redis", redis),
            CheckOutcome::from_result("Chain RPC", rpc),
        ],
    }
}

fn validate_env_vars(config: &Config) -> Result<()> {
    config.validate()?;
    if config.redis_url.is_empty() {
        anyhow::bail!("REDIS_URL is empty");
    }
    for (name, expr) in [
        ("SCHEDULE_TRIAL_END", &config.schedule_trial_end),
        ("SCHEDULE_INVOICE_FINALIZE", &config.schedule_invoice_finalize),
        ("SCHEDULE_RECONCILE", &config.schedule_reconcile),
        ("SCHEDULE_EXCHANGE_RATES", &config.schedule_exchange_rates),
        ("SCHEDULE_SIGNATURE_SWEEP", &config.schedule_signature_sweep),
    ] {
        expr.parse::<cron::Schedule>()
            .with_context(|| format!("{} is not a valid cron expression", name))?;
    }
    Ok(())
}

/// Every migration this build embeds must already be applied.
async fn validate_database(pool: &PgPool) -> Result<()> {
    let applied: Vec<i64> =
        sqlx::query_scalar("SELECT version FROM _sqlx_migrations WHERE success ORDER BY version")
            .fetch_all(pool)
            .await
            .context("Failed to read migrations table")?;

    let pending: Vec<String> = MIGRATOR
        .iter()
        .filter(|migration| !applied.contains(&migration.version))
        .map(|migration| format!("{} {}", migration.version, migration.description))
        .collect();

    if !pending.is_empty() {
        anyhow::bail!("pending migrations: {}", pending.join(", "));
    }
    Ok(())
}

async fn reachable(checker: &dyn DependencyChecker, what: &str) -> Result<()> {
    match checker.check().await {
        DependencyStatus::Healthy { .. } => Ok(()),
        DependencyStatus::Unhealthy { error, .. } => {
            anyhow::bail!("{} unreachable: {}", what, error)
        }
    }
}
