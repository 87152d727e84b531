use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

use crate::providers::blockchain::BlockchainClient;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Without these the ledger cannot settle anything; the rest only degrade it.
const CRITICAL: &[&str] = &["postgres"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: OverallStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: HashMap<String, DependencyStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyStatus {
    Healthy { status: String, latency_ms: u64 },
    Unhealthy { status: String, error: String },
}

impl DependencyStatus {
    fn healthy(started: Instant) -> Self {
        DependencyStatus::Healthy {
            status: "healthy".to_string(),
            latency_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn unhealthy(error: impl Display) -> Self {
        DependencyStatus::Unhealthy {
            status: "unhealthy".to_string(),
            error: error.to_string(),
        }
    }

    fn from_result<E: Display>(started: Instant, result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::healthy(started),
            Err(e) => Self::unhealthy(e),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, DependencyStatus::Healthy { .. })
    }
}

#[async_trait]
pub trait DependencyChecker: Send + Sync {
    async fn check(&self) -> DependencyStatus;
}

pub struct PostgresChecker {
    pool: sqlx::PgPool,
}

impl PostgresChecker {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DependencyChecker for PostgresChecker {
    async fn check(&self) -> DependencyStatus {
        let started = Instant::now();
        let result = sqlx::query("SELECT 1").execute(&self.pool).await.map(|_| ());
        DependencyStatus::from_result(started, result)
    }
}

/// Pings the redis instance backing the settlement queue.
pub struct RedisChecker {
    url: String,
}

impl RedisChecker {
    pub fn new(url: String) -> Self {
        Self { url }
    }

    async fn ping(&self) -> redis::RedisResult<()> {
        let client = redis::Client::open(self.url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl DependencyChecker for RedisChecker {
    async fn check(&self) -> DependencyStatus {
        let started = Instant::now();
        DependencyStatus::from_result(started, self.ping().await)
    }
}

/// Asks the chain RPC for its head block.
pub struct RpcChecker {
    client: BlockchainClient,
}

impl RpcChecker {
    pub fn new(client: BlockchainClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DependencyChecker for RpcChecker {
    async fn check(&self) -> DependencyStatus {
        let started = Instant::now();
        let result = self.client.block_number().await.map(|_| ());
        DependencyStatus::from_result(started, result)
    }
}

/// The dependencies `/health` reports on.
#[derive(Clone)]
pub struct HealthChecks {
    pub postgres: Arc<dyn DependencyChecker>,
    pub redis: Arc<dyn DependencyChecker>,
    pub rpc: Arc<dyn DependencyChecker>,
}

impl HealthChecks {
    fn named(&self) -> [(&'static str, &Arc<dyn DependencyChecker>); 3] {
        [
            ("postgres", &self.postgres),
            ("redis", &self.redis),
            ("rpc", &self.rpc),
        ]
    }
}

/// Runs every check concurrently, each bounded by [`CHECK_TIMEOUT`].
pub async fn check_health(checks: &HealthChecks, start_time: Instant) -> HealthResponse {
    let results = join_all(checks.named().into_iter().map(|(name, checker)| async move {
        let status = timeout(CHECK_TIMEOUT, checker.check())
            .await
            .unwrap_or_else(|_| DependencyStatus::unhealthy("timeout"));
        (name.to_string(), status)
    }))
    .await;

    let dependencies: HashMap<String, DependencyStatus> = results.into_iter().collect();

    HealthResponse {
        status: overall_status(&dependencies),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: start_time.elapsed().as_secs(),
        dependencies,
    }
}

pub fn overall_status(dependencies: &HashMap<String, DependencyStatus>) -> OverallStatus {
    let mut failing = dependencies
        .iter()
        .filter(|(_, status)| !status.is_healthy())
        .map(|(name, _)| name.as_str())
        .peekable();

    if failing.peek().is_none() {
        OverallStatus::Healthy
    } else if failing.any(|name| CRITICAL.contains(&name)) {
        OverallStatus::Unhealthy
    } else {
        OverallStatus::Degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(bool);

    #[async_trait]
    impl DependencyChecker for Fixed {
        async fn check(&self) -> DependencyStatus {
            if self.0 {
                DependencyStatus::healthy(Instant::now())
            } else {
                DependencyStatus::unhealthy("down")
            }
        }
    }

    struct Hangs;

    #[async_trait]
    impl DependencyChecker for Hangs {
        async fn check(&self) -> DependencyStatus {
            tokio::time::sleep(Duration::from_secs(60)).await;
            DependencyStatus::healthy(Instant::now())
        }
    }

    fn checks(postgres: bool, redis: bool, rpc: bool) -> HealthChecks {
        HealthChecks {
            postgres: Arc::new(Fixed(postgres)),
            redis: Arc::new(Fixed(redis)),
            rpc: Arc::new(Fixed(rpc)),
        }
    }

    #[tokio::test]
    async fn test_all_healthy() {
        let report = check_health(&checks(true, true, true), Instant::now()).await;
        assert_eq!(report.status, OverallStatus::Healthy);
        assert_eq!(report.dependencies.len(), 3);
    }

    #[tokio::test]
    async fn test_rpc_down_is_degraded() {
        let report = check_health(&checks(true, true, false), Instant::now()).await;
        assert_eq!(report.status, OverallStatus::Degraded);
    }

    #[tokio::test]
    async fn test_postgres_down_is_unhealthy() {
        let report = check_health(&checks(false, false, true), Instant::now()).await;
        assert_eq!(report.status, OverallStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_slow_check_times_out() {
        let mut slow = checks(true, true, true);
        slow.redis = Arc::new(Hangs);
        let report = check_health(&slow, Instant::now()).await;
        assert_eq!(report.status, OverallStatus::Degraded);
        assert!(matches!(
            &report.dependencies["redis"],
            DependencyStatus::Unhealthy { error, .. } if error == "timeout"
        ));
    }
}
