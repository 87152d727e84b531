use anyhow::Context;
use bigdecimal::BigDecimal;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::providers::blockchain::BlockchainSettings;
use crate::providers::RetryPolicy;
use crate::secrets::SecretsManager;
use crate::services::{
    BillingSettings, LedgerSettings, ReconciliationSettings, ServiceSettings, WalletSettings,
};

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    pub database_max_connections: u32,
    pub redis_url: String,
    pub cors_allowed_origins: Option<String>,
    pub log_request_body: bool,

    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    pub stripe_api_url: String,

    pub blockchain_rpc_url: String,
    pub blockchain_api_key: Option<String>,
    pub blockchain_chain_id: i64,
    pub blockchain_confirmations: u64,
    pub curation_contract_address: Option<String>,
    pub token_decimals: u32,

    pub exchange_rate_api_url: Option<String>,

    pub settlement_queue: String,
    pub queue_batch_size: usize,
    pub queue_max_attempts: u32,

    pub provider_timeout_secs: u64,
    pub pending_timeout_secs: i64,
    pub pending_expire_secs: i64,
    pub signature_ttl_secs: i64,
    pub trial_window_hours: i64,
    pub invoice_grace_secs: i64,
    pub platform_fee_rate: BigDecimal,
    pub payout_min_amount: BigDecimal,
    pub signing_domain: String,
    pub flag_refresh_secs: u64,

    pub schedule_trial_end: String,
    pub schedule_invoice_finalize: String,
    pub schedule_reconcile: String,
    pub schedule_exchange_rates: String,
    pub schedule_signature_sweep: String,
}

fn var_or<T>(name: &str, default: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("{} is not valid", name))
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

impl Config {
    /// Reads the environment. Provider secrets may be left empty here and filled from
    /// Vault by [`Config::load`].
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok(); // Load .env file if present

        Ok(Config {
            server_port: var_or("SERVER_PORT", "3000")?,
            database_url: env::var("DATABASE_URL").context("DATABASE_URL is required")?,
            database_max_connections: var_or("DATABASE_MAX_CONNECTIONS", "5")?,
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            cors_allowed_origins: optional_var("CORS_ALLOWED_ORIGINS"),
            log_request_body: var_or("LOG_REQUEST_BODY", "false")?,

            stripe_secret_key: env::var("STRIPE_SECRET_KEY").unwrap_or_default(),
            stripe_webhook_secret: env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default(),
            stripe_api_url: env::var("STRIPE_API_URL")
                .unwrap_or_else(|_| "https://api.stripe.com".to_string()),

            blockchain_rpc_url: env::var("BLOCKCHAIN_RPC_URL").unwrap_or_default(),
            blockchain_api_key: optional_var("BLOCKCHAIN_API_KEY"),
            blockchain_chain_id: var_or("BLOCKCHAIN_CHAIN_ID", "10")?,
            blockchain_confirmations: var_or("BLOCKCHAIN_CONFIRMATIONS", "3")?,
            curation_contract_address: optional_var("CURATION_CONTRACT_ADDRESS")
                .map(|address| address.to_lowercase()),
            token_decimals: var_or("TOKEN_DECIMALS", "18")?,

            exchange_rate_api_url: optional_var("EXCHANGE_RATE_API_URL"),

            settlement_queue: env::var("BLOCKCHAIN_SETTLEMENT_QUEUE")
                .unwrap_or_else(|_| "blockchain-settlement".to_string()),
            queue_batch_size: var_or("QUEUE_BATCH_SIZE", "10")?,
            queue_max_attempts: var_or("QUEUE_MAX_ATTEMPTS", "5")?,

            provider_timeout_secs: var_or("PROVIDER_TIMEOUT_SECS", "30")?,
            pending_timeout_secs: var_or("PENDING_TIMEOUT_SECS", "1800")?,
            pending_expire_secs: var_or("PENDING_EXPIRE_SECS", "86400")?,
            signature_ttl_secs: var_or("SIGNATURE_TTL_SECS", "600")?,
            trial_window_hours: var_or("TRIAL_WINDOW_HOURS", "24")?,
            invoice_grace_secs: var_or("INVOICE_GRACE_SECS", "3600")?,
            platform_fee_rate: var_or("PLATFORM_FEE_RATE", "0.2")?,
            payout_min_amount: var_or("PAYOUT_MIN_AMOUNT", "500")?,
            signing_domain: env::var("SIGNING_DOMAIN").unwrap_or_else(|_| "matters.town".to_string()),
            flag_refresh_secs: var_or("FLAG_REFRESH_SECS", "30")?,

            schedule_trial_end: env::var("SCHEDULE_TRIAL_END")
                .unwrap_or_else(|_| "0 */10 * * * *".to_string()),
            schedule_invoice_finalize: env::var("SCHEDULE_INVOICE_FINALIZE")
                .unwrap_or_else(|_| "0 */5 * * * *".to_string()),
            schedule_reconcile: env::var("SCHEDULE_RECONCILE")
                .unwrap_or_else(|_| "0 */15 * * * *".to_string()),
            schedule_exchange_rates: env::var("SCHEDULE_EXCHANGE_RATES")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
            schedule_signature_sweep: env::var("SCHEDULE_SIGNATURE_SWEEP")
                .unwrap_or_else(|_| "0 * * * * *".to_string()),
        })
    }

    /// [`Config::from_env`], then provider secrets from Vault when `VAULT_ADDR` is set.
    pub async fn load() -> anyhow::Result<Self> {
        let mut config = Self::from_env()?;

        if env::var("VAULT_ADDR").is_ok() {
            let secrets = SecretsManager::new().await?;
            let stripe = secrets.get_stripe_secrets().await?;
            config.stripe_secret_key = stripe.secret_key;
            config.stripe_webhook_secret = stripe.webhook_secret;
            if let Some(key) = secrets.get_blockchain_api_key().await? {
                config.blockchain_api_key = Some(key);
            }
            tracing::info!("Loaded provider secrets from Vault");
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database_url.is_empty() {
            anyhow::bail!("DATABASE_URL is empty");
        }
        if self.stripe_secret_key.is_empty() {
            anyhow::bail!("STRIPE_SECRET_KEY is required");
        }
        if self.stripe_webhook_secret.is_empty() {
            anyhow::bail!("STRIPE_WEBHOOK_SECRET is required");
        }
        if self.blockchain_rpc_url.is_empty() {
            anyhow::bail!("BLOCKCHAIN_RPC_URL is required");
        }
        if self.server_port == 0 {
            anyhow::bail!("SERVER_PORT must be greater than 0");
        }
        if self.queue_max_attempts == 0 {
            anyhow::bail!("QUEUE_MAX_ATTEMPTS must be greater than 0");
        }

        url::Url::parse(&self.stripe_api_url).context("STRIPE_API_URL is not a valid URL")?;
        url::Url::parse(&self.blockchain_rpc_url)
            .context("BLOCKCHAIN_RPC_URL is not a valid URL")?;
        if let Some(url) = &self.exchange_rate_api_url {
            url::Url::parse(url).context("EXCHANGE_RATE_API_URL is not a valid URL")?;
        }
        Ok(())
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            ledger: self.ledger_settings(),
            billing: self.billing_settings(),
            wallet: self.wallet_settings(),
            reconciliation: self.reconciliation_settings(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn ledger_settings(&self) -> LedgerSettings {
        LedgerSettings {
            provider_timeout: self.provider_timeout(),
            payout_min_amount: self.payout_min_amount.clone(),
            settlement_queue: self.settlement_queue.clone(),
            ..LedgerSettings::default()
        }
    }

    pub fn billing_settings(&self) -> BillingSettings {
        BillingSettings {
            trial_window: chrono::Duration::hours(self.trial_window_hours),
            invoice_grace: chrono::Duration::seconds(self.invoice_grace_secs),
            platform_fee_rate: self.platform_fee_rate.clone(),
            provider_timeout: self.provider_timeout(),
        }
    }

    pub fn wallet_settings(&self) -> WalletSettings {
        WalletSettings {
            signing_domain: self.signing_domain.clone(),
            signature_ttl: chrono::Duration::seconds(self.signature_ttl_secs),
        }
    }

    pub fn reconciliation_settings(&self) -> ReconciliationSettings {
        ReconciliationSettings {
            pending_timeout: chrono::Duration::seconds(self.pending_timeout_secs),
            pending_expiry: chrono::Duration::seconds(self.pending_expire_secs),
            provider_timeout: self.provider_timeout(),
            settlement_queue: self.settlement_queue.clone(),
            ..ReconciliationSettings::default()
        }
    }

    pub fn blockchain_settings(&self) -> BlockchainSettings {
        BlockchainSettings {
            rpc_url: self.blockchain_rpc_url.clone(),
            api_key: self.blockchain_api_key.clone(),
            chain_id: self.blockchain_chain_id,
            confirmations: self.blockchain_confirmations,
            curation_contract: self.curation_contract_address.clone(),
            timeout: self.provider_timeout(),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        server_port: 3000,
        database_url: "postgres://localhost:5432/settlement".to_string(),
        database_max_connections: 5,
        redis_url: "redis://localhost:6379".to_string(),
        cors_allowed_origins: None,
        log_request_body: false,
        stripe_secret_key: "sk_test".to_string(),
        stripe_webhook_secret: "whsec_test".to_string(),
        stripe_api_url: "https://api.stripe.com".to_string(),
        blockchain_rpc_url: "https://mainnet.optimism.io".to_string(),
        blockchain_api_key: None,
        blockchain_chain_id: 10,
        blockchain_confirmations: 3,
        curation_contract_address: None,
        token_decimals: 18,
        exchange_rate_api_url: None,
        settlement_queue: "blockchain-settlement".to_string(),
        queue_batch_size: 10,
        queue_max_attempts: 5,
        provider_timeout_secs: 30,
        pending_timeout_secs: 1800,
        pending_expire_secs: 86_400,
        signature_ttl_secs: 600,
        trial_window_hours: 24,
        invoice_grace_secs: 3600,
        platform_fee_rate: BigDecimal::new(2.into(), 1),
        payout_min_amount: BigDecimal::from(500),
        signing_domain: "matters.town".to_string(),
        flag_refresh_secs: 30,
        schedule_trial_end: "0 */10 * * * *".to_string(),
        schedule_invoice_finalize: "0 */5 * * * *".to_string(),
        schedule_reconcile: "0 */15 * * * *".to_string(),
        schedule_exchange_rates: "0 0 * * * *".to_string(),
        schedule_signature_sweep: "0 * * * * *".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_config_passes() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn missing_provider_secret_fails() {
        let config = Config {
            stripe_secret_key: String::new(),
            ..test_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_rpc_url_fails() {
        let config = Config {
            blockchain_rpc_url: "not-a-url".to_string(),
            ..test_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn settings_carry_configured_values() {
        let config = Config {
            pending_expire_secs: 60,
            payout_min_amount: BigDecimal::from(100),
            ..test_config()
        };
        assert_eq!(
            config.reconciliation_settings().pending_expiry,
            chrono::Duration::seconds(60)
        );
        assert_eq!(config.ledger_settings().payout_min_amount, BigDecimal::from(100));
        assert_eq!(config.blockchain_settings().chain_id, 10);
    }
}
