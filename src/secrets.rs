use std::collections::HashMap;
use std::env;

use anyhow::{Context, Result};
use vaultrs::auth::approle;
use vaultrs::client::{Client, VaultClient, VaultClientSettingsBuilder};
use vaultrs::kv2;

/// Payment provider credentials kept under `secret/stripe`.
#[derive(Clone)]
pub struct StripeSecrets {
    pub secret_key: String,
    pub webhook_secret: String,
}

impl std::fmt::Debug for StripeSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeSecrets")
            .field("secret_key", &"****")
            .field("webhook_secret", &"****")
            .finish()
    }
}

pub struct SecretsManager {
    client: VaultClient,
    kv_mount: String,
}

impl SecretsManager {
    pub async fn new() -> Result<Self> {
        let vault_addr =
            env::var("VAULT_ADDR").unwrap_or_else(|_| "http://127.0.0.1:8200".to_string());
        let role_id = env::var("VAULT_ROLE_ID").context("VAULT_ROLE_ID is required")?;
        let secret_id = env::var("VAULT_SECRET_ID").context("VAULT_SECRET_ID is required")?;
        let auth_mount = env::var("VAULT_AUTH_MOUNT").unwrap_or_else(|_| "auth/approle".to_string());
        let kv_mount = env::var("VAULT_KV_MOUNT").unwrap_or_else(|_| "secret".to_string());

        let mut client = VaultClient::new(
            VaultClientSettingsBuilder::default()
                .address(&vault_addr)
                .build()
                .context("failed to build Vault client settings")?,
        )
        .context("failed to create Vault client")?;

        let auth = approle::login(&mut client, &auth_mount, &role_id, &secret_id)
            .await
            .context("failed to authenticate to Vault with AppRole")?;
        client.set_token(&auth.client_token);

        Ok(Self { client, kv_mount })
    }

    async fn read(&self, path: &str) -> Result<HashMap<String, String>> {
        kv2::read(&self.client, &self.kv_mount, path)
            .await
            .with_context(|| format!("failed to read {}/{} from Vault", self.kv_mount, path))
    }

    pub async fn get_stripe_secrets(&self) -> Result<StripeSecrets> {
        let secret = self.read("stripe").await?;
        Ok(StripeSecrets {
            secret_key: secret
                .get("secret_key")
                .cloned()
                .context("secret_key not found in Vault secret/stripe")?,
            webhook_secret: secret
                .get("webhook_secret")
                .cloned()
                .context("webhook_secret not found in Vault secret/stripe")?,
        })
    }

    /// The RPC key is optional; a missing `secret/blockchain` entry is not an error.
    pub async fn get_blockchain_api_key(&self) -> Result<Option<String>> {
        match self.read("blockchain").await {
            Ok(secret) => Ok(secret.get("api_key").cloned()),
            Err(e) => {
                tracing::debug!(error = %e, "No blockchain secret in Vault");
                Ok(None)
            }
        }
    }
}
