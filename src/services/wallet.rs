//! Links crypto wallets to accounts through signed, single-use challenges.

use axum::http::StatusCode;
use chrono::{Duration, Utc};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::crypto::{recover_address, SignatureError};
use crate::domain::wallet::challenge_message;
use crate::domain::{CryptoWallet, CryptoWalletSignature, SignaturePurpose, SignatureStatus};
use crate::error::{AppError, ErrorClass};
use crate::ports::{AccountRepository, LinkOutcome, WalletRepository};
use crate::validation::{normalize_address, validate_max_len, NONCE_MAX_LEN};

/// Why a wallet operation was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("no challenge issued for this address and nonce")]
    UnknownChallenge,

    #[error("challenge is {0}")]
    ChallengeNotActive(SignatureStatus),

    #[error("challenge expired")]
    ChallengeExpired,

    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),

    #[error("signature was not produced by {0}")]
    AddressMismatch(String),

    #[error("challenge already used")]
    Replayed,

    #[error("address is already linked to an account")]
    AddressTaken,

    #[error("no wallet is linked to {0}")]
    UnknownWallet(String),

    #[error("a {0} challenge needs a signed-in user")]
    UserRequired(SignaturePurpose),

    #[error("set a password before removing the wallet")]
    PasswordRequired,
}

impl WalletError {
    pub fn class(&self) -> ErrorClass {
        match self {
            WalletError::Replayed | WalletError::AddressTaken => ErrorClass::Consistency,
            _ => ErrorClass::Validation,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            WalletError::AddressTaken => StatusCode::CONFLICT,
            WalletError::UnknownWallet(_) => StatusCode::NOT_FOUND,
            WalletError::UserRequired(_) | WalletError::PasswordRequired => StatusCode::FORBIDDEN,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WalletSettings {
    pub signing_domain: String,
    pub signature_ttl: Duration,
}

impl Default for WalletSettings {
    fn default() -> Self {
        Self {
            signing_domain: "matters.town".to_string(),
            signature_ttl: Duration::seconds(600),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub address: String,
    pub nonce: String,
    pub signed_message: String,
    pub purpose: SignaturePurpose,
    pub expired_at: chrono::DateTime<Utc>,
}

pub struct WalletService {
    wallets: Arc<dyn WalletRepository>,
    accounts: Arc<dyn AccountRepository>,
    settings: WalletSettings,
}

impl WalletService {
    pub fn new(
        wallets: Arc<dyn WalletRepository>,
        accounts: Arc<dyn AccountRepository>,
        settings: WalletSettings,
    ) -> Self {
        Self {
            wallets,
            accounts,
            settings,
        }
    }

    pub async fn issue_challenge(
        &self,
        address: &str,
        purpose: SignaturePurpose,
        user_id: Option<Uuid>,
    ) -> Result<Challenge, AppError> {
        let address = normalize_address(address)?;
        if purpose == SignaturePurpose::Connect && user_id.is_none() {
            return Err(WalletError::UserRequired(purpose).into());
        }

        let nonce = hex::encode(rand::thread_rng().gen::<[u8; 16]>());
        let now = Utc::now();
        let expired_at = now + self.settings.signature_ttl;
        let signed_message = challenge_message(
            &self.settings.signing_domain,
            &address,
            purpose,
            &nonce,
            now,
            expired_at,
        );

        let signature = CryptoWalletSignature {
            id: Uuid::new_v4(),
            address: address.clone(),
            user_id,
            nonce: nonce.clone(),
            signed_message: signed_message.clone(),
            purpose,
            status: SignatureStatus::Active,
            expired_at,
            used_at: None,
            created_at: now,
        };
        let superseded = self.wallets.deactivate_signatures(&address, purpose).await?;
        self.wallets.insert_signature(&signature).await?;
        info!(address = %address, purpose = %purpose, superseded, "Issued wallet challenge");

        Ok(Challenge {
            address,
            nonce,
            signed_message,
            purpose,
            expired_at,
        })
    }

    /// Checks a signed challenge and consumes it. Returns the user the wallet belongs
    /// to, linking it first for `signup`/`connect` challenges.
    pub async fn verify(
        &self,
        address: &str,
        signature: &str,
        nonce: &str,
        user_id: Option<Uuid>,
    ) -> Result<Uuid, AppError> {
        let address = normalize_address(address)?;
        validate_max_len("nonce", nonce, NONCE_MAX_LEN)?;

        let challenge = self
            .wallets
            .find_signature(&address, nonce)
            .await?
            .ok_or(WalletError::UnknownChallenge)?;

        if challenge.status != SignatureStatus::Active {
            return Err(WalletError::ChallengeNotActive(challenge.status).into());
        }
        let now = Utc::now();
        if challenge.is_expired_at(now) {
            self.wallets.expire_signature(challenge.id).await?;
            return Err(WalletError::ChallengeExpired.into());
        }

        let recovered = recover_address(&challenge.signed_message, signature)
            .map_err(WalletError::from)?;
        if recovered != address {
            return Err(WalletError::AddressMismatch(address).into());
        }

        match challenge.purpose {
            SignaturePurpose::Login => {
                let wallet = self
                    .wallets
                    .active_wallet_by_address(&address)
                    .await?
                    .ok_or_else(|| WalletError::UnknownWallet(address.clone()))?;
                if !self
                    .wallets
                    .consume_signature(challenge.id, wallet.user_id, now)
                    .await?
                {
                    return Err(WalletError::Replayed.into());
                }
                info!(user_id = %wallet.user_id, address = %address, "Wallet login verified");
                Ok(wallet.user_id)
            }
            purpose @ (SignaturePurpose::Signup | SignaturePurpose::Connect) => {
                let user_id = user_id
                    .or(challenge.user_id)
                    .ok_or(WalletError::UserRequired(purpose))?;
                if challenge.user_id.is_some_and(|owner| owner != user_id) {
                    return Err(WalletError::UnknownChallenge.into());
                }

                match self
                    .wallets
                    .link_wallet(challenge.id, user_id, &address, now)
                    .await?
                {
                    LinkOutcome::Linked(wallet) => {
                        info!(user_id = %user_id, wallet_id = %wallet.id, address = %address, "Linked wallet");
                        Ok(wallet.user_id)
                    }
                    LinkOutcome::Replayed => Err(WalletError::Replayed.into()),
                    LinkOutcome::AddressTaken => Err(WalletError::AddressTaken.into()),
                }
            }
        }
    }

    /// Like [`verify`](Self::verify), but a refused challenge yields `None`.
    pub async fn verify_signature(
        &self,
        address: &str,
        signature: &str,
        nonce: &str,
        user_id: Option<Uuid>,
    ) -> Result<Option<Uuid>, AppError> {
        match self.verify(address, signature, nonce, user_id).await {
            Ok(user_id) => Ok(Some(user_id)),
            Err(AppError::Wallet(reason)) => {
                warn!(address = %address, reason = %reason, "Wallet signature rejected");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn wallet_for_user(&self, user_id: Uuid) -> Result<Option<CryptoWallet>, AppError> {
        Ok(self.wallets.active_wallet_for_user(user_id).await?)
    }

    /// Unlinks the caller's wallet. Only accounts that can still sign in without it may
    /// do so.
    pub async fn reset_wallet(&self, user_id: Uuid) -> Result<CryptoWallet, AppError> {
        self.require_password(user_id).await?;
        let wallet = self
            .wallets
            .active_wallet_for_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("wallet for user {}", user_id)))?;
        self.archive(wallet, user_id).await
    }

    pub async fn delete_wallet(&self, user_id: Uuid, wallet_id: Uuid) -> Result<CryptoWallet, AppError> {
        self.require_password(user_id).await?;
        let wallet = self.wallets.get_wallet(wallet_id).await?;
        if wallet.user_id != user_id {
            return Err(AppError::Forbidden(format!("wallet {} belongs to another user", wallet_id)));
        }
        if wallet.archived {
            return Err(AppError::NotFound(format!("wallet {}", wallet_id)));
        }
        self.archive(wallet, user_id).await
    }

    pub async fn expire_stale_signatures(&self) -> Result<u64, AppError> {
        let expired = self.wallets.expire_stale_signatures(Utc::now()).await?;
        if expired > 0 {
            info!(expired, "Expired stale wallet challenges");
        }
        Ok(expired)
    }

    async fn require_password(&self, user_id: Uuid) -> Result<(), AppError> {
        let account = self.accounts.get_account(user_id).await?;
        if account.has_password {
            Ok(())
        } else {
            Err(WalletError::PasswordRequired.into())
        }
    }

    async fn archive(&self, wallet: CryptoWallet, actor: Uuid) -> Result<CryptoWallet, AppError> {
        if !self
            .wallets
            .archive_wallet(wallet.id, &actor.to_string())
            .await?
        {
            return Err(AppError::Conflict(format!("wallet {} already archived", wallet.id)));
        }
        info!(wallet_id = %wallet.id, user_id = %wallet.user_id, "Archived wallet");
        Ok(self.wallets.get_wallet(wallet.id).await?)
    }
}
