//! Postgres implementation of WalletRepository.
//!
//! Address uniqueness is enforced by the partial unique index on non-archived wallets;
//! a lost race surfaces as [`LinkOutcome::AddressTaken`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::AuditLog;
use crate::domain::audit::ENTITY_CRYPTO_WALLET;
use crate::domain::{CryptoWallet, CryptoWalletSignature, SignaturePurpose};
use crate::ports::{LinkOutcome, RepositoryError, RepositoryResult, WalletRepository};

const WALLET_COLUMNS: &str = "id, user_id, address, archived, created_at, updated_at";
const SIGNATURE_COLUMNS: &str =
    "id, address, user_id, nonce, signed_message, purpose, status, expired_at, used_at, created_at";

#[derive(Clone)]
pub struct PostgresWalletRepository {
    pool: PgPool,
}

impl PostgresWalletRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WalletRepository for PostgresWalletRepository {
    async fn insert_signature(&self, signature: &CryptoWalletSignature) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO crypto_wallet_signature (
                id, address, user_id, nonce, signed_message, purpose, status, expired_at, used_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(signature.id)
        .bind(&signature.address)
        .bind(signature.user_id)
        .bind(&signature.nonce)
        .bind(&signature.signed_message)
        .bind(signature.purpose.as_str())
        .bind(signature.status.as_str())
        .bind(signature.expired_at)
        .bind(signature.used_at)
        .bind(signature.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_signature(
        &self,
        address: &str,
        nonce: &str,
    ) -> RepositoryResult<Option<CryptoWalletSignature>> {
        let sql = format!(
            "SELECT {} FROM crypto_wallet_signature WHERE address = $1 AND nonce = $2",
            SIGNATURE_COLUMNS
        );
        sqlx::query_as::<_, SignatureRow>(&sql)
            .bind(address)
            .bind(nonce)
            .fetch_optional(&self.pool)
            .await?
            .map(SignatureRow::into_domain)
            .transpose()
    }

    async fn expire_signature(&self, id: Uuid) -> RepositoryResult<bool> {
        let result = sqlx::query(
            "UPDATE crypto_wallet_signature SET status = 'expired' WHERE id = $1 AND status = 'active'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn consume_signature(
        &self,
        id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE crypto_wallet_signature
            SET status = 'used', user_id = COALESCE(user_id, $2), used_at = $3
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn expire_stale_signatures(&self, now: DateTime<Utc>) -> RepositoryResult<u64> {
        let result = sqlx::query(
            "UPDATE crypto_wallet_signature SET status = 'expired' WHERE status = 'active' AND expired_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn deactivate_signatures(
        &self,
        address: &str,
        purpose: SignaturePurpose,
    ) -> RepositoryResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE crypto_wallet_signature
            SET status = 'inactive'
            WHERE address = $1 AND purpose = $2 AND status = 'active'
            "#,
        )
        .bind(address)
        .bind(purpose.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn link_wallet(
        &self,
        signature_id: Uuid,
        user_id: Uuid,
        address: &str,
        at: DateTime<Utc>,
    ) -> RepositoryResult<LinkOutcome> {
        let mut db_tx = self.pool.begin().await?;

        let consumed = sqlx::query(
            r#"
            UPDATE crypto_wallet_signature
            SET status = 'used', user_id = COALESCE(user_id, $2), used_at = $3
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(signature_id)
        .bind(user_id)
        .bind(at)
        .execute(&mut *db_tx)
        .await?;
        if consumed.rows_affected() == 0 {
            return Ok(LinkOutcome::Replayed);
        }

        let sql = format!(
            r#"
            INSERT INTO crypto_wallet (id, user_id, address, archived, created_at, updated_at)
            VALUES ($1, $2, $3, FALSE, $4, $4)
            RETURNING {}
            "#,
            WALLET_COLUMNS
        );
        let inserted = sqlx::query_as::<_, WalletRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(address)
            .bind(at)
            .fetch_one(&mut *db_tx)
            .await;

        // Dropping the transaction rolls back the consumed signature as well.
        let wallet = match inserted {
            Ok(row) => row.into_domain(),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Ok(LinkOutcome::AddressTaken)
            }
            Err(e) => return Err(e.into()),
        };

        AuditLog::log_creation(
            &mut db_tx,
            wallet.id,
            ENTITY_CRYPTO_WALLET,
            json!({ "user_id": user_id, "address": address }),
            &user_id.to_string(),
        )
        .await?;

        db_tx.commit().await?;
        Ok(LinkOutcome::Linked(wallet))
    }

    async fn get_wallet(&self, id: Uuid) -> RepositoryResult<CryptoWallet> {
        let sql = format!("SELECT {} FROM crypto_wallet WHERE id = $1", WALLET_COLUMNS);
        sqlx::query_as::<_, WalletRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(WalletRow::into_domain)
            .ok_or_else(|| RepositoryError::NotFound(format!("wallet {}", id)))
    }

    async fn active_wallet_by_address(
        &self,
        address: &str,
    ) -> RepositoryResult<Option<CryptoWallet>> {
        let sql = format!(
            "SELECT {} FROM crypto_wallet WHERE address = $1 AND archived = FALSE",
            WALLET_COLUMNS
        );
        Ok(sqlx::query_as::<_, WalletRow>(&sql)
            .bind(address)
            .fetch_optional(&self.pool)
            .await?
            .map(WalletRow::into_domain))
    }

    async fn active_wallet_for_user(&self, user_id: Uuid) -> RepositoryResult<Option<CryptoWallet>> {
        let sql = format!(
            "SELECT {} FROM crypto_wallet WHERE user_id = $1 AND archived = FALSE",
            WALLET_COLUMNS
        );
        Ok(sqlx::query_as::<_, WalletRow>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .map(WalletRow::into_domain))
    }

    async fn archive_wallet(&self, id: Uuid, actor: &str) -> RepositoryResult<bool> {
        let mut db_tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE crypto_wallet SET archived = TRUE, updated_at = NOW() WHERE id = $1 AND archived = FALSE",
        )
        .bind(id)
        .execute(&mut *db_tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }
        AuditLog::log_field_update(
            &mut db_tx,
            id,
            ENTITY_CRYPTO_WALLET,
            "archived",
            json!(false),
            json!(true),
            actor,
        )
        .await?;
        db_tx.commit().await?;
        Ok(true)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WalletRow {
    id: Uuid,
    user_id: Uuid,
    address: String,
    archived: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WalletRow {
    fn into_domain(self) -> CryptoWallet {
        CryptoWallet {
            id: self.id,
            user_id: self.user_id,
            address: self.address,
            archived: self.archived,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SignatureRow {
    id: Uuid,
    address: String,
    user_id: Option<Uuid>,
    nonce: String,
    signed_message: String,
    purpose: String,
    status: String,
    expired_at: DateTime<Utc>,
    used_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl SignatureRow {
    fn into_domain(self) -> RepositoryResult<CryptoWalletSignature> {
        Ok(CryptoWalletSignature {
            id: self.id,
            address: self.address,
            user_id: self.user_id,
            nonce: self.nonce,
            signed_message: self.signed_message,
            purpose: self.purpose.parse()?,
            status: self.status.parse()?,
            expired_at: self.expired_at,
            used_at: self.used_at,
            created_at: self.created_at,
        })
    }
}
