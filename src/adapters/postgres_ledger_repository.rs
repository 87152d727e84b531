//! Postgres implementation of LedgerRepository.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{PgConnection, PgPool, Postgres};
use std::collections::HashMap;
use uuid::Uuid;

use crate::db::AuditLog;
use crate::domain::audit::ENTITY_TRANSACTION;
use crate::domain::{
    Appreciation, BlockchainCurationEvent, BlockchainTransaction, Currency, DeltaRow,
    NewAppreciation, NewTransaction, ProviderKind, Target, Transaction, TransactionState,
};
use crate::ports::{
    BalanceDrift, BalanceGuard, LedgerRepository, RepositoryError, RepositoryResult,
};

const TRANSACTION_COLUMNS: &str = "id, amount, currency, purpose, state, provider, provider_tx_id, \
     sender_id, recipient_id, target_type, target_id, parent_id, discount, remark, created_at, updated_at";

const AVAILABLE_BALANCE_SQL: &str = r#"
    SELECT COALESCE(SUM(delta), 0)
    FROM transaction_delta_view
    WHERE user_id = $1
      AND currency = $2
      AND (state = 'succeeded' OR (state = 'pending' AND delta < 0))
"#;

/// Postgres-backed ledger. Every write that changes a transaction's state also appends
/// to `audit_logs` in the same database transaction.
#[derive(Clone)]
pub struct PostgresLedgerRepository {
    pool: PgPool,
}

impl PostgresLedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn insert_row(
    conn: &mut PgConnection,
    tx: &NewTransaction,
    state: TransactionState,
) -> RepositoryResult<Transaction> {
    let sql = format!(
        r#"
        INSERT INTO transaction (
            id, amount, currency, purpose, state, provider, provider_tx_id,
            sender_id, recipient_id, target_type, target_id, parent_id, discount, remark
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        RETURNING {}
        "#,
        TRANSACTION_COLUMNS
    );
    let row = sqlx::query_as::<_, TransactionRow>(&sql)
        .bind(tx.id)
        .bind(&tx.amount)
        .bind(tx.currency.as_str())
        .bind(tx.purpose.as_str())
        .bind(state.as_str())
        .bind(tx.provider.as_str())
        .bind(&tx.provider_tx_id)
        .bind(tx.sender_id)
        .bind(tx.recipient_id)
        .bind(tx.target.map(|t| t.type_name()))
        .bind(tx.target.map(|t| t.id()))
        .bind(tx.parent_id)
        .bind(&tx.discount)
        .bind(&tx.remark)
        .fetch_one(conn)
        .await?;
    row.into_domain()
}

async fn log_insert(
    executor: &mut sqlx::Transaction<'_, Postgres>,
    tx: &Transaction,
) -> RepositoryResult<()> {
    AuditLog::log_creation(
        executor,
        tx.id,
        ENTITY_TRANSACTION,
        json!({
            "amount": tx.amount.to_string(),
            "currency": tx.currency,
            "purpose": tx.purpose,
            "state": tx.state,
            "provider": tx.provider,
        }),
        "system",
    )
    .await?;
    Ok(())
}

#[async_trait]
impl LedgerRepository for PostgresLedgerRepository {
    async fn insert_transaction(
        &self,
        tx: &NewTransaction,
        state: TransactionState,
        guard: Option<BalanceGuard>,
    ) -> RepositoryResult<Transaction> {
        let mut db_tx = self.pool.begin().await?;

        if let Some(guard) = guard {
            // Serializes debits of the same user and currency until commit.
            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(format!("balance:{}:{}", guard.user_id, guard.currency))
                .execute(&mut *db_tx)
                .await?;

            let available: BigDecimal = sqlx::query_scalar(AVAILABLE_BALANCE_SQL)
                .bind(guard.user_id)
                .bind(guard.currency.as_str())
                .fetch_one(&mut *db_tx)
                .await?;

            if available < tx.amount {
                return Err(RepositoryError::InsufficientBalance {
                    available,
                    requested: tx.amount.clone(),
                });
            }
        }

        let inserted = insert_row(&mut db_tx, tx, state).await?;
        log_insert(&mut db_tx, &inserted).await?;
        db_tx.commit().await?;
        Ok(inserted)
    }

    async fn insert_split(
        &self,
        parent: &NewTransaction,
        child: Option<&NewTransaction>,
    ) -> RepositoryResult<(Transaction, Option<Transaction>)> {
        let mut db_tx = self.pool.begin().await?;

        let parent = insert_row(&mut db_tx, parent, parent.initial_state()).await?;
        log_insert(&mut db_tx, &parent).await?;

        let child = match child {
            Some(child) => {
                let child = insert_row(&mut db_tx, child, child.initial_state()).await?;
                log_insert(&mut db_tx, &child).await?;
                Some(child)
            }
            None => None,
        };

        db_tx.commit().await?;
        Ok((parent, child))
    }

    async fn get_transaction(&self, id: Uuid) -> RepositoryResult<Transaction> {
        let sql = format!("SELECT {} FROM transaction WHERE id = $1", TRANSACTION_COLUMNS);
        let row = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or_else(|| RepositoryError::NotFound(format!("transaction {}", id)))?
            .into_domain()
    }

    async fn find_by_provider_ref(
        &self,
        provider: ProviderKind,
        provider_tx_id: &str,
    ) -> RepositoryResult<Option<Transaction>> {
        let sql = format!(
            "SELECT {} FROM transaction WHERE provider = $1 AND provider_tx_id = $2",
            TRANSACTION_COLUMNS
        );
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(provider.as_str())
            .bind(provider_tx_id)
            .fetch_optional(&self.pool)
            .await?
            .map(TransactionRow::into_domain)
            .transpose()
    }

    async fn attach_provider_ref(&self, id: Uuid, provider_tx_id: &str) -> RepositoryResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transaction
            SET provider_tx_id = $2, updated_at = NOW()
            WHERE id = $1 AND state = 'pending' AND provider_tx_id IS NULL
            "#,
        )
        .bind(id)
        .bind(provider_tx_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn settle(&self, id: Uuid, state: TransactionState) -> RepositoryResult<bool> {
        let mut db_tx = self.pool.begin().await?;

        let updated: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE transaction
            SET state = $2, updated_at = NOW()
            WHERE id = $1 AND state = 'pending'
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(state.as_str())
        .fetch_optional(&mut *db_tx)
        .await?;

        if updated.is_none() {
            return Ok(false);
        }

        AuditLog::log_field_update(
            &mut db_tx,
            id,
            ENTITY_TRANSACTION,
            "state",
            json!(TransactionState::Pending),
            json!(state),
            "system",
        )
        .await?;
        db_tx.commit().await?;
        Ok(true)
    }

    async fn deltas_for(
        &self,
        user_id: Uuid,
        currency: Option<Currency>,
    ) -> RepositoryResult<Vec<DeltaRow>> {
        let rows = sqlx::query_as::<_, DeltaRowRecord>(
            r#"
            SELECT transaction_id, user_id, delta, currency, purpose, state, created_at
            FROM transaction_delta_view
            WHERE user_id = $1 AND ($2::text IS NULL OR currency = $2)
            ORDER BY created_at DESC, transaction_id
            "#,
        )
        .bind(user_id)
        .bind(currency.map(|c| c.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeltaRowRecord::into_domain).collect()
    }

    async fn balance_of(&self, user_id: Uuid, currency: Currency) -> RepositoryResult<BigDecimal> {
        let balance = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(delta), 0)
            FROM transaction_delta_view
            WHERE user_id = $1 AND currency = $2 AND state = 'succeeded'
            "#,
        )
        .bind(user_id)
        .bind(currency.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(balance)
    }

    async fn available_balance(
        &self,
        user_id: Uuid,
        currency: Currency,
    ) -> RepositoryResult<BigDecimal> {
        let balance = sqlx::query_scalar(AVAILABLE_BALANCE_SQL)
            .bind(user_id)
            .bind(currency.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(balance)
    }

    async fn refunded_total(&self, original_id: Uuid) -> RepositoryResult<BigDecimal> {
        let total = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0)
            FROM transaction
            WHERE parent_id = $1 AND purpose = 'refund' AND state IN ('pending', 'succeeded')
            "#,
        )
        .bind(original_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    async fn stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<Transaction>> {
        let sql = format!(
            r#"
            SELECT {} FROM transaction
            WHERE state = 'pending' AND created_at < $1
            ORDER BY created_at
            LIMIT $2
            "#,
            TRANSACTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(older_than)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TransactionRow::into_domain).collect()
    }

    async fn two_party_net(&self) -> RepositoryResult<HashMap<Currency, BigDecimal>> {
        let rows: Vec<(String, BigDecimal)> = sqlx::query_as(
            r#"
            SELECT v.currency, SUM(v.delta)
            FROM transaction_delta_view v
            JOIN transaction t ON t.id = v.transaction_id
            WHERE v.state = 'succeeded'
              AND t.sender_id IS NOT NULL
              AND t.recipient_id IS NOT NULL
            GROUP BY v.currency
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(currency, net)| Ok((currency.parse::<Currency>()?, net)))
            .collect()
    }

    async fn balance_drift(&self) -> RepositoryResult<Vec<BalanceDrift>> {
        sqlx::query("REFRESH MATERIALIZED VIEW CONCURRENTLY user_balance_mv")
            .execute(&self.pool)
            .await?;

        // Recomputed from the base table, independent of the view definition.
        let rows: Vec<(Uuid, String, BigDecimal, BigDecimal)> = sqlx::query_as(
            r#"
            WITH computed AS (
                SELECT user_id, currency, SUM(delta) AS balance
                FROM (
                    SELECT recipient_id AS user_id, currency, amount AS delta
                    FROM transaction
                    WHERE state = 'succeeded' AND recipient_id IS NOT NULL
                    UNION ALL
                    SELECT sender_id AS user_id, currency, -amount AS delta
                    FROM transaction
                    WHERE state = 'succeeded' AND sender_id IS NOT NULL
                ) deltas
                GROUP BY user_id, currency
            )
            SELECT COALESCE(m.user_id, c.user_id),
                   COALESCE(m.currency, c.currency),
                   COALESCE(m.balance, 0),
                   COALESCE(c.balance, 0)
            FROM user_balance_mv m
            FULL OUTER JOIN computed c
              ON m.user_id = c.user_id AND m.currency = c.currency
            WHERE COALESCE(m.balance, 0) <> COALESCE(c.balance, 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(user_id, currency, materialized, computed)| {
                Ok(BalanceDrift {
                    user_id,
                    currency: currency.parse()?,
                    materialized,
                    computed,
                })
            })
            .collect()
    }

    async fn record_chain_receipt(
        &self,
        receipt: &BlockchainTransaction,
        events: &[BlockchainCurationEvent],
    ) -> RepositoryResult<()> {
        let mut db_tx = self.pool.begin().await?;

        let receipt_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO blockchain_transaction (
                id, chain_id, tx_hash, from_address, to_address, block_number, transaction_id, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (chain_id, tx_hash) DO UPDATE
            SET transaction_id = COALESCE(blockchain_transaction.transaction_id, EXCLUDED.transaction_id)
            RETURNING id
            "#,
        )
        .bind(receipt.id)
        .bind(receipt.chain_id)
        .bind(&receipt.tx_hash)
        .bind(&receipt.from_address)
        .bind(&receipt.to_address)
        .bind(receipt.block_number)
        .bind(receipt.transaction_id)
        .bind(receipt.created_at)
        .fetch_one(&mut *db_tx)
        .await?;

        for event in events {
            sqlx::query(
                r#"
                INSERT INTO blockchain_curation_event (
                    id, blockchain_transaction_id, curator_address, creator_address,
                    creator_id, token_address, uri, amount, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (blockchain_transaction_id, curator_address, creator_address, uri) DO NOTHING
                "#,
            )
            .bind(event.id)
            .bind(receipt_id)
            .bind(&event.curator_address)
            .bind(&event.creator_address)
            .bind(event.creator_id)
            .bind(&event.token_address)
            .bind(&event.uri)
            .bind(&event.amount)
            .bind(event.created_at)
            .execute(&mut *db_tx)
            .await?;
        }

        db_tx.commit().await?;
        Ok(())
    }

    async fn insert_appreciation(&self, input: &NewAppreciation) -> RepositoryResult<Appreciation> {
        let row = sqlx::query_as::<_, AppreciationRow>(
            r#"
            INSERT INTO appreciation (uuid, sender_id, recipient_id, amount, purpose, reference_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, uuid, sender_id, recipient_id, amount, purpose, reference_id, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.sender_id)
        .bind(input.recipient_id)
        .bind(input.amount)
        .bind(input.purpose.as_str())
        .bind(input.reference_id)
        .fetch_one(&self.pool)
        .await?;
        row.into_domain()
    }

    async fn appreciations_for(
        &self,
        recipient_id: Uuid,
        limit: i64,
    ) -> RepositoryResult<Vec<Appreciation>> {
        let rows = sqlx::query_as::<_, AppreciationRow>(
            r#"
            SELECT id, uuid, sender_id, recipient_id, amount, purpose, reference_id, created_at
            FROM appreciation
            WHERE recipient_id = $1
            ORDER BY id DESC
            LIMIT $2
            "#,
        )
        .bind(recipient_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AppreciationRow::into_domain).collect()
    }
}

/// Internal row type for SQLx. Not exposed outside the adapter.
#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    amount: BigDecimal,
    currency: String,
    purpose: String,
    state: String,
    provider: String,
    provider_tx_id: Option<String>,
    sender_id: Option<Uuid>,
    recipient_id: Option<Uuid>,
    target_type: Option<String>,
    target_id: Option<Uuid>,
    parent_id: Option<Uuid>,
    discount: Option<BigDecimal>,
    remark: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TransactionRow {
    fn into_domain(self) -> RepositoryResult<Transaction> {
        Ok(Transaction {
            id: self.id,
            amount: self.amount,
            currency: self.currency.parse()?,
            purpose: self.purpose.parse()?,
            state: self.state.parse()?,
            provider: self.provider.parse()?,
            provider_tx_id: self.provider_tx_id,
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            target: Target::from_parts(self.target_type.as_deref(), self.target_id)?,
            parent_id: self.parent_id,
            discount: self.discount,
            remark: self.remark,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DeltaRowRecord {
    transaction_id: Uuid,
    user_id: Uuid,
    delta: BigDecimal,
    currency: String,
    purpose: String,
    state: String,
    created_at: DateTime<Utc>,
}

impl DeltaRowRecord {
    fn into_domain(self) -> RepositoryResult<DeltaRow> {
        Ok(DeltaRow {
            transaction_id: self.transaction_id,
            user_id: self.user_id,
            delta: self.delta,
            currency: self.currency.parse()?,
            purpose: self.purpose.parse()?,
            state: self.state.parse()?,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AppreciationRow {
    id: i64,
    uuid: Uuid,
    sender_id: Uuid,
    recipient_id: Uuid,
    amount: i32,
    purpose: String,
    reference_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl AppreciationRow {
    fn into_domain(self) -> RepositoryResult<Appreciation> {
        Ok(Appreciation {
            id: self.id,
            uuid: self.uuid,
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            amount: self.amount,
            purpose: self.purpose.parse()?,
            reference_id: self.reference_id,
            created_at: self.created_at,
        })
    }
}
