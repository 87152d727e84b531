//! Postgres implementation of AccountRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::AuditLog;
use crate::domain::audit::ENTITY_CUSTOMER;
use crate::domain::{Currency, Customer, PayoutAccount, ProviderKind, UserAccount};
use crate::ports::{AccountRepository, RepositoryError, RepositoryResult};

const CUSTOMER_COLUMNS: &str = "id, user_id, provider, customer_ref, card_last4, archived, created_at";
const PAYOUT_COLUMNS: &str = "id, user_id, provider, account_ref, country, currency, \
     capabilities_transfers, archived, created_at";

#[derive(Clone)]
pub struct PostgresAccountRepository {
    pool: PgPool,
}

impl PostgresAccountRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountRepository for PostgresAccountRepository {
    async fn get_account(&self, user_id: Uuid) -> RepositoryResult<UserAccount> {
        sqlx::query_as::<_, AccountRow>(
            "SELECT id, password_hash IS NOT NULL AS has_password, currency, role FROM user_account WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(format!("user {}", user_id)))?
        .into_domain()
    }

    async fn set_currency(&self, user_id: Uuid, currency: Currency) -> RepositoryResult<UserAccount> {
        sqlx::query_as::<_, AccountRow>(
            r#"
            UPDATE user_account SET currency = $2
            WHERE id = $1
            RETURNING id, password_hash IS NOT NULL AS has_password, currency, role
            "#,
        )
        .bind(user_id)
        .bind(currency.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(format!("user {}", user_id)))?
        .into_domain()
    }

    async fn active_customer(
        &self,
        user_id: Uuid,
        provider: ProviderKind,
    ) -> RepositoryResult<Option<Customer>> {
        let sql = format!(
            "SELECT {} FROM customer WHERE user_id = $1 AND provider = $2 AND archived = FALSE",
            CUSTOMER_COLUMNS
        );
        sqlx::query_as::<_, CustomerRow>(&sql)
            .bind(user_id)
            .bind(provider.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(CustomerRow::into_domain)
            .transpose()
    }

    async fn insert_customer(&self, customer: &Customer) -> RepositoryResult<Customer> {
        let sql = format!(
            r#"
            INSERT INTO customer (id, user_id, provider, customer_ref, card_last4, archived, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {}
            "#,
            CUSTOMER_COLUMNS
        );
        let mut db_tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, CustomerRow>(&sql)
            .bind(customer.id)
            .bind(customer.user_id)
            .bind(customer.provider.as_str())
            .bind(&customer.customer_ref)
            .bind(&customer.card_last4)
            .bind(customer.archived)
            .bind(customer.created_at)
            .fetch_one(&mut *db_tx)
            .await?;

        AuditLog::log_creation(
            &mut db_tx,
            customer.id,
            ENTITY_CUSTOMER,
            json!({ "user_id": customer.user_id, "provider": customer.provider }),
            "system",
        )
        .await?;
        db_tx.commit().await?;
        row.into_domain()
    }

    async fn archive_customer(&self, id: Uuid) -> RepositoryResult<bool> {
        let mut db_tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE customer SET archived = TRUE, updated_at = NOW() WHERE id = $1 AND archived = FALSE",
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
            ENTITY_CUSTOMER,
            "archived",
            json!(false),
            json!(true),
            "system",
        )
        .await?;
        db_tx.commit().await?;
        Ok(true)
    }

    async fn active_payout_account(
        &self,
        user_id: Uuid,
        provider: ProviderKind,
    ) -> RepositoryResult<Option<PayoutAccount>> {
        let sql = format!(
            "SELECT {} FROM payout_account WHERE user_id = $1 AND provider = $2 AND archived = FALSE",
            PAYOUT_COLUMNS
        );
        sqlx::query_as::<_, PayoutAccountRow>(&sql)
            .bind(user_id)
            .bind(provider.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(PayoutAccountRow::into_domain)
            .transpose()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    has_password: bool,
    currency: String,
    role: String,
}

impl AccountRow {
    fn into_domain(self) -> RepositoryResult<UserAccount> {
        Ok(UserAccount {
            id: self.id,
            has_password: self.has_password,
            currency: self.currency.parse()?,
            is_admin: self.role == "admin",
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CustomerRow {
    id: Uuid,
    user_id: Uuid,
    provider: String,
    customer_ref: String,
    card_last4: Option<String>,
    archived: bool,
    created_at: DateTime<Utc>,
}

impl CustomerRow {
    fn into_domain(self) -> RepositoryResult<Customer> {
        Ok(Customer {
            id: self.id,
            user_id: self.user_id,
            provider: self.provider.parse()?,
            customer_ref: self.customer_ref,
            card_last4: self.card_last4,
            archived: self.archived,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PayoutAccountRow {
    id: Uuid,
    user_id: Uuid,
    provider: String,
    account_ref: String,
    country: Option<String>,
    currency: String,
    capabilities_transfers: bool,
    archived: bool,
    created_at: DateTime<Utc>,
}

impl PayoutAccountRow {
    fn into_domain(self) -> RepositoryResult<PayoutAccount> {
        Ok(PayoutAccount {
            id: self.id,
            user_id: self.user_id,
            provider: self.provider.parse()?,
            account_ref: self.account_ref,
            country: self.country,
            currency: self.currency.parse()?,
            capabilities_transfers: self.capabilities_transfers,
            archived: self.archived,
            created_at: self.created_at,
        })
    }
}
