//! Postgres implementation of SubscriptionRepository.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::db::AuditLog;
use crate::domain::audit::{
    ENTITY_CIRCLE_PRICE, ENTITY_INVOICE, ENTITY_SUBSCRIPTION, ENTITY_SUBSCRIPTION_ITEM,
};
use crate::domain::{
    Circle, CircleCoupon, CircleInvoice, CirclePrice, CircleSubscription, CircleSubscriptionItem,
    InvoiceState, SubscriptionState,
};
use crate::ports::{RepositoryError, RepositoryResult, SubscriptionRepository};

const PRICE_COLUMNS: &str =
    "id, circle_id, amount, currency, provider, provider_price_id, state, created_at";
const SUBSCRIPTION_COLUMNS: &str =
    "id, user_id, provider, provider_subscription_id, state, trial_end_at, canceled_at, created_at";
const ITEM_COLUMNS: &str = "id, subscription_id, price_id, circle_id, user_id, provider, \
     provider_item_id, archived, canceled_at, created_at";
const INVOICE_COLUMNS: &str = "id, subscription_id, user_id, amount, discount, currency, coupon_id, \
     state, provider_invoice_id, period_start, period_end, created_at";

#[derive(Clone)]
pub struct PostgresSubscriptionRepository {
    pool: PgPool,
}

impl PostgresSubscriptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn insert_item_row(
    executor: &mut sqlx::Transaction<'_, Postgres>,
    item: &CircleSubscriptionItem,
) -> RepositoryResult<()> {
    sqlx::query(
        r#"
        INSERT INTO circle_subscription_item (
            id, subscription_id, price_id, circle_id, user_id, provider,
            provider_item_id, archived, canceled_at, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(item.id)
    .bind(item.subscription_id)
    .bind(item.price_id)
    .bind(item.circle_id)
    .bind(item.user_id)
    .bind(item.provider.as_str())
    .bind(&item.provider_item_id)
    .bind(item.archived)
    .bind(item.canceled_at)
    .bind(item.created_at)
    .execute(&mut **executor)
    .await?;

    AuditLog::log_creation(
        executor,
        item.id,
        ENTITY_SUBSCRIPTION_ITEM,
        json!({ "subscription_id": item.subscription_id, "price_id": item.price_id }),
        "system",
    )
    .await?;
    Ok(())
}

async fn archive_item_row(
    executor: &mut sqlx::Transaction<'_, Postgres>,
    item_id: Uuid,
    at: DateTime<Utc>,
) -> RepositoryResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE circle_subscription_item
        SET archived = TRUE, canceled_at = $2, updated_at = NOW()
        WHERE id = $1 AND archived = FALSE
        "#,
    )
    .bind(item_id)
    .bind(at)
    .execute(&mut **executor)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(false);
    }
    AuditLog::log_field_update(
        executor,
        item_id,
        ENTITY_SUBSCRIPTION_ITEM,
        "archived",
        json!(false),
        json!(true),
        "system",
    )
    .await?;
    Ok(true)
}

#[async_trait]
impl SubscriptionRepository for PostgresSubscriptionRepository {
    async fn get_circle(&self, id: Uuid) -> RepositoryResult<Circle> {
        let row: Option<(Uuid, Uuid, String)> =
            sqlx::query_as("SELECT id, owner_id, name FROM circle WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        let (id, owner_id, name) =
            row.ok_or_else(|| RepositoryError::NotFound(format!("circle {}", id)))?;
        Ok(Circle { id, owner_id, name })
    }

    async fn get_price(&self, id: Uuid) -> RepositoryResult<CirclePrice> {
        let sql = format!("SELECT {} FROM circle_price WHERE id = $1", PRICE_COLUMNS);
        sqlx::query_as::<_, PriceRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("circle price {}", id)))?
            .into_domain()
    }

    async fn active_price(&self, circle_id: Uuid) -> RepositoryResult<Option<CirclePrice>> {
        let sql = format!(
            "SELECT {} FROM circle_price WHERE circle_id = $1 AND state = 'active'",
            PRICE_COLUMNS
        );
        sqlx::query_as::<_, PriceRow>(&sql)
            .bind(circle_id)
            .fetch_optional(&self.pool)
            .await?
            .map(PriceRow::into_domain)
            .transpose()
    }

    async fn publish_price(&self, price: &CirclePrice) -> RepositoryResult<CirclePrice> {
        let mut db_tx = self.pool.begin().await?;

        let archived: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE circle_price
            SET state = 'archived', updated_at = NOW()
            WHERE circle_id = $1 AND state = 'active'
            RETURNING id
            "#,
        )
        .bind(price.circle_id)
        .fetch_all(&mut *db_tx)
        .await?;

        for id in archived {
            AuditLog::log_field_update(
                &mut db_tx,
                id,
                ENTITY_CIRCLE_PRICE,
                "state",
                json!("active"),
                json!("archived"),
                "system",
            )
            .await?;
        }

        let sql = format!(
            r#"
            INSERT INTO circle_price (id, circle_id, amount, currency, provider, provider_price_id, state, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'active', $7)
            RETURNING {}
            "#,
            PRICE_COLUMNS
        );
        let row = sqlx::query_as::<_, PriceRow>(&sql)
            .bind(price.id)
            .bind(price.circle_id)
            .bind(&price.amount)
            .bind(price.currency.as_str())
            .bind(price.provider.as_str())
            .bind(&price.provider_price_id)
            .bind(price.created_at)
            .fetch_one(&mut *db_tx)
            .await?;

        AuditLog::log_creation(
            &mut db_tx,
            price.id,
            ENTITY_CIRCLE_PRICE,
            json!({ "circle_id": price.circle_id, "amount": price.amount.to_string(), "currency": price.currency }),
            "system",
        )
        .await?;

        db_tx.commit().await?;
        row.into_domain()
    }

    async fn get_subscription(&self, id: Uuid) -> RepositoryResult<CircleSubscription> {
        let sql = format!("SELECT {} FROM circle_subscription WHERE id = $1", SUBSCRIPTION_COLUMNS);
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("subscription {}", id)))?
            .into_domain()
    }

    async fn open_subscription(
        &self,
        user_id: Uuid,
    ) -> RepositoryResult<Option<CircleSubscription>> {
        let sql = format!(
            "SELECT {} FROM circle_subscription WHERE user_id = $1 AND state <> 'canceled'",
            SUBSCRIPTION_COLUMNS
        );
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .map(SubscriptionRow::into_domain)
            .transpose()
    }

    async fn find_subscription_by_provider_ref(
        &self,
        provider_subscription_id: &str,
    ) -> RepositoryResult<Option<CircleSubscription>> {
        let sql = format!(
            "SELECT {} FROM circle_subscription WHERE provider_subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        );
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(provider_subscription_id)
            .fetch_optional(&self.pool)
            .await?
            .map(SubscriptionRow::into_domain)
            .transpose()
    }

    async fn insert_subscription(
        &self,
        subscription: &CircleSubscription,
        item: &CircleSubscriptionItem,
    ) -> RepositoryResult<()> {
        let mut db_tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO circle_subscription (
                id, user_id, provider, provider_subscription_id, state, trial_end_at, canceled_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.user_id)
        .bind(subscription.provider.as_str())
        .bind(&subscription.provider_subscription_id)
        .bind(subscription.state.as_str())
        .bind(subscription.trial_end_at)
        .bind(subscription.canceled_at)
        .bind(subscription.created_at)
        .execute(&mut *db_tx)
        .await?;

        AuditLog::log_creation(
            &mut db_tx,
            subscription.id,
            ENTITY_SUBSCRIPTION,
            json!({ "user_id": subscription.user_id, "state": subscription.state }),
            "system",
        )
        .await?;

        insert_item_row(&mut db_tx, item).await?;
        db_tx.commit().await?;
        Ok(())
    }

    async fn insert_item(&self, item: &CircleSubscriptionItem) -> RepositoryResult<()> {
        let mut db_tx = self.pool.begin().await?;
        insert_item_row(&mut db_tx, item).await?;
        db_tx.commit().await?;
        Ok(())
    }

    async fn active_items(
        &self,
        subscription_id: Uuid,
    ) -> RepositoryResult<Vec<CircleSubscriptionItem>> {
        let sql = format!(
            r#"
            SELECT {} FROM circle_subscription_item
            WHERE subscription_id = $1 AND archived = FALSE
            ORDER BY created_at
            "#,
            ITEM_COLUMNS
        );
        let rows = sqlx::query_as::<_, ItemRow>(&sql)
            .bind(subscription_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ItemRow::into_domain).collect()
    }

    async fn replace_item(
        &self,
        old_item_id: Uuid,
        new_item: &CircleSubscriptionItem,
        at: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let mut db_tx = self.pool.begin().await?;

        if !archive_item_row(&mut db_tx, old_item_id, at).await? {
            return Err(RepositoryError::Conflict(format!(
                "subscription item {} is already archived",
                old_item_id
            )));
        }
        insert_item_row(&mut db_tx, new_item).await?;

        db_tx.commit().await?;
        Ok(())
    }

    async fn archive_item(&self, item_id: Uuid, at: DateTime<Utc>) -> RepositoryResult<bool> {
        let mut db_tx = self.pool.begin().await?;
        let archived = archive_item_row(&mut db_tx, item_id, at).await?;
        db_tx.commit().await?;
        Ok(archived)
    }

    async fn transition_subscription(
        &self,
        id: Uuid,
        from: SubscriptionState,
        to: SubscriptionState,
    ) -> RepositoryResult<bool> {
        if !from.can_transition_to(to) {
            return Err(RepositoryError::Conflict(format!(
                "subscription cannot move from {} to {}",
                from, to
            )));
        }

        let mut db_tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE circle_subscription
            SET state = $3,
                canceled_at = CASE WHEN $3 = 'canceled' THEN NOW() ELSE canceled_at END,
                updated_at = NOW()
            WHERE id = $1 AND state = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&mut *db_tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }
        AuditLog::log_field_update(
            &mut db_tx,
            id,
            ENTITY_SUBSCRIPTION,
            "state",
            json!(from),
            json!(to),
            "system",
        )
        .await?;
        db_tx.commit().await?;
        Ok(true)
    }

    async fn cancel_subscription(&self, id: Uuid, at: DateTime<Utc>) -> RepositoryResult<bool> {
        let mut db_tx = self.pool.begin().await?;

        let previous: Option<String> =
            sqlx::query_scalar("SELECT state FROM circle_subscription WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *db_tx)
                .await?;

        let previous = match previous {
            None => return Err(RepositoryError::NotFound(format!("subscription {}", id))),
            Some(state) if state == SubscriptionState::Canceled.as_str() => return Ok(false),
            Some(state) => state,
        };

        sqlx::query(
            r#"
            UPDATE circle_subscription
            SET state = 'canceled', canceled_at = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&mut *db_tx)
        .await?;

        let items: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE circle_subscription_item
            SET archived = TRUE, canceled_at = $2, updated_at = NOW()
            WHERE subscription_id = $1 AND archived = FALSE
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(at)
        .fetch_all(&mut *db_tx)
        .await?;

        AuditLog::log_field_update(
            &mut db_tx,
            id,
            ENTITY_SUBSCRIPTION,
            "state",
            json!(previous),
            json!(SubscriptionState::Canceled),
            "system",
        )
        .await?;
        for item_id in items {
            AuditLog::log_field_update(
                &mut db_tx,
                item_id,
                ENTITY_SUBSCRIPTION_ITEM,
                "archived",
                json!(false),
                json!(true),
                "system",
            )
            .await?;
        }

        db_tx.commit().await?;
        Ok(true)
    }

    async fn trials_ending_before(
        &self,
        before: DateTime<Utc>,
    ) -> RepositoryResult<Vec<CircleSubscription>> {
        let sql = format!(
            r#"
            SELECT {} FROM circle_subscription
            WHERE state = 'trialing' AND trial_end_at IS NOT NULL AND trial_end_at <= $1
            ORDER BY trial_end_at
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(before)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(SubscriptionRow::into_domain).collect()
    }

    async fn insert_invoice(
        &self,
        invoice: &CircleInvoice,
    ) -> RepositoryResult<Option<CircleInvoice>> {
        let sql = format!(
            r#"
            INSERT INTO circle_invoice (
                id, subscription_id, user_id, amount, discount, currency, coupon_id,
                state, provider_invoice_id, period_start, period_end, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (subscription_id, period_start) DO NOTHING
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        );
        let mut db_tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, InvoiceRow>(&sql)
            .bind(invoice.id)
            .bind(invoice.subscription_id)
            .bind(invoice.user_id)
            .bind(&invoice.amount)
            .bind(&invoice.discount)
            .bind(invoice.currency.as_str())
            .bind(invoice.coupon_id)
            .bind(invoice.state.as_str())
            .bind(&invoice.provider_invoice_id)
            .bind(invoice.period_start)
            .bind(invoice.period_end)
            .bind(invoice.created_at)
            .fetch_optional(&mut *db_tx)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        AuditLog::log_creation(
            &mut db_tx,
            invoice.id,
            ENTITY_INVOICE,
            json!({ "subscription_id": invoice.subscription_id, "amount": invoice.amount.to_string() }),
            "system",
        )
        .await?;
        db_tx.commit().await?;
        row.into_domain().map(Some)
    }

    async fn get_invoice(&self, id: Uuid) -> RepositoryResult<CircleInvoice> {
        let sql = format!("SELECT {} FROM circle_invoice WHERE id = $1", INVOICE_COLUMNS);
        sqlx::query_as::<_, InvoiceRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("invoice {}", id)))?
            .into_domain()
    }

    async fn latest_invoice(
        &self,
        subscription_id: Uuid,
    ) -> RepositoryResult<Option<CircleInvoice>> {
        let sql = format!(
            r#"
            SELECT {} FROM circle_invoice
            WHERE subscription_id = $1
            ORDER BY period_start DESC
            LIMIT 1
            "#,
            INVOICE_COLUMNS
        );
        sqlx::query_as::<_, InvoiceRow>(&sql)
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await?
            .map(InvoiceRow::into_domain)
            .transpose()
    }

    async fn find_invoice_by_provider_ref(
        &self,
        provider_invoice_id: &str,
    ) -> RepositoryResult<Option<CircleInvoice>> {
        let sql = format!(
            "SELECT {} FROM circle_invoice WHERE provider_invoice_id = $1",
            INVOICE_COLUMNS
        );
        sqlx::query_as::<_, InvoiceRow>(&sql)
            .bind(provider_invoice_id)
            .fetch_optional(&self.pool)
            .await?
            .map(InvoiceRow::into_domain)
            .transpose()
    }

    async fn get_coupon(&self, id: Uuid) -> RepositoryResult<CircleCoupon> {
        let row: Option<(Uuid, Uuid, BigDecimal, Option<DateTime<Utc>>)> = sqlx::query_as(
            "SELECT id, circle_id, percent_off, valid_until FROM circle_coupon WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let (id, circle_id, percent_off, valid_until) =
            row.ok_or_else(|| RepositoryError::NotFound(format!("coupon {}", id)))?;
        Ok(CircleCoupon {
            id,
            circle_id,
            percent_off,
            valid_until,
        })
    }

    async fn apply_coupon(
        &self,
        invoice_id: Uuid,
        coupon_id: Uuid,
        discount: &BigDecimal,
        amount: &BigDecimal,
    ) -> RepositoryResult<bool> {
        let mut db_tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE circle_invoice
            SET coupon_id = $2, discount = $3, amount = $4, updated_at = NOW()
            WHERE id = $1 AND state = 'draft' AND coupon_id IS NULL
            "#,
        )
        .bind(invoice_id)
        .bind(coupon_id)
        .bind(discount)
        .bind(amount)
        .execute(&mut *db_tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }
        AuditLog::log_field_update(
            &mut db_tx,
            invoice_id,
            ENTITY_INVOICE,
            "coupon_id",
            serde_json::Value::Null,
            json!(coupon_id),
            "system",
        )
        .await?;
        db_tx.commit().await?;
        Ok(true)
    }

    async fn transition_invoice(
        &self,
        id: Uuid,
        from: InvoiceState,
        to: InvoiceState,
        provider_invoice_id: Option<&str>,
    ) -> RepositoryResult<bool> {
        let mut db_tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE circle_invoice
            SET state = $3,
                provider_invoice_id = COALESCE($4, provider_invoice_id),
                updated_at = NOW()
            WHERE id = $1 AND state = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(provider_invoice_id)
        .execute(&mut *db_tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }
        AuditLog::log_field_update(
            &mut db_tx,
            id,
            ENTITY_INVOICE,
            "state",
            json!(from),
            json!(to),
            "system",
        )
        .await?;
        db_tx.commit().await?;
        Ok(true)
    }

    async fn drafts_created_before(
        &self,
        before: DateTime<Utc>,
    ) -> RepositoryResult<Vec<CircleInvoice>> {
        let sql = format!(
            r#"
            SELECT {} FROM circle_invoice
            WHERE state = 'draft' AND created_at <= $1
            ORDER BY created_at
            "#,
            INVOICE_COLUMNS
        );
        let rows = sqlx::query_as::<_, InvoiceRow>(&sql)
            .bind(before)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(InvoiceRow::into_domain).collect()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PriceRow {
    id: Uuid,
    circle_id: Uuid,
    amount: BigDecimal,
    currency: String,
    provider: String,
    provider_price_id: String,
    state: String,
    created_at: DateTime<Utc>,
}

impl PriceRow {
    fn into_domain(self) -> RepositoryResult<CirclePrice> {
        Ok(CirclePrice {
            id: self.id,
            circle_id: self.circle_id,
            amount: self.amount,
            currency: self.currency.parse()?,
            provider: self.provider.parse()?,
            provider_price_id: self.provider_price_id,
            state: self.state.parse()?,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    provider: String,
    provider_subscription_id: String,
    state: String,
    trial_end_at: Option<DateTime<Utc>>,
    canceled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl SubscriptionRow {
    fn into_domain(self) -> RepositoryResult<CircleSubscription> {
        Ok(CircleSubscription {
            id: self.id,
            user_id: self.user_id,
            provider: self.provider.parse()?,
            provider_subscription_id: self.provider_subscription_id,
            state: self.state.parse()?,
            trial_end_at: self.trial_end_at,
            canceled_at: self.canceled_at,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ItemRow {
    id: Uuid,
    subscription_id: Uuid,
    price_id: Uuid,
    circle_id: Uuid,
    user_id: Uuid,
    provider: String,
    provider_item_id: String,
    archived: bool,
    canceled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl ItemRow {
    fn into_domain(self) -> RepositoryResult<CircleSubscriptionItem> {
        Ok(CircleSubscriptionItem {
            id: self.id,
            subscription_id: self.subscription_id,
            price_id: self.price_id,
            circle_id: self.circle_id,
            user_id: self.user_id,
            provider: self.provider.parse()?,
            provider_item_id: self.provider_item_id,
            archived: self.archived,
            canceled_at: self.canceled_at,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InvoiceRow {
    id: Uuid,
    subscription_id: Uuid,
    user_id: Uuid,
    amount: BigDecimal,
    discount: BigDecimal,
    currency: String,
    coupon_id: Option<Uuid>,
    state: String,
    provider_invoice_id: Option<String>,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl InvoiceRow {
    fn into_domain(self) -> RepositoryResult<CircleInvoice> {
        Ok(CircleInvoice {
            id: self.id,
            subscription_id: self.subscription_id,
            user_id: self.user_id,
            amount: self.amount,
            discount: self.discount,
            currency: self.currency.parse()?,
            coupon_id: self.coupon_id,
            state: self.state.parse()?,
            provider_invoice_id: self.provider_invoice_id,
            period_start: self.period_start,
            period_end: self.period_end,
            created_at: self.created_at,
        })
    }
}
