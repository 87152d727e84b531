//! Append-only audit trail. Entries are written inside the caller's transaction so a
//! state change and its audit row commit together.

use serde_json::Value;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::domain::AuditEntry;

pub struct AuditLog;

impl AuditLog {
    pub async fn append(
        executor: &mut Transaction<'_, Postgres>,
        entry: &AuditEntry,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (id, entity_id, entity_type, action, old_val, new_val, actor, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.entity_id)
        .bind(&entry.entity_type)
        .bind(&entry.action)
        .bind(&entry.old_val)
        .bind(&entry.new_val)
        .bind(&entry.actor)
        .bind(entry.timestamp)
        .execute(&mut **executor)
        .await?;
        Ok(())
    }

    pub async fn log_creation(
        executor: &mut Transaction<'_, Postgres>,
        entity_id: Uuid,
        entity_type: &str,
        new_val: Value,
        actor: &str,
    ) -> Result<(), sqlx::Error> {
        let entry = AuditEntry::new(entity_id, entity_type, "created", actor).with_new(new_val);
        Self::append(executor, &entry).await
    }

    pub async fn log_field_update(
        executor: &mut Transaction<'_, Postgres>,
        entity_id: Uuid,
        entity_type: &str,
        field: &str,
        old_val: Value,
        new_val: Value,
        actor: &str,
    ) -> Result<(), sqlx::Error> {
        let entry = AuditEntry::new(entity_id, entity_type, &format!("{}_updated", field), actor)
            .change(old_val, new_val);
        Self::append(executor, &entry).await
    }

    /// Entries for one entity, oldest first.
    pub async fn for_entity(
        pool: &sqlx::PgPool,
        entity_id: Uuid,
    ) -> Result<Vec<AuditEntry>, sqlx::Error> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, entity_id, entity_type, action, old_val, new_val, actor, timestamp
            FROM audit_logs
            WHERE entity_id = $1
            ORDER BY timestamp, id
            "#,
        )
        .bind(entity_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(AuditRow::into_domain).collect())
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: Uuid,
    entity_id: Uuid,
    entity_type: String,
    action: String,
    old_val: Option<Value>,
    new_val: Option<Value>,
    actor: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}

impl AuditRow {
    fn into_domain(self) -> AuditEntry {
        AuditEntry {
            id: self.id,
            entity_id: self.entity_id,
            entity_type: self.entity_type,
            action: self.action,
            old_val: self.old_val,
            new_val: self.new_val,
            actor: self.actor,
            timestamp: self.timestamp,
        }
    }
}
