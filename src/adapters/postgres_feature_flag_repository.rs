use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::{FeatureFlag, FlagMode};
use crate::ports::{FeatureFlagRepository, RepositoryError, RepositoryResult};

#[derive(Clone)]
pub struct PostgresFeatureFlagRepository {
    pool: PgPool,
}

impl PostgresFeatureFlagRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FeatureFlagRepository for PostgresFeatureFlagRepository {
    async fn list_flags(&self) -> RepositoryResult<Vec<FeatureFlag>> {
        let rows = sqlx::query_as::<_, FlagRow>(
            "SELECT name, mode, description, updated_at FROM feature_flag ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(FlagRow::into_domain).collect()
    }

    async fn set_mode(&self, name: &str, mode: FlagMode) -> RepositoryResult<FeatureFlag> {
        sqlx::query_as::<_, FlagRow>(
            r#"
            UPDATE feature_flag SET mode = $2, updated_at = NOW()
            WHERE name = $1
            RETURNING name, mode, description, updated_at
            "#,
        )
        .bind(name)
        .bind(mode.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(format!("feature flag {}", name)))?
        .into_domain()
    }

    async fn seeding_users(&self) -> RepositoryResult<Vec<Uuid>> {
        Ok(sqlx::query_scalar("SELECT user_id FROM feature_flag_seeding_user")
            .fetch_all(&self.pool)
            .await?)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct FlagRow {
    name: String,
    mode: String,
    description: Option<String>,
    updated_at: DateTime<Utc>,
}

impl FlagRow {
    fn into_domain(self) -> RepositoryResult<FeatureFlag> {
        Ok(FeatureFlag {
            name: self.name,
            mode: self.mode.parse()?,
            description: self.description,
            updated_at: self.updated_at,
        })
    }
}
