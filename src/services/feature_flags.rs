use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{FeatureFlag, FlagMode};
use crate::ports::{FeatureFlagRepository, RepositoryResult};

#[derive(Default)]
struct FlagCache {
    modes: HashMap<String, FlagMode>,
    seeding: HashSet<Uuid>,
}

/// Cached view of the `payment`/`payout` gates and the seeding cohort.
#[derive(Clone)]
pub struct FeatureFlagService {
    repository: Arc<dyn FeatureFlagRepository>,
    cache: Arc<RwLock<FlagCache>>,
}

impl FeatureFlagService {
    pub fn new(repository: Arc<dyn FeatureFlagRepository>) -> Self {
        Self {
            repository,
            cache: Arc::new(RwLock::new(FlagCache::default())),
        }
    }

    pub fn start(&self, refresh_interval: Duration) {
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = service.refresh_cache().await {
                    tracing::error!("Failed to refresh feature flags cache: {}", e);
                }
                tokio::time::sleep(refresh_interval).await;
            }
        });
    }

    pub async fn refresh_cache(&self) -> RepositoryResult<()> {
        let flags = self.repository.list_flags().await?;
        let seeding = self.repository.seeding_users().await?;

        let mut cache = self.cache.write().await;
        cache.modes = flags.into_iter().map(|flag| (flag.name, flag.mode)).collect();
        cache.seeding = seeding.into_iter().collect();
        tracing::info!(
            "Feature flags cache refreshed with {} flags, {} seeding users",
            cache.modes.len(),
            cache.seeding.len()
        );
        Ok(())
    }

    /// Unknown flags are closed.
    pub async fn is_allowed(&self, name: &str, user_id: Uuid, is_admin: bool) -> bool {
        let cache = self.cache.read().await;
        match cache.modes.get(name) {
            Some(FlagMode::On) => true,
            Some(FlagMode::Off) | None => false,
            Some(FlagMode::Admin) => is_admin,
            Some(FlagMode::Seeding) => is_admin || cache.seeding.contains(&user_id),
        }
    }

    pub async fn get_all(&self) -> RepositoryResult<Vec<FeatureFlag>> {
        self.repository.list_flags().await
    }

    pub async fn update(&self, name: &str, mode: FlagMode) -> RepositoryResult<FeatureFlag> {
        let flag = self.repository.set_mode(name, mode).await?;

        self.cache.write().await.modes.insert(flag.name.clone(), flag.mode);
        tracing::info!("Feature flag '{}' updated to {}", name, mode);

        Ok(flag)
    }
}
