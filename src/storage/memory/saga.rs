//! In-memory saga repository.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::saga::SagaInstance;
use crate::storage::{Result, SagaRepository, StorageError};

/// Reference saga repository with optimistic version checks.
#[derive(Default)]
pub struct InMemorySagaRepository {
    instances: RwLock<HashMap<Uuid, SagaInstance>>,
}

impl InMemorySagaRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SagaRepository for InMemorySagaRepository {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<SagaInstance>> {
        Ok(self.instances.read().await.get(&id).cloned())
    }

    async fn find_by_correlation(
        &self,
        saga_name: &str,
        correlation_id: &str,
    ) -> Result<Vec<SagaInstance>> {
        let instances = self.instances.read().await;
        let mut matches: Vec<SagaInstance> = instances
            .values()
            .filter(|instance| {
                instance.saga_name == saga_name && instance.correlation_id == correlation_id
            })
            .cloned()
            .collect();
        matches.sort_by_key(|instance| instance.created_at);
        Ok(matches)
    }

    async fn save(&self, mut instance: SagaInstance, expected_version: u64) -> Result<u64> {
        let mut instances = self.instances.write().await;

        let stored_version = instances
            .get(&instance.id)
            .map(|stored| stored.version)
            .unwrap_or(0);
        if stored_version != expected_version {
            return Err(StorageError::VersionConflict {
                expected: expected_version,
                stored: stored_version,
            });
        }

        instance.version = expected_version + 1;
        instance.updated_at = Utc::now();
        let version = instance.version;
        instances.insert(instance.id, instance);
        Ok(version)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.instances.write().await.remove(&id).is_some())
    }
}
