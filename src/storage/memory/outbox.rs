//! In-memory outbox store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::outbox::{OutboxEntry, OutboxStatus};
use crate::storage::{OutboxStore, Result, StorageError};

/// Reference outbox store backed by a map.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    entries: RwLock<HashMap<Uuid, OutboxEntry>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn add(&self, entry: OutboxEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&entry.id) {
            return Err(StorageError::AlreadyExists(format!(
                "outbox entry {}",
                entry.id
            )));
        }
        entries.insert(entry.id, entry);
        Ok(())
    }

    async fn get_pending(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let now = Utc::now();
        let entries = self.entries.read().await;

        let mut eligible: Vec<OutboxEntry> = entries
            .values()
            .filter(|entry| entry.is_eligible(now))
            .cloned()
            .collect();
        eligible.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        eligible.truncate(limit);
        Ok(eligible)
    }

    async fn mark_processing(&self, id: Uuid) -> Result<bool> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&id) {
            Some(entry) if entry.status == OutboxStatus::Pending => {
                entry.status = OutboxStatus::Processing;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StorageError::NotFound(format!("outbox entry {}", id))),
        }
    }

    async fn mark_processed(&self, id: Uuid) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("outbox entry {}", id)))?;
        entry.status = OutboxStatus::Processed;
        entry.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("outbox entry {}", id)))?;
        entry.status = OutboxStatus::Failed;
        entry.last_error = Some(error.to_string());
        Ok(())
    }

    async fn update_retry(
        &self,
        id: Uuid,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("outbox entry {}", id)))?;
        entry.status = OutboxStatus::Pending;
        entry.retry_count = retry_count;
        entry.next_retry_at = Some(next_retry_at);
        entry.last_error = Some(error.to_string());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>> {
        Ok(self.entries.read().await.get(&id).cloned())
    }

    async fn pending_count(&self) -> Result<usize> {
        let entries = self.entries.read().await;
        Ok(entries
            .values()
            .filter(|entry| {
                matches!(
                    entry.status,
                    OutboxStatus::Pending | OutboxStatus::Processing
                )
            })
            .count())
    }

    async fn get_failed(&self) -> Result<Vec<OutboxEntry>> {
        let entries = self.entries.read().await;
        let mut failed: Vec<OutboxEntry> = entries
            .values()
            .filter(|entry| entry.status == OutboxStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by_key(|entry| entry.created_at);
        Ok(failed)
    }
}
