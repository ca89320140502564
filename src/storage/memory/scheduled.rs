//! In-memory scheduled-message store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::scheduler::{ScheduleStatus, ScheduledMessage};
use crate::storage::{Result, ScheduledMessageStore, StorageError};

/// Reference scheduled-message store backed by a map.
#[derive(Default)]
pub struct InMemoryScheduledMessageStore {
    entries: RwLock<HashMap<Uuid, ScheduledMessage>>,
}

impl InMemoryScheduledMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduledMessageStore for InMemoryScheduledMessageStore {
    async fn add(&self, entry: ScheduledMessage) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&entry.schedule_id) {
            return Err(StorageError::AlreadyExists(format!(
                "schedule {}",
                entry.schedule_id
            )));
        }
        entries.insert(entry.schedule_id, entry);
        Ok(())
    }

    async fn get_due(&self, as_of: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledMessage>> {
        let entries = self.entries.read().await;
        let mut due: Vec<ScheduledMessage> = entries
            .values()
            .filter(|entry| entry.status == ScheduleStatus::Pending && entry.deliver_at <= as_of)
            .cloned()
            .collect();
        due.sort_by_key(|entry| entry.deliver_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn get(&self, schedule_id: Uuid) -> Result<Option<ScheduledMessage>> {
        Ok(self.entries.read().await.get(&schedule_id).cloned())
    }

    async fn mark_processing(&self, schedule_id: Uuid) -> Result<bool> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&schedule_id) {
            Some(entry) if entry.status == ScheduleStatus::Pending => {
                entry.status = ScheduleStatus::Processing;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StorageError::NotFound(format!("schedule {}", schedule_id))),
        }
    }

    async fn cancel(&self, schedule_id: Uuid) -> Result<bool> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&schedule_id) {
            Some(entry) if entry.status == ScheduleStatus::Pending => {
                entry.status = ScheduleStatus::Cancelled;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StorageError::NotFound(format!("schedule {}", schedule_id))),
        }
    }

    async fn mark_delivered(&self, schedule_id: Uuid) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&schedule_id)
            .ok_or_else(|| StorageError::NotFound(format!("schedule {}", schedule_id)))?;
        entry.status = ScheduleStatus::Delivered;
        entry.delivered_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_failed(&self, schedule_id: Uuid, error: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&schedule_id)
            .ok_or_else(|| StorageError::NotFound(format!("schedule {}", schedule_id)))?;
        entry.status = ScheduleStatus::Failed;
        entry.last_error = Some(error.to_string());
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize> {
        let entries = self.entries.read().await;
        Ok(entries
            .values()
            .filter(|entry| entry.status == ScheduleStatus::Pending)
            .count())
    }

    async fn list_pending(&self) -> Result<Vec<ScheduledMessage>> {
        let entries = self.entries.read().await;
        let mut pending: Vec<ScheduledMessage> = entries
            .values()
            .filter(|entry| entry.status == ScheduleStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|entry| entry.deliver_at);
        Ok(pending)
    }
}
