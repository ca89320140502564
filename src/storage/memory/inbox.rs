//! In-memory inbox store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::inbox::{InboxEntry, InboxStatus};
use crate::storage::{InboxStore, Result, StorageError};

/// Reference inbox store backed by a map.
#[derive(Default)]
pub struct InMemoryInboxStore {
    entries: RwLock<HashMap<Uuid, InboxEntry>>,
}

impl InMemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InboxStore for InMemoryInboxStore {
    async fn add(&self, entry: InboxEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&entry.id) {
            return Err(StorageError::AlreadyExists(format!(
                "inbox entry {}",
                entry.id
            )));
        }
        entries.insert(entry.id, entry);
        Ok(())
    }

    async fn is_duplicate(&self, dedup_key: &str, window: chrono::Duration) -> Result<bool> {
        let cutoff = Utc::now() - window;
        let entries = self.entries.read().await;
        Ok(entries.values().any(|entry| {
            entry.dedup_key == dedup_key
                && entry.status != InboxStatus::Duplicate
                && entry.received_at >= cutoff
        }))
    }

    async fn get(&self, entry_id: Uuid) -> Result<Option<InboxEntry>> {
        Ok(self.entries.read().await.get(&entry_id).cloned())
    }

    async fn mark_processed(&self, entry_id: Uuid) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&entry_id)
            .ok_or_else(|| StorageError::NotFound(format!("inbox entry {}", entry_id)))?;
        entry.status = InboxStatus::Processed;
        entry.processed_at = Some(Utc::now());
        entry.error = None;
        Ok(())
    }

    async fn mark_failed(&self, entry_id: Uuid, error: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&entry_id)
            .ok_or_else(|| StorageError::NotFound(format!("inbox entry {}", entry_id)))?;
        entry.status = InboxStatus::Failed;
        entry.error = Some(error.to_string());
        Ok(())
    }

    async fn unprocessed(&self, limit: usize) -> Result<Vec<InboxEntry>> {
        let entries = self.entries.read().await;
        let mut open: Vec<InboxEntry> = entries
            .values()
            .filter(|entry| {
                matches!(entry.status, InboxStatus::Pending | InboxStatus::Failed)
            })
            .cloned()
            .collect();
        open.sort_by_key(|entry| entry.received_at);
        open.truncate(limit);
        Ok(open)
    }

    async fn cleanup_processed_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| {
            !(entry.status == InboxStatus::Processed && entry.received_at < cutoff)
        });
        Ok(before - entries.len())
    }

    async fn purge_failed_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| {
            !(entry.status == InboxStatus::Failed && entry.received_at < cutoff)
        });
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn make_entry(dedup_key: &str) -> InboxEntry {
        let message = Message::event("orders.OrderPlaced", &serde_json::json!({})).unwrap();
        InboxEntry::new(&message, "orders", dedup_key)
    }

    #[tokio::test]
    async fn test_duplicate_detection_within_window() {
        let store = InMemoryInboxStore::new();
        store.add(make_entry("k1")).await.unwrap();

        assert!(store
            .is_duplicate("k1", chrono::Duration::hours(24))
            .await
            .unwrap());
        assert!(!store
            .is_duplicate("k2", chrono::Duration::hours(24))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_entry_outside_window_is_not_duplicate() {
        let store = InMemoryInboxStore::new();
        let mut old = make_entry("k1");
        old.received_at = Utc::now() - chrono::Duration::hours(48);
        store.add(old).await.unwrap();

        assert!(!store
            .is_duplicate("k1", chrono::Duration::hours(24))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_rows_do_not_count_as_originals() {
        let store = InMemoryInboxStore::new();
        let mut duplicate = make_entry("k1");
        duplicate.status = InboxStatus::Duplicate;
        store.add(duplicate).await.unwrap();

        assert!(!store
            .is_duplicate("k1", chrono::Duration::hours(24))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_spares_failed_entries() {
        let store = InMemoryInboxStore::new();

        let mut processed = make_entry("k1");
        processed.received_at = Utc::now() - chrono::Duration::days(30);
        let processed_id = processed.id;
        store.add(processed).await.unwrap();
        store.mark_processed(processed_id).await.unwrap();
        // mark_processed stamps processed_at but received_at stays old.

        let mut failed = make_entry("k2");
        failed.received_at = Utc::now() - chrono::Duration::days(30);
        let failed_id = failed.id;
        store.add(failed).await.unwrap();
        store.mark_failed(failed_id, "boom").await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(7);
        assert_eq!(store.cleanup_processed_before(cutoff).await.unwrap(), 1);
        assert!(store.get(processed_id).await.unwrap().is_none());
        assert!(store.get(failed_id).await.unwrap().is_some());

        assert_eq!(store.purge_failed_before(cutoff).await.unwrap(), 1);
        assert!(store.get(failed_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unprocessed_lists_pending_and_failed_oldest_first() {
        let store = InMemoryInboxStore::new();

        let mut older = make_entry("k1");
        older.received_at = Utc::now() - chrono::Duration::minutes(10);
        let older_id = older.id;
        let newer = make_entry("k2");
        let newer_id = newer.id;
        store.add(newer).await.unwrap();
        store.add(older).await.unwrap();
        store.mark_failed(older_id, "boom").await.unwrap();

        let open = store.unprocessed(10).await.unwrap();
        let ids: Vec<Uuid> = open.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![older_id, newer_id]);
    }
}
