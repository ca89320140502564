//! In-memory idempotency store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::storage::{IdempotencyResponse, IdempotencyStatus, IdempotencyStore, Result};

/// Reference idempotency store backed by a map. One entry per key; expiry
/// is enforced at read time.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    entries: RwLock<HashMap<String, IdempotencyResponse>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyResponse>> {
        let now = Utc::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => return Ok(Some(entry.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: drop it so the map does not accumulate dead keys.
        self.entries.write().await.remove(key);
        Ok(None)
    }

    async fn store_success(
        &self,
        key: &str,
        payload: Option<serde_json::Value>,
        ttl: std::time::Duration,
    ) -> Result<()> {
        let now = Utc::now();
        let response = IdempotencyResponse {
            key: key.to_string(),
            status: IdempotencyStatus::Success,
            payload,
            failure_category: None,
            failure_message: None,
            stored_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500)),
        };
        self.entries.write().await.insert(key.to_string(), response);
        Ok(())
    }

    async fn store_failure(
        &self,
        key: &str,
        category: &str,
        message: &str,
        ttl: std::time::Duration,
    ) -> Result<()> {
        let now = Utc::now();
        let response = IdempotencyResponse {
            key: key.to_string(),
            status: IdempotencyStatus::Failure,
            payload: None,
            failure_category: Some(category.to_string()),
            failure_message: Some(message.to_string()),
            stored_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500)),
        };
        self.entries.write().await.insert(key.to_string(), response);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_success_round_trip() {
        let store = InMemoryIdempotencyStore::new();
        store
            .store_success("k1", Some(serde_json::json!({"ok": true})), Duration::from_secs(60))
            .await
            .unwrap();

        let response = store.get("k1").await.unwrap().unwrap();
        assert_eq!(response.status, IdempotencyStatus::Success);
        assert_eq!(response.payload, Some(serde_json::json!({"ok": true})));
        assert!(store.exists("k1").await.unwrap());
    }

    #[tokio::test]
    async fn test_failure_round_trip() {
        let store = InMemoryIdempotencyStore::new();
        store
            .store_failure("k1", "validation", "total must be positive", Duration::from_secs(60))
            .await
            .unwrap();

        let response = store.get("k1").await.unwrap().unwrap();
        assert_eq!(response.status, IdempotencyStatus::Failure);
        assert_eq!(response.failure_category.as_deref(), Some("validation"));
        assert_eq!(
            response.failure_message.as_deref(),
            Some("total must be positive")
        );
    }

    #[tokio::test]
    async fn test_expired_entry_reads_as_absent() {
        let store = InMemoryIdempotencyStore::new();
        store
            .store_success("k1", None, Duration::ZERO)
            .await
            .unwrap();

        assert!(store.get("k1").await.unwrap().is_none());
        assert!(!store.exists("k1").await.unwrap());
    }

    #[tokio::test]
    async fn test_one_entry_per_key() {
        let store = InMemoryIdempotencyStore::new();
        store
            .store_failure("k1", "validation", "first", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .store_success("k1", None, Duration::from_secs(60))
            .await
            .unwrap();

        let response = store.get("k1").await.unwrap().unwrap();
        assert_eq!(response.status, IdempotencyStatus::Success);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired() {
        let store = InMemoryIdempotencyStore::new();
        store
            .store_success("dead", None, Duration::ZERO)
            .await
            .unwrap();
        store
            .store_success("live", None, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(store.cleanup_expired().await.unwrap(), 1);
        assert!(store.exists("live").await.unwrap());
    }
}
