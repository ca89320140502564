//! In-memory message store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::message::Message;
use crate::storage::{
    MessageQuery, MessageStore, Result, SortOrder, StorageError, StoredMessage,
};

/// Reference message store backed by a map. TTL expiry is enforced at read
/// time, matching how database adapters filter on an expiry column.
#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: RwLock<HashMap<Uuid, StoredMessage>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_live(stored: &StoredMessage) -> bool {
        stored
            .expires_at
            .map(|expiry| expiry > Utc::now())
            .unwrap_or(true)
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn store(
        &self,
        collection: &str,
        message: Message,
        ttl: Option<std::time::Duration>,
    ) -> Result<()> {
        let now = Utc::now();
        let stored = StoredMessage {
            collection: collection.to_string(),
            stored_at: now,
            expires_at: ttl
                .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
                .map(|ttl| now + ttl),
            message,
        };

        let mut messages = self.messages.write().await;
        if messages.contains_key(&stored.message.id) {
            return Err(StorageError::AlreadyExists(format!(
                "message {}",
                stored.message.id
            )));
        }
        messages.insert(stored.message.id, stored);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<StoredMessage>> {
        let messages = self.messages.read().await;
        Ok(messages.get(&id).filter(|m| Self::is_live(m)).cloned())
    }

    async fn query(&self, query: MessageQuery) -> Result<Vec<StoredMessage>> {
        let messages = self.messages.read().await;
        let mut matches: Vec<StoredMessage> = messages
            .values()
            .filter(|stored| Self::is_live(stored))
            .filter(|stored| stored.collection == query.collection)
            .filter(|stored| query.from.map(|from| stored.stored_at >= from).unwrap_or(true))
            .filter(|stored| query.to.map(|to| stored.stored_at < to).unwrap_or(true))
            .filter(|stored| {
                query.metadata_equals.iter().all(|(key, value)| {
                    stored.message.metadata_value(key) == Some(value.as_str())
                })
            })
            .cloned()
            .collect();

        matches.sort_by(|a, b| match query.order {
            SortOrder::Ascending => a.stored_at.cmp(&b.stored_at),
            SortOrder::Descending => b.stored_at.cmp(&a.stored_at),
        });

        let matches: Vec<StoredMessage> = matches
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(matches)
    }

    async fn update(&self, message: Message) -> Result<()> {
        let mut messages = self.messages.write().await;
        let stored = messages
            .get_mut(&message.id)
            .ok_or_else(|| StorageError::NotFound(format!("message {}", message.id)))?;
        stored.message = message;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.messages.write().await.remove(&id).is_some())
    }

    async fn exists(&self, id: Uuid) -> Result<bool> {
        Ok(self.get(id).await?.is_some())
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let messages = self.messages.read().await;
        Ok(messages
            .values()
            .filter(|stored| stored.collection == collection && Self::is_live(stored))
            .count())
    }
}
