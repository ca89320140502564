//! In-memory queue store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::message::Message;
use crate::storage::{
    EnqueueOptions, QueueMessage, QueueOptions, QueueStore, Result, StorageError,
    DEAD_LETTER_ERROR, DEAD_LETTER_ORIGIN, DEAD_LETTER_QUEUE,
};

struct HeldMessage {
    message: QueueMessage,
    /// Hidden from consumers until this instant while a dequeue is pending
    /// acknowledgement.
    invisible_until: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct QueueState {
    options: QueueOptions,
    messages: Vec<HeldMessage>,
}

/// Reference queue store with visibility-timeout semantics.
#[derive(Default)]
pub struct InMemoryQueueStore {
    queues: RwLock<HashMap<String, QueueState>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn visible(held: &HeldMessage, now: DateTime<Utc>) -> bool {
        held.message.visible_at <= now
            && held.invisible_until.map(|until| until <= now).unwrap_or(true)
            && held
                .message
                .expires_at
                .map(|expiry| expiry > now)
                .unwrap_or(true)
    }

    fn drop_expired(state: &mut QueueState, now: DateTime<Utc>) {
        state.messages.retain(|held| {
            held.message
                .expires_at
                .map(|expiry| expiry > now)
                .unwrap_or(true)
        });
    }

    /// Index of the next visible candidate: highest priority, then oldest.
    fn next_candidate(state: &QueueState, now: DateTime<Utc>) -> Option<usize> {
        state
            .messages
            .iter()
            .enumerate()
            .filter(|(_, held)| Self::visible(held, now))
            .max_by(|(_, a), (_, b)| {
                a.message
                    .priority
                    .cmp(&b.message.priority)
                    .then(b.message.enqueued_at.cmp(&a.message.enqueued_at))
            })
            .map(|(index, _)| index)
    }

    fn dead_letter(
        queues: &mut HashMap<String, QueueState>,
        origin: &str,
        target: String,
        mut message: QueueMessage,
        error: &str,
    ) {
        message
            .message
            .metadata
            .insert(DEAD_LETTER_ORIGIN.to_string(), origin.to_string());
        message
            .message
            .metadata
            .insert(DEAD_LETTER_ERROR.to_string(), error.to_string());
        message.dequeue_count = 0;
        message.visible_at = Utc::now();
        message.expires_at = None;

        debug!(origin = %origin, target = %target, message_id = %message.id, "Message dead-lettered");
        queues.entry(target).or_default().messages.push(HeldMessage {
            message,
            invisible_until: None,
        });
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn create_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        let mut queues = self.queues.write().await;
        if queues.contains_key(name) {
            return Err(StorageError::AlreadyExists(format!("queue {}", name)));
        }
        queues.insert(
            name.to_string(),
            QueueState {
                options,
                messages: Vec::new(),
            },
        );
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<bool> {
        Ok(self.queues.write().await.remove(name).is_some())
    }

    async fn list_queues(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.queues.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn queue_exists(&self, name: &str) -> Result<bool> {
        Ok(self.queues.read().await.contains_key(name))
    }

    async fn enqueue(
        &self,
        queue: &str,
        message: Message,
        options: EnqueueOptions,
    ) -> Result<Uuid> {
        let now = Utc::now();
        let entry = QueueMessage {
            id: Uuid::new_v4(),
            message,
            priority: options.priority,
            enqueued_at: now,
            visible_at: options
                .delay
                .and_then(|delay| chrono::Duration::from_std(delay).ok())
                .map(|delay| now + delay)
                .unwrap_or(now),
            expires_at: options
                .ttl
                .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
                .map(|ttl| now + ttl),
            dequeue_count: 0,
        };
        let id = entry.id;

        let mut queues = self.queues.write().await;
        queues
            .entry(queue.to_string())
            .or_default()
            .messages
            .push(HeldMessage {
                message: entry,
                invisible_until: None,
            });
        Ok(id)
    }

    async fn dequeue(
        &self,
        queue: &str,
        visibility_timeout: std::time::Duration,
    ) -> Result<Option<QueueMessage>> {
        let now = Utc::now();
        let mut queues = self.queues.write().await;

        loop {
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| StorageError::QueueNotFound(queue.to_string()))?;
            Self::drop_expired(state, now);

            let Some(index) = Self::next_candidate(state, now) else {
                return Ok(None);
            };

            let max_dequeues = state.options.max_dequeue_count;
            if state.messages[index].message.dequeue_count >= max_dequeues {
                // Poison message: route to the dead-letter queue and look
                // for the next candidate.
                let target = state
                    .options
                    .dead_letter_queue
                    .clone()
                    .unwrap_or_else(|| DEAD_LETTER_QUEUE.to_string());
                let held = state.messages.remove(index);
                Self::dead_letter(
                    &mut queues,
                    queue,
                    target,
                    held.message,
                    "max dequeue count exceeded",
                );
                continue;
            }

            let held = &mut state.messages[index];
            held.message.dequeue_count += 1;
            held.invisible_until = Some(
                now + chrono::Duration::from_std(visibility_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            );
            return Ok(Some(held.message.clone()));
        }
    }

    async fn peek(&self, queue: &str) -> Result<Option<QueueMessage>> {
        let now = Utc::now();
        let queues = self.queues.read().await;
        let state = queues
            .get(queue)
            .ok_or_else(|| StorageError::QueueNotFound(queue.to_string()))?;
        Ok(Self::next_candidate(state, now).map(|index| state.messages[index].message.clone()))
    }

    async fn acknowledge(&self, queue: &str, message_id: Uuid) -> Result<()> {
        let mut queues = self.queues.write().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| StorageError::QueueNotFound(queue.to_string()))?;
        let before = state.messages.len();
        state.messages.retain(|held| held.message.id != message_id);
        if state.messages.len() == before {
            return Err(StorageError::NotFound(format!(
                "message {} in queue {}",
                message_id, queue
            )));
        }
        Ok(())
    }

    async fn reject(&self, queue: &str, message_id: Uuid, requeue: bool) -> Result<()> {
        let mut queues = self.queues.write().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| StorageError::QueueNotFound(queue.to_string()))?;

        let index = state
            .messages
            .iter()
            .position(|held| held.message.id == message_id)
            .ok_or_else(|| {
                StorageError::NotFound(format!("message {} in queue {}", message_id, queue))
            })?;

        if requeue {
            state.messages[index].invisible_until = None;
        } else {
            let target = state
                .options
                .dead_letter_queue
                .clone()
                .unwrap_or_else(|| DEAD_LETTER_QUEUE.to_string());
            let held = state.messages.remove(index);
            Self::dead_letter(&mut queues, queue, target, held.message, "rejected");
        }
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<usize> {
        let now = Utc::now();
        let queues = self.queues.read().await;
        let state = queues
            .get(queue)
            .ok_or_else(|| StorageError::QueueNotFound(queue.to_string()))?;
        Ok(state
            .messages
            .iter()
            .filter(|held| {
                held.message
                    .expires_at
                    .map(|expiry| expiry > now)
                    .unwrap_or(true)
            })
            .count())
    }
}
