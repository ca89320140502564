//! Persistent store interfaces.
//!
//! This module contains one trait per store, each separately pluggable:
//! message store, outbox store, inbox store, queue store, saga repository,
//! idempotency store, and scheduled-message store. `storage::memory` holds
//! the canonical in-memory implementation of each; it is both the reference
//! for behavior and the fixture set the test suite runs against. Adapters
//! for real databases implement the same traits and delegate concurrency to
//! the underlying store (row locks, optimistic CAS).

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::inbox::InboxEntry;
use crate::message::Message;
use crate::outbox::OutboxEntry;
use crate::saga::SagaInstance;
use crate::scheduler::ScheduledMessage;

/// Shared dead-letter queue name. Messages that exhaust their retries are
/// copied here with their origin recorded in metadata.
pub const DEAD_LETTER_QUEUE: &str = "hero.dead-letter";

/// Metadata key carrying the origin destination of a dead-lettered message.
pub const DEAD_LETTER_ORIGIN: &str = "dead-letter-origin";

/// Metadata key carrying the final error of a dead-lettered message.
pub const DEAD_LETTER_ERROR: &str = "dead-letter-error";

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Version conflict: expected {expected}, stored {stored}")]
    VersionConflict { expected: u64, stored: u64 },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

// ============================================================================
// Message store
// ============================================================================

/// A message at rest in a named collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message: Message,
    pub collection: String,
    pub stored_at: DateTime<Utc>,
    /// Expired entries behave as not-present at read time.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Sort order for message queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Query over a message collection.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub collection: String,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Metadata equality predicates, all of which must match.
    pub metadata_equals: HashMap<String, String>,
    pub offset: usize,
    pub limit: Option<usize>,
    pub order: SortOrder,
}

impl MessageQuery {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Default::default()
        }
    }
}

/// General-purpose message persistence.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Store a message in a collection, optionally with a time-to-live.
    async fn store(
        &self,
        collection: &str,
        message: Message,
        ttl: Option<std::time::Duration>,
    ) -> Result<()>;

    /// Retrieve by id. Expired entries read as absent.
    async fn get(&self, id: Uuid) -> Result<Option<StoredMessage>>;

    /// Query a collection by time range and metadata predicates.
    async fn query(&self, query: MessageQuery) -> Result<Vec<StoredMessage>>;

    /// Replace a stored message.
    async fn update(&self, message: Message) -> Result<()>;

    /// Delete by id. Returns false when absent.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Whether a live (non-expired) entry exists.
    async fn exists(&self, id: Uuid) -> Result<bool>;

    /// Live entries in a collection.
    async fn count(&self, collection: &str) -> Result<usize>;
}

// ============================================================================
// Outbox store
// ============================================================================

/// Store backing the transactional outbox.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Append a Pending entry.
    async fn add(&self, entry: OutboxEntry) -> Result<()>;

    /// Eligible batch: Pending, not deferred past now, ordered by priority
    /// descending then created_at ascending.
    async fn get_pending(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// Claim an entry: compare-and-swap Pending -> Processing. Returns
    /// false when another worker won the claim or the entry moved on.
    async fn mark_processing(&self, id: Uuid) -> Result<bool>;

    /// Terminal success; sets `processed_at`.
    async fn mark_processed(&self, id: Uuid) -> Result<()>;

    /// Terminal failure; records the final error.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()>;

    /// Record a failed attempt and re-arm: back to Pending with the next
    /// retry time and error.
    async fn update_retry(
        &self,
        id: Uuid,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()>;

    /// Look up a single entry.
    async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>>;

    /// Entries not yet terminally resolved.
    async fn pending_count(&self) -> Result<usize>;

    /// Terminally failed entries.
    async fn get_failed(&self) -> Result<Vec<OutboxEntry>>;
}

// ============================================================================
// Inbox store
// ============================================================================

/// Store backing the idempotent inbox.
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Record an entry (any status).
    async fn add(&self, entry: InboxEntry) -> Result<()>;

    /// Whether a non-Duplicate entry with this key was received inside the
    /// window.
    async fn is_duplicate(&self, dedup_key: &str, window: chrono::Duration) -> Result<bool>;

    /// Look up an entry.
    async fn get(&self, entry_id: Uuid) -> Result<Option<InboxEntry>>;

    /// Mark an entry processed.
    async fn mark_processed(&self, entry_id: Uuid) -> Result<()>;

    /// Mark an entry failed with the handler error.
    async fn mark_failed(&self, entry_id: Uuid, error: &str) -> Result<()>;

    /// Pending and Failed entries, oldest first.
    async fn unprocessed(&self, limit: usize) -> Result<Vec<InboxEntry>>;

    /// Delete Processed entries received before the cutoff. Returns how
    /// many were removed. Failed entries are not touched.
    async fn cleanup_processed_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Delete Failed entries received before the cutoff.
    async fn purge_failed_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

// ============================================================================
// Queue store
// ============================================================================

/// Per-queue settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Dequeues after which a message is dead-lettered instead of served.
    pub max_dequeue_count: u32,
    /// Override of the shared dead-letter queue for this queue.
    pub dead_letter_queue: Option<String>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_dequeue_count: 5,
            dead_letter_queue: None,
        }
    }
}

/// Enqueue parameters.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: i32,
    /// Visibility delay before the message can first be dequeued.
    pub delay: Option<std::time::Duration>,
    /// Time-to-live; expired messages are dropped at read time.
    pub ttl: Option<std::time::Duration>,
}

/// A message held in a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: Uuid,
    pub message: Message,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    pub visible_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub dequeue_count: u32,
}

/// Named queues with visibility-timeout dequeue semantics.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn create_queue(&self, name: &str, options: QueueOptions) -> Result<()>;

    async fn delete_queue(&self, name: &str) -> Result<bool>;

    async fn list_queues(&self) -> Result<Vec<String>>;

    async fn queue_exists(&self, name: &str) -> Result<bool>;

    /// Append a message. Creates the queue with default options when it
    /// does not exist.
    async fn enqueue(&self, queue: &str, message: Message, options: EnqueueOptions) -> Result<Uuid>;

    /// Take the highest-priority visible message, hiding it for the
    /// visibility timeout. Increments the dequeue count; a message past the
    /// queue's max dequeue count is dead-lettered instead of served.
    async fn dequeue(
        &self,
        queue: &str,
        visibility_timeout: std::time::Duration,
    ) -> Result<Option<QueueMessage>>;

    /// Inspect the next visible message without taking it.
    async fn peek(&self, queue: &str) -> Result<Option<QueueMessage>>;

    /// Remove a dequeued message permanently.
    async fn acknowledge(&self, queue: &str, message_id: Uuid) -> Result<()>;

    /// Return a dequeued message: back onto the queue when `requeue`,
    /// otherwise to the dead-letter queue.
    async fn reject(&self, queue: &str, message_id: Uuid, requeue: bool) -> Result<()>;

    /// Live message count.
    async fn depth(&self, queue: &str) -> Result<usize>;
}

// ============================================================================
// Saga repository
// ============================================================================

/// Versioned persistence for saga instances.
#[async_trait]
pub trait SagaRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<SagaInstance>>;

    /// Instances of a saga type sharing a correlation id. More than one can
    /// exist briefly during overlap; callers take the first non-completed.
    async fn find_by_correlation(
        &self,
        saga_name: &str,
        correlation_id: &str,
    ) -> Result<Vec<SagaInstance>>;

    /// Persist under optimistic concurrency: succeeds only when the stored
    /// version equals `expected_version` (0 for a new instance), and stores
    /// the instance with version `expected_version + 1`. Returns the stored
    /// version.
    async fn save(&self, instance: SagaInstance, expected_version: u64) -> Result<u64>;

    async fn delete(&self, id: Uuid) -> Result<bool>;
}

// ============================================================================
// Idempotency store
// ============================================================================

/// Outcome cached under an idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyStatus {
    Success,
    Failure,
}

/// Cached response for one idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyResponse {
    pub key: String,
    pub status: IdempotencyStatus,
    /// Stored success payload.
    pub payload: Option<serde_json::Value>,
    /// Stable category tag of a stored failure.
    pub failure_category: Option<String>,
    pub failure_message: Option<String>,
    pub stored_at: DateTime<Utc>,
    /// Lookups after this behave as not-present.
    pub expires_at: DateTime<Utc>,
}

/// Cache of handler outcomes keyed by idempotency key. One entry per key.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Live entry for a key; expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<IdempotencyResponse>>;

    async fn store_success(
        &self,
        key: &str,
        payload: Option<serde_json::Value>,
        ttl: std::time::Duration,
    ) -> Result<()>;

    async fn store_failure(
        &self,
        key: &str,
        category: &str,
        message: &str,
        ttl: std::time::Duration,
    ) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Drop expired entries. Returns how many were removed.
    async fn cleanup_expired(&self) -> Result<usize>;
}

// ============================================================================
// Scheduled-message store
// ============================================================================

/// Store backing the storage-backed scheduler strategy.
#[async_trait]
pub trait ScheduledMessageStore: Send + Sync {
    async fn add(&self, entry: ScheduledMessage) -> Result<()>;

    /// Pending entries due at or before `as_of`, ordered by `deliver_at`
    /// ascending.
    async fn get_due(&self, as_of: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledMessage>>;

    async fn get(&self, schedule_id: Uuid) -> Result<Option<ScheduledMessage>>;

    /// Claim an entry: compare-and-swap Pending -> Processing.
    async fn mark_processing(&self, schedule_id: Uuid) -> Result<bool>;

    /// Cancel under a CAS from Pending. Returns false when the entry
    /// already left Pending.
    async fn cancel(&self, schedule_id: Uuid) -> Result<bool>;

    async fn mark_delivered(&self, schedule_id: Uuid) -> Result<()>;

    async fn mark_failed(&self, schedule_id: Uuid, error: &str) -> Result<()>;

    async fn pending_count(&self) -> Result<usize>;

    /// All pending entries, soonest first.
    async fn list_pending(&self) -> Result<Vec<ScheduledMessage>>;
}
