//! Transactional outbox.
//!
//! Durable dispatch is two stages decoupled by the outbox store. Enqueue
//! appends a Pending entry (in the same transaction as business writes when
//! the store supports transactions); the background relay polls eligible
//! entries, claims each with a compare-and-swap, publishes to the transport,
//! and records the outcome per entry. Delivery is at-least-once; the
//! receiving side's inbox deduplicates.

mod relay;

pub use relay::OutboxRelay;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::Message;

/// Lifecycle of an outbox entry.
///
/// Transitions only Pending -> Processing -> (Processed | Failed | Pending
/// again for retry). Processed is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    /// Awaiting dispatch (possibly deferred until `next_retry_at`).
    Pending,
    /// Claimed by a relay worker.
    Processing,
    /// Delivered to the transport. Terminal.
    Processed,
    /// Retries exhausted, copied to the dead-letter queue. Terminal.
    Failed,
}

/// A message awaiting relay to its destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub message: Message,
    /// Logical destination the relay publishes to.
    pub destination: String,
    /// Higher dispatches first among simultaneously eligible entries.
    pub priority: i32,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// A Pending entry with this in the future is deferred.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl OutboxEntry {
    /// Create a Pending entry.
    pub fn new(message: Message, destination: impl Into<String>, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            message,
            destination: destination.into(),
            priority,
            status: OutboxStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            created_at: Utc::now(),
            processed_at: None,
            last_error: None,
        }
    }

    /// Override the per-entry retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Eligible for dispatch at `now`: Pending and not deferred.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending
            && self.next_retry_at.map(|at| at <= now).unwrap_or(true)
    }
}

/// Outbox relay configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxRelayConfig {
    /// Interval between polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Entries fetched per poll.
    pub batch_size: usize,
    /// Default retry budget for entries that do not carry their own.
    pub max_retries: u32,
    /// Backoff policy for failed dispatches.
    pub retry: crate::policy::retry::RetryConfig,
}

impl Default for OutboxRelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            batch_size: 100,
            max_retries: 3,
            retry: crate::policy::retry::RetryConfig::default(),
        }
    }
}
