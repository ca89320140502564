//! Message scheduling.
//!
//! Deferred and recurring delivery behind one interface with two
//! interchangeable strategies:
//! - `InMemoryScheduler`: one timer task per entry; lowest latency, loses
//!   all state on restart
//! - `PollingScheduler`: persists entries and polls the store; survives
//!   restarts, drift bounded by the poll interval
//!
//! Recurring messages are modeled as a scheduled message whose handler
//! re-schedules the next occurrence on success.

mod in_memory;
mod polling;

pub use in_memory::InMemoryScheduler;
pub use polling::PollingScheduler;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::Message;

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors that can occur during scheduling operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Schedule not found: {0}")]
    NotFound(Uuid),

    #[error("Schedule {id} is {status:?}, not pending")]
    NotPending { id: Uuid, status: ScheduleStatus },

    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),
}

/// Lifecycle of a scheduled message.
///
/// Cancelled and Delivered are terminal; at most one delivery attempt
/// happens at or after `deliver_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Pending,
    /// Claimed by the polling worker for dispatch.
    Processing,
    Delivered,
    Cancelled,
    Failed,
}

/// A message parked until its delivery time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub schedule_id: Uuid,
    pub message: Message,
    pub deliver_at: DateTime<Utc>,
    pub priority: i32,
    /// Destination for dispatch; the scheduler's default when unset.
    pub destination: Option<String>,
    pub status: ScheduleStatus,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Parameters for scheduling a message.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub message: Message,
    pub deliver_at: DateTime<Utc>,
    pub priority: i32,
    pub destination: Option<String>,
}

impl ScheduleRequest {
    pub fn new(message: Message, deliver_at: DateTime<Utc>) -> Self {
        Self {
            message,
            deliver_at,
            priority: 0,
            destination: None,
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub(crate) fn into_entry(self) -> ScheduledMessage {
        ScheduledMessage {
            schedule_id: Uuid::new_v4(),
            message: self.message,
            deliver_at: self.deliver_at,
            priority: self.priority,
            destination: self.destination,
            status: ScheduleStatus::Pending,
            created_at: Utc::now(),
            delivered_at: None,
            last_error: None,
        }
    }
}

/// Strategy discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerStrategy {
    #[default]
    InMemory,
    StorageBacked,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Strategy discriminator.
    pub strategy: SchedulerStrategy,
    /// Poll cadence for the storage-backed strategy, in milliseconds.
    pub poll_interval_ms: u64,
    /// Entries dispatched per poll.
    pub batch_size: usize,
    /// Destination used when a schedule does not name one.
    pub default_destination: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: SchedulerStrategy::InMemory,
            poll_interval_ms: 1_000,
            batch_size: 100,
            default_destination: "hero.scheduled".to_string(),
        }
    }
}

/// Interface for deferred message delivery.
#[async_trait]
pub trait MessageScheduler: Send + Sync {
    /// Park a message for delivery at its `deliver_at`.
    async fn schedule(&self, request: ScheduleRequest) -> Result<Uuid>;

    /// Cancel a pending schedule. Returns false when the schedule already
    /// left Pending (delivered, failed, or cancelled earlier).
    async fn cancel(&self, schedule_id: Uuid) -> Result<bool>;

    /// Look up a schedule.
    async fn get(&self, schedule_id: Uuid) -> Result<Option<ScheduledMessage>>;

    /// All schedules still pending delivery.
    async fn list_pending(&self) -> Result<Vec<ScheduledMessage>>;
}
