//! Transport abstraction.
//!
//! This module contains:
//! - `Transport` trait: envelope delivery to logical destinations plus
//!   consumer registration
//! - `MessageConsumer` trait: asynchronous consumers returning an ack or a
//!   negative-ack with a requeue-or-dead-letter decision
//! - `SubscriptionHandle`: consumer control (pause, resume, stop)
//! - `ChannelTransport`: in-memory implementation on tokio channels
//!
//! Broker-backed transports (AMQP, Kafka) implement the same trait; the
//! core never depends on a concrete broker.

mod channel;

pub use channel::ChannelTransport;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::watch;

use crate::message::Message;
use crate::worker::WorkerHandle;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Destination '{0}' already has a consumer")]
    AlreadySubscribed(String),

    #[error("Transport closed")]
    Closed,
}

/// Consumer verdict for one delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Processed; remove from the destination.
    Ack,
    /// Not processed; make it deliverable again.
    Requeue,
    /// Not processable; route to the dead-letter destination.
    DeadLetter,
}

/// Asynchronous consumer attached to a destination.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    async fn on_message(&self, destination: &str, message: Arc<Message>) -> AckDecision;
}

/// Quality-of-service options for a consumer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerOptions {
    /// Messages in flight at once. 1 preserves delivery order.
    pub prefetch: usize,
    /// Acknowledge on delivery; the consumer's decision is not consulted.
    pub auto_ack: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            prefetch: 1,
            auto_ack: false,
        }
    }
}

/// Interface for envelope delivery.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a message to a logical destination. Retryable.
    async fn publish(&self, destination: &str, message: Arc<Message>) -> Result<()>;

    /// Attach a consumer to a destination. At most one consumer per
    /// destination; the pump starts immediately.
    async fn subscribe(
        &self,
        destination: &str,
        consumer: Arc<dyn MessageConsumer>,
        options: ConsumerOptions,
    ) -> Result<SubscriptionHandle>;
}

/// Control handle for a running consumer.
pub struct SubscriptionHandle {
    paused: watch::Sender<bool>,
    worker: WorkerHandle,
}

impl SubscriptionHandle {
    pub(crate) fn new(paused: watch::Sender<bool>, worker: WorkerHandle) -> Self {
        Self { paused, worker }
    }

    /// Stop delivering messages; already-buffered messages stay queued.
    pub fn pause(&self) {
        let _ = self.paused.send(true);
    }

    /// Resume delivery.
    pub fn resume(&self) {
        let _ = self.paused.send(false);
    }

    /// Two-phase stop: signal, then join within the drain timeout.
    pub async fn stop(self, drain: std::time::Duration) -> bool {
        self.worker.shutdown(drain).await
    }
}
