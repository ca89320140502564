//! Per-invocation processing context and cooperative cancellation.
//!
//! A `ProcessingContext` travels down the decorator chain with the message:
//! cancellation signal, optional deadline, correlation identifiers, an
//! append-only attribute bag decorators use to share data, and the
//! compensation recorder sagas append to. The context is immutable except
//! for the attribute bag and the compensation log.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::ProcessingError;
use crate::message::Message;

// ============================================================================
// Cancellation
// ============================================================================

/// Clonable cooperative cancellation signal.
///
/// Components observe the token at every suspension point and return a
/// `Cancelled` failure promptly. Built on a watch channel so waiters wake
/// without polling.
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    /// Create a token in the not-cancelled state.
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }

    /// Whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait until cancellation is signalled.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow() {
                return;
            }
            if receiver.changed().await.is_err() {
                // All senders dropped without firing; treat as never-cancelled
                // and park forever so select! arms racing this one still win.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Compensation recorder
// ============================================================================

/// A named compensation registered by a forward action.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CompensationRecord {
    /// Name of the reverse action, resolved against the saga definition.
    pub name: String,
    /// When the forward action registered it.
    pub registered_at: DateTime<Utc>,
}

/// Shared append-only log of compensations registered during processing.
#[derive(Debug, Clone, Default)]
pub struct CompensationRecorder {
    records: Arc<std::sync::Mutex<Vec<CompensationRecord>>>,
}

impl CompensationRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a named compensation.
    pub fn record(&self, name: impl Into<String>) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.push(CompensationRecord {
            name: name.into(),
            registered_at: Utc::now(),
        });
    }

    /// Snapshot of the log in registration order.
    pub fn snapshot(&self) -> Vec<CompensationRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_empty(&self) -> bool {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }
}

// ============================================================================
// Processing context
// ============================================================================

/// Context passed down the decorator chain for one invocation.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    /// Id of the message being processed.
    pub message_id: Uuid,
    /// Correlation id, if the message carries one.
    pub correlation_id: Option<String>,
    /// Causation id, if the message carries one.
    pub causation_id: Option<Uuid>,
    /// Cooperative cancellation signal.
    pub cancel: CancelToken,
    /// Optional absolute deadline for the whole invocation.
    pub deadline: Option<Instant>,
    /// Append-only attribute bag shared between decorators.
    attributes: Arc<std::sync::Mutex<HashMap<String, String>>>,
    /// Compensation log, appended to by saga forward actions.
    pub compensations: CompensationRecorder,
}

impl ProcessingContext {
    /// Build a context for a message with a fresh cancellation token and no
    /// deadline.
    pub fn for_message(message: &Message) -> Self {
        Self {
            message_id: message.id,
            correlation_id: message.correlation_id.clone(),
            causation_id: message.causation_id,
            cancel: CancelToken::new(),
            deadline: None,
            attributes: Arc::new(std::sync::Mutex::new(HashMap::new())),
            compensations: CompensationRecorder::new(),
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Set the deadline `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Set an append-only attribute. Returns false (leaving the existing
    /// value) when the key is already present.
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let mut attributes = self.attributes.lock().unwrap_or_else(|e| e.into_inner());
        match attributes.entry(key.into()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(value.into());
                true
            }
        }
    }

    /// Attribute lookup.
    pub fn attribute(&self, key: &str) -> Option<String> {
        self.attributes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Time remaining until the deadline. `None` when no deadline is set,
    /// `Some(ZERO)` when it has passed.
    pub fn remaining_time(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Observe cancellation and deadline. Call at suspension points.
    pub fn check_cancelled(&self) -> Result<(), ProcessingError> {
        if self.cancel.is_cancelled() {
            return Err(ProcessingError::Cancelled);
        }
        if let Some(remaining) = self.remaining_time() {
            if remaining.is_zero() {
                return Err(ProcessingError::Timeout(Duration::ZERO));
            }
        }
        Ok(())
    }
}
