//! Saga orchestration.
//!
//! This module contains:
//! - `SagaInstance`: the persisted state of one long-running workflow
//! - `SagaDefinition`: declarative per-type state machine (event bindings,
//!   transitions, compensations)
//! - `SagaEngine`: correlation, optimistic-concurrency stepping, and the
//!   compensation runner
//!
//! Saga state is a string tag, not a type hierarchy. Transitions are
//! serialized per instance by the repository's version compare-and-swap;
//! two concurrent steps from the same version never both commit.

mod definition;
mod engine;

pub use definition::{
    SagaDefinition, StepContext, StepEffects, TransitionSpec, TransitionTarget, INITIAL_STATE,
};
pub use engine::{SagaEngine, SagaEventHandler, UnmatchedEventPolicy, FAILED_STATE};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::CompensationRecord;
use crate::error::ProcessingError;

/// Result type for saga operations.
pub type Result<T> = std::result::Result<T, SagaError>;

/// Terminal state reached when compensation itself fails. Distinct from
/// success terminals so operators can tell "undone" from "undo failed".
pub const COMPENSATION_FAILED_STATE: &str = "compensation-failed";

/// Errors that can occur during saga processing.
#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error("No saga '{saga}' transition accepts '{event}' in state '{state}'")]
    UnboundEvent {
        saga: String,
        event: String,
        state: String,
    },

    #[error("Event '{0}' carries no correlation id")]
    MissingCorrelation(String),

    #[error("Saga '{saga}' instance {id} is completed")]
    Completed { saga: String, id: Uuid },

    #[error("Concurrency retries exhausted for saga '{saga}' correlation '{correlation_id}'")]
    ConcurrencyExhausted {
        saga: String,
        correlation_id: String,
    },

    #[error("Transition action failed: {0}")]
    Action(#[source] ProcessingError),

    #[error("Compensation '{name}' failed terminally: {error}")]
    CompensationFailed {
        name: String,
        #[source]
        error: ProcessingError,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
}

/// Failure raised by a transition action.
#[derive(Debug)]
pub enum SagaStepError {
    /// Step fails; the event follows the engine's dead-letter policy.
    Failed(ProcessingError),
    /// Step fails and the instance's compensation log must be unwound.
    Compensate(String),
}

/// Persisted state of one saga instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaInstance {
    pub id: Uuid,
    /// Secondary lookup key; may be non-unique during overlap.
    pub correlation_id: String,
    /// Saga type this instance belongs to.
    pub saga_name: String,
    /// Current state tag.
    pub state: String,
    /// Monotonically increasing, maintained by the repository on save.
    pub version: u64,
    /// Workflow data, copied from events by transitions.
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Completed instances accept no further events.
    pub completed: bool,
    /// Names of registered compensations, in registration order.
    pub compensations: Vec<CompensationRecord>,
    /// Outstanding timeout schedules, cancelled on the next transition.
    pub pending_timeouts: Vec<Uuid>,
}

impl SagaInstance {
    /// Fresh instance in the pre-initial state.
    pub fn new(saga_name: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            correlation_id: correlation_id.into(),
            saga_name: saga_name.into(),
            state: INITIAL_STATE.to_string(),
            version: 0,
            data: serde_json::Value::Object(serde_json::Map::new()),
            created_at: now,
            updated_at: now,
            completed: false,
            compensations: Vec::new(),
            pending_timeouts: Vec::new(),
        }
    }
}

/// Saga engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    /// Reload-step-save attempts on version conflicts.
    pub concurrency_retries: u32,
    /// Per-compensation timeout, in milliseconds.
    pub compensation_timeout_ms: u64,
    /// Attempts per compensation before the saga is marked
    /// compensation-failed.
    pub compensation_attempts: u32,
    /// What to do with events that match no instance and no initial
    /// binding.
    pub unmatched: engine::UnmatchedEventPolicy,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            concurrency_retries: 3,
            compensation_timeout_ms: 30_000,
            compensation_attempts: 3,
            unmatched: engine::UnmatchedEventPolicy::Ignore,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_instance_starts_before_initial_state() {
        let instance = SagaInstance::new("order-fulfillment", "O1");
        assert_eq!(instance.state, INITIAL_STATE);
        assert_eq!(instance.version, 0);
        assert!(!instance.completed);
        assert!(instance.compensations.is_empty());
        assert!(instance.data.is_object());
    }
}
