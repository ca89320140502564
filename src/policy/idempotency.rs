//! Idempotency keys and failure classification.
//!
//! A key strategy projects a message onto the deduplication key the
//! idempotency decorator checks before invoking the handler. Failure
//! caching is opt-in by policy: the classifier decides which error
//! categories are idempotent failures (re-running would fail the same way)
//! as opposed to transient conditions that must never be cached.

use std::collections::HashSet;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{ErrorCategory, ProcessingError};
use crate::message::Message;

/// How the idempotency key is derived from a message.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "fields")]
pub enum IdempotencyKeyStrategy {
    /// The message id. Stable across retries of the same message.
    MessageId,
    /// SHA-256 over kind, type, and payload. Two distinct messages with
    /// identical content share a key.
    ContentHash,
    /// Type name plus selected payload fields (dotted paths).
    Composite(Vec<String>),
}

impl Default for IdempotencyKeyStrategy {
    fn default() -> Self {
        Self::MessageId
    }
}

impl IdempotencyKeyStrategy {
    /// Compute the key for a message.
    pub fn key_for(&self, message: &Message) -> String {
        match self {
            Self::MessageId => message.id.to_string(),
            Self::ContentHash => {
                let mut hasher = Sha256::new();
                hasher.update(message.kind.to_string().as_bytes());
                hasher.update(b"\0");
                hasher.update(message.message_type.as_bytes());
                hasher.update(b"\0");
                hasher.update(message.payload.to_string().as_bytes());
                hex::encode(hasher.finalize())
            }
            Self::Composite(paths) => {
                let mut key = message.message_type.clone();
                for path in paths {
                    key.push('|');
                    match lookup_path(&message.payload, path) {
                        Some(value) => key.push_str(&render(value)),
                        None => key.push('-'),
                    }
                }
                key
            }
        }
    }
}

fn lookup_path<'a>(payload: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = payload;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn render(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Decides which failures may be cached under an idempotency key.
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    cacheable: HashSet<ErrorCategory>,
}

impl Default for FailureClassifier {
    /// Validation and business not-found failures are deterministic; a
    /// replay fails the same way. Transient conditions, timeouts, admission
    /// rejections, and cancellations must be retried for real.
    fn default() -> Self {
        let mut cacheable = HashSet::new();
        cacheable.insert(ErrorCategory::Validation);
        cacheable.insert(ErrorCategory::NotFound);
        Self { cacheable }
    }
}

impl FailureClassifier {
    pub fn new(cacheable: impl IntoIterator<Item = ErrorCategory>) -> Self {
        Self {
            cacheable: cacheable.into_iter().collect(),
        }
    }

    /// Whether this failure may be stored and replayed.
    pub fn is_cacheable(&self, error: &ProcessingError) -> bool {
        self.cacheable.contains(&error.category())
    }
}
