//! Message envelope.
//!
//! Commands, queries, and events are three tagged variants over the same
//! immutable envelope: a unique id (stable across retries), a dotted type
//! name, a JSON payload, correlation/causation identifiers, and a free-form
//! metadata map. Messages have value semantics; once constructed they are
//! shared as `Arc<Message>` and never mutated.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProcessingError;

/// Discriminates the three message variants.
///
/// Commands may produce a single result, queries always produce a result,
/// events produce none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Command,
    Query,
    Event,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command => f.write_str("command"),
            Self::Query => f.write_str("query"),
            Self::Event => f.write_str("event"),
        }
    }
}

/// Immutable message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier, stable across retries of the same logical message.
    pub id: Uuid,

    /// Variant tag.
    pub kind: MessageKind,

    /// Dotted type name (e.g. "orders.OrderCreated"). Handler resolution
    /// and saga bindings key on this.
    pub message_type: String,

    /// Payload as JSON.
    pub payload: serde_json::Value,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Groups all messages in one logical conversation.
    pub correlation_id: Option<String>,

    /// Id of the message that caused this one.
    pub causation_id: Option<Uuid>,

    /// Free-form metadata headers.
    pub metadata: HashMap<String, String>,
}

impl Message {
    fn new(
        kind: MessageKind,
        message_type: impl Into<String>,
        payload: &impl Serialize,
    ) -> Result<Self, ProcessingError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| ProcessingError::Validation(format!("Unserializable payload: {}", e)))?;

        Ok(Self {
            id: Uuid::new_v4(),
            kind,
            message_type: message_type.into(),
            payload,
            created_at: Utc::now(),
            correlation_id: None,
            causation_id: None,
            metadata: HashMap::new(),
        })
    }

    /// Create a command message.
    pub fn command(
        message_type: impl Into<String>,
        payload: &impl Serialize,
    ) -> Result<Self, ProcessingError> {
        Self::new(MessageKind::Command, message_type, payload)
    }

    /// Create a query message.
    pub fn query(
        message_type: impl Into<String>,
        payload: &impl Serialize,
    ) -> Result<Self, ProcessingError> {
        Self::new(MessageKind::Query, message_type, payload)
    }

    /// Create an event message.
    pub fn event(
        message_type: impl Into<String>,
        payload: &impl Serialize,
    ) -> Result<Self, ProcessingError> {
        Self::new(MessageKind::Event, message_type, payload)
    }

    /// Set the correlation id.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the causation id.
    pub fn with_causation(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    /// Add a metadata header.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Derive a follow-up message: same correlation, causation set to the
    /// predecessor's id.
    pub fn caused_by(self, predecessor: &Message) -> Self {
        let mut message = self;
        if message.correlation_id.is_none() {
            message.correlation_id = predecessor.correlation_id.clone();
        }
        message.causation_id = Some(predecessor.id);
        message
    }

    /// Deserialize the payload into a typed value.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProcessingError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ProcessingError::Validation(format!(
                "Payload of '{}' does not match expected shape: {}",
                self.message_type, e
            ))
        })
    }

    /// Metadata lookup.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct PlaceOrder {
        order_id: String,
        total: u64,
    }

    fn make_command() -> Message {
        Message::command(
            "orders.PlaceOrder",
            &PlaceOrder {
                order_id: "O1".to_string(),
                total: 50,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_command_round_trips_payload() {
        let message = make_command();

        assert_eq!(message.kind, MessageKind::Command);
        assert_eq!(message.message_type, "orders.PlaceOrder");

        let payload: PlaceOrder = message.payload_as().unwrap();
        assert_eq!(payload.order_id, "O1");
        assert_eq!(payload.total, 50);
    }

    #[test]
    fn test_payload_shape_mismatch_is_validation_error() {
        #[derive(Deserialize, Debug)]
        #[allow(dead_code)]
        struct Other {
            quantity: u32,
        }

        let message = make_command();
        let err = message.payload_as::<Other>().unwrap_err();
        assert!(matches!(err, ProcessingError::Validation(_)));
    }

    #[test]
    fn test_caused_by_links_lineage() {
        let first = make_command().with_correlation("corr-1");
        let second = Message::event("orders.OrderPlaced", &serde_json::json!({"order_id": "O1"}))
            .unwrap()
            .caused_by(&first);

        assert_eq!(second.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(second.causation_id, Some(first.id));
        assert_ne!(second.id, first.id);
    }

    #[test]
    fn test_caused_by_keeps_explicit_correlation() {
        let first = make_command().with_correlation("corr-1");
        let second = Message::event("orders.OrderPlaced", &serde_json::json!({}))
            .unwrap()
            .with_correlation("corr-2")
            .caused_by(&first);

        assert_eq!(second.correlation_id.as_deref(), Some("corr-2"));
    }

    #[test]
    fn test_metadata_headers() {
        let message = make_command().with_metadata("tenant", "acme");
        assert_eq!(message.metadata_value("tenant"), Some("acme"));
        assert_eq!(message.metadata_value("missing"), None);
    }
}
