//! Message serialization seam.
//!
//! Envelopes cross the transport boundary as bytes. The trait offers the
//! plain allocate-and-return form plus buffer-reusing variants for hot
//! paths where the caller owns the scratch buffer. `JsonSerializer` is the
//! reference implementation; MessagePack or Protobuf implementations plug
//! in behind the same trait.

use crate::error::ProcessingError;
use crate::message::Message;

/// Result type for serialization operations.
pub type Result<T> = std::result::Result<T, ProcessingError>;

/// Bytes-level codec for message envelopes.
pub trait Serializer: Send + Sync {
    /// Serialize into a fresh buffer.
    fn serialize(&self, message: &Message) -> Result<Vec<u8>>;

    /// Deserialize from bytes.
    fn deserialize(&self, bytes: &[u8]) -> Result<Message>;

    /// Serialize into the caller's buffer, appending to it.
    fn serialize_into(&self, message: &Message, buffer: &mut Vec<u8>) -> Result<()> {
        buffer.extend_from_slice(&self.serialize(message)?);
        Ok(())
    }

    /// Content-type label for transport headers (e.g. "application/json").
    fn content_type(&self) -> &'static str;
}

/// JSON codec on serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, message: &Message) -> Result<Vec<u8>> {
        serde_json::to_vec(message)
            .map_err(|e| ProcessingError::Fatal(format!("Envelope serialization failed: {}", e)))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Message> {
        serde_json::from_slice(bytes)
            .map_err(|e| ProcessingError::Validation(format!("Malformed envelope: {}", e)))
    }

    fn serialize_into(&self, message: &Message, buffer: &mut Vec<u8>) -> Result<()> {
        serde_json::to_writer(&mut *buffer, message)
            .map_err(|e| ProcessingError::Fatal(format!("Envelope serialization failed: {}", e)))
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}
