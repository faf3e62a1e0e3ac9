//! Message serialization.
//!
//! Two representations leave the process: the `content` string a store
//! persists, and the [`TransportMessage`] a broker carries. Both are JSON so
//! that a retry rehydrates exactly the message that was originally stored.

use crate::message::Message;
use crate::transport::TransportMessage;

/// Result type for serializer operations.
pub type Result<T> = std::result::Result<T, SerializationError>;

/// Errors that can occur while (de)serializing messages.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport message is missing the {0} header")]
    MissingHeader(&'static str),
}

/// Converts messages to and from their stored and wire forms.
pub trait Serializer: Send + Sync {
    /// Serialize a message into the string a store persists.
    fn serialize_content(&self, message: &Message) -> Result<String>;

    /// Rehydrate a message from stored content.
    fn deserialize_content(&self, content: &str) -> Result<Message>;

    /// Build the wire envelope for a message.
    fn serialize(&self, message: &Message) -> Result<TransportMessage>;

    /// Rebuild a message from a wire envelope.
    fn deserialize(&self, transport: &TransportMessage) -> Result<Message>;
}

/// JSON serializer used by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize_content(&self, message: &Message) -> Result<String> {
        Ok(serde_json::to_string(message)?)
    }

    fn deserialize_content(&self, content: &str) -> Result<Message> {
        Ok(serde_json::from_str(content)?)
    }

    fn serialize(&self, message: &Message) -> Result<TransportMessage> {
        let body = match &message.body {
            Some(value) => serde_json::to_vec(value)?,
            None => Vec::new(),
        };
        Ok(TransportMessage::new(message.headers.clone(), body))
    }

    fn deserialize(&self, transport: &TransportMessage) -> Result<Message> {
        if transport.name().is_none() {
            return Err(SerializationError::MissingHeader(
                crate::message::headers::MESSAGE_NAME,
            ));
        }
        let body = if transport.body.is_empty() {
            None
        } else {
            Some(serde_json::from_slice(&transport.body)?)
        };
        Ok(Message::new(transport.headers.clone(), body))
    }
}
