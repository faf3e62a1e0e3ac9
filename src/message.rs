//! Message envelope and delivery bookkeeping.
//!
//! A [`Message`] is what a publisher produces: a header map plus an opaque
//! JSON body. A [`MediumMessage`] is the store's row for a message, carrying
//! the serialized `content` that retries rehydrate from, plus status, retry
//! count and expiry.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved header keys.
pub mod headers {
    /// Unique id of the message, generated per publish.
    pub const MESSAGE_ID: &str = "MessageId";
    /// Conversation id; defaults to the message id of the first message.
    pub const CORRELATION_ID: &str = "CorrelationId";
    /// Position of the message within its conversation.
    pub const CORRELATION_SEQUENCE: &str = "CorrelationSequence";
    /// Routing key / topic.
    pub const MESSAGE_NAME: &str = "MessageName";
    /// Payload type tag.
    pub const TYPE: &str = "Type";
    /// RFC 3339 publish time.
    pub const SENT_TIME: &str = "SentTime";
    /// Consumer group (inbound only).
    pub const GROUP: &str = "Group";
    /// Topic a subscriber reply is published to.
    pub const CALLBACK_NAME: &str = "CallbackName";

    /// Headers the publisher always generates, ignoring caller-supplied values.
    pub const GENERATED: [&str; 3] = [MESSAGE_ID, MESSAGE_NAME, SENT_TIME];
}

/// A message exchanged between publisher, store, transport and subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "Headers")]
    pub headers: BTreeMap<String, String>,
    #[serde(rename = "Value")]
    pub body: Option<serde_json::Value>,
}

impl Message {
    pub fn new(headers: BTreeMap<String, String>, body: Option<serde_json::Value>) -> Self {
        Self { headers, body }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// The `MessageId` header, or an empty string if missing.
    pub fn id(&self) -> &str {
        self.header(headers::MESSAGE_ID).unwrap_or_default()
    }

    /// The `MessageName` header, or an empty string if missing.
    pub fn name(&self) -> &str {
        self.header(headers::MESSAGE_NAME).unwrap_or_default()
    }

    pub fn group(&self) -> Option<&str> {
        self.header(headers::GROUP)
    }

    pub fn callback_name(&self) -> Option<&str> {
        self.header(headers::CALLBACK_NAME).filter(|s| !s.is_empty())
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.header(headers::CORRELATION_ID)
    }

    /// The `CorrelationSequence` header parsed as an integer, 0 when absent or malformed.
    pub fn correlation_sequence(&self) -> u32 {
        self.header(headers::CORRELATION_SEQUENCE)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }
}

/// Which side of the pipeline a stored message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Outbox row: produced locally, sent to a broker.
    Publish,
    /// Inbox row: received from a broker, handed to a subscriber.
    Receive,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Publish => "publish",
            MessageType::Receive => "receive",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery status of a stored message.
///
/// `Processing` is a transient marker held while a send or invocation is in
/// flight. It is never written to a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusName {
    Scheduled,
    Processing,
    Succeeded,
    Failed,
}

impl StatusName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusName::Scheduled => "Scheduled",
            StatusName::Processing => "Processing",
            StatusName::Succeeded => "Succeeded",
            StatusName::Failed => "Failed",
        }
    }

    /// Whether this status may rest in a store.
    pub fn is_durable(&self) -> bool {
        !matches!(self, StatusName::Processing)
    }

    /// Whether a row in this status is picked up by the retry sweep.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StatusName::Scheduled | StatusName::Failed)
    }
}

impl fmt::Display for StatusName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown status name: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for StatusName {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Scheduled" => Ok(StatusName::Scheduled),
            "Processing" => Ok(StatusName::Processing),
            "Succeeded" => Ok(StatusName::Succeeded),
            "Failed" => Ok(StatusName::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// The store's row representation of a message.
#[derive(Debug, Clone, PartialEq)]
pub struct MediumMessage {
    /// Row id. Equals the `MessageId` header for published messages.
    pub id: i64,
    /// The message the row was built from.
    pub origin: Message,
    /// Serialized form of `origin`; what is persisted and rehydrated on retry.
    pub content: String,
    pub added: DateTime<Utc>,
    /// Set when the row reaches `Succeeded`; `None` means not eligible for deletion.
    pub expires_at: Option<DateTime<Utc>>,
    pub retries: u32,
    pub status: StatusName,
}

impl MediumMessage {
    pub fn name(&self) -> &str {
        self.origin.name()
    }
}

#[cfg(test)]
mod tests;
