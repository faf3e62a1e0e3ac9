//! Broker abstraction.
//!
//! This module contains:
//! - `Transport` trait: single-attempt outbound send
//! - `ConsumerClient` trait: subscribe, listen, commit/reject for one consumer group
//! - `ConsumerClientFactory` trait: one client per group
//! - Implementations: `ChannelBroker` (in-process), `MockTransport` (tests)
//!
//! Retries are not the transport's concern: a failed send is reported as
//! [`OperateResult::Failed`] and the dispatcher records the attempt.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::message::headers;

pub mod channel;
pub mod mock;

pub use channel::{ChannelBroker, ChannelConsumerClient};
pub use mock::MockTransport;

// ============================================================================
// Errors
// ============================================================================

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur talking to a broker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Send error: {0}")]
    Send(String),

    #[error("Subscribe error: {0}")]
    Subscribe(String),

    #[error("Unknown delivery token: {0}")]
    UnknownToken(AckToken),

    #[error("Consumer channel closed")]
    Closed,
}

/// Outcome of a single send attempt.
#[derive(Debug, Clone)]
pub enum OperateResult {
    Success,
    Failed(TransportError),
}

impl OperateResult {
    pub fn is_success(&self) -> bool {
        matches!(self, OperateResult::Success)
    }
}

// ============================================================================
// Wire envelope
// ============================================================================

/// Message as carried by a broker: headers plus an opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl TransportMessage {
    pub fn new(headers: BTreeMap<String, String>, body: Vec<u8>) -> Self {
        Self { headers, body }
    }

    pub fn id(&self) -> Option<&str> {
        self.headers.get(headers::MESSAGE_ID).map(String::as_str)
    }

    /// Topic the message is routed by.
    pub fn name(&self) -> Option<&str> {
        self.headers.get(headers::MESSAGE_NAME).map(String::as_str)
    }

    pub fn group(&self) -> Option<&str> {
        self.headers.get(headers::GROUP).map(String::as_str)
    }
}

/// Opaque handle a consumer client hands out with each delivery and takes
/// back on commit or reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckToken(pub u64);

impl fmt::Display for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Outbound side of a broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message. Exactly one attempt.
    async fn send(&self, message: &TransportMessage) -> OperateResult;

    /// Human-readable broker address, for logs.
    fn address(&self) -> String;
}

/// Receives deliveries from a [`ConsumerClient`].
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Called once per delivery. The client awaits the returned future before
    /// pulling the next delivery.
    async fn on_message(&self, message: TransportMessage, token: AckToken);
}

/// Inbound side of a broker, bound to one consumer group.
#[async_trait]
pub trait ConsumerClient: Send + Sync {
    /// Bind the group to the given topics.
    async fn subscribe(&self, topics: &[String]) -> Result<()>;

    /// Drive deliveries into `handler` until `shutdown` flips to `true`.
    ///
    /// Returns `Ok(())` on shutdown and an error if the connection is lost,
    /// in which case the caller may reconnect by listening again.
    async fn listen(
        &self,
        handler: Arc<dyn DeliveryHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>;

    /// Acknowledge a delivery.
    async fn commit(&self, token: AckToken) -> Result<()>;

    /// Negatively acknowledge a delivery; the broker may redeliver it.
    async fn reject(&self, token: AckToken) -> Result<()>;
}

/// Creates consumer clients.
#[async_trait]
pub trait ConsumerClientFactory: Send + Sync {
    /// Create a client for `group` that will run at most `concurrency`
    /// handler invocations at once.
    async fn create(&self, group: &str, concurrency: usize) -> Result<Arc<dyn ConsumerClient>>;
}
