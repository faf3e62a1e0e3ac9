//! Inbound subscriber model.
//!
//! Subscribers are registered explicitly as typed closures
//! ([`ConsumerRegistryBuilder`]), matched to deliveries by exact topic name
//! within a group ([`ConsumerSelector`]) and invoked with their body
//! deserialized into the declared parameter type ([`SubscribeInvoker`]).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::message::Message;

mod invoker;
mod registry;
mod selector;

pub(crate) use invoker::panic_message;
pub use invoker::SubscribeInvoker;
pub use registry::{ConsumerRegistry, ConsumerRegistryBuilder};
pub use selector::ConsumerSelector;

// ============================================================================
// Errors
// ============================================================================

/// Error a subscriber handler returns to mark its invocation failed.
#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl SubscriberError {
    pub fn failed(message: impl Into<String>) -> Self {
        SubscriberError::Failed(message.into())
    }
}

/// Why an invocation did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("Failed to deserialize body into {implementation}: {source}")]
    Deserialize {
        implementation: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Subscriber failed: {0}")]
    Subscriber(#[from] SubscriberError),

    #[error("Subscriber panicked: {0}")]
    Panicked(String),

    #[error("Failed to serialize reply: {0}")]
    Reply(#[source] serde_json::Error),

    #[error("No subscriber for topic {name} in group {group}")]
    NoSubscriber { group: String, name: String },
}

/// Errors raised while building the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Duplicate subscriber for topic {topic} in group {group}")]
    DuplicateSubscriber { group: String, topic: String },

    #[error("Subscriber topic must not be empty")]
    EmptyTopic,
}

// ============================================================================
// Handler model
// ============================================================================

/// Result type handlers return.
pub type HandlerResult<R = ()> = std::result::Result<R, SubscriberError>;

/// What a handler learns about the delivery besides its body.
#[derive(Debug, Clone)]
pub struct ConsumerContext {
    pub message_id: String,
    pub name: String,
    pub group: String,
    pub correlation_id: Option<String>,
    pub correlation_sequence: u32,
    pub headers: BTreeMap<String, String>,
}

impl ConsumerContext {
    pub(crate) fn from_message(message: &Message, group: &str) -> Self {
        Self {
            message_id: message.id().to_string(),
            name: message.name().to_string(),
            group: group.to_string(),
            correlation_id: message.correlation_id().map(str::to_string),
            correlation_sequence: message.correlation_sequence(),
            headers: message.headers.clone(),
        }
    }
}

/// Type-erased handler: takes the context and raw body, returns an optional
/// reply value.
pub(crate) type ErasedHandler = Arc<
    dyn Fn(
            ConsumerContext,
            Option<serde_json::Value>,
        ) -> BoxFuture<'static, Result<Option<serde_json::Value>, InvokeError>>
        + Send
        + Sync,
>;

/// A registered subscriber.
#[derive(Clone)]
pub struct ConsumerExecutorDescriptor {
    /// Fully-qualified topic.
    pub topic: String,
    /// Fully-qualified group (`"{group}.{version}"`).
    pub group: String,
    /// Type name of the handler's parameter.
    pub implementation: &'static str,
    /// `true` when the handler produces no reply.
    pub one_way: bool,
    pub(crate) handler: ErasedHandler,
}

impl fmt::Debug for ConsumerExecutorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerExecutorDescriptor")
            .field("topic", &self.topic)
            .field("group", &self.group)
            .field("implementation", &self.implementation)
            .field("one_way", &self.one_way)
            .finish()
    }
}
