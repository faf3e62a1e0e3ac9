//! Runs a subscriber against a stored message.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{debug, error};

use super::{ConsumerContext, ConsumerExecutorDescriptor, InvokeError};
use crate::message::Message;

/// Invokes subscribers. Errors and panics both come back as [`InvokeError`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeInvoker;

impl SubscribeInvoker {
    /// Deserialize the body into the subscriber's parameter type and run it.
    ///
    /// Returns the reply value, if the subscriber produced one.
    pub async fn invoke(
        &self,
        descriptor: &ConsumerExecutorDescriptor,
        message: &Message,
    ) -> Result<Option<serde_json::Value>, InvokeError> {
        let ctx = ConsumerContext::from_message(message, &descriptor.group);
        let handler = descriptor.handler.clone();
        let body = message.body.clone();

        let outcome = AssertUnwindSafe(async move { handler(ctx, body).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(result) => {
                debug!(
                    id = %message.id(),
                    topic = %descriptor.topic,
                    ok = result.is_ok(),
                    "Subscriber invoked"
                );
                result
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(
                    id = %message.id(),
                    topic = %descriptor.topic,
                    panic = %reason,
                    "Subscriber panicked"
                );
                Err(InvokeError::Panicked(reason))
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
