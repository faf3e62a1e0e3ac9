//! Single send attempt plus its state transition.

use std::sync::Arc;

use tracing::{debug, error, warn};

use super::{FailedInfo, FailedThresholdCallback};
use crate::message::{MediumMessage, MessageType, StatusName};
use crate::serializer::Serializer;
use crate::storage::{self, DataStorage};
use crate::transport::{OperateResult, Transport, TransportError};

/// Sends stored messages and records the outcome.
pub struct MessageSender {
    storage: Arc<dyn DataStorage>,
    transport: Arc<dyn Transport>,
    serializer: Arc<dyn Serializer>,
    failed_retry_count: u32,
    on_threshold: Option<FailedThresholdCallback>,
}

impl MessageSender {
    pub fn new(
        storage: Arc<dyn DataStorage>,
        transport: Arc<dyn Transport>,
        serializer: Arc<dyn Serializer>,
        failed_retry_count: u32,
    ) -> Self {
        Self {
            storage,
            transport,
            serializer,
            failed_retry_count,
            on_threshold: None,
        }
    }

    pub fn with_failed_threshold_callback(mut self, callback: FailedThresholdCallback) -> Self {
        self.on_threshold = Some(callback);
        self
    }

    /// One attempt: send, then move the row to `Succeeded` or `Failed`.
    ///
    /// The transport outcome is returned; only failing to record it is an error.
    #[tracing::instrument(name = "dispatcher.send", skip_all, fields(id = message.id, name = %message.name()))]
    pub async fn send(&self, message: &MediumMessage) -> storage::Result<OperateResult> {
        let result = match self.serializer.serialize(&message.origin) {
            Ok(wire) => self.transport.send(&wire).await,
            Err(e) => OperateResult::Failed(TransportError::Send(format!(
                "failed to serialize message: {}",
                e
            ))),
        };

        match &result {
            OperateResult::Success => {
                self.storage
                    .change_publish_state(message.id, StatusName::Succeeded)
                    .await?;
                debug!(address = %self.transport.address(), "Message sent");
            }
            OperateResult::Failed(e) => {
                self.storage
                    .change_publish_state(message.id, StatusName::Failed)
                    .await?;
                let retries = message.retries + 1;
                warn!(error = %e, retries = retries, "Message send failed");

                if retries == self.failed_retry_count {
                    error!(
                        retries = retries,
                        "Message reached the retry ceiling and will not be retried"
                    );
                    if let Some(callback) = &self.on_threshold {
                        callback(FailedInfo {
                            kind: MessageType::Publish,
                            id: message.id,
                            message: message.origin.clone(),
                            retries,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
        Ok(result)
    }
}
