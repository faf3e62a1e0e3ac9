//! Runs stored inbound messages through their subscriber.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, warn};

use super::{FailedInfo, FailedThresholdCallback, InFlight, InFlightGuard};
use crate::consumer::{panic_message, ConsumerSelector, InvokeError, SubscribeInvoker};
use crate::message::{headers, MediumMessage, MessageType, StatusName};
use crate::publisher::Publisher;
use crate::storage::{self, DataStorage};

/// Result of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    Succeeded,
    Failed,
    /// Another attempt for the same row is running; nothing was done.
    InFlight,
}

/// Select, invoke, record the outcome, publish any reply.
pub struct SubscribeExecutor {
    storage: Arc<dyn DataStorage>,
    selector: Arc<ConsumerSelector>,
    invoker: SubscribeInvoker,
    publisher: Arc<Publisher>,
    in_flight: Arc<InFlight>,
    failed_retry_count: u32,
    on_threshold: Option<FailedThresholdCallback>,
}

impl SubscribeExecutor {
    pub fn new(
        storage: Arc<dyn DataStorage>,
        selector: Arc<ConsumerSelector>,
        publisher: Arc<Publisher>,
        in_flight: Arc<InFlight>,
        failed_retry_count: u32,
    ) -> Self {
        Self {
            storage,
            selector,
            invoker: SubscribeInvoker,
            publisher,
            in_flight,
            failed_retry_count,
            on_threshold: None,
        }
    }

    pub fn with_failed_threshold_callback(mut self, callback: FailedThresholdCallback) -> Self {
        self.on_threshold = Some(callback);
        self
    }

    /// One attempt for an inbox row.
    ///
    /// Invocation failures come back as [`ExecuteOutcome::Failed`]; only a
    /// failure to record the outcome is an error.
    pub async fn execute(&self, message: &MediumMessage) -> storage::Result<ExecuteOutcome> {
        let Some(guard) = self.in_flight.try_begin(MessageType::Receive, message.id) else {
            debug!(id = message.id, "Execution already in flight, skipping");
            return Ok(ExecuteOutcome::InFlight);
        };
        self.execute_marked(message, guard).await
    }

    /// [`SubscribeExecutor::execute`] for a row whose in-flight mark the
    /// caller already holds.
    #[tracing::instrument(
        name = "dispatcher.execute",
        skip_all,
        fields(id = message.id, name = %message.name())
    )]
    pub(crate) async fn execute_marked(
        &self,
        message: &MediumMessage,
        _guard: InFlightGuard,
    ) -> storage::Result<ExecuteOutcome> {
        // A panic past the subscriber (reply building, selection) still counts
        // as one failed attempt.
        let attempt = AssertUnwindSafe(self.invoke(message))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ExecuteError::Panicked(panic_message(panic.as_ref()))));

        match attempt {
            Ok(()) => {
                self.storage
                    .change_receive_state(message.id, StatusName::Succeeded)
                    .await?;
                debug!("Message consumed");
                Ok(ExecuteOutcome::Succeeded)
            }
            Err(e) => {
                self.storage
                    .change_receive_state(message.id, StatusName::Failed)
                    .await?;
                let retries = message.retries + 1;
                warn!(error = %e, retries = retries, "Message consumption failed");

                if retries == self.failed_retry_count {
                    error!(
                        retries = retries,
                        "Message reached the retry ceiling and will not be retried"
                    );
                    if let Some(callback) = &self.on_threshold {
                        callback(FailedInfo {
                            kind: MessageType::Receive,
                            id: message.id,
                            message: message.origin.clone(),
                            retries,
                            error: e.to_string(),
                        });
                    }
                }
                Ok(ExecuteOutcome::Failed)
            }
        }
    }

    async fn invoke(&self, message: &MediumMessage) -> Result<(), ExecuteError> {
        let group = message.origin.group().unwrap_or_default();
        let descriptor = self
            .selector
            .select_by_group(group, message.name())
            .await
            .ok_or_else(|| InvokeError::NoSubscriber {
                group: group.to_string(),
                name: message.name().to_string(),
            })?;

        let reply = self.invoker.invoke(&descriptor, &message.origin).await?;

        if let (Some(reply), Some(callback)) = (reply, message.origin.callback_name()) {
            let mut reply_headers = BTreeMap::new();
            if let Some(correlation_id) = message.origin.correlation_id() {
                reply_headers.insert(
                    headers::CORRELATION_ID.to_string(),
                    correlation_id.to_string(),
                );
            }
            reply_headers.insert(
                headers::CORRELATION_SEQUENCE.to_string(),
                message
                    .origin
                    .correlation_sequence()
                    .saturating_add(1)
                    .to_string(),
            );
            self.publisher
                .publish(callback, &reply, reply_headers)
                .await
                .map_err(|e| ExecuteError::Reply(e.to_string()))?;
            debug!(callback = %callback, "Reply published");
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum ExecuteError {
    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error("Failed to publish reply: {0}")]
    Reply(String),

    #[error("Execution panicked: {0}")]
    Panicked(String),
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::config::Naming;
    use crate::consumer::{ConsumerContext, ConsumerRegistry, HandlerResult, SubscriberError};
    use crate::dispatcher::{Dispatcher, MessageSender};
    use crate::message::Message;
    use crate::processor::Pulse;
    use crate::serializer::JsonSerializer;
    use crate::storage::{InMemoryStorage, MonitoringApi};
    use crate::transport::MockTransport;
    use crate::utils::snowflake::SnowflakeId;

    #[derive(Deserialize)]
    struct Ping {
        n: u32,
    }

    async fn ok(_ctx: ConsumerContext, _p: Ping) -> HandlerResult {
        Ok(())
    }

    async fn fail(_ctx: ConsumerContext, _p: Ping) -> HandlerResult {
        Err(SubscriberError::failed("nope"))
    }

    struct Harness {
        storage: Arc<InMemoryStorage>,
        executor: SubscribeExecutor,
        in_flight: Arc<InFlight>,
        _dispatcher: Dispatcher,
    }

    fn harness(registry: ConsumerRegistry) -> Harness {
        let storage = Arc::new(InMemoryStorage::default());
        let in_flight = Arc::new(InFlight::new());
        let sender = Arc::new(MessageSender::new(
            storage.clone(),
            Arc::new(MockTransport::new()),
            Arc::new(JsonSerializer),
            50,
        ));
        let (dispatcher, queue) = Dispatcher::new(sender, in_flight.clone(), 16, 1);
        let publisher = Arc::new(Publisher::new(
            storage.clone(),
            queue,
            Arc::new(SnowflakeId::new(2)),
            Naming::default(),
            Pulse::new(),
        ));
        let executor = SubscribeExecutor::new(
            storage.clone(),
            Arc::new(ConsumerSelector::new(Arc::new(registry))),
            publisher,
            in_flight.clone(),
            50,
        );
        Harness {
            storage,
            executor,
            in_flight,
            _dispatcher: dispatcher,
        }
    }

    async fn received(storage: &InMemoryStorage, name: &str, extra: &[(&str, &str)]) -> MediumMessage {
        let mut h = BTreeMap::new();
        h.insert(headers::MESSAGE_ID.to_string(), "500".to_string());
        h.insert(headers::MESSAGE_NAME.to_string(), name.to_string());
        h.insert(headers::CORRELATION_ID.to_string(), "500".to_string());
        h.insert(headers::CORRELATION_SEQUENCE.to_string(), "0".to_string());
        for (k, v) in extra {
            h.insert(k.to_string(), v.to_string());
        }
        let message = Message::new(h, Some(json!({"n": 1})));
        storage
            .store_received_message(name, "carrier.queue.v1", &message)
            .await
            .unwrap()
    }

    fn registry(builder: crate::consumer::ConsumerRegistryBuilder) -> ConsumerRegistry {
        builder.build(&Naming::default()).unwrap()
    }

    #[tokio::test]
    async fn test_success_marks_succeeded() {
        let h = harness(registry(ConsumerRegistry::builder().subscribe("ping", ok)));
        let row = received(&h.storage, "ping", &[]).await;

        assert_eq!(h.executor.execute(&row).await.unwrap(), ExecuteOutcome::Succeeded);
        let row = h
            .storage
            .get_message(MessageType::Receive, row.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, StatusName::Succeeded);
        assert!(h.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_failure_marks_failed() {
        let h = harness(registry(ConsumerRegistry::builder().subscribe("ping", fail)));
        let row = received(&h.storage, "ping", &[]).await;

        assert_eq!(h.executor.execute(&row).await.unwrap(), ExecuteOutcome::Failed);
        let row = h
            .storage
            .get_message(MessageType::Receive, row.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, StatusName::Failed);
        assert_eq!(row.retries, 1);
    }

    #[tokio::test]
    async fn test_unregistered_topic_fails() {
        let h = harness(registry(ConsumerRegistry::builder().subscribe("ping", ok)));
        let row = received(&h.storage, "pong", &[]).await;
        assert_eq!(h.executor.execute(&row).await.unwrap(), ExecuteOutcome::Failed);
    }

    #[tokio::test]
    async fn test_in_flight_row_skipped() {
        let h = harness(registry(ConsumerRegistry::builder().subscribe("ping", ok)));
        let row = received(&h.storage, "ping", &[]).await;

        let _held = h.in_flight.try_begin(MessageType::Receive, row.id).unwrap();
        assert_eq!(h.executor.execute(&row).await.unwrap(), ExecuteOutcome::InFlight);
        let row = h
            .storage
            .get_message(MessageType::Receive, row.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, StatusName::Scheduled);
    }

    #[tokio::test]
    async fn test_reply_published_to_callback() {
        let h = harness(registry(ConsumerRegistry::builder().subscribe_with_reply(
            "ping",
            None,
            |_ctx, p: Ping| async move { Ok(json!({"pong": p.n})) },
        )));
        let row = received(&h.storage, "ping", &[(headers::CALLBACK_NAME, "pong")]).await;

        assert_eq!(h.executor.execute(&row).await.unwrap(), ExecuteOutcome::Succeeded);

        let replies = h
            .storage
            .get_messages_by_status(MessageType::Publish, StatusName::Scheduled, 10)
            .await
            .unwrap();
        assert_eq!(replies.len(), 1);
        let reply = &replies[0].origin;
        assert_eq!(reply.name(), "pong");
        assert_eq!(reply.correlation_id(), Some("500"));
        assert_eq!(reply.correlation_sequence(), 1);
        assert_eq!(reply.body, Some(json!({"pong": 1})));
    }

    #[tokio::test]
    async fn test_reply_sequence_saturates_at_max() {
        let h = harness(registry(ConsumerRegistry::builder().subscribe_with_reply(
            "ping",
            None,
            |_ctx, p: Ping| async move { Ok(json!({"pong": p.n})) },
        )));
        let max = u32::MAX.to_string();
        let row = received(
            &h.storage,
            "ping",
            &[
                (headers::CALLBACK_NAME, "pong"),
                (headers::CORRELATION_SEQUENCE, max.as_str()),
            ],
        )
        .await;

        assert_eq!(h.executor.execute(&row).await.unwrap(), ExecuteOutcome::Succeeded);
        let replies = h
            .storage
            .get_messages_by_status(MessageType::Publish, StatusName::Scheduled, 10)
            .await
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].origin.correlation_sequence(), u32::MAX);
        assert!(h.in_flight.is_empty());
    }

    /// Delegates to the in-memory store but panics on every outbox insert,
    /// so a reply publish panics after the subscriber returned.
    struct PanicOnReply(InMemoryStorage);

    #[async_trait::async_trait]
    impl MonitoringApi for PanicOnReply {
        async fn get_message(
            &self,
            kind: MessageType,
            id: i64,
        ) -> storage::Result<Option<MediumMessage>> {
            self.0.get_message(kind, id).await
        }

        async fn get_messages_by_status(
            &self,
            kind: MessageType,
            status: StatusName,
            limit: u32,
        ) -> storage::Result<Vec<MediumMessage>> {
            self.0.get_messages_by_status(kind, status, limit).await
        }

        async fn statistics(&self) -> storage::Result<storage::Statistics> {
            self.0.statistics().await
        }
    }

    #[async_trait::async_trait]
    impl DataStorage for PanicOnReply {
        fn options(&self) -> &storage::StorageOptions {
            self.0.options()
        }

        async fn begin_transaction(&self) -> storage::Result<Box<dyn storage::StorageTransaction>> {
            self.0.begin_transaction().await
        }

        async fn store_message(
            &self,
            _name: &str,
            _message: &Message,
            _txn: Option<&mut dyn storage::StorageTransaction>,
        ) -> storage::Result<MediumMessage> {
            panic!("outbox insert exploded")
        }

        async fn store_received_message(
            &self,
            name: &str,
            group: &str,
            message: &Message,
        ) -> storage::Result<MediumMessage> {
            self.0.store_received_message(name, group, message).await
        }

        async fn change_publish_state(&self, id: i64, status: StatusName) -> storage::Result<bool> {
            self.0.change_publish_state(id, status).await
        }

        async fn change_receive_state(&self, id: i64, status: StatusName) -> storage::Result<bool> {
            self.0.change_receive_state(id, status).await
        }

        async fn get_messages_needing_retry(
            &self,
            kind: MessageType,
        ) -> storage::Result<Vec<MediumMessage>> {
            self.0.get_messages_needing_retry(kind).await
        }

        async fn delete_expired(
            &self,
            kind: MessageType,
            cutoff: chrono::DateTime<chrono::Utc>,
            batch_size: u32,
        ) -> storage::Result<u64> {
            self.0.delete_expired(kind, cutoff, batch_size).await
        }
    }

    #[tokio::test]
    async fn test_panic_after_subscriber_records_failure() {
        let storage = Arc::new(PanicOnReply(InMemoryStorage::default()));
        let in_flight = Arc::new(InFlight::new());
        let sender = Arc::new(MessageSender::new(
            storage.clone(),
            Arc::new(MockTransport::new()),
            Arc::new(JsonSerializer),
            50,
        ));
        let (_dispatcher, queue) = Dispatcher::new(sender, in_flight.clone(), 16, 1);
        let publisher = Arc::new(Publisher::new(
            storage.clone(),
            queue,
            Arc::new(SnowflakeId::new(2)),
            Naming::default(),
            Pulse::new(),
        ));
        let executor = SubscribeExecutor::new(
            storage.clone(),
            Arc::new(ConsumerSelector::new(Arc::new(registry(
                ConsumerRegistry::builder().subscribe_with_reply(
                    "ping",
                    None,
                    |_ctx, p: Ping| async move { Ok(json!({"pong": p.n})) },
                ),
            )))),
            publisher,
            in_flight.clone(),
            50,
        );
        let row = received(&storage.0, "ping", &[(headers::CALLBACK_NAME, "pong")]).await;

        assert_eq!(executor.execute(&row).await.unwrap(), ExecuteOutcome::Failed);
        let row = storage
            .get_message(MessageType::Receive, row.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, StatusName::Failed);
        assert_eq!(row.retries, 1);
        assert!(in_flight.is_empty());
    }
}
