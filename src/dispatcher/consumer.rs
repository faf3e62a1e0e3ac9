//! Inbound side: one consumer client per group.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use futures::FutureExt;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ExecuteOutcome, GroupPermits, SubscribeExecutor};
use crate::consumer::ConsumerRegistry;
use crate::serializer::Serializer;
use crate::storage::DataStorage;
use crate::transport::{
    AckToken, ConsumerClient, ConsumerClientFactory, DeliveryHandler, Result, TransportMessage,
};

/// Starts a listener per consumer group and feeds deliveries into the inbox.
///
/// Each group runs at most `permits.capacity()` subscribers at once; the
/// retry sweep draws from the same permits.
pub struct ConsumerRegister {
    factory: Arc<dyn ConsumerClientFactory>,
    registry: Arc<ConsumerRegistry>,
    storage: Arc<dyn DataStorage>,
    serializer: Arc<dyn Serializer>,
    executor: Arc<SubscribeExecutor>,
    permits: Arc<GroupPermits>,
}

impl ConsumerRegister {
    pub fn new(
        factory: Arc<dyn ConsumerClientFactory>,
        registry: Arc<ConsumerRegistry>,
        storage: Arc<dyn DataStorage>,
        serializer: Arc<dyn Serializer>,
        executor: Arc<SubscribeExecutor>,
        permits: Arc<GroupPermits>,
    ) -> Self {
        Self {
            factory,
            registry,
            storage,
            serializer,
            executor,
            permits,
        }
    }

    /// Create, subscribe and start a client for every registered group.
    ///
    /// Fails if a client cannot be created or subscribed; connection loss
    /// after that is handled by reconnecting.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();
        let concurrency = self.permits.capacity();

        for group in self.registry.groups() {
            let topics = self.registry.topics(&group);
            let client = self.factory.create(&group, concurrency).await?;
            client.subscribe(&topics).await?;

            let permits = self.permits.for_group(&group);
            let handler = Arc::new(GroupHandler {
                group: group.clone(),
                client: client.clone(),
                storage: self.storage.clone(),
                serializer: self.serializer.clone(),
                executor: self.executor.clone(),
                permits: permits.clone(),
            });

            info!(group = %group, topics = ?topics, "Consumer group started");
            handles.push(tokio::spawn(listen_with_reconnect(
                group,
                client,
                handler,
                permits,
                concurrency,
                shutdown.clone(),
            )));
        }

        Ok(handles)
    }
}

/// Listen loop with reconnection and exponential backoff with jitter.
///
/// On shutdown it waits for running executions to give their permits back.
async fn listen_with_reconnect(
    group: String,
    client: Arc<dyn ConsumerClient>,
    handler: Arc<GroupHandler>,
    permits: Arc<Semaphore>,
    concurrency: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let backoff_builder = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .with_jitter()
        .without_max_times();
    let mut backoff = backoff_builder.build();

    loop {
        if *shutdown.borrow() {
            break;
        }

        match client.listen(handler.clone(), shutdown.clone()).await {
            Ok(()) => break,
            Err(e) => {
                let delay = backoff.next().unwrap_or(Duration::from_secs(30));
                error!(
                    group = %group,
                    error = %e,
                    backoff_ms = %delay.as_millis(),
                    "Consumer connection lost, reconnecting after backoff"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    let all = u32::try_from(concurrency).unwrap_or(u32::MAX);
    let _drained = permits.acquire_many(all).await;
    info!(group = %group, "Consumer group stopped");
}

/// Per-group delivery handler.
struct GroupHandler {
    group: String,
    client: Arc<dyn ConsumerClient>,
    storage: Arc<dyn DataStorage>,
    serializer: Arc<dyn Serializer>,
    executor: Arc<SubscribeExecutor>,
    permits: Arc<Semaphore>,
}

impl GroupHandler {
    async fn reject(&self, token: AckToken) {
        if let Err(e) = self.client.reject(token).await {
            warn!(group = %self.group, error = %e, "Failed to reject delivery");
        }
    }
}

#[async_trait]
impl DeliveryHandler for GroupHandler {
    /// Waits for a permit before returning, so a saturated group stops
    /// pulling from the broker.
    #[tracing::instrument(name = "dispatcher.consume", skip_all, fields(group = %self.group, name = ?transport.name()))]
    async fn on_message(&self, transport: TransportMessage, token: AckToken) {
        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            self.reject(token).await;
            return;
        };

        let message = match self.serializer.deserialize(&transport) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "Failed to deserialize delivery");
                self.reject(token).await;
                return;
            }
        };

        let stored = match self
            .storage
            .store_received_message(message.name(), &self.group, &message)
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                error!(error = %e, "Failed to store received message");
                self.reject(token).await;
                return;
            }
        };
        debug!(id = stored.id, "Message written to inbox");

        let client = self.client.clone();
        let executor = self.executor.clone();
        let group = self.group.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let outcome = AssertUnwindSafe(executor.execute(&stored))
                .catch_unwind()
                .await;

            let ack = match outcome {
                Ok(Ok(ExecuteOutcome::Succeeded)) => client.commit(token).await,
                Ok(Ok(outcome)) => {
                    debug!(id = stored.id, outcome = ?outcome, "Rejecting delivery");
                    client.reject(token).await
                }
                Ok(Err(e)) => {
                    error!(id = stored.id, error = %e, "Failed to record consume outcome");
                    client.reject(token).await
                }
                Err(_) => {
                    error!(id = stored.id, "Execution panicked");
                    client.reject(token).await
                }
            };
            if let Err(e) = ack {
                warn!(group = %group, id = stored.id, error = %e, "Failed to acknowledge delivery");
            }
        });
    }
}
