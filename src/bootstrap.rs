//! Wiring facade.
//!
//! [`CarrierBuilder`] collects the store, the transport, the consumer client
//! factory, the subscriber registry and the configuration, and builds a
//! [`Carrier`]. [`Carrier::start`] launches the dispatcher workers, one
//! listener per consumer group, and the retry and collector loops;
//! [`Carrier::shutdown`] stops all of them within `shutdown_timeout`.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{CarrierConfig, ConfigError};
use crate::consumer::{ConsumerRegistry, ConsumerRegistryBuilder, ConsumerSelector, RegistryError};
use crate::dispatcher::{
    ConsumerRegister, Dispatcher, EnqueueOutcome, FailedThresholdCallback, GroupPermits,
    InFlight, MessageSender, OutboundQueue, SubscribeExecutor,
};
use crate::message::{MessageType, StatusName};
use crate::processor::{CollectorProcessor, ProcessingServer, Pulse, RetryProcessor};
use crate::publisher::{PublishError, Publisher};
use crate::serializer::{JsonSerializer, Serializer};
use crate::storage::{self, DataStorage, MonitoringApi, StorageError};
use crate::transport::{ConsumerClientFactory, Transport, TransportError};
use crate::utils::snowflake::SnowflakeId;

/// Errors surfaced by the facade.
#[derive(Debug, thiserror::Error)]
pub enum CarrierError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("No {0} configured")]
    Missing(&'static str),

    #[error("Carrier is already started")]
    AlreadyStarted,
}

pub type Result<T> = std::result::Result<T, CarrierError>;

/// Builder for [`Carrier`].
pub struct CarrierBuilder {
    config: CarrierConfig,
    storage: Option<Arc<dyn DataStorage>>,
    transport: Option<Arc<dyn Transport>>,
    consumers: Option<Arc<dyn ConsumerClientFactory>>,
    registry: ConsumerRegistryBuilder,
    serializer: Arc<dyn Serializer>,
    on_failed_threshold: Option<FailedThresholdCallback>,
}

impl CarrierBuilder {
    pub fn new(config: CarrierConfig) -> Self {
        Self {
            config,
            storage: None,
            transport: None,
            consumers: None,
            registry: ConsumerRegistry::builder(),
            serializer: Arc::new(JsonSerializer),
            on_failed_threshold: None,
        }
    }

    /// Use an explicit store instead of the one `config.storage` describes.
    pub fn storage(mut self, storage: Arc<dyn DataStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Required when any subscriber is registered.
    pub fn consumer_factory(mut self, factory: Arc<dyn ConsumerClientFactory>) -> Self {
        self.consumers = Some(factory);
        self
    }

    /// Register subscribers.
    pub fn subscribers(
        mut self,
        register: impl FnOnce(ConsumerRegistryBuilder) -> ConsumerRegistryBuilder,
    ) -> Self {
        self.registry = register(self.registry);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Called once for every message whose failed attempt reaches
    /// `failed_retry_count`.
    pub fn on_failed_threshold(mut self, callback: FailedThresholdCallback) -> Self {
        self.on_failed_threshold = Some(callback);
        self
    }

    /// Validate the configuration and registry and wire every component.
    /// Nothing runs until [`Carrier::start`].
    pub async fn build(self) -> Result<Carrier> {
        self.config.validate()?;
        let naming = self.config.naming();
        let registry = Arc::new(self.registry.build(&naming)?);

        let transport = self.transport.ok_or(CarrierError::Missing("transport"))?;
        if !registry.is_empty() && self.consumers.is_none() {
            return Err(CarrierError::Missing("consumer client factory"));
        }

        let storage = match self.storage {
            Some(storage) => {
                // The sender, executor and the store's retry query must agree on
                // the ceiling and retry window.
                if *storage.options() != self.config.storage_options() {
                    return Err(ConfigError::Invalid(format!(
                        "store options {:?} differ from configuration {:?}",
                        storage.options(),
                        self.config.storage_options()
                    ))
                    .into());
                }
                storage
            }
            None => {
                storage::init_storage(&self.config.storage, self.config.storage_options()).await?
            }
        };

        let in_flight = Arc::new(InFlight::new());
        let pulse = Pulse::new();

        let mut sender = MessageSender::new(
            storage.clone(),
            transport.clone(),
            self.serializer.clone(),
            self.config.failed_retry_count,
        );
        if let Some(callback) = &self.on_failed_threshold {
            sender = sender.with_failed_threshold_callback(callback.clone());
        }
        let (dispatcher, queue) = Dispatcher::new(
            Arc::new(sender),
            in_flight.clone(),
            self.config.producer_queue_capacity,
            self.config.producer_workers,
        );

        let publisher = Arc::new(Publisher::new(
            storage.clone(),
            queue.clone(),
            Arc::new(SnowflakeId::new(self.config.worker_id)),
            naming,
            pulse.clone(),
        ));

        let mut executor = SubscribeExecutor::new(
            storage.clone(),
            Arc::new(ConsumerSelector::new(registry.clone())),
            publisher.clone(),
            in_flight,
            self.config.failed_retry_count,
        );
        if let Some(callback) = self.on_failed_threshold {
            executor = executor.with_failed_threshold_callback(callback);
        }

        let permits = Arc::new(GroupPermits::new(self.config.consumer_thread_count));

        info!(
            transport = %transport.address(),
            subscribers = registry.descriptors().len(),
            "Carrier built"
        );

        Ok(Carrier {
            config: self.config,
            storage,
            consumers: self.consumers,
            registry,
            serializer: self.serializer,
            publisher,
            queue,
            executor: Arc::new(executor),
            permits,
            dispatcher,
            pulse,
            server: None,
        })
    }
}

/// A wired outbox/inbox runtime.
pub struct Carrier {
    config: CarrierConfig,
    storage: Arc<dyn DataStorage>,
    consumers: Option<Arc<dyn ConsumerClientFactory>>,
    registry: Arc<ConsumerRegistry>,
    serializer: Arc<dyn Serializer>,
    publisher: Arc<Publisher>,
    queue: OutboundQueue,
    executor: Arc<SubscribeExecutor>,
    permits: Arc<GroupPermits>,
    dispatcher: Dispatcher,
    pulse: Pulse,
    server: Option<ProcessingServer>,
}

impl Carrier {
    pub fn builder(config: CarrierConfig) -> CarrierBuilder {
        CarrierBuilder::new(config)
    }

    pub fn publisher(&self) -> Arc<Publisher> {
        self.publisher.clone()
    }

    /// The store. Hosts open transactions on it directly, and operators use
    /// its [`MonitoringApi`] read side.
    pub fn storage(&self) -> Arc<dyn DataStorage> {
        self.storage.clone()
    }

    pub fn config(&self) -> &CarrierConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.server.is_some()
    }

    /// Start background processing.
    pub async fn start(&mut self) -> Result<()> {
        if self.server.is_some() {
            return Err(CarrierError::AlreadyStarted);
        }

        let mut server = ProcessingServer::new(self.config.shutdown_timeout);
        server.track(self.dispatcher.start(server.shutdown_signal()));

        if let Some(factory) = &self.consumers {
            if !self.registry.is_empty() {
                let register = ConsumerRegister::new(
                    factory.clone(),
                    self.registry.clone(),
                    self.storage.clone(),
                    self.serializer.clone(),
                    self.executor.clone(),
                    self.permits.clone(),
                );
                match register.start(server.shutdown_signal()).await {
                    Ok(handles) => server.track(handles),
                    Err(e) => {
                        server.shutdown().await;
                        return Err(e.into());
                    }
                }
            }
        }

        server.spawn(Arc::new(RetryProcessor::new(
            self.storage.clone(),
            self.queue.clone(),
            self.executor.clone(),
            self.permits.clone(),
            self.config.failed_retry_interval,
            self.pulse.clone(),
        )));
        server.spawn(Arc::new(CollectorProcessor::new(
            self.storage.clone(),
            self.config.collector_batch_size,
            self.config.collector_interval,
        )));

        info!(tasks = server.task_count(), "Carrier started");
        self.server = Some(server);
        Ok(())
    }

    /// Put an outbox message back in `Scheduled` and dispatch it again,
    /// regardless of its retry count. Returns `false` for an unknown id.
    pub async fn requeue(&self, id: i64) -> Result<bool> {
        if !self
            .storage
            .change_publish_state(id, StatusName::Scheduled)
            .await?
        {
            return Ok(false);
        }
        let Some(message) = self.storage.get_message(MessageType::Publish, id).await? else {
            return Ok(false);
        };
        match self.queue.enqueue(message) {
            EnqueueOutcome::Queued | EnqueueOutcome::InFlight => {}
            outcome => {
                warn!(id = id, outcome = ?outcome, "Requeued message left for the retry sweep");
            }
        }
        Ok(true)
    }

    /// Stop background processing. Returns `true` when every task stopped
    /// within `shutdown_timeout`.
    pub async fn shutdown(mut self) -> bool {
        match self.server.take() {
            Some(server) => {
                info!("Carrier shutting down");
                server.shutdown().await
            }
            None => true,
        }
    }
}
