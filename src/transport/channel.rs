//! In-process broker over tokio channels.
//!
//! Each consumer group owns one queue. A send is copied into the queue of
//! every group bound to the message's topic, and within a group each message
//! is delivered to one listener. Rejected deliveries go back to the tail of
//! the group's queue after a short delay, up to a delivery limit; past the
//! limit they are dead-lettered. When a listener's connection drops, its
//! unacknowledged deliveries are requeued.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

use super::{
    AckToken, ConsumerClient, ConsumerClientFactory, DeliveryHandler, OperateResult, Result,
    Transport, TransportError, TransportMessage,
};

/// Default number of deliveries before a rejected message is dead-lettered.
pub const DEFAULT_MAX_DELIVERIES: u32 = 5;
/// Default pause before a rejected message is redelivered.
pub const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_millis(20);

/// A message on its way to a group, with the number of prior deliveries.
struct Delivery {
    message: TransportMessage,
    deliveries: u32,
}

struct GroupQueue {
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Delivery>>>,
}

impl GroupQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }
}

struct BrokerState {
    /// topic -> bound groups
    bindings: RwLock<HashMap<String, BTreeSet<String>>>,
    queues: RwLock<HashMap<String, GroupQueue>>,
    sent: RwLock<Vec<TransportMessage>>,
    committed: RwLock<Vec<(String, TransportMessage)>>,
    rejected: RwLock<Vec<(String, TransportMessage)>>,
    dead_lettered: RwLock<Vec<(String, TransportMessage)>>,
    fail_on_send: AtomicBool,
    fail_next_listens: AtomicUsize,
    drop_connections: Notify,
    max_deliveries: u32,
    redelivery_delay: Duration,
}

impl BrokerState {
    fn new(max_deliveries: u32, redelivery_delay: Duration) -> Self {
        Self {
            bindings: RwLock::default(),
            queues: RwLock::default(),
            sent: RwLock::default(),
            committed: RwLock::default(),
            rejected: RwLock::default(),
            dead_lettered: RwLock::default(),
            fail_on_send: AtomicBool::new(false),
            fail_next_listens: AtomicUsize::new(0),
            drop_connections: Notify::new(),
            max_deliveries,
            redelivery_delay,
        }
    }
}

/// In-process broker: both a [`Transport`] and a [`ConsumerClientFactory`].
///
/// Cloning shares the broker.
#[derive(Clone)]
pub struct ChannelBroker {
    state: Arc<BrokerState>,
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBroker {
    pub fn new() -> Self {
        Self::with_redelivery(DEFAULT_MAX_DELIVERIES, DEFAULT_REDELIVERY_DELAY)
    }

    /// Broker that delivers a message at most `max_deliveries` times per
    /// group, waiting `delay` before each redelivery.
    pub fn with_redelivery(max_deliveries: u32, delay: Duration) -> Self {
        Self {
            state: Arc::new(BrokerState::new(max_deliveries.max(1), delay)),
        }
    }

    /// Simulate a broker outage for sends.
    pub fn set_fail_on_send(&self, fail: bool) {
        self.state.fail_on_send.store(fail, Ordering::SeqCst);
    }

    /// Make the next `n` calls to `listen` fail as if the connection dropped.
    pub fn fail_next_listens(&self, n: usize) {
        self.state.fail_next_listens.store(n, Ordering::SeqCst);
    }

    /// Make every running `listen` fail as if its connection dropped.
    pub fn drop_connections(&self) {
        self.state.drop_connections.notify_waiters();
    }

    /// Every message accepted by `send`, in order.
    pub async fn sent(&self) -> Vec<TransportMessage> {
        self.state.sent.read().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.state.sent.read().await.len()
    }

    /// Messages committed by `group`.
    pub async fn committed(&self, group: &str) -> Vec<TransportMessage> {
        Self::for_group(&self.state.committed, group).await
    }

    /// Messages rejected by `group`, one entry per rejection.
    pub async fn rejected(&self, group: &str) -> Vec<TransportMessage> {
        Self::for_group(&self.state.rejected, group).await
    }

    /// Messages `group` rejected on their last allowed delivery.
    pub async fn dead_lettered(&self, group: &str) -> Vec<TransportMessage> {
        Self::for_group(&self.state.dead_lettered, group).await
    }

    async fn for_group(
        log: &RwLock<Vec<(String, TransportMessage)>>,
        group: &str,
    ) -> Vec<TransportMessage> {
        log.read()
            .await
            .iter()
            .filter(|(g, _)| g == group)
            .map(|(_, m)| m.clone())
            .collect()
    }

    async fn enqueue(&self, group: &str, delivery: Delivery) -> Result<()> {
        let queues = self.state.queues.read().await;
        let queue = queues
            .get(group)
            .ok_or_else(|| TransportError::Send(format!("no queue for group {}", group)))?;
        queue
            .sender
            .send(delivery)
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Transport for ChannelBroker {
    #[tracing::instrument(name = "channel.send", skip_all, fields(name = ?message.name()))]
    async fn send(&self, message: &TransportMessage) -> OperateResult {
        if self.state.fail_on_send.load(Ordering::SeqCst) {
            return OperateResult::Failed(TransportError::Connection(
                "channel broker unavailable".to_string(),
            ));
        }
        let Some(name) = message.name() else {
            return OperateResult::Failed(TransportError::Send(
                "message has no name".to_string(),
            ));
        };

        let groups: Vec<String> = self
            .state
            .bindings
            .read()
            .await
            .get(name)
            .map(|g| g.iter().cloned().collect())
            .unwrap_or_default();

        for group in &groups {
            let delivery = Delivery {
                message: message.clone(),
                deliveries: 0,
            };
            if let Err(e) = self.enqueue(group, delivery).await {
                return OperateResult::Failed(e);
            }
        }

        debug!(name = %name, groups = groups.len(), "Message routed via channel");
        self.state.sent.write().await.push(message.clone());
        OperateResult::Success
    }

    fn address(&self) -> String {
        "channel://in-process".to_string()
    }
}

#[async_trait]
impl ConsumerClientFactory for ChannelBroker {
    async fn create(&self, group: &str, concurrency: usize) -> Result<Arc<dyn ConsumerClient>> {
        self.state
            .queues
            .write()
            .await
            .entry(group.to_string())
            .or_insert_with(GroupQueue::new);

        info!(group = %group, concurrency = concurrency, "Channel consumer client created");
        Ok(Arc::new(ChannelConsumerClient {
            broker: self.clone(),
            group: group.to_string(),
            next_token: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }))
    }
}

/// Consumer client for one group of a [`ChannelBroker`].
pub struct ChannelConsumerClient {
    broker: ChannelBroker,
    group: String,
    next_token: AtomicU64,
    /// Deliveries handed out and not yet committed or rejected.
    pending: Mutex<HashMap<AckToken, Delivery>>,
}

impl ChannelConsumerClient {
    pub fn group(&self) -> &str {
        &self.group
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn take_pending(&self, token: AckToken) -> Result<Delivery> {
        self.pending
            .lock()
            .await
            .remove(&token)
            .ok_or(TransportError::UnknownToken(token))
    }

    /// Hand every unacknowledged delivery back to the group's queue. Their
    /// tokens become unknown.
    async fn requeue_pending(&self) {
        let unacked: Vec<Delivery> = self.pending.lock().await.drain().map(|(_, d)| d).collect();
        if unacked.is_empty() {
            return;
        }
        warn!(
            group = %self.group,
            count = unacked.len(),
            "Connection lost, requeueing unacknowledged deliveries"
        );
        for delivery in unacked {
            if let Err(e) = self.broker.enqueue(&self.group, delivery).await {
                warn!(group = %self.group, error = %e, "Redelivery failed");
            }
        }
    }

    async fn session(
        &self,
        handler: Arc<dyn DeliveryHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let injected = self
            .broker
            .state
            .fail_next_listens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(TransportError::Connection(
                "injected listen failure".to_string(),
            ));
        }

        let receiver = {
            let queues = self.broker.state.queues.read().await;
            queues
                .get(&self.group)
                .map(|q| q.receiver.clone())
                .ok_or_else(|| TransportError::Subscribe(format!("unknown group {}", self.group)))?
        };
        let mut receiver = receiver.lock().await;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                _ = self.broker.state.drop_connections.notified() => {
                    return Err(TransportError::Connection("connection dropped".to_string()));
                }
                delivery = receiver.recv() => {
                    let Some(mut delivery) = delivery else {
                        return Err(TransportError::Closed);
                    };
                    delivery.deliveries += 1;
                    let message = delivery.message.clone();
                    let token = AckToken(self.next_token.fetch_add(1, Ordering::SeqCst));
                    self.pending.lock().await.insert(token, delivery);
                    handler.on_message(message, token).await;
                }
            }
        }
    }
}

#[async_trait]
impl ConsumerClient for ChannelConsumerClient {
    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        let mut bindings = self.broker.state.bindings.write().await;
        for topic in topics {
            bindings
                .entry(topic.clone())
                .or_default()
                .insert(self.group.clone());
        }
        info!(group = %self.group, topics = ?topics, "Bound group to topics");
        Ok(())
    }

    async fn listen(
        &self,
        handler: Arc<dyn DeliveryHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let result = self.session(handler, shutdown).await;
        if result.is_err() {
            self.requeue_pending().await;
        }
        result
    }

    async fn commit(&self, token: AckToken) -> Result<()> {
        let delivery = self.take_pending(token).await?;
        self.broker
            .state
            .committed
            .write()
            .await
            .push((self.group.clone(), delivery.message));
        Ok(())
    }

    async fn reject(&self, token: AckToken) -> Result<()> {
        let delivery = self.take_pending(token).await?;
        let state = &self.broker.state;
        state
            .rejected
            .write()
            .await
            .push((self.group.clone(), delivery.message.clone()));

        if delivery.deliveries >= state.max_deliveries {
            warn!(
                group = %self.group,
                name = ?delivery.message.name(),
                deliveries = delivery.deliveries,
                "Delivery rejected too often, dead-lettering"
            );
            state
                .dead_lettered
                .write()
                .await
                .push((self.group.clone(), delivery.message));
            return Ok(());
        }

        debug!(
            group = %self.group,
            name = ?delivery.message.name(),
            "Delivery rejected, requeueing"
        );
        let broker = self.broker.clone();
        let group = self.group.clone();
        let delay = state.redelivery_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = broker.enqueue(&group, delivery).await {
                warn!(group = %group, error = %e, "Redelivery failed");
            }
        });
        Ok(())
    }
}
