//! Message dispatch.
//!
//! Outbound: a bounded queue of stored messages drained by a pool of workers,
//! each sending through the [`Transport`](crate::transport::Transport) and
//! recording the outcome ([`MessageSender`]).
//!
//! Inbound: one consumer client per group feeding deliveries into the store
//! and the subscriber pipeline ([`ConsumerRegister`], [`SubscribeExecutor`]).
//!
//! A message being sent or invoked is tracked in [`InFlight`] rather than in
//! the store, so the retry sweep never starts a second attempt in-process
//! while one is running.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::message::{MediumMessage, Message, MessageType};

mod consumer;
mod executor;
mod sender;

pub use consumer::ConsumerRegister;
pub use executor::{ExecuteOutcome, SubscribeExecutor};
pub use sender::MessageSender;

// ============================================================================
// Failure threshold
// ============================================================================

/// Handed to the failure callback when a message reaches the retry ceiling.
#[derive(Debug, Clone)]
pub struct FailedInfo {
    pub kind: MessageType,
    pub id: i64,
    pub message: Message,
    pub retries: u32,
    pub error: String,
}

/// Called once per message when its failed attempts reach the retry ceiling.
pub type FailedThresholdCallback = Arc<dyn Fn(FailedInfo) + Send + Sync>;

// ============================================================================
// In-flight tracking
// ============================================================================

/// Ids currently queued, being sent, or being invoked.
#[derive(Debug, Default)]
pub struct InFlight {
    ids: Mutex<HashSet<(MessageType, i64)>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `id` in flight. Returns `None` if it already is.
    pub fn try_begin(self: &Arc<Self>, kind: MessageType, id: i64) -> Option<InFlightGuard> {
        let inserted = self
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((kind, id));
        inserted.then(|| InFlightGuard {
            owner: self.clone(),
            key: (kind, id),
        })
    }

    pub fn contains(&self, kind: MessageType, id: i64) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(kind, id))
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Clears the in-flight mark when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    owner: Arc<InFlight>,
    key: (MessageType, i64),
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.owner
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

// ============================================================================
// Group permits
// ============================================================================

/// Invocation permits per consumer group, shared by live deliveries and the
/// retry sweep so a group never runs more than `capacity` subscribers at once.
#[derive(Debug)]
pub struct GroupPermits {
    capacity: usize,
    groups: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl GroupPermits {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The semaphore for `group`, created on first use.
    pub fn for_group(&self, group: &str) -> Arc<Semaphore> {
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(group.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.capacity)))
            .clone()
    }
}

// ============================================================================
// Outbound queue
// ============================================================================

struct Outbound {
    message: MediumMessage,
    _guard: InFlightGuard,
}

/// What happened to a message handed to [`OutboundQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Already queued or being sent.
    InFlight,
    /// Queue at capacity; the stored row waits for the retry sweep.
    Full,
    /// Dispatcher stopped; the stored row waits for the next start.
    Closed,
}

/// Sending half of the outbound queue. Cheap to clone.
#[derive(Clone)]
pub struct OutboundQueue {
    sender: mpsc::Sender<Outbound>,
    in_flight: Arc<InFlight>,
}

impl OutboundQueue {
    /// Hand a stored message to the workers without waiting.
    pub fn enqueue(&self, message: MediumMessage) -> EnqueueOutcome {
        let Some(guard) = self.in_flight.try_begin(MessageType::Publish, message.id) else {
            return EnqueueOutcome::InFlight;
        };
        self.enqueue_marked(message, guard)
    }

    /// Enqueue a message whose in-flight mark the caller already holds.
    pub(crate) fn enqueue_marked(
        &self,
        message: MediumMessage,
        guard: InFlightGuard,
    ) -> EnqueueOutcome {
        let id = message.id;
        match self.sender.try_send(Outbound {
            message,
            _guard: guard,
        }) {
            Ok(()) => EnqueueOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(id = id, "Outbound queue full, leaving message for retry");
                EnqueueOutcome::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(id = id, "Outbound queue closed, leaving message for retry");
                EnqueueOutcome::Closed
            }
        }
    }

    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.in_flight
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Owns the receiving half of the outbound queue and runs the send workers.
pub struct Dispatcher {
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Outbound>>>,
    sender: Arc<MessageSender>,
    workers: usize,
}

impl Dispatcher {
    /// Create the outbound queue and its dispatcher.
    pub fn new(
        sender: Arc<MessageSender>,
        in_flight: Arc<InFlight>,
        capacity: usize,
        workers: usize,
    ) -> (Self, OutboundQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dispatcher = Self {
            receiver: Arc::new(tokio::sync::Mutex::new(rx)),
            sender,
            workers: workers.max(1),
        };
        (dispatcher, OutboundQueue { sender: tx, in_flight })
    }

    /// Spawn the send workers. They stop when `shutdown` flips to `true`,
    /// after finishing any send already started.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(workers = self.workers, "Starting outbound dispatcher");
        (0..self.workers)
            .map(|worker| {
                let receiver = self.receiver.clone();
                let sender = self.sender.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(run_worker(worker, receiver, sender, shutdown))
            })
            .collect()
    }
}

async fn run_worker(
    worker: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Outbound>>>,
    sender: Arc<MessageSender>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let mut queue = receiver.lock().await;
        let next = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            item = queue.recv() => item,
        };
        drop(queue);

        // Every sender is gone: nothing more can arrive.
        let Some(Outbound { message, _guard }) = next else {
            break;
        };

        if let Err(e) = sender.send(&message).await {
            warn!(
                worker = worker,
                id = message.id,
                error = %e,
                "Failed to record send outcome; retry sweep will pick the message up"
            );
        }
    }
    debug!(worker = worker, "Outbound worker stopped");
}
