//! Retry sweep for both outbox and inbox rows.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Processor, Pulse};
use crate::dispatcher::{
    EnqueueOutcome, ExecuteOutcome, GroupPermits, InFlight, OutboundQueue, SubscribeExecutor,
};
use crate::message::{MediumMessage, MessageType};
use crate::storage::{self, DataStorage, MonitoringApi};

/// Re-dispatches outbox rows and re-executes inbox rows the store reports as
/// needing retry. Rows with an attempt in flight are skipped, as are inbox
/// rows whose group has no free invocation permit.
pub struct RetryProcessor {
    storage: Arc<dyn DataStorage>,
    queue: OutboundQueue,
    executor: Arc<SubscribeExecutor>,
    permits: Arc<GroupPermits>,
    in_flight: Arc<InFlight>,
    interval: Duration,
    pulse: Pulse,
}

impl RetryProcessor {
    pub fn new(
        storage: Arc<dyn DataStorage>,
        queue: OutboundQueue,
        executor: Arc<SubscribeExecutor>,
        permits: Arc<GroupPermits>,
        interval: Duration,
        pulse: Pulse,
    ) -> Self {
        let in_flight = queue.in_flight().clone();
        Self {
            storage,
            queue,
            executor,
            permits,
            in_flight,
            interval,
            pulse,
        }
    }

    /// Re-read a row from the sweep's snapshot while holding its in-flight
    /// mark. `None` when an attempt finished after the snapshot was taken.
    async fn still_due(
        &self,
        kind: MessageType,
        snapshot: &MediumMessage,
    ) -> storage::Result<Option<MediumMessage>> {
        let current = self.storage.get_message(kind, snapshot.id).await?;
        Ok(current.filter(|row| row.status.is_retryable() && row.retries == snapshot.retries))
    }

    async fn retry_published(&self) -> storage::Result<usize> {
        let mut queued = 0;
        let messages = self
            .storage
            .get_messages_needing_retry(MessageType::Publish)
            .await?;
        for message in messages {
            let Some(guard) = self.in_flight.try_begin(MessageType::Publish, message.id) else {
                continue;
            };
            let Some(current) = self.still_due(MessageType::Publish, &message).await? else {
                continue;
            };
            match self.queue.enqueue_marked(current, guard) {
                EnqueueOutcome::Queued => queued += 1,
                EnqueueOutcome::InFlight => {}
                EnqueueOutcome::Full | EnqueueOutcome::Closed => break,
            }
        }
        Ok(queued)
    }

    async fn retry_received(&self) -> storage::Result<usize> {
        let mut executed = 0;
        let messages = self
            .storage
            .get_messages_needing_retry(MessageType::Receive)
            .await?;
        for message in messages {
            let Some(guard) = self.in_flight.try_begin(MessageType::Receive, message.id) else {
                continue;
            };
            let Some(current) = self.still_due(MessageType::Receive, &message).await? else {
                continue;
            };
            let group = current.origin.group().unwrap_or_default();
            let Ok(_permit) = self.permits.for_group(group).try_acquire_owned() else {
                debug!(id = current.id, group = %group, "Group saturated, retrying later");
                continue;
            };
            match self.executor.execute_marked(&current, guard).await {
                Ok(ExecuteOutcome::InFlight) => {}
                Ok(_) => executed += 1,
                Err(e) => {
                    warn!(
                        id = message.id,
                        error = %e,
                        "Failed to record retried consume outcome"
                    );
                }
            }
        }
        Ok(executed)
    }
}

#[async_trait]
impl Processor for RetryProcessor {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn process(&self) -> storage::Result<()> {
        let published = self.retry_published().await?;
        let received = self.retry_received().await?;
        if published + received > 0 {
            info!(published = published, received = received, "Retried messages");
        } else {
            debug!("Nothing to retry");
        }
        Ok(())
    }

    async fn idle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.interval) => {}
            _ = self.pulse.wait() => {}
        }
    }
}
