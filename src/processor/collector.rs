//! Deletes expired rows.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use super::Processor;
use crate::message::MessageType;
use crate::storage::{self, DataStorage};

/// Removes `Succeeded` rows past their retention, in batches, for both
/// tables.
pub struct CollectorProcessor {
    storage: Arc<dyn DataStorage>,
    batch_size: u32,
    interval: Duration,
}

impl CollectorProcessor {
    pub fn new(storage: Arc<dyn DataStorage>, batch_size: u32, interval: Duration) -> Self {
        Self {
            storage,
            batch_size: batch_size.max(1),
            interval,
        }
    }
}

#[async_trait]
impl Processor for CollectorProcessor {
    fn name(&self) -> &'static str {
        "collector"
    }

    async fn process(&self) -> storage::Result<()> {
        for kind in [MessageType::Publish, MessageType::Receive] {
            let mut total = 0;
            loop {
                let deleted = self
                    .storage
                    .delete_expired(kind, Utc::now(), self.batch_size)
                    .await?;
                if deleted == 0 {
                    break;
                }
                total += deleted;
                debug!(kind = %kind, deleted = deleted, "Deleted expired batch");
            }
            if total > 0 {
                info!(kind = %kind, deleted = total, "Expired messages collected");
            }
        }
        Ok(())
    }

    async fn idle(&self) {
        tokio::time::sleep(self.interval).await;
    }
}
