//! In-memory storage.
//!
//! An explicit store instance owned by the host; nothing here is process
//! global. Transactions buffer inserts and apply them on commit, so a
//! rolled-back publish leaves no row behind.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    published_id, DataStorage, MonitoringApi, Result, Statistics, StorageError, StorageOptions,
    StorageTransaction,
};
use crate::message::{headers, MediumMessage, Message, MessageType, StatusName};
use crate::serializer::{JsonSerializer, Serializer};
use crate::utils::snowflake::SnowflakeId;

type Table = HashMap<i64, MediumMessage>;

#[derive(Default)]
struct Tables {
    published: RwLock<Table>,
    received: RwLock<Table>,
}

impl Tables {
    fn table(&self, kind: MessageType) -> &RwLock<Table> {
        match kind {
            MessageType::Publish => &self.published,
            MessageType::Receive => &self.received,
        }
    }
}

/// In-memory store.
pub struct InMemoryStorage {
    tables: Arc<Tables>,
    options: StorageOptions,
    serializer: Arc<dyn Serializer>,
    ids: Arc<SnowflakeId>,
    fail_on_store: RwLock<bool>,
    fail_on_change_state: RwLock<bool>,
}

impl InMemoryStorage {
    /// Create an empty store.
    pub fn new(options: StorageOptions) -> Self {
        Self {
            tables: Arc::new(Tables::default()),
            options,
            serializer: Arc::new(JsonSerializer),
            ids: Arc::new(SnowflakeId::default()),
            fail_on_store: RwLock::new(false),
            fail_on_change_state: RwLock::new(false),
        }
    }

    /// Use a custom serializer for `content`.
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Share an id generator for received-message ids.
    pub fn with_id_generator(mut self, ids: Arc<SnowflakeId>) -> Self {
        self.ids = ids;
        self
    }

    /// Make subsequent inserts fail with a transient error.
    pub async fn set_fail_on_store(&self, fail: bool) {
        *self.fail_on_store.write().await = fail;
    }

    /// Make subsequent state changes fail with a transient error.
    pub async fn set_fail_on_change_state(&self, fail: bool) {
        *self.fail_on_change_state.write().await = fail;
    }

    /// Overwrite the `added` timestamp of a row. Lets tests age rows past the
    /// retry minimum age without sleeping.
    pub async fn set_added(&self, kind: MessageType, id: i64, added: DateTime<Utc>) -> bool {
        match self.tables.table(kind).write().await.get_mut(&id) {
            Some(row) => {
                row.added = added;
                true
            }
            None => false,
        }
    }

    fn new_row(&self, id: i64, message: &Message) -> Result<MediumMessage> {
        Ok(MediumMessage {
            id,
            content: self.serializer.serialize_content(message)?,
            origin: message.clone(),
            added: Utc::now(),
            expires_at: None,
            retries: 0,
            status: StatusName::Scheduled,
        })
    }

    async fn check_store(&self) -> Result<()> {
        if *self.fail_on_store.read().await {
            return Err(StorageError::Unavailable("injected store failure".to_string()));
        }
        Ok(())
    }

    async fn change_state(&self, kind: MessageType, id: i64, status: StatusName) -> Result<bool> {
        if !status.is_durable() {
            return Err(StorageError::TransientStatus(status));
        }
        if *self.fail_on_change_state.read().await {
            return Err(StorageError::Unavailable(
                "injected state change failure".to_string(),
            ));
        }

        let mut table = self.tables.table(kind).write().await;
        let Some(row) = table.get_mut(&id) else {
            return Ok(false);
        };

        match status {
            StatusName::Failed => {
                row.retries += 1;
                row.expires_at = None;
            }
            StatusName::Succeeded => {
                row.expires_at = Some(self.options.expires_at(Utc::now()));
            }
            StatusName::Scheduled | StatusName::Processing => {}
        }
        row.status = status;
        Ok(true)
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new(StorageOptions::default())
    }
}

/// Transaction over an [`InMemoryStorage`]: inserts are buffered until commit.
pub struct MemoryTransaction {
    tables: Arc<Tables>,
    pending: Vec<MediumMessage>,
}

impl MemoryTransaction {
    /// Number of outbox rows waiting for commit.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl StorageTransaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        let mut table = self.tables.published.write().await;
        for row in self.pending {
            table.insert(row.id, row);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[async_trait]
impl MonitoringApi for InMemoryStorage {
    async fn get_message(&self, kind: MessageType, id: i64) -> Result<Option<MediumMessage>> {
        Ok(self.tables.table(kind).read().await.get(&id).cloned())
    }

    async fn get_messages_by_status(
        &self,
        kind: MessageType,
        status: StatusName,
        limit: u32,
    ) -> Result<Vec<MediumMessage>> {
        let table = self.tables.table(kind).read().await;
        let mut rows: Vec<_> = table
            .values()
            .filter(|m| m.status == status)
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.id);
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn statistics(&self) -> Result<Statistics> {
        let mut stats = Statistics::default();
        for row in self.tables.published.read().await.values() {
            stats.published.bump(row.status);
        }
        for row in self.tables.received.read().await.values() {
            stats.received.bump(row.status);
        }
        Ok(stats)
    }
}

#[async_trait]
impl DataStorage for InMemoryStorage {
    fn options(&self) -> &StorageOptions {
        &self.options
    }

    async fn begin_transaction(&self) -> Result<Box<dyn StorageTransaction>> {
        Ok(Box::new(MemoryTransaction {
            tables: self.tables.clone(),
            pending: Vec::new(),
        }))
    }

    async fn store_message(
        &self,
        _name: &str,
        message: &Message,
        txn: Option<&mut dyn StorageTransaction>,
    ) -> Result<MediumMessage> {
        self.check_store().await?;
        let row = self.new_row(published_id(message)?, message)?;

        match txn {
            Some(txn) => {
                let txn = txn
                    .as_any_mut()
                    .downcast_mut::<MemoryTransaction>()
                    .ok_or(StorageError::TransactionMismatch { expected: "memory" })?;
                txn.pending.push(row.clone());
            }
            None => {
                self.tables
                    .published
                    .write()
                    .await
                    .insert(row.id, row.clone());
            }
        }
        Ok(row)
    }

    async fn store_received_message(
        &self,
        _name: &str,
        group: &str,
        message: &Message,
    ) -> Result<MediumMessage> {
        self.check_store().await?;
        let mut message = message.clone();
        message
            .headers
            .insert(headers::GROUP.to_string(), group.to_string());
        let row = self.new_row(self.ids.next_id(), &message)?;
        self.tables
            .received
            .write()
            .await
            .insert(row.id, row.clone());
        Ok(row)
    }

    async fn change_publish_state(&self, id: i64, status: StatusName) -> Result<bool> {
        self.change_state(MessageType::Publish, id, status).await
    }

    async fn change_receive_state(&self, id: i64, status: StatusName) -> Result<bool> {
        self.change_state(MessageType::Receive, id, status).await
    }

    async fn get_messages_needing_retry(&self, kind: MessageType) -> Result<Vec<MediumMessage>> {
        let cutoff = self.options.retry_cutoff(Utc::now());
        let table = self.tables.table(kind).read().await;
        let mut rows: Vec<_> = table
            .values()
            .filter(|m| {
                m.retries < self.options.failed_retry_count
                    && m.added < cutoff
                    && m.status.is_retryable()
            })
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.id);
        rows.truncate(self.options.retry_batch_size as usize);
        Ok(rows)
    }

    async fn delete_expired(
        &self,
        kind: MessageType,
        cutoff: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<u64> {
        let mut table = self.tables.table(kind).write().await;
        let expired: Vec<i64> = table
            .values()
            .filter(|m| m.expires_at.is_some_and(|at| at < cutoff))
            .map(|m| m.id)
            .take(batch_size as usize)
            .collect();
        for id in &expired {
            table.remove(id);
        }
        Ok(expired.len() as u64)
    }
}
