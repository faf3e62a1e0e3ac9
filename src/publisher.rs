//! Outbox publishing.
//!
//! A publish writes the message to the outbox first. Without a transaction
//! the row is handed to the dispatcher right away; inside an
//! [`OutboxTransaction`] it is buffered and handed over only once the
//! transaction commits, so a rolled-back business operation never emits.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::Naming;
use crate::dispatcher::OutboundQueue;
use crate::message::{headers, MediumMessage, Message};
use crate::processor::Pulse;
use crate::storage::{DataStorage, StorageError, StorageTransaction};
use crate::utils::snowflake::SnowflakeId;

/// Result type for publish operations.
pub type Result<T> = std::result::Result<T, PublishError>;

/// Errors surfaced to the publishing caller. Anything after the outbox row is
/// durable is handled asynchronously and never shows up here.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Message name must not be empty")]
    EmptyName,

    #[error("Transaction already committed or rolled back")]
    TransactionCompleted,

    #[error("Failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Stores and enqueues outgoing messages.
pub struct Publisher {
    storage: Arc<dyn DataStorage>,
    queue: OutboundQueue,
    ids: Arc<SnowflakeId>,
    naming: Naming,
    pulse: Pulse,
}

impl Publisher {
    pub fn new(
        storage: Arc<dyn DataStorage>,
        queue: OutboundQueue,
        ids: Arc<SnowflakeId>,
        naming: Naming,
        pulse: Pulse,
    ) -> Self {
        Self {
            storage,
            queue,
            ids,
            naming,
            pulse,
        }
    }

    /// Store `payload` under `name` and hand it to the dispatcher.
    ///
    /// Caller `headers` are kept, except `MessageId`, `MessageName` and
    /// `SentTime`, which are always generated.
    #[tracing::instrument(name = "publisher.publish", skip(self, payload, headers))]
    pub async fn publish<T>(
        &self,
        name: &str,
        payload: &T,
        headers: BTreeMap<String, String>,
    ) -> Result<MediumMessage>
    where
        T: Serialize + ?Sized,
    {
        let message = self.build_message(name, payload, headers)?;
        let stored = self
            .storage
            .store_message(message.name(), &message, None)
            .await?;

        let outcome = self.queue.enqueue(stored.clone());
        debug!(id = stored.id, outcome = ?outcome, "Message published");
        self.pulse.pulse();
        Ok(stored)
    }

    /// Publish with a `CallbackName`, so the subscriber's reply is published
    /// to `callback_name`.
    pub async fn publish_with_callback<T>(
        &self,
        name: &str,
        payload: &T,
        callback_name: &str,
    ) -> Result<MediumMessage>
    where
        T: Serialize + ?Sized,
    {
        let mut headers = BTreeMap::new();
        headers.insert(headers::CALLBACK_NAME.to_string(), callback_name.to_string());
        self.publish(name, payload, headers).await
    }

    /// Store `payload` inside `txn`. The dispatcher sees it only after
    /// `txn` commits; with auto-commit the transaction commits here.
    #[tracing::instrument(name = "publisher.publish_in", skip(self, txn, payload, headers))]
    pub async fn publish_in<T>(
        &self,
        txn: &mut OutboxTransaction,
        name: &str,
        payload: &T,
        headers: BTreeMap<String, String>,
    ) -> Result<MediumMessage>
    where
        T: Serialize + ?Sized,
    {
        let message = self.build_message(name, payload, headers)?;
        let stored = self
            .storage
            .store_message(message.name(), &message, Some(txn.storage()?))
            .await?;
        txn.buffered.push(stored.clone());

        if txn.auto_commit {
            txn.commit().await?;
        }
        Ok(stored)
    }

    /// Open a transaction that business writes and publishes can share.
    pub async fn begin_transaction(&self, auto_commit: bool) -> Result<OutboxTransaction> {
        let inner = self.storage.begin_transaction().await?;
        Ok(OutboxTransaction {
            inner: Some(inner),
            buffered: Vec::new(),
            queue: self.queue.clone(),
            pulse: self.pulse.clone(),
            auto_commit,
        })
    }

    fn build_message<T>(
        &self,
        name: &str,
        payload: &T,
        mut extra: BTreeMap<String, String>,
    ) -> Result<Message>
    where
        T: Serialize + ?Sized,
    {
        if name.is_empty() {
            return Err(PublishError::EmptyName);
        }

        let id = self.ids.next_id().to_string();
        extra.insert(headers::MESSAGE_ID.to_string(), id.clone());
        extra.insert(headers::MESSAGE_NAME.to_string(), self.naming.topic(name));
        extra.insert(
            headers::SENT_TIME.to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        extra
            .entry(headers::CORRELATION_ID.to_string())
            .or_insert(id);
        extra
            .entry(headers::CORRELATION_SEQUENCE.to_string())
            .or_insert_with(|| "0".to_string());
        extra
            .entry(headers::TYPE.to_string())
            .or_insert_with(|| std::any::type_name::<T>().to_string());

        let body = serde_json::to_value(payload)?;
        Ok(Message::new(extra, Some(body)))
    }
}

/// Explicit transaction scope for publishing.
///
/// Dropping it without `commit` discards buffered messages and leaves the
/// backend transaction to its own drop behaviour (rollback for SQLite).
pub struct OutboxTransaction {
    inner: Option<Box<dyn StorageTransaction>>,
    buffered: Vec<MediumMessage>,
    queue: OutboundQueue,
    pulse: Pulse,
    auto_commit: bool,
}

impl OutboxTransaction {
    /// Backend transaction for business writes, e.g.
    /// `SqliteTransaction::from_handle(txn.storage()?)`.
    pub fn storage(&mut self) -> Result<&mut dyn StorageTransaction> {
        match self.inner.as_deref_mut() {
            Some(inner) => Ok(inner),
            None => Err(PublishError::TransactionCompleted),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.inner.is_none()
    }

    /// Messages stored in this transaction and not yet handed over.
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Commit, then hand the buffered messages to the dispatcher.
    pub async fn commit(&mut self) -> Result<()> {
        let inner = self.inner.take().ok_or(PublishError::TransactionCompleted)?;
        inner.commit().await?;

        let buffered = std::mem::take(&mut self.buffered);
        info!(count = buffered.len(), "Outbox transaction committed");
        for message in buffered {
            self.queue.enqueue(message);
        }
        self.pulse.pulse();
        Ok(())
    }

    /// Roll back and discard the buffered messages.
    pub async fn rollback(&mut self) -> Result<()> {
        let inner = self.inner.take().ok_or(PublishError::TransactionCompleted)?;
        self.buffered.clear();
        inner.rollback().await?;
        Ok(())
    }
}
