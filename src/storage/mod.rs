//! Durable outbox/inbox storage.
//!
//! This module contains:
//! - `DataStorage` trait: the contract every backend fulfils
//! - `StorageTransaction` trait: a backend transaction a publish can join
//! - `MonitoringApi` trait: read side for operators
//! - Implementations: in-memory (always), SQLite (`sqlite` feature)
//!
//! Status transitions are single-row atomic updates keyed by message id. The
//! store, not an in-process lock, is the source of truth for mutual exclusion.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use crate::message::{MediumMessage, Message, MessageType, StatusName};
use crate::serializer::SerializationError;

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{InMemoryStorage, MemoryTransaction};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteStorage, SqliteTransaction};

// ============================================================================
// Errors
// ============================================================================

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// Everything except `TransactionMismatch`, `TransientStatus` and
/// `InvalidMessageId` is treated as transient by the background loops.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Transaction handle does not belong to the {expected} store")]
    TransactionMismatch { expected: &'static str },

    #[error("Status {0} is transient and cannot be persisted")]
    TransientStatus(StatusName),

    #[error("Message id is not a valid 64-bit integer: {0:?}")]
    InvalidMessageId(String),

    #[error("Invalid stored row: {0}")]
    InvalidRow(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown storage type: {0}")]
    UnknownType(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Traits
// ============================================================================

/// An open backend transaction.
///
/// The host performs its business writes through the concrete type (reached
/// with [`StorageTransaction::as_any_mut`]) and passes the same handle to
/// `store_message`, so the business rows and the outbox row commit or roll
/// back together.
#[async_trait]
pub trait StorageTransaction: Send {
    /// Commit the transaction.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Roll the transaction back.
    async fn rollback(self: Box<Self>) -> Result<()>;

    /// Downcast hook for backends and hosts.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Per-status row counts for one message kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub scheduled: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub(crate) fn bump(&mut self, status: StatusName) {
        match status {
            StatusName::Scheduled => self.scheduled += 1,
            StatusName::Succeeded => self.succeeded += 1,
            StatusName::Failed => self.failed += 1,
            StatusName::Processing => {}
        }
    }
}

/// Row counts across both tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    pub published: StatusCounts,
    pub received: StatusCounts,
}

/// Read side used by operators to inspect messages, e.g. those resting in
/// `Failed` after reaching the retry ceiling.
#[async_trait]
pub trait MonitoringApi: Send + Sync {
    /// Fetch a single row.
    async fn get_message(&self, kind: MessageType, id: i64) -> Result<Option<MediumMessage>>;

    /// List rows in a status, oldest first.
    async fn get_messages_by_status(
        &self,
        kind: MessageType,
        status: StatusName,
        limit: u32,
    ) -> Result<Vec<MediumMessage>>;

    /// Row counts per kind and status.
    async fn statistics(&self) -> Result<Statistics>;
}

/// Interface for outbox/inbox persistence.
///
/// Implementations:
/// - `InMemoryStorage`: explicit in-process instance, for tests and local runs
/// - `SqliteStorage`: SQLite via sqlx
#[async_trait]
pub trait DataStorage: MonitoringApi {
    /// The retry and retention parameters this store applies.
    fn options(&self) -> &StorageOptions;

    /// Open a transaction that a publish can participate in.
    async fn begin_transaction(&self) -> Result<Box<dyn StorageTransaction>>;

    /// Persist a new outbox message in `Scheduled`.
    ///
    /// With `txn`, the insert joins that transaction and becomes visible only
    /// when it commits. The row id is the message's `MessageId` header.
    async fn store_message(
        &self,
        name: &str,
        message: &Message,
        txn: Option<&mut dyn StorageTransaction>,
    ) -> Result<MediumMessage>;

    /// Persist a new inbox message in `Scheduled` with a freshly generated id.
    async fn store_received_message(
        &self,
        name: &str,
        group: &str,
        message: &Message,
    ) -> Result<MediumMessage>;

    /// Atomically move an outbox row to `status`.
    ///
    /// `Failed` increments `retries` and clears `expires_at`; `Succeeded` sets
    /// `expires_at` to now plus the retention window. Returns `false` if no
    /// row has that id.
    async fn change_publish_state(&self, id: i64, status: StatusName) -> Result<bool>;

    /// Atomically move an inbox row to `status`. Same rules as
    /// [`DataStorage::change_publish_state`].
    async fn change_receive_state(&self, id: i64, status: StatusName) -> Result<bool>;

    /// Rows below the retry ceiling, older than the minimum age, in
    /// `Scheduled` or `Failed`. Bounded by the configured batch size.
    async fn get_messages_needing_retry(&self, kind: MessageType) -> Result<Vec<MediumMessage>>;

    /// Delete at most `batch_size` rows whose `expires_at` is before `cutoff`.
    async fn delete_expired(
        &self,
        kind: MessageType,
        cutoff: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<u64>;
}

// ============================================================================
// Options
// ============================================================================

/// Retry and retention parameters every store applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageOptions {
    /// Retry ceiling: rows with `retries >= failed_retry_count` are never retried.
    pub failed_retry_count: u32,
    /// Rows younger than this are left to the happy path.
    pub retry_min_age: Duration,
    /// Maximum rows returned by one retry query.
    pub retry_batch_size: u32,
    /// Retention of `Succeeded` rows before the collector may delete them.
    pub succeed_expired_after: Duration,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            failed_retry_count: 50,
            retry_min_age: Duration::from_secs(10),
            retry_batch_size: 200,
            succeed_expired_after: Duration::from_secs(24 * 3600),
        }
    }
}

impl StorageOptions {
    pub(crate) fn retry_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::from_std(self.retry_min_age).unwrap_or(chrono::Duration::zero())
    }

    pub(crate) fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.succeed_expired_after)
            .unwrap_or(chrono::Duration::days(1))
    }
}

/// Parse the published row id out of a message's `MessageId` header.
pub(crate) fn published_id(message: &Message) -> Result<i64> {
    message
        .id()
        .parse()
        .map_err(|_| StorageError::InvalidMessageId(message.id().to_string()))
}

// ============================================================================
// Configuration
// ============================================================================

/// Storage type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// In-process store; lost on restart.
    #[default]
    Memory,
    /// SQLite file (or in-memory database when no path is given).
    Sqlite,
}

/// SQLite-specific configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Database file path. `None` uses an in-memory database.
    pub path: Option<String>,
}

/// Storage configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage type discriminator.
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// SQLite-specific configuration.
    pub sqlite: SqliteConfig,
}

/// Initialize storage based on configuration.
pub async fn init_storage(
    config: &StorageConfig,
    options: StorageOptions,
) -> Result<Arc<dyn DataStorage>> {
    match config.storage_type {
        StorageType::Memory => {
            info!(storage_type = "memory", "Storage initialized");
            Ok(Arc::new(InMemoryStorage::new(options)))
        }
        StorageType::Sqlite => {
            #[cfg(feature = "sqlite")]
            {
                let storage = match &config.sqlite.path {
                    Some(path) => {
                        if let Some(parent) = std::path::Path::new(path).parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        let pool =
                            sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", path)).await?;
                        SqliteStorage::new(pool, options)
                    }
                    None => {
                        // Every connection to :memory: is a separate database.
                        let pool = sqlx::sqlite::SqlitePoolOptions::new()
                            .max_connections(1)
                            .connect("sqlite::memory:")
                            .await?;
                        SqliteStorage::new(pool, options)
                    }
                };
                storage.init().await?;
                info!(storage_type = "sqlite", path = ?config.sqlite.path, "Storage initialized");
                Ok(Arc::new(storage))
            }

            #[cfg(not(feature = "sqlite"))]
            {
                let _ = options;
                Err(StorageError::UnknownType(
                    "sqlite (rebuild with --features sqlite)".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_options_default() {
        let options = StorageOptions::default();
        assert_eq!(options.failed_retry_count, 50);
        assert_eq!(options.retry_min_age, Duration::from_secs(10));
        assert_eq!(options.retry_batch_size, 200);
    }

    #[test]
    fn test_retry_cutoff_subtracts_min_age() {
        let options = StorageOptions {
            retry_min_age: Duration::from_secs(4),
            ..Default::default()
        };
        let now = Utc::now();
        assert_eq!(now - options.retry_cutoff(now), chrono::Duration::seconds(4));
    }

    #[test]
    fn test_status_counts_ignore_processing() {
        let mut counts = StatusCounts::default();
        counts.bump(StatusName::Failed);
        counts.bump(StatusName::Processing);
        counts.bump(StatusName::Succeeded);
        assert_eq!(
            counts,
            StatusCounts {
                scheduled: 0,
                succeeded: 1,
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn test_init_memory_storage() {
        let storage = init_storage(&StorageConfig::default(), StorageOptions::default())
            .await
            .unwrap();
        assert_eq!(storage.statistics().await.unwrap(), Statistics::default());
    }
}
