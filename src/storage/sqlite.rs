//! SQLite implementation of the outbox/inbox store.
//!
//! Two tables, `published` and `received`. Timestamps are stored as RFC 3339
//! text with millisecond precision and a `Z` suffix, so they compare
//! correctly as strings.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sea_query::{ColumnDef, Expr, Func, Iden, Index, Order, Query, SqliteQueryBuilder, Table};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use super::{
    published_id, DataStorage, MonitoringApi, Result, Statistics, StorageError, StorageOptions,
    StorageTransaction,
};
use crate::message::{headers, MediumMessage, Message, MessageType, StatusName, UnknownStatus};
use crate::serializer::{JsonSerializer, Serializer};
use crate::utils::snowflake::SnowflakeId;

// ============================================================================
// Schema
// ============================================================================

/// Columns shared by both tables.
#[derive(Iden, Clone, Copy)]
enum Col {
    #[iden = "id"]
    Id,
    #[iden = "name"]
    Name,
    #[iden = "group_name"]
    GroupName,
    #[iden = "content"]
    Content,
    #[iden = "retries"]
    Retries,
    #[iden = "added"]
    Added,
    #[iden = "expires_at"]
    ExpiresAt,
    #[iden = "status"]
    Status,
}

#[derive(Iden, Clone, Copy)]
enum Tables {
    #[iden = "published"]
    Published,
    #[iden = "received"]
    Received,
}

fn table_for(kind: MessageType) -> Tables {
    match kind {
        MessageType::Publish => Tables::Published,
        MessageType::Receive => Tables::Received,
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidRow(format!("bad timestamp {:?}: {}", value, e)))
}

// ============================================================================
// Transaction
// ============================================================================

/// A sqlx transaction the host shares between its business writes and the
/// outbox insert.
pub struct SqliteTransaction {
    tx: sqlx::Transaction<'static, Sqlite>,
}

impl SqliteTransaction {
    /// Connection to run business statements on inside the transaction.
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    /// Reach the concrete transaction behind a storage handle.
    pub fn from_handle(handle: &mut dyn StorageTransaction) -> Option<&mut SqliteTransaction> {
        handle.as_any_mut().downcast_mut::<SqliteTransaction>()
    }
}

#[async_trait]
impl StorageTransaction for SqliteTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ============================================================================
// Store
// ============================================================================

/// SQLite implementation of [`DataStorage`].
pub struct SqliteStorage {
    pool: SqlitePool,
    options: StorageOptions,
    serializer: Arc<dyn Serializer>,
    ids: Arc<SnowflakeId>,
}

impl SqliteStorage {
    /// Create a new SQLite store. Call [`SqliteStorage::init`] before use.
    pub fn new(pool: SqlitePool, options: StorageOptions) -> Self {
        Self {
            pool,
            options,
            serializer: Arc::new(JsonSerializer),
            ids: Arc::new(SnowflakeId::default()),
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

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Initialize the outbox and inbox schema.
    pub async fn init(&self) -> Result<()> {
        for kind in [MessageType::Publish, MessageType::Receive] {
            let mut create = Table::create();
            create
                .table(table_for(kind))
                .if_not_exists()
                .col(ColumnDef::new(Col::Id).big_integer().not_null().primary_key())
                .col(ColumnDef::new(Col::Name).text().not_null());
            if kind == MessageType::Receive {
                create.col(ColumnDef::new(Col::GroupName).text().not_null());
            }
            create
                .col(ColumnDef::new(Col::Content).text().not_null())
                .col(ColumnDef::new(Col::Retries).integer().not_null().default(0))
                .col(ColumnDef::new(Col::Added).text().not_null())
                .col(ColumnDef::new(Col::ExpiresAt).text().null())
                .col(ColumnDef::new(Col::Status).text().not_null());
            sqlx::query(&create.to_string(SqliteQueryBuilder))
                .execute(&self.pool)
                .await?;

            // Index for retry queries
            let retry_index = Index::create()
                .if_not_exists()
                .name(format!("idx_{}_retry", kind.as_str()))
                .table(table_for(kind))
                .col(Col::Status)
                .col(Col::Added)
                .to_string(SqliteQueryBuilder);
            sqlx::query(&retry_index).execute(&self.pool).await?;

            // Index for expiry sweeps
            let expiry_index = Index::create()
                .if_not_exists()
                .name(format!("idx_{}_expires_at", kind.as_str()))
                .table(table_for(kind))
                .col(Col::ExpiresAt)
                .to_string(SqliteQueryBuilder);
            sqlx::query(&expiry_index).execute(&self.pool).await?;
        }

        info!("Outbox and inbox tables initialized (SQLite)");
        Ok(())
    }

    fn row_to_message(&self, row: &SqliteRow) -> Result<MediumMessage> {
        let content: String = row.try_get("content")?;
        let status: String = row.try_get("status")?;
        let added: String = row.try_get("added")?;
        let expires_at: Option<String> = row.try_get("expires_at")?;
        let retries: i64 = row.try_get("retries")?;

        Ok(MediumMessage {
            id: row.try_get("id")?,
            origin: self.serializer.deserialize_content(&content)?,
            content,
            added: parse_ts(&added)?,
            expires_at: expires_at.as_deref().map(parse_ts).transpose()?,
            retries: u32::try_from(retries)
                .map_err(|_| StorageError::InvalidRow(format!("bad retries {}", retries)))?,
            status: status
                .parse()
                .map_err(|e: UnknownStatus| StorageError::InvalidRow(e.to_string()))?,
        })
    }

    async fn insert(
        conn: &mut SqliteConnection,
        kind: MessageType,
        row: &MediumMessage,
        group: Option<&str>,
    ) -> Result<()> {
        let mut insert = Query::insert();
        insert.into_table(table_for(kind));
        match group {
            Some(group) => {
                insert
                    .columns([
                        Col::Id,
                        Col::Name,
                        Col::GroupName,
                        Col::Content,
                        Col::Retries,
                        Col::Added,
                        Col::Status,
                    ])
                    .values_panic([
                        row.id.into(),
                        row.name().into(),
                        group.into(),
                        row.content.clone().into(),
                        row.retries.into(),
                        format_ts(row.added).into(),
                        row.status.as_str().into(),
                    ]);
            }
            None => {
                insert
                    .columns([
                        Col::Id,
                        Col::Name,
                        Col::Content,
                        Col::Retries,
                        Col::Added,
                        Col::Status,
                    ])
                    .values_panic([
                        row.id.into(),
                        row.name().into(),
                        row.content.clone().into(),
                        row.retries.into(),
                        format_ts(row.added).into(),
                        row.status.as_str().into(),
                    ]);
            }
        }

        sqlx::query(&insert.to_string(SqliteQueryBuilder))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    fn new_row(&self, id: i64, message: &Message) -> Result<MediumMessage> {
        let now = Utc::now();
        Ok(MediumMessage {
            id,
            content: self.serializer.serialize_content(message)?,
            origin: message.clone(),
            // Truncate to what the column keeps so the returned row equals the stored one.
            added: parse_ts(&format_ts(now))?,
            expires_at: None,
            retries: 0,
            status: StatusName::Scheduled,
        })
    }

    async fn change_state(&self, kind: MessageType, id: i64, status: StatusName) -> Result<bool> {
        if !status.is_durable() {
            return Err(StorageError::TransientStatus(status));
        }

        let mut update = Query::update();
        update
            .table(table_for(kind))
            .value(Col::Status, status.as_str())
            .and_where(Expr::col(Col::Id).eq(id));

        match status {
            StatusName::Failed => {
                update
                    .value(Col::Retries, Expr::col(Col::Retries).add(1))
                    .value(Col::ExpiresAt, Option::<String>::None);
            }
            StatusName::Succeeded => {
                update.value(Col::ExpiresAt, format_ts(self.options.expires_at(Utc::now())));
            }
            StatusName::Scheduled | StatusName::Processing => {}
        }

        let result = sqlx::query(&update.to_string(SqliteQueryBuilder))
            .execute(&self.pool)
            .await?;
        debug!(kind = %kind, id = id, status = %status, "State changed");
        Ok(result.rows_affected() > 0)
    }

    fn select_columns(kind: MessageType) -> sea_query::SelectStatement {
        let mut select = Query::select();
        select
            .columns([
                Col::Id,
                Col::Content,
                Col::Retries,
                Col::Added,
                Col::ExpiresAt,
                Col::Status,
            ])
            .from(table_for(kind));
        select
    }
}

#[async_trait]
impl MonitoringApi for SqliteStorage {
    async fn get_message(&self, kind: MessageType, id: i64) -> Result<Option<MediumMessage>> {
        let query = Self::select_columns(kind)
            .and_where(Expr::col(Col::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(|r| self.row_to_message(r)).transpose()
    }

    async fn get_messages_by_status(
        &self,
        kind: MessageType,
        status: StatusName,
        limit: u32,
    ) -> Result<Vec<MediumMessage>> {
        let query = Self::select_columns(kind)
            .and_where(Expr::col(Col::Status).eq(status.as_str()))
            .order_by(Col::Id, Order::Asc)
            .limit(u64::from(limit))
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(|r| self.row_to_message(r)).collect()
    }

    async fn statistics(&self) -> Result<Statistics> {
        let mut stats = Statistics::default();
        for kind in [MessageType::Publish, MessageType::Receive] {
            let query = Query::select()
                .column(Col::Status)
                .expr(Func::count(Expr::col(Col::Id)))
                .from(table_for(kind))
                .group_by_col(Col::Status)
                .to_string(SqliteQueryBuilder);

            let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
            let counts = match kind {
                MessageType::Publish => &mut stats.published,
                MessageType::Receive => &mut stats.received,
            };
            for row in rows {
                let status: String = row.try_get(0)?;
                let count: i64 = row.try_get(1)?;
                let count = u64::try_from(count).unwrap_or_default();
                match status.parse::<StatusName>() {
                    Ok(StatusName::Scheduled) => counts.scheduled = count,
                    Ok(StatusName::Succeeded) => counts.succeeded = count,
                    Ok(StatusName::Failed) => counts.failed = count,
                    _ => {}
                }
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl DataStorage for SqliteStorage {
    fn options(&self) -> &StorageOptions {
        &self.options
    }

    async fn begin_transaction(&self) -> Result<Box<dyn StorageTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTransaction { tx }))
    }

    async fn store_message(
        &self,
        _name: &str,
        message: &Message,
        txn: Option<&mut dyn StorageTransaction>,
    ) -> Result<MediumMessage> {
        let row = self.new_row(published_id(message)?, message)?;

        match txn {
            Some(txn) => {
                let txn = SqliteTransaction::from_handle(txn)
                    .ok_or(StorageError::TransactionMismatch { expected: "sqlite" })?;
                Self::insert(&mut txn.tx, MessageType::Publish, &row, None).await?;
            }
            None => {
                let mut conn = self.pool.acquire().await?;
                Self::insert(&mut conn, MessageType::Publish, &row, None).await?;
            }
        }

        debug!(id = row.id, name = %row.name(), "Message written to outbox");
        Ok(row)
    }

    async fn store_received_message(
        &self,
        _name: &str,
        group: &str,
        message: &Message,
    ) -> Result<MediumMessage> {
        let mut message = message.clone();
        message
            .headers
            .insert(headers::GROUP.to_string(), group.to_string());
        let row = self.new_row(self.ids.next_id(), &message)?;

        let mut conn = self.pool.acquire().await?;
        Self::insert(&mut conn, MessageType::Receive, &row, Some(group)).await?;

        debug!(id = row.id, name = %row.name(), group = %group, "Message written to inbox");
        Ok(row)
    }

    async fn change_publish_state(&self, id: i64, status: StatusName) -> Result<bool> {
        self.change_state(MessageType::Publish, id, status).await
    }

    async fn change_receive_state(&self, id: i64, status: StatusName) -> Result<bool> {
        self.change_state(MessageType::Receive, id, status).await
    }

    async fn get_messages_needing_retry(&self, kind: MessageType) -> Result<Vec<MediumMessage>> {
        let cutoff = format_ts(self.options.retry_cutoff(Utc::now()));
        let query = Self::select_columns(kind)
            .and_where(Expr::col(Col::Retries).lt(self.options.failed_retry_count))
            .and_where(Expr::col(Col::Added).lt(cutoff))
            .and_where(Expr::col(Col::Status).is_in([
                StatusName::Scheduled.as_str(),
                StatusName::Failed.as_str(),
            ]))
            .order_by(Col::Id, Order::Asc)
            .limit(u64::from(self.options.retry_batch_size))
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(|r| self.row_to_message(r)).collect()
    }

    async fn delete_expired(
        &self,
        kind: MessageType,
        cutoff: DateTime<Utc>,
        batch_size: u32,
    ) -> Result<u64> {
        // SQLite has no DELETE ... LIMIT by default; bound through a subquery.
        let batch = Query::select()
            .column(Col::Id)
            .from(table_for(kind))
            .and_where(Expr::col(Col::ExpiresAt).is_not_null())
            .and_where(Expr::col(Col::ExpiresAt).lt(format_ts(cutoff)))
            .limit(u64::from(batch_size))
            .to_owned();

        let delete = Query::delete()
            .from_table(table_for(kind))
            .and_where(Expr::col(Col::Id).in_subquery(batch))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&delete).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
