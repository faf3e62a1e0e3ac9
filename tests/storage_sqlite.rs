//! SQLite storage integration tests.
//!
//! Run with: cargo test --test storage_sqlite --features sqlite
//!
//! Contract tests use a fresh in-memory database per test; the transaction
//! and restart tests use a database file in a temporary directory.

mod storage;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use carrier::message::{MessageType, StatusName};
use carrier::storage::{DataStorage, MonitoringApi, SqliteStorage, SqliteTransaction};

use storage::data_storage_tests::{contract_options, make_message};

/// A store on its own in-memory database.
async fn sqlite_store() -> SqliteStorage {
    // Every connection to :memory: is a separate database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to connect to SQLite");
    let store = SqliteStorage::new(pool, contract_options());
    store.init().await.expect("Failed to create schema");
    store
}

async fn file_pool(dir: &tempfile::TempDir) -> SqlitePool {
    let path = dir.path().join("carrier.db");
    SqlitePool::connect(&format!("sqlite:{}?mode=rwc", path.display()))
        .await
        .expect("Failed to open SQLite file")
}

async fn create_orders(pool: &SqlitePool) {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS orders (id INTEGER PRIMARY KEY, total INTEGER NOT NULL)",
    )
    .execute(pool)
    .await
    .expect("Failed to create orders table");
}

async fn order_count(pool: &SqlitePool) -> i64 {
    sqlx::query("SELECT COUNT(*) AS n FROM orders")
        .fetch_one(pool)
        .await
        .expect("count should succeed")
        .get("n")
}

#[tokio::test]
async fn test_sqlite_data_storage() {
    println!("=== SQLite DataStorage Tests ===");

    run_storage_tests!(sqlite_store().await);

    println!("=== All SQLite DataStorage tests PASSED ===");
}

#[tokio::test]
async fn test_business_write_and_outbox_commit_together() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = file_pool(&dir).await;
    let store = SqliteStorage::new(pool.clone(), contract_options());
    store.init().await.expect("init");
    create_orders(&pool).await;

    let mut txn = store.begin_transaction().await.expect("begin");
    {
        let sqlite = SqliteTransaction::from_handle(txn.as_mut()).expect("sqlite transaction");
        sqlx::query("INSERT INTO orders (id, total) VALUES (1, 250)")
            .execute(sqlite.connection())
            .await
            .expect("business insert");
    }
    store
        .store_message(
            "orders.created",
            &make_message(1, "orders.created"),
            Some(txn.as_mut()),
        )
        .await
        .expect("outbox insert");
    txn.commit().await.expect("commit");

    assert_eq!(order_count(&pool).await, 1);
    let row = store
        .get_message(MessageType::Publish, 1)
        .await
        .expect("get")
        .expect("outbox row committed with the order");
    assert_eq!(row.status, StatusName::Scheduled);
}

#[tokio::test]
async fn test_business_write_and_outbox_roll_back_together() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = file_pool(&dir).await;
    let store = SqliteStorage::new(pool.clone(), contract_options());
    store.init().await.expect("init");
    create_orders(&pool).await;

    let mut txn = store.begin_transaction().await.expect("begin");
    {
        let sqlite = SqliteTransaction::from_handle(txn.as_mut()).expect("sqlite transaction");
        sqlx::query("INSERT INTO orders (id, total) VALUES (2, 99)")
            .execute(sqlite.connection())
            .await
            .expect("business insert");
    }
    store
        .store_message(
            "orders.created",
            &make_message(2, "orders.created"),
            Some(txn.as_mut()),
        )
        .await
        .expect("outbox insert");
    txn.rollback().await.expect("rollback");

    assert_eq!(order_count(&pool).await, 0);
    assert!(store
        .get_message(MessageType::Publish, 2)
        .await
        .expect("get")
        .is_none());
}

#[tokio::test]
async fn test_foreign_transaction_handle_is_rejected() {
    let store = sqlite_store().await;
    let memory = carrier::storage::InMemoryStorage::default();
    let mut foreign = memory.begin_transaction().await.expect("begin");

    let result = store
        .store_message("t", &make_message(3, "t"), Some(foreign.as_mut()))
        .await;
    assert!(matches!(
        result,
        Err(carrier::storage::StorageError::TransactionMismatch { expected: "sqlite" })
    ));
}

#[tokio::test]
async fn test_rows_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let pool = file_pool(&dir).await;
        let store = SqliteStorage::new(pool.clone(), contract_options());
        store.init().await.expect("init");
        store
            .store_message("t", &make_message(4, "t"), None)
            .await
            .expect("store");
        store
            .change_publish_state(4, StatusName::Failed)
            .await
            .expect("change");
        pool.close().await;
    }

    let store = SqliteStorage::new(file_pool(&dir).await, contract_options());
    store.init().await.expect("init is idempotent");
    let row = store
        .get_message(MessageType::Publish, 4)
        .await
        .expect("get")
        .expect("row survives restart");
    assert_eq!(row.status, StatusName::Failed);
    assert_eq!(row.retries, 1);
    assert_eq!(store.statistics().await.expect("stats").published.failed, 1);
}
