//! DataStorage interface tests.
//!
//! These tests verify the contract of the DataStorage trait. Every store
//! under test must be created with [`contract_options`].

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use carrier::message::{headers, Message, MessageType, StatusName};
use carrier::storage::{DataStorage, StorageError, StorageOptions};

/// Options the contract assumes: a low retry ceiling, no minimum age, small
/// retry batches and immediate expiry of succeeded rows.
pub fn contract_options() -> StorageOptions {
    StorageOptions {
        failed_retry_count: 3,
        retry_min_age: Duration::ZERO,
        retry_batch_size: 2,
        succeed_expired_after: Duration::ZERO,
    }
}

/// Create a test message with the given id and name.
pub fn make_message(id: i64, name: &str) -> Message {
    let mut h = BTreeMap::new();
    h.insert(headers::MESSAGE_ID.to_string(), id.to_string());
    h.insert(headers::MESSAGE_NAME.to_string(), name.to_string());
    h.insert(headers::CORRELATION_ID.to_string(), id.to_string());
    h.insert(headers::CORRELATION_SEQUENCE.to_string(), "0".to_string());
    Message::new(h, Some(json!({"order": id, "lines": ["a", "b"]})))
}

/// Let the clock pass the `added` timestamp of rows just written.
async fn tick() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

// =============================================================================
// store_message / store_received_message
// =============================================================================

pub async fn test_store_message_is_scheduled<S: DataStorage>(store: &S) {
    let message = make_message(101, "orders.created");
    let stored = store
        .store_message("orders.created", &message, None)
        .await
        .expect("store should succeed");

    assert_eq!(stored.id, 101);
    assert_eq!(stored.status, StatusName::Scheduled);
    assert_eq!(stored.retries, 0);
    assert!(stored.expires_at.is_none());

    let fetched = store
        .get_message(MessageType::Publish, 101)
        .await
        .expect("get should succeed")
        .expect("row should exist");
    assert_eq!(fetched.origin, message, "content should rehydrate the message");
    assert_eq!(fetched.status, StatusName::Scheduled);
}

pub async fn test_store_message_rejects_non_numeric_id<S: DataStorage>(store: &S) {
    let mut message = make_message(1, "orders.created");
    message
        .headers
        .insert(headers::MESSAGE_ID.to_string(), "not-a-number".to_string());

    let result = store.store_message("orders.created", &message, None).await;
    assert!(matches!(result, Err(StorageError::InvalidMessageId(_))));
}

pub async fn test_store_received_records_group<S: DataStorage>(store: &S) {
    let message = make_message(202, "orders.created");
    let first = store
        .store_received_message("orders.created", "billing.v1", &message)
        .await
        .expect("store should succeed");
    let second = store
        .store_received_message("orders.created", "billing.v1", &message)
        .await
        .expect("duplicate delivery should be stored again");

    assert_ne!(first.id, second.id, "inbox ids are generated per delivery");
    assert_eq!(first.status, StatusName::Scheduled);

    let fetched = store
        .get_message(MessageType::Receive, first.id)
        .await
        .expect("get should succeed")
        .expect("row should exist");
    assert_eq!(fetched.origin.group(), Some("billing.v1"));
    assert_eq!(fetched.origin.body, message.body);
}

// =============================================================================
// change_*_state
// =============================================================================

pub async fn test_failed_increments_retries<S: DataStorage>(store: &S) {
    store
        .store_message("t", &make_message(301, "t"), None)
        .await
        .expect("store should succeed");

    for expected in 1..=2 {
        assert!(store
            .change_publish_state(301, StatusName::Failed)
            .await
            .expect("change should succeed"));
        let row = store
            .get_message(MessageType::Publish, 301)
            .await
            .expect("get should succeed")
            .expect("row should exist");
        assert_eq!(row.retries, expected);
        assert_eq!(row.status, StatusName::Failed);
    }
}

pub async fn test_succeeded_twice_is_idempotent<S: DataStorage>(store: &S) {
    store
        .store_message("t", &make_message(311, "t"), None)
        .await
        .expect("store should succeed");
    store
        .change_publish_state(311, StatusName::Failed)
        .await
        .expect("change should succeed");

    for _ in 0..2 {
        assert!(store
            .change_publish_state(311, StatusName::Succeeded)
            .await
            .expect("change should succeed"));
        let row = store
            .get_message(MessageType::Publish, 311)
            .await
            .expect("get should succeed")
            .expect("row should exist");
        assert_eq!(row.status, StatusName::Succeeded);
        assert_eq!(row.retries, 1);
        assert!(row.expires_at.is_some());
    }
    assert_eq!(store.options().failed_retry_count, contract_options().failed_retry_count);
}

pub async fn test_succeeded_sets_expiry_and_failed_clears_it<S: DataStorage>(store: &S) {
    let row = store
        .store_received_message("t", "g.v1", &make_message(1, "t"))
        .await
        .expect("store should succeed");

    store
        .change_receive_state(row.id, StatusName::Succeeded)
        .await
        .expect("change should succeed");
    let succeeded = store
        .get_message(MessageType::Receive, row.id)
        .await
        .expect("get should succeed")
        .expect("row should exist");
    assert!(succeeded.expires_at.is_some());
    assert_eq!(succeeded.retries, 0);

    store
        .change_receive_state(row.id, StatusName::Failed)
        .await
        .expect("change should succeed");
    let failed = store
        .get_message(MessageType::Receive, row.id)
        .await
        .expect("get should succeed")
        .expect("row should exist");
    assert!(failed.expires_at.is_none());
    assert_eq!(failed.retries, 1);
}

pub async fn test_processing_is_never_persisted<S: DataStorage>(store: &S) {
    store
        .store_message("t", &make_message(401, "t"), None)
        .await
        .expect("store should succeed");

    let result = store
        .change_publish_state(401, StatusName::Processing)
        .await;
    assert!(matches!(result, Err(StorageError::TransientStatus(_))));

    let row = store
        .get_message(MessageType::Publish, 401)
        .await
        .expect("get should succeed")
        .expect("row should exist");
    assert_eq!(row.status, StatusName::Scheduled);
}

pub async fn test_change_state_unknown_id<S: DataStorage>(store: &S) {
    let changed = store
        .change_publish_state(999_999, StatusName::Succeeded)
        .await
        .expect("change should succeed");
    assert!(!changed);
}

// =============================================================================
// get_messages_needing_retry
// =============================================================================

pub async fn test_retry_eligibility<S: DataStorage>(store: &S) {
    for id in [501, 502, 503] {
        store
            .store_message("t", &make_message(id, "t"), None)
            .await
            .expect("store should succeed");
    }
    // 501 stays Scheduled, 502 succeeds, 503 exhausts the ceiling of 3.
    store
        .change_publish_state(502, StatusName::Succeeded)
        .await
        .expect("change should succeed");
    for _ in 0..3 {
        store
            .change_publish_state(503, StatusName::Failed)
            .await
            .expect("change should succeed");
    }
    tick().await;

    let ids: Vec<i64> = store
        .get_messages_needing_retry(MessageType::Publish)
        .await
        .expect("query should succeed")
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec![501]);
}

pub async fn test_retry_includes_failed_below_ceiling<S: DataStorage>(store: &S) {
    let row = store
        .store_received_message("t", "g.v1", &make_message(1, "t"))
        .await
        .expect("store should succeed");
    for _ in 0..2 {
        store
            .change_receive_state(row.id, StatusName::Failed)
            .await
            .expect("change should succeed");
    }
    tick().await;

    let rows = store
        .get_messages_needing_retry(MessageType::Receive)
        .await
        .expect("query should succeed");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, row.id);
    assert_eq!(rows[0].retries, 2);
    assert_eq!(rows[0].origin.name(), "t", "retried rows rehydrate from content");
}

pub async fn test_retry_respects_batch_size<S: DataStorage>(store: &S) {
    for id in 601..=605 {
        store
            .store_message("t", &make_message(id, "t"), None)
            .await
            .expect("store should succeed");
    }
    tick().await;

    let rows = store
        .get_messages_needing_retry(MessageType::Publish)
        .await
        .expect("query should succeed");
    assert_eq!(rows.len(), 2);
}

// =============================================================================
// delete_expired
// =============================================================================

pub async fn test_delete_expired_in_batches<S: DataStorage>(store: &S) {
    for id in 701..=703 {
        store
            .store_message("t", &make_message(id, "t"), None)
            .await
            .expect("store should succeed");
        store
            .change_publish_state(id, StatusName::Succeeded)
            .await
            .expect("change should succeed");
    }
    store
        .store_message("t", &make_message(704, "t"), None)
        .await
        .expect("store should succeed");
    tick().await;

    let now = Utc::now();
    let first = store
        .delete_expired(MessageType::Publish, now, 2)
        .await
        .expect("delete should succeed");
    let second = store
        .delete_expired(MessageType::Publish, now, 2)
        .await
        .expect("delete should succeed");
    let third = store
        .delete_expired(MessageType::Publish, now, 2)
        .await
        .expect("delete should succeed");
    assert_eq!((first, second, third), (2, 1, 0));

    assert!(store
        .get_message(MessageType::Publish, 704)
        .await
        .expect("get should succeed")
        .is_some(), "rows without expiry are kept");
}

pub async fn test_delete_expired_respects_cutoff<S: DataStorage>(store: &S) {
    let cutoff = Utc::now() - chrono::Duration::hours(1);
    store
        .store_message("t", &make_message(801, "t"), None)
        .await
        .expect("store should succeed");
    store
        .change_publish_state(801, StatusName::Succeeded)
        .await
        .expect("change should succeed");

    let deleted = store
        .delete_expired(MessageType::Publish, cutoff, 100)
        .await
        .expect("delete should succeed");
    assert_eq!(deleted, 0);
}

// =============================================================================
// Transactions
// =============================================================================

pub async fn test_transaction_commit_makes_row_visible<S: DataStorage>(store: &S) {
    let mut txn = store.begin_transaction().await.expect("begin should succeed");
    store
        .store_message("t", &make_message(901, "t"), Some(txn.as_mut()))
        .await
        .expect("store should succeed");
    txn.commit().await.expect("commit should succeed");

    assert!(store
        .get_message(MessageType::Publish, 901)
        .await
        .expect("get should succeed")
        .is_some());
}

pub async fn test_transaction_rollback_discards_row<S: DataStorage>(store: &S) {
    let mut txn = store.begin_transaction().await.expect("begin should succeed");
    store
        .store_message("t", &make_message(902, "t"), Some(txn.as_mut()))
        .await
        .expect("store should succeed");
    txn.rollback().await.expect("rollback should succeed");

    assert!(store
        .get_message(MessageType::Publish, 902)
        .await
        .expect("get should succeed")
        .is_none());
}

// =============================================================================
// MonitoringApi
// =============================================================================

pub async fn test_statistics_and_listing<S: DataStorage>(store: &S) {
    for id in [1001, 1002, 1003] {
        store
            .store_message("t", &make_message(id, "t"), None)
            .await
            .expect("store should succeed");
    }
    store
        .change_publish_state(1002, StatusName::Succeeded)
        .await
        .expect("change should succeed");
    store
        .change_publish_state(1003, StatusName::Failed)
        .await
        .expect("change should succeed");
    store
        .store_received_message("t", "g.v1", &make_message(1, "t"))
        .await
        .expect("store should succeed");

    let stats = store.statistics().await.expect("statistics should succeed");
    assert_eq!(
        (stats.published.scheduled, stats.published.succeeded, stats.published.failed),
        (1, 1, 1)
    );
    assert_eq!(stats.received.scheduled, 1);

    let failed = store
        .get_messages_by_status(MessageType::Publish, StatusName::Failed, 10)
        .await
        .expect("listing should succeed");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, 1003);
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run all DataStorage interface tests. `$make` is evaluated once per test
/// and must yield a fresh store built with `contract_options()`.
#[macro_export]
macro_rules! run_storage_tests {
    ($make:expr) => {
        use $crate::storage::data_storage_tests::*;

        test_store_message_is_scheduled(&$make).await;
        println!("  test_store_message_is_scheduled: PASSED");

        test_store_message_rejects_non_numeric_id(&$make).await;
        println!("  test_store_message_rejects_non_numeric_id: PASSED");

        test_store_received_records_group(&$make).await;
        println!("  test_store_received_records_group: PASSED");

        test_failed_increments_retries(&$make).await;
        println!("  test_failed_increments_retries: PASSED");

        test_succeeded_twice_is_idempotent(&$make).await;
        println!("  test_succeeded_twice_is_idempotent: PASSED");

        test_succeeded_sets_expiry_and_failed_clears_it(&$make).await;
        println!("  test_succeeded_sets_expiry_and_failed_clears_it: PASSED");

        test_processing_is_never_persisted(&$make).await;
        println!("  test_processing_is_never_persisted: PASSED");

        test_change_state_unknown_id(&$make).await;
        println!("  test_change_state_unknown_id: PASSED");

        test_retry_eligibility(&$make).await;
        println!("  test_retry_eligibility: PASSED");

        test_retry_includes_failed_below_ceiling(&$make).await;
        println!("  test_retry_includes_failed_below_ceiling: PASSED");

        test_retry_respects_batch_size(&$make).await;
        println!("  test_retry_respects_batch_size: PASSED");

        test_delete_expired_in_batches(&$make).await;
        println!("  test_delete_expired_in_batches: PASSED");

        test_delete_expired_respects_cutoff(&$make).await;
        println!("  test_delete_expired_respects_cutoff: PASSED");

        test_transaction_commit_makes_row_visible(&$make).await;
        println!("  test_transaction_commit_makes_row_visible: PASSED");

        test_transaction_rollback_discards_row(&$make).await;
        println!("  test_transaction_rollback_discards_row: PASSED");

        test_statistics_and_listing(&$make).await;
        println!("  test_statistics_and_listing: PASSED");
    };
}
