//! Integration tests for `PgChangeStore` and `PgSnapshotStore`.
//!
//! These need a `PostgreSQL` server reachable through `DATABASE_URL`; run them
//! with `cargo test -- --ignored`.

use std::sync::Arc;

use cairn_core::error::DomainError;
use cairn_core::snapshot::Snapshot;
use cairn_core::store::{ChangeStore, SnapshotStore, StoredChange};
use cairn_store::{PgChangeStore, PgSnapshotStore};
use cairn_test_support::{ManualClock, fixed_time};
use chrono::TimeDelta;
use sqlx::PgPool;
use uuid::Uuid;

/// Helper to build a `StoredChange` with sensible defaults.
fn make_change(aggregate_id: Uuid, sequence_number: i64) -> StoredChange {
    StoredChange {
        change_id: Uuid::new_v4(),
        aggregate_id,
        aggregate_type: "ledger".to_owned(),
        root_id: None,
        change_type: "ledger.deposited".to_owned(),
        payload: serde_json::json!({"type": "Deposited", "amount": sequence_number}),
        sequence_number,
        correlation_id: Uuid::new_v4(),
        causation_id: Uuid::new_v4(),
        occurred_at: fixed_time(),
    }
}

fn make_snapshot(aggregate_id: Uuid, version: i64) -> Snapshot {
    Snapshot {
        aggregate_id,
        aggregate_type: "ledger".to_owned(),
        root_id: None,
        aggregate_version: version,
        state: format!("{{\"balance\":{version}}}").into_bytes(),
        taken_at: fixed_time(),
    }
}

// --- get_changes ---

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_get_changes_returns_empty_vec_for_unknown_aggregate(pool: PgPool) {
    let store = PgChangeStore::new(pool);

    let changes = store.get_changes(Uuid::new_v4(), 0).await.unwrap();

    assert!(changes.is_empty());
}

// --- append + get_changes round trip ---

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_append_and_load_preserves_every_field(pool: PgPool) {
    // Arrange
    let store = PgChangeStore::new(pool);
    let aggregate_id = Uuid::new_v4();
    let mut change = make_change(aggregate_id, 1);
    change.root_id = Some(Uuid::new_v4());
    let expected = change.clone();

    // Act
    let committed = store.append(aggregate_id, vec![change], Some(0)).await.unwrap();

    // Assert
    assert_eq!(committed, vec![expected.clone()]);
    let loaded = store.get_changes(aggregate_id, 0).await.unwrap();
    assert_eq!(loaded, vec![expected]);
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_get_changes_filters_by_min_version_in_order(pool: PgPool) {
    let store = PgChangeStore::new(pool);
    let aggregate_id = Uuid::new_v4();
    let changes = (1..=4).map(|n| make_change(aggregate_id, n)).collect();
    store.append(aggregate_id, changes, None).await.unwrap();

    let loaded = store.get_changes(aggregate_id, 2).await.unwrap();

    let sequence: Vec<i64> = loaded.iter().map(|c| c.sequence_number).collect();
    assert_eq!(sequence, vec![3, 4]);
}

// --- concurrency ---

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_stale_expected_version_is_concurrency_conflict(pool: PgPool) {
    let store = PgChangeStore::new(pool);
    let aggregate_id = Uuid::new_v4();
    store
        .append(aggregate_id, vec![make_change(aggregate_id, 1)], Some(0))
        .await
        .unwrap();

    let result = store
        .append(aggregate_id, vec![make_change(aggregate_id, 2)], Some(0))
        .await;

    match result {
        Err(DomainError::ConcurrencyConflict {
            aggregate_id: id,
            expected,
            actual,
        }) => {
            assert_eq!(id, aggregate_id);
            assert_eq!(expected, 0);
            assert_eq!(actual, 1);
        }
        other => panic!("expected ConcurrencyConflict, got {other:?}"),
    }
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_duplicate_sequence_number_is_concurrency_conflict(pool: PgPool) {
    let store = PgChangeStore::new(pool);
    let aggregate_id = Uuid::new_v4();
    store
        .append(aggregate_id, vec![make_change(aggregate_id, 1)], None)
        .await
        .unwrap();

    let result = store
        .append(aggregate_id, vec![make_change(aggregate_id, 1)], None)
        .await;

    assert!(matches!(result, Err(DomainError::ConcurrencyConflict { .. })));
    assert_eq!(store.get_changes(aggregate_id, 0).await.unwrap().len(), 1);
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_append_empty_batch_is_noop(pool: PgPool) {
    let store = PgChangeStore::new(pool);
    let aggregate_id = Uuid::new_v4();

    let committed = store.append(aggregate_id, Vec::new(), Some(3)).await.unwrap();

    assert!(committed.is_empty());
    assert!(!store.exists(aggregate_id).await.unwrap());
}

// --- boxing ---

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_boxed_stream_is_hidden_and_rejects_appends(pool: PgPool) {
    let store = PgChangeStore::new(pool);
    let aggregate_id = Uuid::new_v4();
    let changes = (1..=2).map(|n| make_change(aggregate_id, n)).collect();
    store.append(aggregate_id, changes, None).await.unwrap();

    assert!(!store.is_boxed(aggregate_id).await.unwrap());

    store.box_changes(aggregate_id, true).await.unwrap();

    assert!(store.is_boxed(aggregate_id).await.unwrap());
    assert!(!store.exists(aggregate_id).await.unwrap());
    assert!(store.get_changes(aggregate_id, 0).await.unwrap().is_empty());
    let result = store
        .append(aggregate_id, vec![make_change(aggregate_id, 3)], None)
        .await;
    assert!(matches!(result, Err(DomainError::Validation(_))));
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_reopened_stream_starts_fresh_chain(pool: PgPool) {
    let store = PgChangeStore::new(pool);
    let aggregate_id = Uuid::new_v4();
    let changes = (1..=3).map(|n| make_change(aggregate_id, n)).collect();
    store.append(aggregate_id, changes, None).await.unwrap();
    store.box_changes(aggregate_id, true).await.unwrap();

    store.box_changes(aggregate_id, false).await.unwrap();
    let committed = store
        .append(aggregate_id, vec![make_change(aggregate_id, 2)], Some(1))
        .await
        .unwrap();

    assert_eq!(committed.len(), 1);
    let loaded = store.get_changes(aggregate_id, 1).await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].sequence_number, 2);
}

// --- expiry ---

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_get_expired_uses_last_activity(pool: PgPool) {
    // Arrange
    let clock = Arc::new(ManualClock::new(fixed_time()));
    let store = PgChangeStore::new(pool)
        .with_clock(clock)
        .with_ttl(TimeDelta::seconds(300));
    let aggregate_id = Uuid::new_v4();
    store
        .append(aggregate_id, vec![make_change(aggregate_id, 1)], None)
        .await
        .unwrap();

    // Act / Assert
    let before = fixed_time() + TimeDelta::seconds(299);
    assert!(store.get_expired("ledger", before).await.unwrap().is_empty());

    let after = fixed_time() + TimeDelta::seconds(301);
    assert_eq!(store.get_expired("ledger", after).await.unwrap(), vec![aggregate_id]);
    assert!(store.get_expired("other", after).await.unwrap().is_empty());
}

// --- snapshots ---

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_snapshot_store_returns_latest_and_counts(pool: PgPool) {
    let store = PgSnapshotStore::new(pool);
    let aggregate_id = Uuid::new_v4();

    store.save(make_snapshot(aggregate_id, 2)).await.unwrap();
    store.save(make_snapshot(aggregate_id, 4)).await.unwrap();

    let latest = store.get(aggregate_id).await.unwrap().unwrap();
    assert_eq!(latest, make_snapshot(aggregate_id, 4));
    assert_eq!(store.count(aggregate_id).await.unwrap(), 2);
    assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_snapshot_box_and_unbox(pool: PgPool) {
    let store = PgSnapshotStore::new(pool);
    let aggregate_id = Uuid::new_v4();
    store.save(make_snapshot(aggregate_id, 3)).await.unwrap();

    store.box_snapshot(aggregate_id).await.unwrap();
    assert!(store.get(aggregate_id).await.unwrap().is_none());

    let boxed = store.get_boxed(aggregate_id).await.unwrap().unwrap();
    assert_eq!(boxed, make_snapshot(aggregate_id, 3));
    assert_eq!(store.get_boxed(aggregate_id).await.unwrap(), Some(boxed));

    store.unbox_snapshot(aggregate_id).await.unwrap();
    assert!(store.get_boxed(aggregate_id).await.unwrap().is_none());
    assert_eq!(store.get(aggregate_id).await.unwrap(), Some(make_snapshot(aggregate_id, 3)));
    store.unbox_snapshot(aggregate_id).await.unwrap();
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_migrate_is_idempotent(pool: PgPool) {
    let changes = PgChangeStore::new(pool.clone());
    let snapshots = PgSnapshotStore::new(pool);

    changes.migrate().await.unwrap();
    changes.migrate().await.unwrap();
    snapshots.migrate().await.unwrap();
}
