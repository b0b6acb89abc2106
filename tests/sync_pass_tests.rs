//! Sync pass tests
//!
//! End-to-end passes against the in-memory remote covering:
//! - Round trip of a locally created record
//! - The offline create / connectivity restore scenario
//! - Single-flight passes
//! - Bounded retry and per-entity ordering
//! - Pull phase downloads and pagination

mod common;

use std::sync::Arc;
use std::time::Duration;

use classnotes_sync::sync::{DropReason, SyncEvent};
use classnotes_sync::{RemoteError, SyncOutcome, SyncState, SyncStatus};
use common::{collect_events, create_test_engine, lesson_entity, next_terminal};
use serde_json::json;

// ============================================================================
// Round trip
// ============================================================================

#[tokio::test]
async fn test_round_trip_create() {
    let engine = create_test_engine(true);
    let client = &engine.client;

    client
        .create("lesson", Some("X".into()), json!({"title": "Photosynthesis"}))
        .unwrap();
    assert_eq!(client.pending_operations().len(), 1);

    let outcome = client.sync_now().await;
    assert_eq!(
        outcome,
        SyncOutcome::Finished(SyncStatus::Completed {
            uploaded: 1,
            downloaded: 0
        })
    );

    let record = client.get("X").unwrap().unwrap();
    assert_eq!(record.sync_state, SyncState::Synced);
    assert!(client.pending_operations().is_empty());
    assert_eq!(engine.remote.entity("X").unwrap().payload, json!({"title": "Photosynthesis"}));
}

#[tokio::test]
async fn test_offline_create_then_connectivity_restored() {
    let engine = create_test_engine(false);
    let client = &engine.client;

    client
        .create("lesson", Some("L1".into()), json!({"title": "Cells"}))
        .unwrap();
    assert_eq!(client.get("L1").unwrap().unwrap().sync_state, SyncState::LocalOnly);
    let ops = client.pending_operations();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].mutation.name(), "create");

    let mut events = client.subscribe();
    client.start().unwrap();
    engine.network.set_connected(true);

    let status = next_terminal(&mut events).await;
    assert_eq!(
        status,
        SyncStatus::Completed {
            uploaded: 1,
            downloaded: 0
        }
    );

    assert_eq!(client.get("L1").unwrap().unwrap().sync_state, SyncState::Synced);
    assert!(client.pending_operations().is_empty());

    client.stop().await;
}

#[tokio::test]
async fn test_state_transitions_return_to_idle() {
    let engine = create_test_engine(true);
    let mut events = engine.client.subscribe();

    engine.client.sync_now().await;

    let states: Vec<SyncStatus> = collect_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            SyncEvent::StateChanged(s) => Some(s),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            SyncStatus::Syncing,
            SyncStatus::Completed {
                uploaded: 0,
                downloaded: 0
            },
            SyncStatus::Idle
        ]
    );
}

// ============================================================================
// Single flight
// ============================================================================

#[tokio::test]
async fn test_at_most_one_concurrent_sync() {
    let engine = create_test_engine(true);
    for i in 0..3 {
        engine
            .client
            .create("lesson", Some(format!("L{}", i)), json!({"title": i}))
            .unwrap();
    }
    engine.remote.set_latency(Duration::from_millis(30));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let client = Arc::clone(&engine.client);
        handles.push(tokio::spawn(async move { client.sync_now().await }));
    }

    let mut finished = 0;
    let mut skipped = 0;
    for handle in handles {
        match handle.await.unwrap() {
            SyncOutcome::Finished(_) => finished += 1,
            SyncOutcome::Skipped => skipped += 1,
        }
    }

    assert!(finished >= 1);
    assert!(skipped >= 1);
    assert_eq!(engine.remote.max_in_flight(), 1);
    assert_eq!(
        engine.remote.applied().iter().filter(|(m, _)| *m == "create").count(),
        3
    );
}

// ============================================================================
// Bounded retry
// ============================================================================

#[tokio::test]
async fn test_bounded_retry_drops_after_ceiling() {
    let engine = create_test_engine(true);
    let client = &engine.client;
    client
        .create("lesson", Some("L1".into()), json!({"title": "Stuck"}))
        .unwrap();
    engine.remote.fail_always(
        "create",
        Some("L1"),
        RemoteError::Unavailable("backend down".into()),
    );
    let mut events = client.subscribe();

    let mut retry_counts = vec![client.pending_operations()[0].retry_count];
    for _ in 0..2 {
        client.sync_now().await;
        retry_counts.push(client.pending_operations()[0].retry_count);
    }
    client.sync_now().await;
    assert!(client.pending_operations().is_empty());

    let dropped: Vec<_> = collect_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            SyncEvent::OperationDropped { operation, reason } => Some((operation, reason)),
            _ => None,
        })
        .collect();
    assert_eq!(dropped.len(), 1);
    let (operation, reason) = &dropped[0];
    retry_counts.push(operation.retry_count);
    assert_eq!(retry_counts, vec![0, 1, 2, 3]);
    assert!(matches!(
        reason,
        DropReason::RetriesExhausted { attempts: 3, .. }
    ));
    assert_eq!(client.get("L1").unwrap().unwrap().sync_state, SyncState::Failed);

    // 3 drain attempts of 2 low-level calls each, then nothing more
    client.sync_now().await;
    let creates = engine.remote.calls().iter().filter(|c| c.method == "create").count();
    assert_eq!(creates, 6);
}

#[tokio::test]
async fn test_transient_failure_recovers_within_call() {
    let engine = create_test_engine(true);
    engine
        .client
        .create("lesson", Some("L1".into()), json!({"title": "Flaky"}))
        .unwrap();
    engine.remote.fail_times(
        "create",
        Some("L1"),
        RemoteError::DeadlineExceeded("slow".into()),
        1,
    );

    engine.client.sync_now().await;

    assert!(engine.client.pending_operations().is_empty());
    assert_eq!(
        engine.client.get("L1").unwrap().unwrap().sync_state,
        SyncState::Synced
    );
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_update_then_delete_applied_in_order() {
    let engine = create_test_engine(true);
    let client = &engine.client;

    client
        .create("lesson", Some("L1".into()), json!({"title": "v1"}))
        .unwrap();
    client.sync_now().await;

    client.update("L1", json!({"title": "v2"})).unwrap();
    client.delete("L1").unwrap();

    // The update fails for the whole first pass
    engine.remote.fail_times(
        "update",
        Some("L1"),
        RemoteError::Unavailable("blip".into()),
        2,
    );
    client.sync_now().await;

    assert!(engine.remote.entity("L1").is_some(), "delete must wait for the update");
    let kinds: Vec<&str> = client
        .pending_operations()
        .iter()
        .map(|op| op.mutation.name())
        .collect();
    assert_eq!(kinds, vec!["update", "delete"]);
    assert!(client.get("L1").unwrap().is_none());

    client.sync_now().await;

    assert_eq!(
        engine.remote.applied(),
        vec![
            ("create", "L1".to_string()),
            ("update", "L1".to_string()),
            ("delete", "L1".to_string()),
        ]
    );
    assert!(engine.remote.entity("L1").is_none());
    assert!(client.pending_operations().is_empty());
}

#[tokio::test]
async fn test_blocked_entity_does_not_block_others() {
    let engine = create_test_engine(true);
    let client = &engine.client;
    client.create("lesson", Some("A".into()), json!({"title": "a"})).unwrap();
    client.create("lesson", Some("B".into()), json!({"title": "b"})).unwrap();
    engine
        .remote
        .fail_times("create", Some("A"), RemoteError::Unavailable("x".into()), 2);

    let outcome = client.sync_now().await;

    assert_eq!(
        outcome,
        SyncOutcome::Finished(SyncStatus::Completed {
            uploaded: 1,
            downloaded: 0
        })
    );
    assert_eq!(client.get("A").unwrap().unwrap().sync_state, SyncState::LocalOnly);
    assert_eq!(client.get("B").unwrap().unwrap().sync_state, SyncState::Synced);
}

#[tokio::test]
async fn test_delete_of_missing_remote_counts_as_success() {
    let engine = create_test_engine(true);
    let client = &engine.client;
    client.create("lesson", Some("L1".into()), json!({"title": "a"})).unwrap();
    client.sync_now().await;

    engine.remote.remove("L1");
    client.delete("L1").unwrap();
    client.sync_now().await;

    assert!(client.pending_operations().is_empty());
    assert!(client.get("L1").unwrap().is_none());
}

// ============================================================================
// Pull phase
// ============================================================================

#[tokio::test]
async fn test_pull_downloads_all_pages() {
    let engine = create_test_engine(true);
    for i in 0..5 {
        engine
            .remote
            .seed(lesson_entity(&format!("R{}", i), 1, "remote"));
    }

    let outcome = engine.client.sync_now().await;
    assert_eq!(
        outcome,
        SyncOutcome::Finished(SyncStatus::Completed {
            uploaded: 0,
            downloaded: 5
        })
    );
    // page_size is 2 in the test config
    let lists = engine.remote.calls().iter().filter(|c| c.method == "list").count();
    assert_eq!(lists, 3);

    // Nothing new on the second pass
    let outcome = engine.client.sync_now().await;
    assert_eq!(
        outcome,
        SyncOutcome::Finished(SyncStatus::Completed {
            uploaded: 0,
            downloaded: 0
        })
    );
}

#[tokio::test]
async fn test_offline_pass_fails_without_side_effects() {
    let engine = create_test_engine(false);
    engine
        .client
        .create("lesson", Some("L1".into()), json!({"title": "a"}))
        .unwrap();

    let outcome = engine.client.sync_now().await;

    assert!(matches!(
        outcome,
        SyncOutcome::Finished(SyncStatus::Failed(_))
    ));
    assert_eq!(engine.client.pending_operations()[0].retry_count, 0);
    assert!(engine.remote.calls().is_empty());
}

#[tokio::test]
async fn test_pull_failure_reports_failed() {
    let engine = create_test_engine(true);
    engine
        .remote
        .fail_always("list", None, RemoteError::Unauthenticated("expired token".into()));

    let outcome = engine.client.sync_now().await;

    match outcome {
        SyncOutcome::Finished(SyncStatus::Failed(reason)) => {
            assert!(reason.contains("expired token"), "{}", reason)
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}
