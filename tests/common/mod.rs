//! Common test utilities for sync engine tests
//!
//! Provides shared helpers for:
//! - Building a client over an in-memory or RocksDB-backed store
//! - Seeding the in-memory remote as another device would
//! - Waiting for sync pass outcomes on the event stream

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use classnotes_sync::sync::{CoordinatorConfig, Entity, SyncEvent, SyncStatus};
use classnotes_sync::{
    InMemoryRemote, MemoryStore, NetworkObserver, PersistentStore, RetryPolicy, RocksStore,
    SyncClient,
};
use serde_json::json;
use tokio::sync::broadcast;

pub struct TestEngine {
    pub client: Arc<SyncClient>,
    pub remote: Arc<InMemoryRemote>,
    pub network: Arc<NetworkObserver>,
}

/// Retry settings small enough for tests: 2 attempts per call, ceiling 3
pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        policy: RetryPolicy {
            base: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            call_attempts: 2,
            max_retries: 3,
        },
        page_size: 2,
        ..CoordinatorConfig::default()
    }
}

pub fn engine_with(
    kv: Arc<dyn PersistentStore>,
    remote: Arc<InMemoryRemote>,
    connected: bool,
    config: CoordinatorConfig,
) -> TestEngine {
    let network = Arc::new(NetworkObserver::new(connected));
    let client = SyncClient::new(
        kv,
        remote.clone(),
        network.clone(),
        config,
        Duration::from_secs(3600),
    )
    .expect("Failed to build sync client");
    TestEngine {
        client: Arc::new(client),
        remote,
        network,
    }
}

pub fn create_test_engine(connected: bool) -> TestEngine {
    engine_with(
        Arc::new(MemoryStore::new()),
        Arc::new(InMemoryRemote::new()),
        connected,
        fast_config(),
    )
}

/// Engine over a RocksDB store in `dir`; reopen with the same remote to
/// simulate a process restart
pub fn create_rocks_engine(dir: &Path, remote: Arc<InMemoryRemote>, connected: bool) -> TestEngine {
    let kv = RocksStore::open(dir).expect("Failed to open RocksDB");
    engine_with(Arc::new(kv), remote, connected, fast_config())
}

pub fn lesson_entity(id: &str, version: u64, title: &str) -> Entity {
    Entity {
        id: id.to_string(),
        entity_type: "lesson".to_string(),
        version,
        last_modified: Utc::now(),
        payload: json!({ "title": title }),
    }
}

/// Wait for the next terminal status on `events`
pub async fn next_terminal(events: &mut broadcast::Receiver<SyncEvent>) -> SyncStatus {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(SyncEvent::StateChanged(status)) if status.is_terminal() => return status,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("Timed out waiting for a sync pass")
}

/// Drain whatever events are already buffered
pub fn collect_events(events: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
