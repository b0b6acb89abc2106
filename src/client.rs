//! Sync client
//!
//! [`SyncClient`] assembles the local store, operation queue, conflict
//! resolver, network observer and coordinator around one persistent store
//! and one remote. Mutations are optimistic: they are written locally and
//! queued, and a background pass is requested when the device is online.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::storage::{LocalStore, PersistentStore, RocksStore};
use crate::sync::{
    ConflictResolver, ConnectivityProbe, CoordinatorConfig, NetworkObserver, OperationQueue,
    PendingOperation, Record, RecordFilter, RemoteDataService, Resolution, SyncConflict,
    SyncCoordinator, SyncEvent, SyncOutcome,
};

pub struct SyncClient {
    store: Arc<LocalStore>,
    queue: Arc<OperationQueue>,
    resolver: Arc<ConflictResolver>,
    network: Arc<NetworkObserver>,
    coordinator: Arc<SyncCoordinator>,
    cache_ttl: Duration,
    probe: Mutex<Option<JoinHandle<()>>>,
}

impl SyncClient {
    pub fn new(
        kv: Arc<dyn PersistentStore>,
        remote: Arc<dyn RemoteDataService>,
        network: Arc<NetworkObserver>,
        coordinator_config: CoordinatorConfig,
        cache_ttl: Duration,
    ) -> SyncResult<Self> {
        let store = Arc::new(LocalStore::new(kv.clone()));
        let queue = Arc::new(OperationQueue::open(
            kv.clone(),
            coordinator_config.policy.max_retries,
        )?);
        let resolver = Arc::new(ConflictResolver::new(kv, store.clone(), queue.clone()));
        let coordinator = Arc::new(SyncCoordinator::new(
            store.clone(),
            queue.clone(),
            resolver.clone(),
            remote,
            network.clone(),
            coordinator_config,
        )?);

        Ok(Self {
            store,
            queue,
            resolver,
            network,
            coordinator,
            cache_ttl,
            probe: Mutex::new(None),
        })
    }

    /// Open the RocksDB store under `config.data_dir`
    pub fn open(
        config: &SyncConfig,
        remote: Arc<dyn RemoteDataService>,
        initially_connected: bool,
    ) -> SyncResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let kv: Arc<dyn PersistentStore> = Arc::new(RocksStore::open(&config.data_dir)?);
        Self::new(
            kv,
            remote,
            Arc::new(NetworkObserver::new(initially_connected)),
            config.coordinator_config(),
            config.cache_ttl(),
        )
    }

    // ==================== Mutations ====================

    /// Create a record locally and queue its upload.
    ///
    /// A fresh UUID is assigned when `id` is `None`.
    pub fn create(
        &self,
        entity_type: &str,
        id: Option<String>,
        payload: Value,
    ) -> SyncResult<Record> {
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let record = Record::new_local(id, entity_type, payload);

        {
            let _guard = self.store.lock_edits();
            if self.store.get(&record.id)?.is_some() {
                return Err(SyncError::RecordExists(record.id));
            }
            self.store.put(&record)?;
            if let Err(e) = self.queue.enqueue(PendingOperation::create(&record)) {
                self.rollback(&record.id, None);
                return Err(e);
            }
        }

        tracing::debug!("Created {} {} locally", entity_type, record.id);
        self.request_sync();
        Ok(record)
    }

    /// Edit a cached record and queue the update
    pub fn update(&self, id: &str, payload: Value) -> SyncResult<Record> {
        let record = {
            let _guard = self.store.lock_edits();
            let previous = self
                .store
                .get(id)?
                .ok_or_else(|| SyncError::RecordNotFound(id.to_string()))?;

            let mut record = previous.clone();
            record.apply_local_edit(payload);
            self.store.put(&record)?;
            if let Err(e) = self.queue.enqueue(PendingOperation::update(&record)) {
                self.rollback(id, Some(&previous));
                return Err(e);
            }
            record
        };

        tracing::debug!("Updated {} locally (v{})", id, record.version);
        self.request_sync();
        Ok(record)
    }

    /// Remove a cached record and queue the remote delete
    pub fn delete(&self, id: &str) -> SyncResult<()> {
        {
            let _guard = self.store.lock_edits();
            let previous = self
                .store
                .get(id)?
                .ok_or_else(|| SyncError::RecordNotFound(id.to_string()))?;

            self.store.delete(id)?;
            if let Err(e) = self
                .queue
                .enqueue(PendingOperation::delete(id, &previous.entity_type))
            {
                self.rollback(id, Some(&previous));
                return Err(e);
            }
            // A stale conflict on a deleted record has nothing left to resolve
            self.resolver.clear(id)?;
        }

        tracing::debug!("Deleted {} locally", id);
        self.request_sync();
        Ok(())
    }

    fn rollback(&self, id: &str, previous: Option<&Record>) {
        let result = match previous {
            Some(record) => self.store.put(record),
            None => self.store.delete(id),
        };
        if let Err(e) = result {
            tracing::error!("Failed to roll back local change to {}: {}", id, e);
        }
    }

    fn request_sync(&self) {
        if self.network.is_connected_now() && !self.coordinator.trigger() {
            tracing::debug!("Sync request dropped, command channel full");
        }
    }

    // ==================== Reads ====================

    pub fn get(&self, id: &str) -> SyncResult<Option<Record>> {
        self.store.get(id)
    }

    pub fn list(&self, filter: &RecordFilter) -> SyncResult<Vec<Record>> {
        self.store.list_all(filter)
    }

    pub fn is_expired(&self, id: &str) -> SyncResult<bool> {
        self.store.is_expired(id, self.cache_ttl)
    }

    pub fn purge_expired(&self) -> SyncResult<usize> {
        self.store.purge_expired(self.cache_ttl)
    }

    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        self.queue.peek_all()
    }

    // ==================== Conflicts ====================

    pub fn conflicts(&self) -> SyncResult<Vec<SyncConflict>> {
        self.resolver.list()
    }

    /// Resolve the active conflict on `entity_id`
    pub fn resolve(&self, entity_id: &str, resolution: Resolution) -> SyncResult<Option<Record>> {
        let conflict = self
            .resolver
            .get(entity_id)?
            .ok_or_else(|| SyncError::ConflictNotFound(entity_id.to_string()))?;
        self.resolve_conflict(&conflict, resolution)
    }

    /// Resolve from a conflict snapshot, active or not
    pub fn resolve_conflict(
        &self,
        conflict: &SyncConflict,
        resolution: Resolution,
    ) -> SyncResult<Option<Record>> {
        let requeued = !matches!(resolution, Resolution::KeepRemote);
        let result = {
            let _guard = self.store.lock_edits();
            self.resolver.resolve(conflict, resolution)?
        };
        if requeued {
            self.request_sync();
        }
        Ok(result)
    }

    // ==================== Sync ====================

    pub async fn sync_now(&self) -> SyncOutcome {
        self.coordinator.sync_now().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.coordinator.subscribe()
    }

    pub fn start(&self) -> SyncResult<()> {
        self.coordinator.start()
    }

    /// Poll `probe` and feed the network observer until [`Self::stop`]
    pub fn start_probe(&self, probe: Arc<dyn ConnectivityProbe>, interval: Duration) {
        let handle = self
            .network
            .spawn_probe(probe, interval, self.coordinator.cancel_token());
        if let Some(previous) = self.probe.lock().replace(handle) {
            previous.abort();
        }
    }

    pub async fn stop(&self) {
        self.coordinator.stop().await;
        let probe = self.probe.lock().take();
        if let Some(handle) = probe {
            let _ = handle.await;
        }
    }

    pub fn network(&self) -> &Arc<NetworkObserver> {
        &self.network
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::sync::{InMemoryRemote, Mutation, SyncState};
    use serde_json::json;

    fn client(connected: bool) -> (SyncClient, Arc<MemoryStore>) {
        let kv = Arc::new(MemoryStore::new());
        let client = SyncClient::new(
            kv.clone(),
            Arc::new(InMemoryRemote::new()),
            Arc::new(NetworkObserver::new(connected)),
            CoordinatorConfig::default(),
            Duration::from_secs(60),
        )
        .unwrap();
        (client, kv)
    }

    #[test]
    fn test_optimistic_mutations() {
        let (client, _) = client(false);
        let created = client
            .create("lesson", Some("L1".into()), json!({"title": "Algebra"}))
            .unwrap();
        assert_eq!(created.sync_state, SyncState::LocalOnly);

        let updated = client.update("L1", json!({"title": "Geometry"})).unwrap();
        assert_eq!(updated.version, 2);

        client.delete("L1").unwrap();
        assert!(client.get("L1").unwrap().is_none());

        let kinds: Vec<&str> = client
            .pending_operations()
            .iter()
            .map(|op| op.mutation.name())
            .collect();
        assert_eq!(kinds, vec!["create", "update", "delete"]);
    }

    #[test]
    fn test_mutation_errors() {
        let (client, _) = client(false);
        assert!(matches!(
            client.update("missing", json!({})),
            Err(SyncError::RecordNotFound(_))
        ));
        assert!(matches!(client.delete("missing"), Err(SyncError::RecordNotFound(_))));
        assert!(matches!(
            client.resolve("missing", Resolution::KeepRemote),
            Err(SyncError::ConflictNotFound(_))
        ));

        client.create("lesson", Some("L1".into()), json!({})).unwrap();
        assert!(matches!(
            client.create("lesson", Some("L1".into()), json!({})),
            Err(SyncError::RecordExists(_))
        ));

        let generated = client.create("lesson", None, json!({})).unwrap();
        assert!(uuid::Uuid::parse_str(&generated.id).is_ok());
    }

    #[test]
    fn test_failed_write_leaves_state_intact() {
        let (client, kv) = client(false);
        client
            .create("lesson", Some("L1".into()), json!({"title": "a"}))
            .unwrap();

        kv.set_fail_writes(true);
        assert!(client.update("L1", json!({"title": "b"})).is_err());
        kv.set_fail_writes(false);

        assert_eq!(client.get("L1").unwrap().unwrap().payload, json!({"title": "a"}));
        assert_eq!(client.pending_operations().len(), 1);
        assert!(matches!(
            client.pending_operations()[0].mutation,
            Mutation::Create { .. }
        ));
    }
}
