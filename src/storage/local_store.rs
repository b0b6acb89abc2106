//! Local record cache
//!
//! Durable cache of [`Record`]s under the `record:` namespace. `put`
//! overwrites unconditionally; version checks belong to the caller.
//! Writes are serialized, reads run concurrently.
//!
//! Sequences that read a record, decide, then write it (and usually touch
//! the operation queue) hold [`LocalStore::lock_edits`] for their duration.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard, RwLock};

use super::kv::PersistentStore;
use crate::error::SyncResult;
use crate::sync::record::{Record, RecordFilter, SyncState};

const RECORD_PREFIX: &str = "record:";

pub struct LocalStore {
    kv: Arc<dyn PersistentStore>,
    write_lock: RwLock<()>,
    edit_lock: Mutex<()>,
}

impl LocalStore {
    pub fn new(kv: Arc<dyn PersistentStore>) -> Self {
        Self {
            kv,
            write_lock: RwLock::new(()),
            edit_lock: Mutex::new(()),
        }
    }

    /// Exclusive access for a read-decide-write sequence over the cache.
    ///
    /// Not reentrant. Calls on `self` other than `purge_expired` are fine
    /// while it is held.
    pub fn lock_edits(&self) -> MutexGuard<'_, ()> {
        self.edit_lock.lock()
    }

    fn key(id: &str) -> String {
        format!("{}{}", RECORD_PREFIX, id)
    }

    pub fn get(&self, id: &str) -> SyncResult<Option<Record>> {
        let _guard = self.write_lock.read();
        match self.kv.get(&Self::key(id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, record: &Record) -> SyncResult<()> {
        let bytes = serde_json::to_vec(record)?;
        let _guard = self.write_lock.write();
        self.kv.put(&Self::key(&record.id), &bytes)
    }

    pub fn delete(&self, id: &str) -> SyncResult<()> {
        let _guard = self.write_lock.write();
        self.kv.delete(&Self::key(id))
    }

    /// Every cached record matching `filter`, ordered by id
    pub fn list_all(&self, filter: &RecordFilter) -> SyncResult<Vec<Record>> {
        let _guard = self.write_lock.read();
        let mut records = Vec::new();
        for (key, bytes) in self.kv.list_by_prefix(RECORD_PREFIX)? {
            match serde_json::from_slice::<Record>(&bytes) {
                Ok(record) if filter.matches(&record) => records.push(record),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Skipping unreadable cached record {}: {}", key, e);
                }
            }
        }
        Ok(records)
    }

    /// True when the record is missing or was cached more than `ttl` ago
    pub fn is_expired(&self, id: &str, ttl: Duration) -> SyncResult<bool> {
        Ok(match self.get(id)? {
            Some(record) => Self::older_than(&record, ttl),
            None => true,
        })
    }

    /// Update only the sync state of a cached record.
    ///
    /// Returns the updated record, or `None` when it is not cached.
    pub fn set_sync_state(&self, id: &str, state: SyncState) -> SyncResult<Option<Record>> {
        let _guard = self.write_lock.write();
        let key = Self::key(id);
        let Some(bytes) = self.kv.get(&key)? else {
            return Ok(None);
        };
        let mut record: Record = serde_json::from_slice(&bytes)?;
        if record.sync_state != state {
            record.sync_state = state;
            self.kv.put(&key, &serde_json::to_vec(&record)?)?;
        }
        Ok(Some(record))
    }

    /// Evict synced records cached longer than `ttl`.
    ///
    /// Records with unconfirmed local state are never evicted.
    pub fn purge_expired(&self, ttl: Duration) -> SyncResult<usize> {
        let _edits = self.lock_edits();
        let expired: Vec<String> = self
            .list_all(&RecordFilter::all().with_state(SyncState::Synced))?
            .into_iter()
            .filter(|r| Self::older_than(r, ttl))
            .map(|r| r.id)
            .collect();

        for id in &expired {
            self.delete(id)?;
        }

        if !expired.is_empty() {
            tracing::info!("Cache purge: evicted {} expired records", expired.len());
        }
        Ok(expired.len())
    }

    fn older_than(record: &Record, ttl: Duration) -> bool {
        Utc::now()
            .signed_duration_since(record.cached_at)
            .to_std()
            .map(|age| age > ttl)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::MemoryStore;
    use serde_json::json;

    fn create_store() -> (LocalStore, Arc<MemoryStore>) {
        let kv = Arc::new(MemoryStore::new());
        (LocalStore::new(kv.clone()), kv)
    }

    fn synced(id: &str, cached_secs_ago: i64) -> Record {
        let mut record = Record::new_local(id, "lesson", json!({"title": id}));
        record.synced_version = Some(1);
        record.sync_state = SyncState::Synced;
        record.cached_at = Utc::now() - chrono::Duration::seconds(cached_secs_ago);
        record
    }

    #[test]
    fn test_put_get_delete() {
        let (store, _) = create_store();
        let record = Record::new_local("L1", "lesson", json!({"title": "Algebra"}));

        store.put(&record).unwrap();
        assert_eq!(store.get("L1").unwrap(), Some(record));

        store.delete("L1").unwrap();
        assert_eq!(store.get("L1").unwrap(), None);
    }

    #[test]
    fn test_put_overwrites() {
        let (store, _) = create_store();
        let mut record = Record::new_local("L1", "lesson", json!({"title": "v1"}));
        store.put(&record).unwrap();

        record.apply_local_edit(json!({"title": "v2"}));
        store.put(&record).unwrap();

        let loaded = store.get("L1").unwrap().unwrap();
        assert_eq!(loaded.payload["title"], "v2");
        assert_eq!(loaded.version, 2);
    }

    #[test]
    fn test_list_all_with_filter() {
        let (store, _) = create_store();
        store.put(&Record::new_local("a", "lesson", json!({}))).unwrap();
        store.put(&synced("b", 0)).unwrap();
        store.put(&Record::new_local("c", "note", json!({}))).unwrap();

        assert_eq!(store.list_all(&RecordFilter::all()).unwrap().len(), 3);

        let lessons = store.list_all(&RecordFilter::entity_type("lesson")).unwrap();
        let ids: Vec<_> = lessons.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let pending = store
            .list_all(&RecordFilter::all().with_state(SyncState::LocalOnly))
            .unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn test_is_expired() {
        let (store, _) = create_store();
        store.put(&synced("fresh", 10)).unwrap();
        store.put(&synced("stale", 7200)).unwrap();

        let ttl = Duration::from_secs(3600);
        assert!(!store.is_expired("fresh", ttl).unwrap());
        assert!(store.is_expired("stale", ttl).unwrap());
        assert!(store.is_expired("missing", ttl).unwrap());
    }

    #[test]
    fn test_purge_keeps_unsynced_records() {
        let (store, _) = create_store();
        store.put(&synced("stale", 7200)).unwrap();
        let mut pending = Record::new_local("pending", "lesson", json!({}));
        pending.cached_at = Utc::now() - chrono::Duration::seconds(7200);
        store.put(&pending).unwrap();

        let evicted = store.purge_expired(Duration::from_secs(3600)).unwrap();
        assert_eq!(evicted, 1);
        assert!(store.get("stale").unwrap().is_none());
        assert!(store.get("pending").unwrap().is_some());
    }

    #[test]
    fn test_set_sync_state() {
        let (store, _) = create_store();
        store.put(&Record::new_local("L1", "lesson", json!({}))).unwrap();

        let updated = store.set_sync_state("L1", SyncState::Syncing).unwrap().unwrap();
        assert_eq!(updated.sync_state, SyncState::Syncing);
        assert_eq!(store.get("L1").unwrap().unwrap().sync_state, SyncState::Syncing);

        assert!(store.set_sync_state("nope", SyncState::Synced).unwrap().is_none());
    }

    #[test]
    fn test_write_failure_surfaces() {
        let (store, kv) = create_store();
        kv.set_fail_writes(true);
        let result = store.put(&Record::new_local("L1", "lesson", json!({})));
        assert!(result.is_err());
        assert!(store.get("L1").unwrap().is_none());
    }
}
