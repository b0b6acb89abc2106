//! Durable key-value namespace
//!
//! Everything the engine persists (cached records, the operation queue,
//! active conflicts) goes through [`PersistentStore`]. Keys are UTF-8
//! strings grouped by a `namespace:` prefix so a single database can host
//! several logical collections.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};

use crate::error::{SyncError, SyncResult};

/// A single mutation inside an atomic batch
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Durable key-value storage used by the local store and the queue.
///
/// A completed `put`, `delete` or `apply_batch` must survive a process
/// crash before the call returns.
pub trait PersistentStore: Send + Sync {
    fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>>;

    fn put(&self, key: &str, value: &[u8]) -> SyncResult<()>;

    fn delete(&self, key: &str) -> SyncResult<()>;

    /// All entries whose key starts with `prefix`, in ascending key order
    fn list_by_prefix(&self, prefix: &str) -> SyncResult<Vec<(String, Vec<u8>)>>;

    /// Apply every op or none of them
    fn apply_batch(&self, ops: Vec<BatchOp>) -> SyncResult<()>;
}

/// RocksDB-backed persistent store
pub struct RocksStore {
    db: Arc<DB>,
    path: PathBuf,
}

impl std::fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStore")
            .field("path", &self.path)
            .finish()
    }
}

impl RocksStore {
    /// Open (or create) the database under `data_dir`
    pub fn open<P: AsRef<Path>>(data_dir: P) -> SyncResult<Self> {
        let path = data_dir.as_ref().to_path_buf();

        let mut opts = Options::default();
        opts.create_if_missing(true);

        // Cap WAL growth; the queue is small but rewritten often
        opts.set_max_total_wal_size(50 * 1024 * 1024);
        opts.set_keep_log_file_num(5);
        opts.set_recycle_log_file_num(3);

        let db = DB::open(&opts, &path)
            .map_err(|e| SyncError::Storage(format!("Failed to open RocksDB: {}", e)))?;

        tracing::debug!("Opened persistent store at {}", path.display());

        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_options() -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        opts
    }
}

impl PersistentStore for RocksStore {
    fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.db.get(key.as_bytes())?)
    }

    fn put(&self, key: &str, value: &[u8]) -> SyncResult<()> {
        self.db
            .put_opt(key.as_bytes(), value, &Self::write_options())?;
        Ok(())
    }

    fn delete(&self, key: &str) -> SyncResult<()> {
        self.db.delete_opt(key.as_bytes(), &Self::write_options())?;
        Ok(())
    }

    fn list_by_prefix(&self, prefix: &str) -> SyncResult<Vec<(String, Vec<u8>)>> {
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| SyncError::Storage(format!("Non UTF-8 key: {}", e)))?;
            entries.push((key, value.to_vec()));
        }
        Ok(entries)
    }

    fn apply_batch(&self, ops: Vec<BatchOp>) -> SyncResult<()> {
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => batch.put(key.as_bytes(), &value),
                BatchOp::Delete { key } => batch.delete(key.as_bytes()),
            }
        }
        self.db.write_opt(batch, &Self::write_options())?;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral sessions.
///
/// Writes can be made to fail with [`MemoryStore::set_fail_writes`] to
/// exercise local storage failure paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn check_writable(&self) -> SyncResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("write rejected".to_string()));
        }
        Ok(())
    }
}

impl PersistentStore for MemoryStore {
    fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> SyncResult<()> {
        self.check_writable()?;
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> SyncResult<()> {
        self.check_writable()?;
        self.entries.write().remove(key);
        Ok(())
    }

    fn list_by_prefix(&self, prefix: &str) -> SyncResult<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn apply_batch(&self, ops: Vec<BatchOp>) -> SyncResult<()> {
        self.check_writable()?;
        let mut entries = self.entries.write();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    entries.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}
