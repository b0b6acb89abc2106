//! Conflict detection and resolution
//!
//! Detection compares a cached [`Record`] with the authoritative
//! [`Entity`] using the last common version (`synced_version`) as the
//! merge base. Active conflicts are persisted under `conflict:{id}` so they
//! survive a restart; resolving one clears it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::operation::PendingOperation;
use super::queue::OperationQueue;
use super::record::{Entity, Record, SyncState};
use crate::error::{SyncError, SyncResult};
use crate::storage::kv::PersistentStore;
use crate::storage::LocalStore;

const CONFLICT_PREFIX: &str = "conflict:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    /// Payloads differ but only one side moved past the common version
    ContentDiffers,
    /// Deleted remotely while modified locally
    DeletedRemotely,
    /// Both sides advanced independently
    ModifiedBoth,
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConflictType::ContentDiffers => "content-differs",
            ConflictType::DeletedRemotely => "deleted-remotely",
            ConflictType::ModifiedBoth => "modified-both",
        };
        f.write_str(s)
    }
}

/// A detected divergence awaiting a resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub entity_id: String,
    pub entity_type: String,
    pub local: Record,
    /// Authoritative state; `None` when the remote deleted the entity
    pub remote: Option<Record>,
    pub conflict_type: ConflictType,
    pub detected_at: DateTime<Utc>,
}

/// Resolution chosen by the caller
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Re-push the local payload, overwriting the remote
    KeepLocal,
    /// Discard local changes and adopt the remote state
    KeepRemote,
    /// Store a caller-supplied payload and push it
    Merge(Value),
}

/// Result of comparing a cached record with the remote state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// Payloads agree
    InSync,
    /// Only the remote advanced; it overwrites the cache
    AdoptRemote,
    /// The local change is still queued for upload, or was never synced
    KeepLocal,
    /// Deleted remotely and untouched locally; drop the cached copy
    EvictLocal,
    Conflict(ConflictType),
}

impl Detection {
    /// Classify `local` against `remote`.
    ///
    /// `has_pending` tells whether a queued operation still carries the
    /// local change to the remote.
    pub fn classify(local: &Record, remote: Option<&Entity>, has_pending: bool) -> Self {
        let local_advanced = local.is_locally_modified();

        let Some(remote) = remote else {
            return match local.synced_version {
                None => Detection::KeepLocal,
                Some(_) if local_advanced => Detection::Conflict(ConflictType::DeletedRemotely),
                Some(_) => Detection::EvictLocal,
            };
        };

        if local.payload == remote.payload {
            return if has_pending {
                Detection::KeepLocal
            } else {
                Detection::InSync
            };
        }

        let remote_advanced = local
            .synced_version
            .map_or(true, |base| remote.version > base);

        match (local_advanced, remote_advanced) {
            (false, true) => Detection::AdoptRemote,
            (true, true) => Detection::Conflict(ConflictType::ModifiedBoth),
            (true, false) if has_pending => Detection::KeepLocal,
            (true, false) | (false, false) => Detection::Conflict(ConflictType::ContentDiffers),
        }
    }
}

/// Records, lists and resolves conflicts
pub struct ConflictResolver {
    kv: Arc<dyn PersistentStore>,
    store: Arc<LocalStore>,
    queue: Arc<OperationQueue>,
}

impl ConflictResolver {
    pub fn new(
        kv: Arc<dyn PersistentStore>,
        store: Arc<LocalStore>,
        queue: Arc<OperationQueue>,
    ) -> Self {
        Self { kv, store, queue }
    }

    fn key(entity_id: &str) -> String {
        format!("{}{}", CONFLICT_PREFIX, entity_id)
    }

    /// Persist a conflict and flag the cached record.
    ///
    /// Returns `true` when the conflict is new or its type changed.
    pub fn record(&self, conflict: &SyncConflict) -> SyncResult<bool> {
        let previous = self.get(&conflict.entity_id)?;
        self.kv
            .put(&Self::key(&conflict.entity_id), &serde_json::to_vec(conflict)?)?;
        self.store
            .set_sync_state(&conflict.entity_id, SyncState::Conflicted)?;

        Ok(previous.map_or(true, |p| p.conflict_type != conflict.conflict_type))
    }

    pub fn get(&self, entity_id: &str) -> SyncResult<Option<SyncConflict>> {
        match self.kv.get(&Self::key(entity_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Active conflicts, ordered by entity id
    pub fn list(&self) -> SyncResult<Vec<SyncConflict>> {
        let mut conflicts = Vec::new();
        for (key, bytes) in self.kv.list_by_prefix(CONFLICT_PREFIX)? {
            match serde_json::from_slice::<SyncConflict>(&bytes) {
                Ok(c) => conflicts.push(c),
                Err(e) => tracing::warn!("Skipping unreadable conflict {}: {}", key, e),
            }
        }
        Ok(conflicts)
    }

    pub fn count(&self) -> SyncResult<usize> {
        Ok(self.kv.list_by_prefix(CONFLICT_PREFIX)?.len())
    }

    /// Forget a conflict without touching the cached record
    pub fn clear(&self, entity_id: &str) -> SyncResult<()> {
        self.kv.delete(&Self::key(entity_id))
    }

    /// Apply `resolution` to the conflict snapshot.
    ///
    /// The snapshot does not need to be active: resolving the same
    /// conflict again leaves the same cache and queue state. Returns the
    /// resulting cached record, `None` if it was deleted.
    pub fn resolve(
        &self,
        conflict: &SyncConflict,
        resolution: Resolution,
    ) -> SyncResult<Option<Record>> {
        let id = conflict.entity_id.as_str();
        tracing::info!(
            "Resolving {} conflict on {} with {:?}",
            conflict.conflict_type,
            id,
            resolution
        );

        let result = match resolution {
            Resolution::KeepRemote => {
                self.queue.remove_for_entity(id)?;
                match &conflict.remote {
                    Some(remote) => {
                        let mut record = remote.clone();
                        record.synced_version = Some(record.version);
                        record.sync_state = SyncState::Synced;
                        record.cached_at = Utc::now();
                        self.store.put(&record)?;
                        Some(record)
                    }
                    None => {
                        self.store.delete(id)?;
                        None
                    }
                }
            }
            Resolution::KeepLocal => {
                let current = self.store.get(id)?.unwrap_or_else(|| conflict.local.clone());
                Some(self.push_local(conflict, current.payload)?)
            }
            Resolution::Merge(payload) => {
                if conflict.conflict_type != ConflictType::ContentDiffers
                    || conflict.remote.is_none()
                {
                    return Err(SyncError::InvalidResolution(format!(
                        "merge is only valid for content-differs, {} is {}",
                        id, conflict.conflict_type
                    )));
                }
                Some(self.push_local(conflict, payload)?)
            }
        };

        self.clear(id)?;
        Ok(result)
    }

    /// Rebase `payload` on the remote version and queue it for upload
    fn push_local(&self, conflict: &SyncConflict, payload: Value) -> SyncResult<Record> {
        self.queue.remove_for_entity(&conflict.entity_id)?;

        let now = Utc::now();
        let mut record = conflict.local.clone();
        record.payload = payload;
        record.last_modified = now;
        record.cached_at = now;
        record.sync_state = SyncState::LocalOnly;

        let op = match &conflict.remote {
            Some(remote) => {
                record.version = remote.version + 1;
                record.synced_version = Some(remote.version);
                PendingOperation::update(&record)
            }
            None => {
                record.synced_version = None;
                PendingOperation::create(&record)
            }
        };

        self.store.put(&record)?;
        self.queue.enqueue(op)?;
        Ok(record)
    }
}
