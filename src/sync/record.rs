//! Synchronizable records
//!
//! A [`Record`] is the locally cached copy of an entity. The remote data
//! service speaks [`Entity`], the authoritative shape without any local
//! bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sync lifecycle of a cached record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Changed locally, not yet confirmed by the remote
    LocalOnly,
    /// An operation for this record is in flight
    Syncing,
    /// Matches the remote as of the last pass
    Synced,
    /// Diverged from the remote, waiting for a resolution
    Conflicted,
    /// The pending operation was dropped (fatal error or retry ceiling)
    Failed,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncState::LocalOnly => "pending sync",
            SyncState::Syncing => "syncing",
            SyncState::Synced => "synced",
            SyncState::Conflicted => "conflict",
            SyncState::Failed => "sync failed",
        };
        f.write_str(s)
    }
}

/// Authoritative entity as exchanged with the remote data service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "entityType")]
    pub entity_type: String,
    pub version: u64,
    #[serde(rename = "lastModified")]
    pub last_modified: DateTime<Utc>,
    pub payload: Value,
}

/// Locally cached record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub entity_type: String,
    /// Bumped on every local edit, replaced by the remote version on sync
    pub version: u64,
    /// Last version both sides agreed on; `None` until first confirmed
    #[serde(default)]
    pub synced_version: Option<u64>,
    pub last_modified: DateTime<Utc>,
    pub payload: Value,
    pub sync_state: SyncState,
    /// When the record was last written from the remote or by a mutation
    pub cached_at: DateTime<Utc>,
}

impl Record {
    /// A record created locally that the remote has never seen
    pub fn new_local(
        id: impl Into<String>,
        entity_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            version: 1,
            synced_version: None,
            last_modified: now,
            payload,
            sync_state: SyncState::LocalOnly,
            cached_at: now,
        }
    }

    /// A record mirroring the remote state exactly
    pub fn from_entity(entity: &Entity) -> Self {
        Self {
            id: entity.id.clone(),
            entity_type: entity.entity_type.clone(),
            version: entity.version,
            synced_version: Some(entity.version),
            last_modified: entity.last_modified,
            payload: entity.payload.clone(),
            sync_state: SyncState::Synced,
            cached_at: Utc::now(),
        }
    }

    /// Apply a local edit
    pub fn apply_local_edit(&mut self, payload: Value) {
        let now = Utc::now();
        self.payload = payload;
        self.version += 1;
        self.last_modified = now;
        self.cached_at = now;
        self.sync_state = SyncState::LocalOnly;
    }

    /// True when the record carries changes the remote has not confirmed
    pub fn is_locally_modified(&self) -> bool {
        match self.synced_version {
            Some(base) => self.version > base,
            None => true,
        }
    }

    /// Snapshot sent to the remote data service
    pub fn to_entity(&self) -> Entity {
        Entity {
            id: self.id.clone(),
            entity_type: self.entity_type.clone(),
            version: self.version,
            last_modified: self.last_modified,
            payload: self.payload.clone(),
        }
    }
}

/// Selection criteria for [`crate::storage::LocalStore::list_all`]
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub entity_type: Option<String>,
    pub sync_state: Option<SyncState>,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn entity_type(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            sync_state: None,
        }
    }

    pub fn with_state(mut self, state: SyncState) -> Self {
        self.sync_state = Some(state);
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        if let Some(ref t) = self.entity_type {
            if &record.entity_type != t {
                return false;
            }
        }
        if let Some(state) = self.sync_state {
            if record.sync_state != state {
                return false;
            }
        }
        true
    }
}
