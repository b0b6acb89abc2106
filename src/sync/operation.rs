//! Queued mutations
//!
//! On disk a [`PendingOperation`] is a JSON object whose `kind` field
//! discriminates the [`Mutation`] variant, e.g.
//! `{"kind":"update","payload":{..},"base_version":3, ...}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::record::{Entity, Record};

/// The change a pending operation will apply remotely
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
    Create { payload: Value },
    Update { payload: Value, base_version: u64 },
    Delete,
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::Create { .. } => "create",
            Mutation::Update { .. } => "update",
            Mutation::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: String,
    /// Position in the queue, assigned on enqueue
    #[serde(default)]
    pub sequence: u64,
    pub entity_id: String,
    pub entity_type: String,
    #[serde(flatten)]
    pub mutation: Mutation,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingOperation {
    fn new(entity_id: &str, entity_type: &str, mutation: Mutation) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            sequence: 0,
            entity_id: entity_id.to_string(),
            entity_type: entity_type.to_string(),
            mutation,
            retry_count: 0,
            enqueued_at: Utc::now(),
        }
    }

    pub fn create(record: &Record) -> Self {
        Self::new(
            &record.id,
            &record.entity_type,
            Mutation::Create {
                payload: record.payload.clone(),
            },
        )
    }

    pub fn update(record: &Record) -> Self {
        Self::new(
            &record.id,
            &record.entity_type,
            Mutation::Update {
                payload: record.payload.clone(),
                base_version: record.synced_version.unwrap_or(0),
            },
        )
    }

    pub fn delete(entity_id: &str, entity_type: &str) -> Self {
        Self::new(entity_id, entity_type, Mutation::Delete)
    }

    /// Entity snapshot carried by a create or update
    pub fn entity(&self) -> Option<Entity> {
        let (payload, version) = match &self.mutation {
            Mutation::Create { payload } => (payload, 0),
            Mutation::Update {
                payload,
                base_version,
            } => (payload, *base_version),
            Mutation::Delete => return None,
        };
        Some(Entity {
            id: self.entity_id.clone(),
            entity_type: self.entity_type.clone(),
            version,
            last_modified: self.enqueued_at,
            payload: payload.clone(),
        })
    }
}
