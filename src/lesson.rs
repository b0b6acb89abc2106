//! Lesson entity
//!
//! Typed view over records of type `lesson`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::client::SyncClient;
use crate::error::SyncResult;
use crate::sync::{Record, RecordFilter, SyncState};

pub const LESSON_TYPE: &str = "lesson";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Lesson {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            subject: None,
            notes: String::new(),
            tags: Vec::new(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }
}

/// A lesson together with its sync bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct StoredLesson {
    pub id: String,
    pub version: u64,
    pub sync_state: SyncState,
    pub lesson: Lesson,
}

impl TryFrom<Record> for StoredLesson {
    type Error = crate::error::SyncError;

    fn try_from(record: Record) -> SyncResult<Self> {
        Ok(Self {
            lesson: serde_json::from_value(record.payload)?,
            id: record.id,
            version: record.version,
            sync_state: record.sync_state,
        })
    }
}

pub struct LessonRepository {
    client: Arc<SyncClient>,
}

impl LessonRepository {
    pub fn new(client: Arc<SyncClient>) -> Self {
        Self { client }
    }

    pub fn create(&self, id: Option<String>, lesson: &Lesson) -> SyncResult<StoredLesson> {
        let payload = serde_json::to_value(lesson)?;
        self.client.create(LESSON_TYPE, id, payload)?.try_into()
    }

    pub fn update(&self, id: &str, lesson: &Lesson) -> SyncResult<StoredLesson> {
        let payload = serde_json::to_value(lesson)?;
        self.client.update(id, payload)?.try_into()
    }

    pub fn delete(&self, id: &str) -> SyncResult<()> {
        self.client.delete(id)
    }

    pub fn get(&self, id: &str) -> SyncResult<Option<StoredLesson>> {
        match self.client.get(id)? {
            Some(record) if record.entity_type == LESSON_TYPE => Ok(Some(record.try_into()?)),
            _ => Ok(None),
        }
    }

    /// All cached lessons, ordered by id. Unreadable payloads are skipped.
    pub fn list(&self) -> SyncResult<Vec<StoredLesson>> {
        let records = self.client.list(&RecordFilter::entity_type(LESSON_TYPE))?;
        Ok(records
            .into_iter()
            .filter_map(|record| {
                let id = record.id.clone();
                StoredLesson::try_from(record)
                    .map_err(|e| tracing::warn!("Skipping malformed lesson {}: {}", id, e))
                    .ok()
            })
            .collect())
    }
}
