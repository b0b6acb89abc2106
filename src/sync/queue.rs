//! Durable operation queue
//!
//! Pending mutations are persisted under `queue:{sequence:020}` so a plain
//! prefix scan returns them in enqueue order after a restart. An in-memory
//! mirror behind a read/write lock serves snapshots: a drain works on the
//! snapshot it took, so operations enqueued meanwhile wait for the next
//! pass.
//!
//! Entries that no longer decode are moved to `queue_dead:` on open.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::operation::PendingOperation;
use crate::error::{SyncError, SyncResult};
use crate::storage::kv::{BatchOp, PersistentStore};

const QUEUE_PREFIX: &str = "queue:";
const SEQ_KEY: &str = "queue:_sequence";
const DEAD_PREFIX: &str = "queue_dead:";

struct QueueInner {
    sequence: u64,
    ops: BTreeMap<u64, PendingOperation>,
}

pub struct OperationQueue {
    kv: Arc<dyn PersistentStore>,
    inner: RwLock<QueueInner>,
    max_retries: u32,
}

impl OperationQueue {
    /// Open the queue, reloading anything persisted by a previous process
    pub fn open(kv: Arc<dyn PersistentStore>, max_retries: u32) -> SyncResult<Self> {
        let mut sequence = match kv.get(SEQ_KEY)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes.as_slice().try_into().unwrap_or([0u8; 8]);
                u64::from_be_bytes(arr)
            }
            None => 0,
        };

        let mut ops = BTreeMap::new();
        let mut quarantine = Vec::new();
        for (key, value) in kv.list_by_prefix(QUEUE_PREFIX)? {
            if key == SEQ_KEY {
                continue;
            }
            let decoded = serde_json::from_slice::<PendingOperation>(&value);
            match decoded {
                Ok(op) => {
                    sequence = sequence.max(op.sequence);
                    ops.insert(op.sequence, op);
                }
                Err(e) => {
                    tracing::error!("Queue: moving unreadable entry {} aside: {}", key, e);
                    let dead_key = format!("{}{}", DEAD_PREFIX, &key[QUEUE_PREFIX.len()..]);
                    quarantine.push(BatchOp::Put {
                        key: dead_key,
                        value,
                    });
                    quarantine.push(BatchOp::Delete { key });
                }
            }
        }
        if !quarantine.is_empty() {
            kv.apply_batch(quarantine)?;
        }

        if !ops.is_empty() {
            tracing::info!("Queue: restored {} pending operations", ops.len());
        }

        Ok(Self {
            kv,
            inner: RwLock::new(QueueInner { sequence, ops }),
            max_retries,
        })
    }

    fn key(sequence: u64) -> String {
        format!("{}{:020}", QUEUE_PREFIX, sequence)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Append an operation; returns once it is durably written
    pub fn enqueue(&self, mut op: PendingOperation) -> SyncResult<PendingOperation> {
        let mut inner = self.inner.write();
        let seq = inner.sequence + 1;
        op.sequence = seq;

        self.kv.apply_batch(vec![
            BatchOp::Put {
                key: Self::key(seq),
                value: serde_json::to_vec(&op)?,
            },
            BatchOp::Put {
                key: SEQ_KEY.to_string(),
                value: seq.to_be_bytes().to_vec(),
            },
        ])?;

        inner.sequence = seq;
        inner.ops.insert(seq, op.clone());
        tracing::debug!(
            "Queue: enqueued {} {} #{} ({})",
            op.mutation.name(),
            op.entity_id,
            seq,
            op.id
        );
        Ok(op)
    }

    /// Consistent snapshot of every pending operation, oldest first
    pub fn peek_all(&self) -> Vec<PendingOperation> {
        self.inner.read().ops.values().cloned().collect()
    }

    /// Pending operations for one entity, oldest first
    pub fn pending_for(&self, entity_id: &str) -> Vec<PendingOperation> {
        self.inner
            .read()
            .ops
            .values()
            .filter(|op| op.entity_id == entity_id)
            .cloned()
            .collect()
    }

    pub fn contains(&self, op_id: &str) -> bool {
        self.inner.read().ops.values().any(|op| op.id == op_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().ops.is_empty()
    }

    pub fn remove(&self, op_id: &str) -> SyncResult<PendingOperation> {
        let mut inner = self.inner.write();
        let seq = Self::find(&inner, op_id)?;
        self.kv.delete(&Self::key(seq))?;
        inner
            .ops
            .remove(&seq)
            .ok_or_else(|| SyncError::OperationNotFound(op_id.to_string()))
    }

    /// Drop every pending operation for an entity
    pub fn remove_for_entity(&self, entity_id: &str) -> SyncResult<usize> {
        let mut inner = self.inner.write();
        let seqs: Vec<u64> = inner
            .ops
            .values()
            .filter(|op| op.entity_id == entity_id)
            .map(|op| op.sequence)
            .collect();
        if seqs.is_empty() {
            return Ok(0);
        }

        self.kv.apply_batch(
            seqs.iter()
                .map(|seq| BatchOp::Delete {
                    key: Self::key(*seq),
                })
                .collect(),
        )?;
        for seq in &seqs {
            inner.ops.remove(seq);
        }
        Ok(seqs.len())
    }

    /// Record a failed drain attempt.
    ///
    /// Returns the new retry count and whether the ceiling has been reached.
    pub fn increment_retry(&self, op_id: &str) -> SyncResult<(u32, bool)> {
        let mut inner = self.inner.write();
        let seq = Self::find(&inner, op_id)?;

        let mut op = inner
            .ops
            .get(&seq)
            .cloned()
            .ok_or_else(|| SyncError::OperationNotFound(op_id.to_string()))?;
        op.retry_count = op.retry_count.saturating_add(1);
        self.kv.put(&Self::key(seq), &serde_json::to_vec(&op)?)?;

        let count = op.retry_count;
        inner.ops.insert(seq, op);
        Ok((count, count >= self.max_retries))
    }

    fn find(inner: &QueueInner, op_id: &str) -> SyncResult<u64> {
        inner
            .ops
            .values()
            .find(|op| op.id == op_id)
            .map(|op| op.sequence)
            .ok_or_else(|| SyncError::OperationNotFound(op_id.to_string()))
    }
}
