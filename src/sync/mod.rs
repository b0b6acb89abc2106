//! Offline-first synchronization engine
//!
//! This module provides:
//! - A durable operation queue for mutations made while offline
//! - Retry policy with exponential backoff and error classification
//! - Connectivity observation and probing
//! - Conflict detection and resolution against the remote authority
//! - The sync coordinator that drains, pulls and reconciles
//!
//! Architecture:
//! - Mutations land in the local store first, then in the queue
//! - One sync pass at a time drains the queue oldest-first
//! - The pull phase diffs the authoritative set against the cache

pub mod conflict;
pub mod coordinator;
pub mod network;
pub mod operation;
pub mod queue;
pub mod record;
pub mod remote;
pub mod retry;

// Re-export key types
pub use conflict::{ConflictResolver, ConflictType, Detection, Resolution, SyncConflict};
pub use coordinator::{
    CoordinatorConfig, DropReason, SyncCommand, SyncCoordinator, SyncEvent, SyncOutcome,
    SyncStatus,
};
pub use network::{ConnectivityEvents, ConnectivityProbe, NetworkObserver, TcpProbe};
pub use operation::{Mutation, PendingOperation};
pub use queue::OperationQueue;
pub use record::{Entity, Record, RecordFilter, SyncState};
pub use remote::{HttpRemote, InMemoryRemote, Page, RemoteCall, RemoteDataService};
pub use retry::{CancelToken, ErrorClass, RetryPolicy};
