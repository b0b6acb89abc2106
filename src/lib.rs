pub mod client;
pub mod config;
pub mod error;
pub mod lesson;
pub mod storage;
pub mod sync;

pub use client::SyncClient;
pub use config::SyncConfig;
pub use error::{RemoteError, SyncError, SyncResult};
pub use lesson::{Lesson, LessonRepository, StoredLesson, LESSON_TYPE};
pub use storage::{LocalStore, MemoryStore, PersistentStore, RocksStore};
pub use sync::{
    ConflictType, HttpRemote, InMemoryRemote, NetworkObserver, OperationQueue, PendingOperation,
    Record, RecordFilter, RemoteDataService, Resolution, RetryPolicy, SyncConflict,
    SyncCoordinator, SyncEvent, SyncOutcome, SyncState, SyncStatus,
};
