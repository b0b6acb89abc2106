use thiserror::Error;

/// Errors reported by the remote data service.
///
/// Variants follow the status taxonomy of the remote API so the retry
/// policy can tell transient transport failures apart from fatal ones.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Remote unavailable: {0}")]
    Unavailable(String),

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Unknown remote error: {0}")]
    Unknown(String),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Entity '{0}' not found")]
    NotFound(String),

    #[error("Entity '{0}' already exists")]
    AlreadyExists(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Record '{0}' not found")]
    RecordNotFound(String),

    #[error("Record '{0}' already exists")]
    RecordExists(String),

    #[error("Pending operation '{0}' not found")]
    OperationNotFound(String),

    #[error("No active conflict for '{0}'")]
    ConflictNotFound(String),

    #[error("Invalid resolution: {0}")]
    InvalidResolution(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Remote is unreachable (offline)")]
    Offline,

    #[error("Sync cancelled")]
    Cancelled,
}

pub type SyncResult<T> = Result<T, SyncError>;

impl From<rocksdb::Error> for SyncError {
    fn from(err: rocksdb::Error) -> Self {
        SyncError::Storage(err.into_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}
