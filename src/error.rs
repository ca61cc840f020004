// Error taxonomy for the storage engine
use std::fmt;
use std::io;

use crate::hash::ObjectId;

/// Which side of a transfer failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOperation {
    Push,
    Pull,
}

impl fmt::Display for TransferOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferOperation::Push => write!(f, "push"),
            TransferOperation::Pull => write!(f, "pull"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    /// Backend is not ready: missing directory, settings or credentials.
    #[error("Backend configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Wraps whatever the backend raised during a push or pull batch.
    #[error("Failed to {operation} {objects} objects ({bytes} bytes): {source}")]
    BackendTransfer {
        operation: TransferOperation,
        objects: usize,
        bytes: u64,
        #[source]
        source: Box<DatasetError>,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Content mismatch: expected {expected}, found {actual}")]
    Integrity { expected: ObjectId, actual: ObjectId },

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to (de)serialize JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Metadata database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to walk directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, DatasetError>;

/// Attach a human readable context to `io::Result`, mirroring `anyhow::Context`.
pub trait IoContext<T> {
    fn with_context<F: FnOnce() -> String>(self, context: F) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn with_context<F: FnOnce() -> String>(self, context: F) -> Result<T> {
        self.map_err(|source| DatasetError::Io {
            context: context(),
            source,
        })
    }
}

impl DatasetError {
    /// True for errors that re-running the same operation cannot fix.
    pub fn is_permanent(&self) -> bool {
        match self {
            DatasetError::Configuration(_)
            | DatasetError::NotFound(_)
            | DatasetError::InvalidArgument(_) => true,
            DatasetError::BackendTransfer { source, .. } => source.is_permanent(),
            _ => false,
        }
    }
}
