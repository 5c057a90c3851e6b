//! Service Error Types
//!
//! Errors surfaced by the stream engine. Storage and validation errors are
//! wrapped with `#[from]`; [`ServiceError::kind`] classifies any of them.
//!
//! ## Propagation
//!
//! - Per-record corruption never reaches this type: iterators count and skip it
//! - A failed batch write terminates the stream's ingest loop and marks the
//!   stream degraded; later puts report `Degraded`
//! - Stream start failures during `init` are collected into one `StartFailed`

use streamlog_core::ErrorKind;
use streamlog_storage::StorageError;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Stream not found: {0}")]
    StreamNotFound(Uuid),

    #[error("Iterator not found: {0}")]
    IteratorNotFound(Uuid),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Ingest channel is full")]
    Busy,

    #[error("Stream is closed: {0}")]
    Closed(Uuid),

    #[error("Service is stopped")]
    Stopped,

    #[error("Stream is degraded after a storage fault: {0}")]
    Degraded(Uuid),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{failed} of {total} streams failed to start: {}", .details.join("; "))]
    StartFailed {
        failed: usize,
        total: usize,
        details: Vec<String>,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Core(#[from] streamlog_core::Error),
}

impl From<streamlog_core::FilterError> for ServiceError {
    fn from(e: streamlog_core::FilterError) -> Self {
        ServiceError::Core(e.into())
    }
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::StreamNotFound(_) | ServiceError::IteratorNotFound(_) => {
                ErrorKind::NotFound
            }
            ServiceError::QuotaExceeded(_) | ServiceError::Busy => ErrorKind::QuotaExceeded,
            ServiceError::Closed(_) | ServiceError::Stopped => ErrorKind::Closed,
            ServiceError::Degraded(_) | ServiceError::StartFailed { .. } => {
                ErrorKind::StorageFault
            }
            ServiceError::Cancelled(_) => ErrorKind::Cancelled,
            ServiceError::Config(_) => ErrorKind::InvalidArgument,
            ServiceError::Storage(e) => e.kind(),
            ServiceError::Core(e) => e.kind(),
        }
    }
}
