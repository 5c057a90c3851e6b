//! Storage Error Types
//!
//! This module defines all error types that can occur inside a storage provider.
//!
//! ## Error Categories
//!
//! ### Catalog Errors
//! - `StreamNotFound`: The stream is not in the catalog
//! - `StreamExists`: A stream with this uuid is already registered
//!
//! ### Read Errors
//! - `RecordNotFound`: A seek target does not exist (AT_MESSAGE_ID, AT_TIMESTAMP)
//! - `InvalidSeek`: A seek target is outside the readable range
//! - `CorruptedRecord`: A single record could not be decoded; readers may skip it
//! - `Corrupted`: The per-stream data is damaged beyond a single record
//!
//! ### Backend Errors
//! - `Io`, `Database`: Low-level failures on the file or SQL path
//! - `QuotaExceeded`: A backend limit was hit
//!
//! ## Usage
//!
//! All provider operations return `Result<T>` which is aliased to
//! `Result<T, StorageError>`. Callers classify failures through
//! [`StorageError::kind`] and decide whether an iterator may keep reading
//! through [`StorageError::is_recoverable`].

use streamlog_core::ErrorKind;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Stream not found: {0}")]
    StreamNotFound(Uuid),

    #[error("Stream already exists: {0}")]
    StreamExists(Uuid),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Invalid seek: {0}")]
    InvalidSeek(String),

    #[error("Corrupted record {id}: {reason}")]
    CorruptedRecord { id: u64, reason: String },

    #[error("Corrupted stream data: {0}")]
    Corrupted(String),

    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Unknown storage type: {0}")]
    UnknownStorageType(String),

    #[error("Storage provider not initialized")]
    NotInitialized,

    #[error("Iterator handler is not positioned")]
    NotPositioned,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] streamlog_core::Error),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::StreamNotFound(_) | StorageError::RecordNotFound(_) => {
                ErrorKind::NotFound
            }
            StorageError::StreamExists(_) => ErrorKind::Conflict,
            StorageError::InvalidSeek(_)
            | StorageError::UnknownStorageType(_)
            | StorageError::Core(_) => ErrorKind::InvalidArgument,
            StorageError::CorruptedRecord { .. } => ErrorKind::CorruptedRecord,
            StorageError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            StorageError::Corrupted(_)
            | StorageError::NotInitialized
            | StorageError::NotPositioned
            | StorageError::Io(_)
            | StorageError::Database(_)
            | StorageError::Serialization(_) => ErrorKind::StorageFault,
        }
    }

    /// Whether a reader may skip the failing record and continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StorageError::CorruptedRecord { .. })
    }
}
