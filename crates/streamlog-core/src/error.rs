//! Core Error Types
//!
//! This module defines the validation errors raised while building requests,
//! compiling filters and checking stream properties, plus the [`ErrorKind`]
//! taxonomy every StreamLog error maps onto.
//!
//! ## Error Kinds
//!
//! | Kind | Meaning |
//! |------|---------|
//! | `InvalidArgument` | Bad uuid, malformed request, invalid filter, unknown iterator type |
//! | `NotFound` | Unknown stream, iterator or record |
//! | `QuotaExceeded` | Stream cap, iterator cap, backend limits, full ingest channel |
//! | `Conflict` | Duplicate stream creation |
//! | `StorageFault` | I/O or database failure on a critical path |
//! | `CorruptedRecord` | A single record could not be decoded |
//! | `Cancelled` | Caller cancellation or wait timeout |
//! | `Closed` | The stream or service is stopping |
//!
//! Storage and service errors expose `kind()` so callers (an HTTP layer, a CLI)
//! can translate them without matching every variant.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification shared by all StreamLog errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    QuotaExceeded,
    Conflict,
    StorageFault,
    CorruptedRecord,
    Cancelled,
    Closed,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::InvalidArgument => "invalid-argument",
            ErrorKind::NotFound => "not-found",
            ErrorKind::QuotaExceeded => "quota-exceeded",
            ErrorKind::Conflict => "conflict",
            ErrorKind::StorageFault => "storage-fault",
            ErrorKind::CorruptedRecord => "corrupted-record",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid stream properties: {0}")]
    InvalidProperties(String),

    #[error("Invalid filter expression: {0}")]
    InvalidFilter(String),

    #[error("Invalid iterator request: {0}")]
    InvalidRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// All core errors are caller mistakes.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidArgument
    }
}
