//! StreamLog Stream Engine
//!
//! Append-only record streams on top of a pluggable storage provider.
//!
//! - [`StreamService`]: catalog-level operations and routing
//! - [`Stream`]: per-stream actor assigning ids and owning the ingest task
//! - [`IngestBuffer`]: bounded channel plus batch staging in front of the writer
//! - [`StreamIterator`]: filtered, resumable reads
//! - [`ServiceConfig`]: TOML and environment configuration
//!
//! Storage backends live in `streamlog-storage`, the data model and the
//! record-filter language in `streamlog-core`.

pub mod config;
pub mod error;
pub mod ingest;
pub mod iterator;
pub mod service;
pub mod stream;

pub use config::{ServiceConfig, StreamsConfig};
pub use error::{Result, ServiceError};
pub use ingest::IngestBuffer;
pub use iterator::{GetRecordsResponse, IteratorInfo, IteratorStats, StreamIterator};
pub use service::StreamService;
pub use stream::Stream;
