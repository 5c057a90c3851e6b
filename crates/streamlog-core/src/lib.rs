//! StreamLog Core
//!
//! Shared data model for the StreamLog record-stream engine.
//!
//! ## What lives here?
//!
//! - [`record`]: the immutable [`Record`] that producers append and iterators
//!   replay, plus its on-disk line encoding
//! - [`stream`]: stream metadata ([`StreamInfo`]) and the two statistics
//!   blocks (`ingested` / `readable`)
//! - [`iterator`]: the iterator request payload and the seek policies it maps to
//! - [`filter`]: the record-filter expression engine used by iterators and by
//!   stream listings
//! - [`error`]: validation errors shared by the other crates
//!
//! This crate performs no I/O. Storage backends live in `streamlog-storage`,
//! the per-stream actors and the service live in `streamlog-server`.

pub mod error;
pub mod filter;
pub mod iterator;
pub mod record;
pub mod stream;

pub use error::{Error, ErrorKind, Result};
pub use filter::{Filter, FilterError};
pub use iterator::{IteratorRequest, IteratorType, SeekPosition};
pub use record::{Payload, Record};
pub use stream::{validate_properties, Properties, StreamInfo, StreamStats};
