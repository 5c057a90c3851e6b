//! Storage Provider Capability Set
//!
//! Every backend implements three traits:
//!
//! - [`StorageProvider`]: catalog management and factories for per-stream handles
//! - [`StreamWriter`]: the single writer of a stream, owned by its ingest task
//! - [`IteratorHandler`]: the read side of one iterator
//!
//! ## Read Positions
//!
//! An iterator handler keeps a cursor on the *next* record it will return.
//! `seek` places the cursor the first time it is called; later calls restore
//! the position stored by the last `save_seek`, so a reader that is preempted
//! (cancelled, paged out) resumes at the first unread record.
//!
//! Handlers never read past the stream's `readable` statistics snapshot. A
//! record becomes visible only after the batch containing it committed.

use async_trait::async_trait;
use streamlog_core::{Record, SeekPosition, StreamInfo, StreamStats};
use uuid::Uuid;

use crate::error::{Result, StorageError};

/// Persistent home of the stream catalog and per-stream data.
///
/// ## Examples
///
/// ```ignore
/// use streamlog_storage::{FileProvider, FileConfig, StorageProvider};
/// use std::sync::Arc;
///
/// let provider: Arc<dyn StorageProvider> = Arc::new(FileProvider::new(FileConfig::default()));
/// provider.init().await?;
///
/// for uuid in provider.load_catalog().await? {
///     let info = provider.get_stream_info(uuid).await?;
///     println!("{} has {} readable records", uuid, info.readable.count);
/// }
/// ```
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Backend name as used in the provider registry.
    fn name(&self) -> &'static str;

    /// Bytes a record adds to a stream's `size_bytes` statistic. Producers
    /// use it for `ingested` so it agrees with the writer's `readable`.
    fn record_size(&self, record: &Record) -> u64 {
        record.payload.len() as u64
    }

    /// Acquire persistent resources (directories, connection pool, schema).
    async fn init(&self) -> Result<()>;

    /// Release persistent resources. Calling it twice is harmless.
    async fn stop(&self) -> Result<()>;

    /// A uuid that does not clash with any stream known at call time.
    async fn new_stream_id(&self) -> Result<Uuid>;

    async fn stream_exists(&self, uuid: Uuid) -> bool;

    /// Load the catalog into memory and return the ids of all streams.
    ///
    /// Streams whose per-stream data exists but which are absent from the
    /// catalog are ignored.
    ///
    /// # Errors
    ///
    /// - `Io` / `Database`: the catalog could not be read
    /// - `Serialization`: the catalog document is malformed
    async fn load_catalog(&self) -> Result<Vec<Uuid>>;

    /// Persist the catalog enumeration. A no-op for backends whose catalog is
    /// intrinsically persistent.
    async fn save_catalog(&self) -> Result<()>;

    /// Metadata and readable statistics of a stream.
    async fn get_stream_info(&self, uuid: Uuid) -> Result<StreamInfo>;

    /// Create per-stream storage and add the catalog entry.
    ///
    /// Either both exist afterwards or neither does.
    ///
    /// # Errors
    ///
    /// - `StreamExists`: the uuid is already registered
    async fn on_create_stream(&self, info: &StreamInfo) -> Result<()>;

    /// Destroy per-stream storage and remove the catalog entry.
    ///
    /// # Errors
    ///
    /// - `StreamNotFound`: the uuid is not registered
    async fn on_delete_stream(&self, uuid: Uuid) -> Result<()>;

    /// Build the writer of a stream. Only one writer per stream may be live.
    async fn new_writer(&self, uuid: Uuid) -> Result<Box<dyn StreamWriter>>;

    /// Build the read side of a new iterator.
    async fn new_iterator_handler(
        &self,
        stream: Uuid,
        iterator: Uuid,
    ) -> Result<Box<dyn IteratorHandler>>;

    /// Rebuild the primary index of a stream from its authoritative data and
    /// return the recomputed statistics.
    ///
    /// Holds the stream's index exclusively for its whole duration. Running it
    /// twice in a row produces identical index contents.
    async fn build_index(&self, uuid: Uuid) -> Result<StreamStats>;
}

/// Append side of a stream.
#[async_trait]
pub trait StreamWriter: Send {
    /// Validate that per-stream storage exists.
    async fn init(&mut self) -> Result<()>;

    /// Acquire write handles.
    async fn open(&mut self) -> Result<()>;

    /// Append a batch atomically: after `Ok(())` every record is readable and
    /// the stream's readable statistics include the batch; after `Err` none of
    /// it is, so the same batch can be written again.
    async fn write(&mut self, records: &[Record]) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Read side of a single iterator.
#[async_trait]
pub trait IteratorHandler: Send {
    async fn open(&mut self) -> Result<()>;

    /// Position the cursor, or restore the last saved position.
    ///
    /// # Errors
    ///
    /// - `RecordNotFound`: AT_MESSAGE_ID target absent, or AT_TIMESTAMP after
    ///   the last record
    /// - `InvalidSeek`: AFTER_MESSAGE_ID target beyond the last readable id
    async fn seek(&mut self, position: &SeekPosition) -> Result<()>;

    /// Next record, or `None` at the end of the readable range.
    ///
    /// A `CorruptedRecord` error consumes the failing record; the caller may
    /// continue reading (see [`StorageError::is_recoverable`]).
    ///
    /// Must be cancel-safe: a call dropped before completion leaves the
    /// position unchanged.
    async fn get_next(&mut self) -> Result<Option<Record>>;

    /// Remember the current position for the next `seek`.
    async fn save_seek(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Check an AFTER_MESSAGE_ID target against the readable range.
pub(crate) fn check_after_id(target: u64, readable: &StreamStats) -> Result<()> {
    if target > readable.last_id {
        return Err(StorageError::InvalidSeek(format!(
            "message id {} is beyond the last readable id {}",
            target, readable.last_id
        )));
    }
    Ok(())
}

/// First slot in `[0, count)` for which `pred` holds, assuming `pred` is
/// monotone (false..false, true..true). Returns `count` if it never holds.
pub(crate) fn lower_bound(count: u64, mut pred: impl FnMut(u64) -> bool) -> u64 {
    let (mut lo, mut hi) = (0u64, count);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(mid) {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    lo
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lower_bound() {
        let ids = [1u64, 2, 3, 5, 8, 13];
        let n = ids.len() as u64;
        assert_eq!(lower_bound(n, |i| ids[i as usize] >= 5), 3);
        assert_eq!(lower_bound(n, |i| ids[i as usize] >= 4), 3);
        assert_eq!(lower_bound(n, |i| ids[i as usize] >= 1), 0);
        assert_eq!(lower_bound(n, |i| ids[i as usize] >= 14), n);
        assert_eq!(lower_bound(0, |_| true), 0);
    }

    #[test]
    fn test_check_after_id() {
        let readable = StreamStats {
            count: 3,
            first_id: 1,
            last_id: 3,
            ..Default::default()
        };
        assert!(check_after_id(0, &readable).is_ok());
        assert!(check_after_id(3, &readable).is_ok());
        assert!(matches!(
            check_after_id(4, &readable),
            Err(StorageError::InvalidSeek(_))
        ));
    }
}
