//! Stream Iterator
//!
//! A named read position into one stream, with an optional record filter.
//!
//! ## Read contract
//!
//! `get_records(cancel, max)`:
//!
//! 1. Seek the handler (a no-op once positioned, a restore after a save)
//! 2. Pull records until `max` were gathered, the readable end is reached,
//!    the caller cancels, or the backend fails
//! 3. Corrupted records and records the filter cannot evaluate are counted
//!    under `errors`; records the filter rejects under `skipped`
//! 4. Save the handler position on every exit path
//!
//! For every call `count + skipped + errors` equals the number of records
//! consumed from the handler.
//!
//! Calls on one iterator are serialized by its state lock.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use streamlog_core::{Filter, IteratorRequest, Record, SeekPosition};
use streamlog_storage::{IteratorHandler, StorageError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, ServiceError};

/// Cumulative counters of an iterator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IteratorStats {
    /// Records consumed from storage, including errored ones
    pub records_read: u64,
    pub records_sent: u64,
    pub records_skipped: u64,
    pub records_errored: u64,
    /// Payload bytes of records consumed from storage
    pub bytes_read: u64,
    pub last_read_at: Option<DateTime<Utc>>,
}

/// Result of one `get_records` call.
#[derive(Debug, Clone)]
pub struct GetRecordsResponse {
    pub records: Vec<Record>,
    pub count: usize,
    pub errors: u64,
    pub skipped: u64,
    /// Id of the last record consumed, 0 before the first one
    pub last_id_read: u64,
    /// True when the call stopped before the readable end
    pub remain: bool,
    pub duration: Duration,
}

/// Snapshot for listings and introspection.
#[derive(Debug, Clone, Serialize)]
pub struct IteratorInfo {
    pub uuid: Uuid,
    pub stream: Uuid,
    pub name: Option<String>,
    pub request: IteratorRequest,
    pub created_at: DateTime<Utc>,
    pub last_id_read: u64,
    pub stats: IteratorStats,
}

struct IteratorState {
    handler: Box<dyn IteratorHandler>,
    last_id_read: u64,
    stats: IteratorStats,
    closed: bool,
}

pub struct StreamIterator {
    uuid: Uuid,
    stream: Uuid,
    request: IteratorRequest,
    position: SeekPosition,
    filter: Option<Filter>,
    created_at: DateTime<Utc>,
    /// Milliseconds since the epoch of the last read
    last_active_ms: AtomicI64,
    state: Mutex<IteratorState>,
}

impl StreamIterator {
    /// Wrap a handler that is already open and positioned.
    pub fn new(
        uuid: Uuid,
        stream: Uuid,
        request: IteratorRequest,
        position: SeekPosition,
        filter: Option<Filter>,
        handler: Box<dyn IteratorHandler>,
    ) -> Self {
        let now = Utc::now();
        Self {
            uuid,
            stream,
            request,
            position,
            filter,
            created_at: now,
            last_active_ms: AtomicI64::new(now.timestamp_millis()),
            state: Mutex::new(IteratorState {
                handler,
                last_id_read: 0,
                stats: IteratorStats::default(),
                closed: false,
            }),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> Option<&str> {
        self.request.name.as_deref()
    }

    pub fn request(&self) -> &IteratorRequest {
        &self.request
    }

    /// Time since the iterator was created or last read.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_active_ms.load(Ordering::Relaxed);
        let elapsed = Utc::now().timestamp_millis().saturating_sub(last);
        Duration::from_millis(elapsed.max(0) as u64)
    }

    fn touch(&self) {
        self.last_active_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub async fn info(&self) -> IteratorInfo {
        let state = self.state.lock().await;
        IteratorInfo {
            uuid: self.uuid,
            stream: self.stream,
            name: self.request.name.clone(),
            request: self.request.clone(),
            created_at: self.created_at,
            last_id_read: state.last_id_read,
            stats: state.stats.clone(),
        }
    }

    /// Read up to `max` records (see the module docs).
    ///
    /// # Errors
    ///
    /// - `IteratorNotFound`: the iterator was closed
    /// - `Storage`: the seek failed, or the backend failed before any record
    ///   was gathered. A failure after that returns the partial page with
    ///   `remain = true`.
    #[tracing::instrument(skip(self, cancel), fields(stream = %self.stream, iterator = %self.uuid))]
    pub async fn get_records(
        &self,
        cancel: &CancellationToken,
        max: usize,
    ) -> Result<GetRecordsResponse> {
        let started = Instant::now();
        self.touch();

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ServiceError::IteratorNotFound(self.uuid));
        }
        state.handler.seek(&self.position).await?;

        let mut records = Vec::with_capacity(max.min(1024));
        let mut errors = 0u64;
        let mut skipped = 0u64;
        let mut observed = 0u64;
        let mut bytes = 0u64;
        let mut interrupted = false;
        let mut fault: Option<StorageError> = None;

        while records.len() < max {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                next = state.handler.get_next() => next,
            };

            match next {
                Ok(None) => break,
                Ok(Some(record)) => {
                    observed += 1;
                    bytes += record.payload.len() as u64;
                    state.last_id_read = record.id;
                    match self.accepts(&record) {
                        Ok(true) => records.push(record),
                        Ok(false) => skipped += 1,
                        Err(e) => {
                            tracing::debug!(id = record.id, error = %e, "Filter evaluation failed");
                            errors += 1;
                        }
                    }
                }
                Err(e) if e.is_recoverable() => {
                    observed += 1;
                    errors += 1;
                    if let StorageError::CorruptedRecord { id, .. } = &e {
                        state.last_id_read = *id;
                    }
                    tracing::warn!(error = %e, "Skipping unreadable record");
                }
                Err(e) => {
                    fault = Some(e);
                    break;
                }
            }
        }

        let saved = state.handler.save_seek().await;

        let sent = records.len() as u64;
        let stats = &mut state.stats;
        stats.records_read += observed;
        stats.records_sent += sent;
        stats.records_skipped += skipped;
        stats.records_errored += errors;
        stats.bytes_read += bytes;
        if observed > 0 {
            stats.last_read_at = Some(Utc::now());
        }

        if let Some(e) = fault {
            if records.is_empty() {
                return Err(e.into());
            }
            tracing::warn!(error = %e, gathered = records.len(), "Read stopped by storage error");
            interrupted = true;
        }
        saved?;

        let count = records.len();
        Ok(GetRecordsResponse {
            records,
            count,
            errors,
            skipped,
            last_id_read: state.last_id_read,
            remain: interrupted || count == max,
            duration: started.elapsed(),
        })
    }

    fn accepts(&self, record: &Record) -> Result<bool> {
        match &self.filter {
            None => Ok(true),
            Some(filter) => {
                let value = record.payload.to_value()?;
                Ok(filter.matches(&value)?)
            }
        }
    }

    /// Release the handler. Later reads report `IteratorNotFound`.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.handler.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamlog_core::{Payload, Properties, StreamInfo};
    use streamlog_storage::{MemoryProvider, StorageProvider, StreamWriter};

    async fn memory_stream(payloads: &[&str]) -> (MemoryProvider, Uuid) {
        let provider = MemoryProvider::default();
        provider.init().await.unwrap();
        let uuid = provider.new_stream_id().await.unwrap();
        provider
            .on_create_stream(&StreamInfo::new(uuid, Properties::new()))
            .await
            .unwrap();

        let records: Vec<Record> = payloads
            .iter()
            .enumerate()
            .map(|(i, p)| Record::new(i as u64 + 1, Utc::now(), Payload::from_json(p).unwrap()))
            .collect();
        let mut writer = provider.new_writer(uuid).await.unwrap();
        writer.write(&records).await.unwrap();
        (provider, uuid)
    }

    async fn iterator(provider: &MemoryProvider, stream: Uuid, request: IteratorRequest) -> StreamIterator {
        let position = request.position().unwrap();
        let filter = request
            .jq_filter
            .as_deref()
            .map(Filter::compile)
            .transpose()
            .unwrap();
        let uuid = Uuid::new_v4();
        let mut handler = provider.new_iterator_handler(stream, uuid).await.unwrap();
        handler.open().await.unwrap();
        handler.seek(&position).await.unwrap();
        StreamIterator::new(uuid, stream, request, position, filter, handler)
    }

    #[tokio::test]
    async fn test_counts_add_up_with_filter() {
        let (provider, stream) = memory_stream(&[
            r#"{"level":"info"}"#,
            r#"{"level":"warn"}"#,
            r#"[1,2]"#,
            r#"{"level":"warn"}"#,
        ])
        .await;
        let it = iterator(&provider, stream, IteratorRequest::first().with_filter(".level == \"warn\"")).await;

        let response = it.get_records(&CancellationToken::new(), 10).await.unwrap();
        assert_eq!(response.count, 2);
        assert_eq!(response.skipped, 1);
        // indexing an array with a string key is an evaluation error
        assert_eq!(response.errors, 1);
        assert_eq!(response.last_id_read, 4);
        assert!(!response.remain);

        let info = it.info().await;
        assert_eq!(info.stats.records_read, 4);
        assert_eq!(
            info.stats.records_sent + info.stats.records_skipped + info.stats.records_errored,
            info.stats.records_read
        );
    }

    #[tokio::test]
    async fn test_resumes_after_page() {
        let (provider, stream) = memory_stream(&["1", "2", "3", "4", "5"]).await;
        let it = iterator(&provider, stream, IteratorRequest::first()).await;
        let cancel = CancellationToken::new();

        let page = it.get_records(&cancel, 2).await.unwrap();
        assert_eq!(page.records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(page.remain);

        let page = it.get_records(&cancel, 10).await.unwrap();
        assert_eq!(page.records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert!(!page.remain);
        assert_eq!(page.last_id_read, 5);
    }

    #[tokio::test]
    async fn test_cancelled_read_keeps_position() {
        let (provider, stream) = memory_stream(&["1", "2", "3"]).await;
        let it = iterator(&provider, stream, IteratorRequest::first()).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let page = it.get_records(&cancel, 10).await.unwrap();
        assert_eq!(page.count, 0);
        assert!(page.remain);
        assert_eq!(page.last_id_read, 0);

        let page = it.get_records(&CancellationToken::new(), 10).await.unwrap();
        assert_eq!(page.count, 3);
    }

    /// Handler that yields one record, then waits forever for storage.
    struct StalledHandler {
        served: bool,
    }

    #[async_trait::async_trait]
    impl IteratorHandler for StalledHandler {
        async fn open(&mut self) -> streamlog_storage::Result<()> {
            Ok(())
        }

        async fn seek(&mut self, _position: &SeekPosition) -> streamlog_storage::Result<()> {
            Ok(())
        }

        async fn get_next(&mut self) -> streamlog_storage::Result<Option<Record>> {
            if !self.served {
                self.served = true;
                return Ok(Some(Record::new(1, Utc::now(), Payload::from_json("1").unwrap())));
            }
            std::future::pending().await
        }

        async fn save_seek(&mut self) -> streamlog_storage::Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> streamlog_storage::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_slow_storage() {
        let it = StreamIterator::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            IteratorRequest::first(),
            SeekPosition::First,
            None,
            Box::new(StalledHandler { served: false }),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let page = tokio::time::timeout(Duration::from_secs(5), it.get_records(&cancel, 10))
            .await
            .expect("read should stop on cancellation")
            .unwrap();
        assert_eq!(page.count, 1);
        assert_eq!(page.last_id_read, 1);
        assert!(page.remain);
    }

    #[tokio::test]
    async fn test_closed_iterator_is_not_found() {
        let (provider, stream) = memory_stream(&["1"]).await;
        let it = iterator(&provider, stream, IteratorRequest::first()).await;
        it.close().await.unwrap();
        it.close().await.unwrap();

        assert!(matches!(
            it.get_records(&CancellationToken::new(), 1).await,
            Err(ServiceError::IteratorNotFound(_))
        ));
    }
}
