//! Ingest Buffer
//!
//! Staging area between producers and the stream's writer.
//!
//! ```text
//! put() ──► mpsc (channel_buffer_size) ──► pending (≤ bulk_max_size) ──save()──► StreamWriter
//! ```
//!
//! Producers hold the [`mpsc::Sender`] returned by [`IngestBuffer::new`]; a
//! full channel makes them wait. The buffer itself, and with it the writer,
//! is owned by the stream's ingest task, so `save` calls never overlap.
//!
//! ## Failure handling
//!
//! `save` retries transient backend errors (I/O, database) with exponential
//! backoff. Writers roll back failed batches, so a retry never duplicates
//! records. After the last attempt the error is returned and the pending
//! records are kept; the caller decides whether the stream can go on.

use std::time::Duration;
use streamlog_core::Record;
use streamlog_storage::{StorageError, StreamWriter};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::StreamsConfig;

const INITIAL_BACKOFF_MS: u64 = 50;

pub struct IngestBuffer {
    stream: Uuid,
    writer: Box<dyn StreamWriter>,
    receiver: mpsc::Receiver<Record>,
    pending: Vec<Record>,
    max_size: usize,
    flush_frequency: Option<Duration>,
    retries: u32,
}

impl IngestBuffer {
    /// Build the buffer of a stream and the producer side of its channel.
    pub fn new(
        stream: Uuid,
        writer: Box<dyn StreamWriter>,
        config: &StreamsConfig,
    ) -> (Self, mpsc::Sender<Record>) {
        let (sender, receiver) = mpsc::channel(config.channel_buffer_size.max(1));
        let buffer = Self {
            stream,
            writer,
            receiver,
            pending: Vec::with_capacity(config.bulk_max_size.min(4096)),
            max_size: config.bulk_max_size.max(1),
            flush_frequency: config.flush_frequency(),
            retries: config.flush_retries.max(1),
        };
        (buffer, sender)
    }

    /// Next record from the channel, `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Record> {
        self.receiver.recv().await
    }

    /// Move records that are already queued into the pending slice, without
    /// waiting and without exceeding `bulk_max_size`.
    pub fn drain_ready(&mut self) -> usize {
        let mut moved = 0;
        while !self.is_full() {
            match self.receiver.try_recv() {
                Ok(record) => {
                    self.pending.push(record);
                    moved += 1;
                }
                Err(_) => break,
            }
        }
        moved
    }

    pub fn append(&mut self, record: Record) {
        self.pending.push(record);
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.max_size
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Timer period in batched mode, `None` in immediate mode.
    pub fn flush_frequency(&self) -> Option<Duration> {
        self.flush_frequency
    }

    /// Write the pending slice as one batch.
    ///
    /// Returns the last id now readable, or `None` when nothing was pending.
    /// On success the slice is empty.
    ///
    /// # Errors
    ///
    /// The writer's error after the final attempt, or immediately for
    /// errors that retrying cannot fix. The slice is left untouched.
    pub async fn save(&mut self) -> Result<Option<u64>, StorageError> {
        let Some(last_id) = self.pending.last().map(|r| r.id) else {
            return Ok(None);
        };

        let mut attempt = 0;
        loop {
            match self.writer.write(&self.pending).await {
                Ok(()) => {
                    tracing::debug!(
                        stream = %self.stream,
                        records = self.pending.len(),
                        last_id,
                        attempt = attempt + 1,
                        "Flushed ingest batch"
                    );
                    self.pending.clear();
                    return Ok(Some(last_id));
                }
                Err(e) if is_transient(&e) && attempt + 1 < self.retries => {
                    let backoff_ms = INITIAL_BACKOFF_MS * 2_u64.pow(attempt);
                    tracing::warn!(
                        stream = %self.stream,
                        attempt = attempt + 1,
                        backoff_ms,
                        error = %e,
                        "Flush failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        stream = %self.stream,
                        records = self.pending.len(),
                        attempts = attempt + 1,
                        error = %e,
                        "Flush failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Close the writer. Pending records are not flushed.
    pub async fn close(&mut self) -> Result<(), StorageError> {
        self.receiver.close();
        self.writer.close().await
    }
}

fn is_transient(e: &StorageError) -> bool {
    matches!(e, StorageError::Io(_) | StorageError::Database(_))
}
