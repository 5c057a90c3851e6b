//! File Stream Writer
//!
//! Appends a batch in four steps:
//!
//! 1. Encode every record into one data buffer and one index buffer, computing
//!    offsets from the current data length
//! 2. Append and sync the data buffer
//! 3. Append and sync the index buffer
//! 4. Advance `readable` and persist `stream.json`
//!
//! If step 2 or 3 fails both files are truncated back to their lengths before
//! the batch, so a retried batch never duplicates records. Step 4 cannot undo
//! the batch: once the index is on disk the records are committed, and a
//! failure to refresh `stream.json` is only logged (the file is re-derived from
//! the index on the next load).

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::Utc;
use std::sync::Arc;
use streamlog_core::Record;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use super::index::IndexEntry;
use super::{FileStream, DATA_FILE, INDEX_FILE};
use crate::error::{Result, StorageError};
use crate::provider::StreamWriter;

pub struct FileWriter {
    stream: Arc<FileStream>,
    data: Option<File>,
    index: Option<File>,
    sync_on_write: bool,
}

struct EncodedBatch {
    data: Vec<u8>,
    index: BytesMut,
    lengths: Vec<u64>,
}

impl FileWriter {
    pub fn new(stream: Arc<FileStream>, sync_on_write: bool) -> Self {
        Self {
            stream,
            data: None,
            index: None,
            sync_on_write,
        }
    }

    fn encode(records: &[Record], start_offset: u64) -> Result<EncodedBatch> {
        let mut data = Vec::new();
        let mut index = BytesMut::with_capacity(records.len() * 32);
        let mut lengths = Vec::with_capacity(records.len());
        let mut offset = start_offset;

        for record in records {
            let line = record.encode_line()?;
            let length = line.len() as u64;
            IndexEntry {
                id: record.id,
                length,
                offset,
                timestamp_nanos: record.timestamp_nanos(),
            }
            .encode_into(&mut index);
            data.extend_from_slice(&line);
            lengths.push(length);
            offset += length;
        }

        Ok(EncodedBatch {
            data,
            index,
            lengths,
        })
    }

    async fn append(file: &mut File, bytes: &[u8], sync: bool) -> std::io::Result<()> {
        file.write_all(bytes).await?;
        file.flush().await?;
        if sync {
            file.sync_data().await?;
        }
        Ok(())
    }

    async fn rollback(file: &mut File, len: u64, what: &str, stream: uuid::Uuid) {
        if let Err(e) = file.set_len(len).await {
            error!(stream = %stream, file = what, error = %e, "Failed to roll back partial write");
        }
    }
}

async fn open_append(path: &std::path::Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

#[async_trait]
impl StreamWriter for FileWriter {
    async fn init(&mut self) -> Result<()> {
        let dir = self.stream.dir();
        if tokio::fs::metadata(dir).await.is_err() {
            return Err(StorageError::StreamNotFound(self.stream.uuid()));
        }
        Ok(())
    }

    async fn open(&mut self) -> Result<()> {
        let dir = self.stream.dir().to_path_buf();
        self.data = Some(open_append(&dir.join(DATA_FILE)).await?);
        self.index = Some(open_append(&dir.join(INDEX_FILE)).await?);
        debug!(stream = %self.stream.uuid(), "File writer opened");
        Ok(())
    }

    async fn write(&mut self, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let uuid = self.stream.uuid();
        let (data, index) = match (self.data.as_mut(), self.index.as_mut()) {
            (Some(data), Some(index)) => (data, index),
            _ => {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "writer is not open",
                )))
            }
        };

        let _guard = self.stream.index_lock.read().await;

        // Current lengths, not cached ones: a rebuild may have truncated a torn tail.
        let data_len = data.metadata().await?.len();
        let index_len = index.metadata().await?.len();
        let batch = Self::encode(records, data_len)?;

        if let Err(e) = Self::append(data, &batch.data, self.sync_on_write).await {
            Self::rollback(data, data_len, DATA_FILE, uuid).await;
            return Err(e.into());
        }
        if let Err(e) = Self::append(index, &batch.index, self.sync_on_write).await {
            Self::rollback(index, index_len, INDEX_FILE, uuid).await;
            Self::rollback(data, data_len, DATA_FILE, uuid).await;
            return Err(e.into());
        }

        {
            let mut info = self.stream.info.write().await;
            info.readable.observe_batch(records, &batch.lengths);
            if info.ingested.last_id < info.readable.last_id {
                info.ingested = info.readable.clone();
            }
            info.last_update = Utc::now();
        }
        if let Err(e) = self.stream.persist_info().await {
            warn!(stream = %uuid, error = %e, "Failed to persist stream metadata");
        }

        debug!(
            stream = %uuid,
            records = records.len(),
            bytes = batch.data.len(),
            "Batch committed"
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        for file in [self.data.take(), self.index.take()].into_iter().flatten() {
            file.sync_all().await?;
        }
        debug!(stream = %self.stream.uuid(), "File writer closed");
        Ok(())
    }
}
