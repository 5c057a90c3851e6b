//! File Iterator Handler
//!
//! Reads records by index slot. The cursor is the slot of the next record to
//! return; seeks resolve to a slot with a binary search over `index.bin`.
//!
//! ## Read-Ahead
//!
//! Records are fetched a page at a time: up to `page_size` index entries in
//! one read, then the data span they cover in one contiguous read. Entries are
//! contiguous in `data.jsonl`, so the span is exactly
//! `[first.offset, last.offset + last.length)`.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use streamlog_core::record::timestamp_nanos;
use streamlog_core::{Record, SeekPosition};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;
use uuid::Uuid;

use super::index;
use super::{FileStream, DATA_FILE, INDEX_FILE};
use crate::error::{Result, StorageError};
use crate::provider::{check_after_id, IteratorHandler};

pub struct FileIteratorHandler {
    stream: Arc<FileStream>,
    iterator: Uuid,
    page_size: usize,
    data: Option<File>,
    index: Option<File>,
    /// Slot of the next record to return
    position: Option<u64>,
    saved: Option<u64>,
    page: VecDeque<Result<Record>>,
}

impl FileIteratorHandler {
    pub fn new(stream: Arc<FileStream>, iterator: Uuid, page_size: usize) -> Self {
        Self {
            stream,
            iterator,
            page_size: page_size.max(1),
            data: None,
            index: None,
            position: None,
            saved: None,
            page: VecDeque::new(),
        }
    }

    fn files(&mut self) -> Result<(&mut File, &mut File)> {
        match (self.data.as_mut(), self.index.as_mut()) {
            (Some(data), Some(index)) => Ok((data, index)),
            _ => Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "iterator handler is not open",
            ))),
        }
    }

    async fn resolve(&mut self, position: &SeekPosition) -> Result<u64> {
        let readable = self.stream.readable().await;
        let count = readable.count;
        let (_, index) = self.files()?;

        let slot = match *position {
            SeekPosition::First => 0,
            SeekPosition::Last => count.saturating_sub(1),
            SeekPosition::AfterLast => count,
            SeekPosition::AtId(id) => {
                let slot = index::search(index, count, |e| e.id >= id).await?;
                if slot == count || index::read_entry(index, slot).await?.id != id {
                    return Err(StorageError::RecordNotFound(format!("message id {}", id)));
                }
                slot
            }
            SeekPosition::AfterId(id) => {
                check_after_id(id, &readable)?;
                index::search(index, count, |e| e.id > id).await?
            }
            SeekPosition::AtTimestamp(t) => {
                let target = timestamp_nanos(&t);
                let slot = index::search(index, count, |e| e.timestamp_nanos >= target).await?;
                if slot == count {
                    return Err(StorageError::RecordNotFound(format!(
                        "no record at or after {}",
                        t.to_rfc3339()
                    )));
                }
                slot
            }
        };
        Ok(slot)
    }

    /// Fetch the next page starting at `slot`. Returns false at the end of the
    /// readable range.
    async fn fill_page(&mut self, slot: u64) -> Result<bool> {
        let stream = self.stream.clone();
        let _guard = stream.index_lock.read().await;
        let count = stream.readable().await.count;
        if slot >= count {
            return Ok(false);
        }

        let n = (count - slot).min(self.page_size as u64);
        let (data, index) = self.files()?;
        let entries = index::read_entries(index, slot, n).await?;

        let (start, end) = match (entries.first(), entries.last()) {
            (Some(first), Some(last)) => (first.offset, last.end_offset()),
            _ => return Ok(false),
        };
        let mut span = vec![0u8; (end - start) as usize];
        data.seek(std::io::SeekFrom::Start(start)).await?;
        data.read_exact(&mut span).await?;

        for entry in &entries {
            let from = (entry.offset - start) as usize;
            let to = from + entry.length as usize;
            let decoded = span
                .get(from..to)
                .ok_or_else(|| StorageError::CorruptedRecord {
                    id: entry.id,
                    reason: "index entry points outside the data span".to_string(),
                })
                .and_then(|line| {
                    Record::decode_line(line).map_err(|e| StorageError::CorruptedRecord {
                        id: entry.id,
                        reason: e.to_string(),
                    })
                })
                .and_then(|record| {
                    if record.id == entry.id {
                        Ok(record)
                    } else {
                        Err(StorageError::CorruptedRecord {
                            id: entry.id,
                            reason: format!("line holds id {}", record.id),
                        })
                    }
                });
            self.page.push_back(decoded);
        }

        debug!(
            stream = %stream.uuid(),
            iterator = %self.iterator,
            slot,
            records = entries.len(),
            "Read-ahead page loaded"
        );
        Ok(true)
    }
}

#[async_trait]
impl IteratorHandler for FileIteratorHandler {
    async fn open(&mut self) -> Result<()> {
        let dir = self.stream.dir();
        self.data = Some(File::open(dir.join(DATA_FILE)).await?);
        self.index = Some(File::open(dir.join(INDEX_FILE)).await?);
        Ok(())
    }

    async fn seek(&mut self, position: &SeekPosition) -> Result<()> {
        if let Some(saved) = self.saved {
            if self.position != Some(saved) {
                self.page.clear();
            }
            self.position = Some(saved);
            return Ok(());
        }
        if self.position.is_some() {
            return Ok(());
        }

        let slot = {
            let stream = self.stream.clone();
            let _guard = stream.index_lock.read().await;
            self.resolve(position).await?
        };
        debug!(iterator = %self.iterator, slot, "Iterator positioned");
        self.position = Some(slot);
        Ok(())
    }

    async fn get_next(&mut self) -> Result<Option<Record>> {
        let slot = self.position.ok_or(StorageError::NotPositioned)?;
        if self.page.is_empty() && !self.fill_page(slot).await? {
            return Ok(None);
        }

        match self.page.pop_front() {
            Some(result) => {
                self.position = Some(slot + 1);
                result.map(Some)
            }
            None => Ok(None),
        }
    }

    async fn save_seek(&mut self) -> Result<()> {
        self.saved = self.position;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.page.clear();
        self.data = None;
        self.index = None;
        Ok(())
    }
}
