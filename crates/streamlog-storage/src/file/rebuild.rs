//! Index Verification and Rebuild
//!
//! `data.jsonl` is authoritative; `index.bin` can always be derived from it.
//! On load the provider checks that the two agree and, if not, regenerates
//! the index with [`rebuild_index`].
//!
//! ## Crash Windows
//!
//! The writer appends data before the index. A crash between the two leaves
//! lines without entries; a crash in the middle of a data write leaves a torn
//! trailing line. Rebuild handles both: it re-derives every entry and cuts a
//! torn tail off `data.jsonl`. A damaged line in the middle of the file is not
//! repaired and fails the rebuild.

use bytes::BytesMut;
use std::path::Path;
use streamlog_core::{Record, StreamStats};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use super::index::{self, IndexEntry, ENTRY_SIZE};
use super::{DATA_FILE, INDEX_FILE};
use crate::error::{Result, StorageError};

/// Whether `index.bin` describes `data.jsonl` exactly.
pub async fn verify_index(dir: &Path) -> Result<bool> {
    let data_len = file_len(&dir.join(DATA_FILE)).await?;
    let index_len = file_len(&dir.join(INDEX_FILE)).await?;

    if index_len % ENTRY_SIZE != 0 {
        return Ok(false);
    }
    if index_len == 0 {
        return Ok(data_len == 0);
    }

    let mut file = File::open(dir.join(INDEX_FILE)).await?;
    let last = index::read_entry(&mut file, index_len / ENTRY_SIZE - 1).await?;
    Ok(last.end_offset() == data_len)
}

/// Readable statistics derived from a verified index.
pub async fn stats_from_index(dir: &Path) -> Result<StreamStats> {
    let index_len = file_len(&dir.join(INDEX_FILE)).await?;
    let count = index_len / ENTRY_SIZE;
    if count == 0 {
        return Ok(StreamStats::default());
    }

    let mut file = File::open(dir.join(INDEX_FILE)).await?;
    let first = index::read_entry(&mut file, 0).await?;
    let last = index::read_entry(&mut file, count - 1).await?;

    Ok(StreamStats {
        count,
        size_bytes: last.end_offset(),
        first_id: first.id,
        last_id: last.id,
        first_time: Some(streamlog_core::record::from_timestamp_nanos(
            first.timestamp_nanos,
        )),
        last_time: Some(streamlog_core::record::from_timestamp_nanos(
            last.timestamp_nanos,
        )),
    })
}

/// Regenerate `index.bin` from `data.jsonl`, truncating a torn tail.
///
/// The caller must hold the stream's index lock exclusively.
pub async fn rebuild_index(dir: &Path) -> Result<StreamStats> {
    let data_path = dir.join(DATA_FILE);
    let data_len = file_len(&data_path).await?;

    let mut reader = BufReader::new(File::open(&data_path).await?);
    let mut entries = BytesMut::new();
    let mut stats = StreamStats::default();
    let mut line = Vec::new();
    let mut offset = 0u64;
    let mut torn_at: Option<u64> = None;

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await? as u64;
        if n == 0 {
            break;
        }

        let is_last = offset + n == data_len;
        if line.last() != Some(&b'\n') {
            torn_at = Some(offset);
            break;
        }

        let record = match Record::decode_line(&line) {
            Ok(record) => record,
            Err(e) if is_last => {
                debug!(offset, error = %e, "undecodable trailing line");
                torn_at = Some(offset);
                break;
            }
            Err(e) => {
                return Err(StorageError::Corrupted(format!(
                    "line at offset {} cannot be decoded: {}",
                    offset, e
                )))
            }
        };

        if stats.count > 0 && record.id <= stats.last_id {
            return Err(StorageError::Corrupted(format!(
                "record id {} at offset {} does not follow {}",
                record.id, offset, stats.last_id
            )));
        }

        IndexEntry {
            id: record.id,
            length: n,
            offset,
            timestamp_nanos: record.timestamp_nanos(),
        }
        .encode_into(&mut entries);
        stats.observe(record.id, record.creation_time, n);
        offset += n;
    }

    if let Some(at) = torn_at {
        warn!(
            path = %data_path.display(),
            offset = at,
            dropped_bytes = data_len - at,
            "Truncating torn tail of data file"
        );
        let data = OpenOptions::new().write(true).open(&data_path).await?;
        data.set_len(at).await?;
        data.sync_all().await?;
    }

    // Truncate in place: an open writer keeps appending to the same file.
    let mut index_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dir.join(INDEX_FILE))
        .await?;
    index_file.write_all(&entries).await?;
    index_file.flush().await?;
    index_file.sync_all().await?;

    Ok(stats)
}

async fn file_len(path: &Path) -> Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}
