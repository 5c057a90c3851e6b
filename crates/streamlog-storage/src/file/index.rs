//! Binary Index File
//!
//! `index.bin` is a packed array of 32-byte entries, one per line of
//! `data.jsonl`, in the same order:
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────────────┐
//! │ id (u64) │ len (u64)│ off (u64)│ timestamp (i64)  │   little-endian
//! └──────────┴──────────┴──────────┴──────────────────┘
//!   slot i lives at byte i * 32
//! ```
//!
//! Invariants:
//! - ids strictly increase, timestamps never decrease
//! - `entry[i].offset + entry[i].length == entry[i + 1].offset`
//! - the last entry ends exactly at the length of `data.jsonl`
//!
//! Random access by slot makes id and timestamp lookups a binary search over
//! the file without loading it.

use bytes::{Buf, BufMut, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{Result, StorageError};

pub const ENTRY_SIZE: u64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: u64,
    pub length: u64,
    pub offset: u64,
    pub timestamp_nanos: i64,
}

impl IndexEntry {
    /// Byte offset just past this record's line.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.length
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.id);
        buf.put_u64_le(self.length);
        buf.put_u64_le(self.offset);
        buf.put_i64_le(self.timestamp_nanos);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < ENTRY_SIZE as usize {
            return Err(StorageError::Corrupted(format!(
                "index entry needs {} bytes, got {}",
                ENTRY_SIZE,
                buf.len()
            )));
        }
        Ok(Self {
            id: buf.get_u64_le(),
            length: buf.get_u64_le(),
            offset: buf.get_u64_le(),
            timestamp_nanos: buf.get_i64_le(),
        })
    }
}

/// Decode a run of packed entries.
pub fn decode_entries(bytes: &[u8]) -> Result<Vec<IndexEntry>> {
    if bytes.len() as u64 % ENTRY_SIZE != 0 {
        return Err(StorageError::Corrupted(format!(
            "index length {} is not a multiple of {}",
            bytes.len(),
            ENTRY_SIZE
        )));
    }
    bytes
        .chunks_exact(ENTRY_SIZE as usize)
        .map(IndexEntry::decode)
        .collect()
}

/// Read `count` entries starting at `slot`.
pub async fn read_entries(file: &mut File, slot: u64, count: u64) -> Result<Vec<IndexEntry>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let mut buf = vec![0u8; (count * ENTRY_SIZE) as usize];
    file.seek(std::io::SeekFrom::Start(slot * ENTRY_SIZE)).await?;
    file.read_exact(&mut buf).await?;
    decode_entries(&buf)
}

pub async fn read_entry(file: &mut File, slot: u64) -> Result<IndexEntry> {
    let mut buf = [0u8; ENTRY_SIZE as usize];
    file.seek(std::io::SeekFrom::Start(slot * ENTRY_SIZE)).await?;
    file.read_exact(&mut buf).await?;
    IndexEntry::decode(&buf)
}

/// First slot in `[0, count)` whose entry satisfies `pred`, or `count`.
///
/// `pred` must be monotone over the index (false for a prefix, true after).
pub async fn search<F>(file: &mut File, count: u64, pred: F) -> Result<u64>
where
    F: Fn(&IndexEntry) -> bool,
{
    let (mut lo, mut hi) = (0u64, count);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let entry = read_entry(file, mid).await?;
        if pred(&entry) {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Ok(lo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn entries(n: u64) -> Vec<IndexEntry> {
        let mut offset = 0;
        (1..=n)
            .map(|id| {
                let entry = IndexEntry {
                    id,
                    length: 40 + id,
                    offset,
                    // two records share each timestamp
                    timestamp_nanos: ((id + 1) / 2) as i64 * 1_000,
                };
                offset = entry.end_offset();
                entry
            })
            .collect()
    }

    async fn write_index(dir: &std::path::Path, entries: &[IndexEntry]) -> File {
        let path = dir.join("index.bin");
        let mut buf = BytesMut::new();
        for e in entries {
            e.encode_into(&mut buf);
        }
        let mut file = File::create(&path).await.unwrap();
        file.write_all(&buf).await.unwrap();
        file.flush().await.unwrap();
        File::open(&path).await.unwrap()
    }

    #[test]
    fn test_entry_layout_is_little_endian() {
        let entry = IndexEntry {
            id: 1,
            length: 2,
            offset: 3,
            timestamp_nanos: -4,
        };
        let mut buf = BytesMut::new();
        entry.encode_into(&mut buf);
        assert_eq!(buf.len(), 32);
        assert_eq!(&buf[0..8], &1u64.to_le_bytes());
        assert_eq!(&buf[8..16], &2u64.to_le_bytes());
        assert_eq!(&buf[16..24], &3u64.to_le_bytes());
        assert_eq!(&buf[24..32], &(-4i64).to_le_bytes());
        assert_eq!(IndexEntry::decode(&buf).unwrap(), entry);
    }

    #[test]
    fn test_decode_entries_rejects_partial() {
        assert!(decode_entries(&[0u8; 33]).is_err());
        assert_eq!(decode_entries(&[0u8; 64]).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_search_by_id_and_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let all = entries(9);
        let mut file = write_index(dir.path(), &all).await;

        let slot = search(&mut file, 9, |e| e.id >= 5).await.unwrap();
        assert_eq!(slot, 4);

        let slot = search(&mut file, 9, |e| e.id > 9).await.unwrap();
        assert_eq!(slot, 9);

        // ids 3 and 4 share timestamp 2000; the lowest id wins
        let slot = search(&mut file, 9, |e| e.timestamp_nanos >= 2_000)
            .await
            .unwrap();
        assert_eq!(all[slot as usize].id, 3);

        let read = read_entries(&mut file, 2, 3).await.unwrap();
        assert_eq!(read, all[2..5].to_vec());
    }
}
