//! In-Memory Storage Backend
//!
//! Keeps every stream as a `Vec<Record>` behind a lock. Nothing survives a
//! restart; `load_catalog` returns whatever was created during this process'
//! lifetime. Useful for tests and ephemeral deployments.
//!
//! An optional per-stream record cap turns the backend into a bounded buffer:
//! a batch that would exceed it fails with `QuotaExceeded` and is not applied.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use streamlog_core::{Record, SeekPosition, StreamInfo, StreamStats};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::error::{Result, StorageError};
use crate::provider::{check_after_id, lower_bound, IteratorHandler, StorageProvider, StreamWriter};

#[derive(Debug)]
struct MemoryStream {
    info: RwLock<StreamInfo>,
    records: RwLock<Vec<Record>>,
}

/// Storage provider holding all data in process memory.
pub struct MemoryProvider {
    config: MemoryConfig,
    streams: RwLock<HashMap<Uuid, Arc<MemoryStream>>>,
}

impl MemoryProvider {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            streams: RwLock::new(HashMap::new()),
        }
    }

    async fn stream(&self, uuid: Uuid) -> Result<Arc<MemoryStream>> {
        self.streams
            .read()
            .await
            .get(&uuid)
            .cloned()
            .ok_or(StorageError::StreamNotFound(uuid))
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

fn record_size(record: &Record) -> u64 {
    record.payload.len() as u64
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn init(&self) -> Result<()> {
        info!("In-memory storage initialized");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn new_stream_id(&self) -> Result<Uuid> {
        let streams = self.streams.read().await;
        loop {
            let uuid = Uuid::new_v4();
            if !streams.contains_key(&uuid) {
                return Ok(uuid);
            }
        }
    }

    async fn stream_exists(&self, uuid: Uuid) -> bool {
        self.streams.read().await.contains_key(&uuid)
    }

    async fn load_catalog(&self) -> Result<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self.streams.read().await.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn save_catalog(&self) -> Result<()> {
        Ok(())
    }

    async fn get_stream_info(&self, uuid: Uuid) -> Result<StreamInfo> {
        Ok(self.stream(uuid).await?.info.read().await.clone())
    }

    async fn on_create_stream(&self, info: &StreamInfo) -> Result<()> {
        let mut streams = self.streams.write().await;
        if streams.contains_key(&info.uuid) {
            return Err(StorageError::StreamExists(info.uuid));
        }
        streams.insert(
            info.uuid,
            Arc::new(MemoryStream {
                info: RwLock::new(info.clone()),
                records: RwLock::new(Vec::new()),
            }),
        );
        Ok(())
    }

    async fn on_delete_stream(&self, uuid: Uuid) -> Result<()> {
        self.streams
            .write()
            .await
            .remove(&uuid)
            .map(|_| ())
            .ok_or(StorageError::StreamNotFound(uuid))
    }

    async fn new_writer(&self, uuid: Uuid) -> Result<Box<dyn StreamWriter>> {
        Ok(Box::new(MemoryWriter {
            stream: self.stream(uuid).await?,
            max_records: self.config.max_records_per_stream,
        }))
    }

    async fn new_iterator_handler(
        &self,
        stream: Uuid,
        _iterator: Uuid,
    ) -> Result<Box<dyn IteratorHandler>> {
        Ok(Box::new(MemoryIteratorHandler {
            stream: self.stream(stream).await?,
            position: None,
            saved: None,
        }))
    }

    async fn build_index(&self, uuid: Uuid) -> Result<StreamStats> {
        let stream = self.stream(uuid).await?;
        let records = stream.records.read().await;
        let mut stats = StreamStats::default();
        for record in records.iter() {
            stats.observe(record.id, record.creation_time, record_size(record));
        }
        {
            let mut info = stream.info.write().await;
            info.readable = stats.clone();
            if info.ingested.last_id < stats.last_id || info.ingested.count < stats.count {
                info.ingested = stats.clone();
            }
            info.last_update = Utc::now();
        }
        debug!(stream = %uuid, records = stats.count, "Statistics recomputed");
        Ok(stats)
    }
}

struct MemoryWriter {
    stream: Arc<MemoryStream>,
    max_records: u64,
}

#[async_trait]
impl StreamWriter for MemoryWriter {
    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, batch: &[Record]) -> Result<()> {
        let mut records = self.stream.records.write().await;
        if self.max_records > 0 && records.len() as u64 + batch.len() as u64 > self.max_records {
            return Err(StorageError::QuotaExceeded(format!(
                "stream holds {} records, limit is {}",
                records.len(),
                self.max_records
            )));
        }
        records.extend_from_slice(batch);

        // Publish while still holding the records lock so readers never see
        // records beyond `readable`.
        let mut info = self.stream.info.write().await;
        for record in batch {
            info.readable
                .observe(record.id, record.creation_time, record_size(record));
        }
        if info.ingested.last_id < info.readable.last_id {
            info.ingested = info.readable.clone();
        }
        info.last_update = Utc::now();

        debug!(stream = %info.uuid, records = batch.len(), "Batch committed");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct MemoryIteratorHandler {
    stream: Arc<MemoryStream>,
    position: Option<usize>,
    saved: Option<usize>,
}

#[async_trait]
impl IteratorHandler for MemoryIteratorHandler {
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    async fn seek(&mut self, position: &SeekPosition) -> Result<()> {
        if let Some(saved) = self.saved {
            self.position = Some(saved);
            return Ok(());
        }
        if self.position.is_some() {
            return Ok(());
        }

        let records = self.stream.records.read().await;
        let readable = self.stream.info.read().await.readable.clone();
        let count = records.len() as u64;

        let slot = match *position {
            SeekPosition::First => 0,
            SeekPosition::Last => count.saturating_sub(1),
            SeekPosition::AfterLast => count,
            SeekPosition::AtId(id) => {
                let slot = lower_bound(count, |i| records[i as usize].id >= id);
                if records.get(slot as usize).map(|r| r.id) != Some(id) {
                    return Err(StorageError::RecordNotFound(format!("message id {}", id)));
                }
                slot
            }
            SeekPosition::AfterId(id) => {
                check_after_id(id, &readable)?;
                lower_bound(count, |i| records[i as usize].id > id)
            }
            SeekPosition::AtTimestamp(t) => {
                let slot = lower_bound(count, |i| records[i as usize].creation_time >= t);
                if slot == count {
                    return Err(StorageError::RecordNotFound(format!(
                        "no record at or after {}",
                        t.to_rfc3339()
                    )));
                }
                slot
            }
        };

        self.position = Some(slot as usize);
        Ok(())
    }

    async fn get_next(&mut self) -> Result<Option<Record>> {
        let slot = self.position.ok_or(StorageError::NotPositioned)?;
        let records = self.stream.records.read().await;
        match records.get(slot) {
            Some(record) => {
                self.position = Some(slot + 1);
                Ok(Some(record.clone()))
            }
            None => Ok(None),
        }
    }

    async fn save_seek(&mut self) -> Result<()> {
        self.saved = self.position;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamlog_core::{Payload, Properties};

    fn records(ids: std::ops::RangeInclusive<u64>) -> Vec<Record> {
        let start = Utc::now();
        ids.map(|id| {
            Record::new(
                id,
                start + chrono::Duration::milliseconds(id as i64),
                Payload::from_json(&format!(r#"{{"n":{}}}"#, id)).unwrap(),
            )
        })
        .collect()
    }

    async fn stream_with(provider: &MemoryProvider, n: u64) -> Uuid {
        let uuid = provider.new_stream_id().await.unwrap();
        provider
            .on_create_stream(&StreamInfo::new(uuid, Properties::new()))
            .await
            .unwrap();
        if n > 0 {
            let mut writer = provider.new_writer(uuid).await.unwrap();
            writer.write(&records(1..=n)).await.unwrap();
        }
        uuid
    }

    #[tokio::test]
    async fn test_write_advances_readable() {
        let provider = MemoryProvider::default();
        let uuid = stream_with(&provider, 5).await;

        let info = provider.get_stream_info(uuid).await.unwrap();
        assert_eq!(info.readable.count, 5);
        assert_eq!(info.readable.last_id, 5);
        assert_eq!(info.readable.size_bytes, 5 * 7);
    }

    #[tokio::test]
    async fn test_build_index_refreshes_info() {
        let provider = MemoryProvider::default();
        let uuid = stream_with(&provider, 4).await;
        let before = provider.get_stream_info(uuid).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let stats = provider.build_index(uuid).await.unwrap();
        let after = provider.get_stream_info(uuid).await.unwrap();
        assert_eq!(stats, before.readable);
        assert_eq!(after.readable, stats);
        assert_eq!(after.ingested.last_id, 4);
        assert_eq!(after.ingested.count, 4);
        assert!(after.last_update > before.last_update);
    }

    #[tokio::test]
    async fn test_record_cap_rejects_whole_batch() {
        let provider = MemoryProvider::new(MemoryConfig {
            max_records_per_stream: 4,
        });
        let uuid = stream_with(&provider, 3).await;

        let mut writer = provider.new_writer(uuid).await.unwrap();
        let err = writer.write(&records(4..=5)).await.unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded(_)));
        assert_eq!(provider.get_stream_info(uuid).await.unwrap().readable.count, 3);
    }

    #[tokio::test]
    async fn test_seek_and_resume() {
        let provider = MemoryProvider::default();
        let uuid = stream_with(&provider, 10).await;

        let mut handler = provider
            .new_iterator_handler(uuid, Uuid::new_v4())
            .await
            .unwrap();
        handler.open().await.unwrap();
        handler.seek(&SeekPosition::AfterId(4)).await.unwrap();
        assert_eq!(handler.get_next().await.unwrap().unwrap().id, 5);
        handler.save_seek().await.unwrap();

        // a later seek restores the saved cursor instead of re-resolving
        handler.seek(&SeekPosition::First).await.unwrap();
        assert_eq!(handler.get_next().await.unwrap().unwrap().id, 6);
    }

    #[tokio::test]
    async fn test_seek_errors() {
        let provider = MemoryProvider::default();
        let uuid = stream_with(&provider, 3).await;

        let mut handler = provider
            .new_iterator_handler(uuid, Uuid::new_v4())
            .await
            .unwrap();
        assert!(matches!(
            handler.seek(&SeekPosition::AtId(9)).await,
            Err(StorageError::RecordNotFound(_))
        ));
        assert!(matches!(
            handler.seek(&SeekPosition::AfterId(4)).await,
            Err(StorageError::InvalidSeek(_))
        ));
        assert!(matches!(
            handler
                .seek(&SeekPosition::AtTimestamp(Utc::now() + chrono::Duration::hours(1)))
                .await,
            Err(StorageError::RecordNotFound(_))
        ));
    }
}
