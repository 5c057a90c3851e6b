//! File Storage Backend
//!
//! Streams live on the local filesystem as a data/index file pair.
//!
//! ## Layout
//!
//! ```text
//! <data_dir>/streams.json                 { "streams": ["<uuid>", ...] }
//! <data_dir>/streams/<uuid>/stream.json   StreamInfo
//! <data_dir>/streams/<uuid>/data.jsonl    one record per line
//! <data_dir>/streams/<uuid>/index.bin     32-byte entries, see [`index`]
//! ```
//!
//! ## Concurrency
//!
//! Each stream has an index lock. The writer and all readers take it shared;
//! [`rebuild::rebuild_index`] takes it exclusively. Readers never go past the
//! `readable.count` snapshot, which the writer advances only after the data
//! and index of a batch are both on disk.
//!
//! ## Recovery
//!
//! `load_catalog` verifies every stream's index against its data file and
//! rebuilds it on mismatch, then recomputes `readable` from the index so the
//! statistics cached in `stream.json` can never disagree with the files.
//!
//! A stream that cannot be loaded (missing or unreadable `stream.json`, failed
//! rebuild) does not stop the others. It stays in the catalog as damaged:
//! its id is still returned by `load_catalog`, every lookup on it fails with
//! `Corrupted`, and `on_delete_stream` can remove it.

pub mod index;
pub mod iterator;
pub mod rebuild;
pub mod writer;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use streamlog_core::{Record, StreamInfo, StreamStats};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::FileConfig;
use crate::error::{Result, StorageError};
use crate::provider::{IteratorHandler, StorageProvider, StreamWriter};

pub use iterator::FileIteratorHandler;
pub use writer::FileWriter;

pub const CATALOG_FILE: &str = "streams.json";
pub const STREAMS_DIR: &str = "streams";
pub const META_FILE: &str = "stream.json";
pub const DATA_FILE: &str = "data.jsonl";
pub const INDEX_FILE: &str = "index.bin";

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogDocument {
    streams: Vec<Uuid>,
}

/// Shared state of one stream on disk
#[derive(Debug)]
pub struct FileStream {
    uuid: Uuid,
    dir: PathBuf,
    info: RwLock<StreamInfo>,
    index_lock: RwLock<()>,
}

impl FileStream {
    fn new(dir: PathBuf, info: StreamInfo) -> Self {
        Self {
            uuid: info.uuid,
            dir,
            info: RwLock::new(info),
            index_lock: RwLock::new(()),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn info(&self) -> StreamInfo {
        self.info.read().await.clone()
    }

    pub async fn readable(&self) -> StreamStats {
        self.info.read().await.readable.clone()
    }

    /// Persist `stream.json` from the in-memory info.
    async fn persist_info(&self) -> Result<()> {
        let info = self.info.read().await.clone();
        write_json_atomic(&self.dir.join(META_FILE), &info).await
    }
}

/// Write a JSON document through a temporary file and rename.
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(&tmp, &body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Storage provider over the local filesystem.
///
/// ## Examples
///
/// ```ignore
/// let provider = FileProvider::new(FileConfig {
///     data_dir: "/var/lib/streamlog".into(),
///     ..Default::default()
/// });
/// provider.init().await?;
/// let streams = provider.load_catalog().await?;
/// ```
pub struct FileProvider {
    config: FileConfig,
    streams: RwLock<HashMap<Uuid, Arc<FileStream>>>,
    /// Catalog entries that failed to load, with the reason
    damaged: RwLock<HashMap<Uuid, String>>,
}

impl FileProvider {
    pub fn new(config: FileConfig) -> Self {
        Self {
            config,
            streams: RwLock::new(HashMap::new()),
            damaged: RwLock::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Directory holding one stream's files.
    pub fn stream_dir(&self, uuid: Uuid) -> PathBuf {
        self.config.data_dir.join(STREAMS_DIR).join(uuid.to_string())
    }

    async fn stream(&self, uuid: Uuid) -> Result<Arc<FileStream>> {
        if let Some(stream) = self.streams.read().await.get(&uuid) {
            return Ok(stream.clone());
        }
        match self.damaged.read().await.get(&uuid) {
            Some(reason) => Err(StorageError::Corrupted(format!(
                "stream {} failed to load: {}",
                uuid, reason
            ))),
            None => Err(StorageError::StreamNotFound(uuid)),
        }
    }

    /// Load one catalog entry, repairing its index when needed.
    async fn load_stream(&self, uuid: Uuid) -> Result<FileStream> {
        let dir = self.stream_dir(uuid);
        let body = tokio::fs::read(dir.join(META_FILE)).await?;
        let mut info: StreamInfo = serde_json::from_slice(&body)?;
        info.uuid = uuid;

        let readable = if rebuild::verify_index(&dir).await? {
            rebuild::stats_from_index(&dir).await?
        } else {
            warn!(stream = %uuid, "Index does not match data file, rebuilding");
            let stats = rebuild::rebuild_index(&dir).await?;
            info!(stream = %uuid, records = stats.count, "Index rebuilt");
            stats
        };

        info.readable = readable.clone();
        info.ingested = readable;
        info.degraded = false;

        let stream = FileStream::new(dir, info);
        stream.persist_info().await?;
        Ok(stream)
    }
}

#[async_trait]
impl StorageProvider for FileProvider {
    fn name(&self) -> &'static str {
        "file"
    }

    fn record_size(&self, record: &Record) -> u64 {
        record.encoded_len() as u64
    }

    async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.config.data_dir.join(STREAMS_DIR)).await?;
        info!(data_dir = %self.config.data_dir.display(), "File storage initialized");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if tokio::fs::metadata(&self.config.data_dir).await.is_ok() {
            self.save_catalog().await?;
        }
        Ok(())
    }

    async fn new_stream_id(&self) -> Result<Uuid> {
        let streams = self.streams.read().await;
        loop {
            let uuid = Uuid::new_v4();
            if streams.contains_key(&uuid) {
                continue;
            }
            if tokio::fs::metadata(self.stream_dir(uuid)).await.is_ok() {
                continue;
            }
            return Ok(uuid);
        }
    }

    async fn stream_exists(&self, uuid: Uuid) -> bool {
        self.streams.read().await.contains_key(&uuid)
            || self.damaged.read().await.contains_key(&uuid)
    }

    async fn load_catalog(&self) -> Result<Vec<Uuid>> {
        let path = self.config.data_dir.join(CATALOG_FILE);
        let document: CatalogDocument = match tokio::fs::read(&path).await {
            Ok(body) => serde_json::from_slice(&body)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CatalogDocument::default(),
            Err(e) => return Err(e.into()),
        };

        let mut loaded = HashMap::with_capacity(document.streams.len());
        let mut damaged = HashMap::new();
        for uuid in document.streams {
            match self.load_stream(uuid).await {
                Ok(stream) => {
                    loaded.insert(uuid, Arc::new(stream));
                }
                Err(e) => {
                    warn!(stream = %uuid, error = %e, "Stream failed to load");
                    damaged.insert(uuid, e.to_string());
                }
            }
        }

        let mut ids: Vec<Uuid> = loaded.keys().chain(damaged.keys()).copied().collect();
        ids.sort();
        ids.dedup();
        info!(
            streams = loaded.len(),
            damaged = damaged.len(),
            "Catalog loaded"
        );
        *self.streams.write().await = loaded;
        *self.damaged.write().await = damaged;
        Ok(ids)
    }

    async fn save_catalog(&self) -> Result<()> {
        let mut streams: Vec<Uuid> = self.streams.read().await.keys().copied().collect();
        streams.extend(self.damaged.read().await.keys().copied());
        streams.sort();
        streams.dedup();
        let document = CatalogDocument { streams };
        write_json_atomic(&self.config.data_dir.join(CATALOG_FILE), &document).await?;
        debug!(streams = document.streams.len(), "Catalog saved");
        Ok(())
    }

    async fn get_stream_info(&self, uuid: Uuid) -> Result<StreamInfo> {
        Ok(self.stream(uuid).await?.info().await)
    }

    async fn on_create_stream(&self, info: &StreamInfo) -> Result<()> {
        let mut streams = self.streams.write().await;
        if streams.contains_key(&info.uuid) {
            return Err(StorageError::StreamExists(info.uuid));
        }

        let dir = self.stream_dir(info.uuid);
        let stream = FileStream::new(dir.clone(), info.clone());
        let created: Result<()> = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(dir.join(DATA_FILE), b"").await?;
            tokio::fs::write(dir.join(INDEX_FILE), b"").await?;
            stream.persist_info().await
        }
        .await;

        if let Err(e) = created {
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(e);
        }

        streams.insert(info.uuid, Arc::new(stream));
        drop(streams);

        if let Err(e) = self.save_catalog().await {
            self.streams.write().await.remove(&info.uuid);
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(e);
        }

        info!(stream = %info.uuid, "Stream storage created");
        Ok(())
    }

    async fn on_delete_stream(&self, uuid: Uuid) -> Result<()> {
        let live = self.streams.read().await.get(&uuid).cloned();
        if live.is_none() && !self.damaged.read().await.contains_key(&uuid) {
            return Err(StorageError::StreamNotFound(uuid));
        }

        {
            // Wait out in-flight readers and rebuilds
            let _guard = match &live {
                Some(stream) => Some(stream.index_lock.write().await),
                None => None,
            };
            match tokio::fs::remove_dir_all(self.stream_dir(uuid)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        // Entries go only once the files are gone
        self.streams.write().await.remove(&uuid);
        self.damaged.write().await.remove(&uuid);
        self.save_catalog().await?;

        info!(stream = %uuid, "Stream storage deleted");
        Ok(())
    }

    async fn new_writer(&self, uuid: Uuid) -> Result<Box<dyn StreamWriter>> {
        let stream = self.stream(uuid).await?;
        Ok(Box::new(FileWriter::new(stream, self.config.sync_on_write)))
    }

    async fn new_iterator_handler(
        &self,
        stream: Uuid,
        iterator: Uuid,
    ) -> Result<Box<dyn IteratorHandler>> {
        let stream = self.stream(stream).await?;
        Ok(Box::new(FileIteratorHandler::new(
            stream,
            iterator,
            self.config.page_size,
        )))
    }

    async fn build_index(&self, uuid: Uuid) -> Result<StreamStats> {
        let stream = self.stream(uuid).await?;
        let _guard = stream.index_lock.write().await;

        let stats = rebuild::rebuild_index(stream.dir()).await?;
        {
            let mut info = stream.info.write().await;
            info.readable = stats.clone();
            if info.ingested.last_id < stats.last_id || info.ingested.count < stats.count {
                info.ingested = stats.clone();
            }
            info.last_update = chrono::Utc::now();
        }
        stream.persist_info().await?;

        info!(stream = %uuid, records = stats.count, "Index rebuilt");
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamlog_core::Properties;

    fn provider(dir: &Path) -> FileProvider {
        FileProvider::new(FileConfig {
            data_dir: dir.to_path_buf(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_create_writes_layout_and_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path());
        provider.init().await.unwrap();

        let uuid = provider.new_stream_id().await.unwrap();
        let info = StreamInfo::new(uuid, Properties::new());
        provider.on_create_stream(&info).await.unwrap();

        let stream_dir = provider.stream_dir(uuid);
        assert!(stream_dir.join(DATA_FILE).exists());
        assert!(stream_dir.join(INDEX_FILE).exists());
        assert!(stream_dir.join(META_FILE).exists());

        let catalog: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(CATALOG_FILE)).unwrap()).unwrap();
        assert_eq!(catalog, serde_json::json!({"streams": [uuid.to_string()]}));

        assert!(matches!(
            provider.on_create_stream(&info).await,
            Err(StorageError::StreamExists(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path());
        provider.init().await.unwrap();

        let uuid = provider.new_stream_id().await.unwrap();
        provider
            .on_create_stream(&StreamInfo::new(uuid, Properties::new()))
            .await
            .unwrap();
        provider.on_delete_stream(uuid).await.unwrap();

        assert!(!provider.stream_dir(uuid).exists());
        assert!(!provider.stream_exists(uuid).await);
        assert!(matches!(
            provider.on_delete_stream(uuid).await,
            Err(StorageError::StreamNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_uncatalogued_directory_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path());
        provider.init().await.unwrap();

        let orphan = Uuid::new_v4();
        std::fs::create_dir_all(provider.stream_dir(orphan)).unwrap();

        let ids = provider.load_catalog().await.unwrap();
        assert!(ids.is_empty());
        assert!(!provider.stream_exists(orphan).await);
    }

    #[tokio::test]
    async fn test_damaged_stream_does_not_block_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let (good, bad) = {
            let provider = provider(dir.path());
            provider.init().await.unwrap();
            let good = provider.new_stream_id().await.unwrap();
            provider
                .on_create_stream(&StreamInfo::new(good, Properties::new()))
                .await
                .unwrap();
            let bad = provider.new_stream_id().await.unwrap();
            provider
                .on_create_stream(&StreamInfo::new(bad, Properties::new()))
                .await
                .unwrap();
            (good, bad)
        };
        std::fs::remove_file(dir.path().join(STREAMS_DIR).join(bad.to_string()).join(META_FILE))
            .unwrap();

        let provider = provider(dir.path());
        provider.init().await.unwrap();
        let mut expected = vec![good, bad];
        expected.sort();
        assert_eq!(provider.load_catalog().await.unwrap(), expected);

        assert_eq!(provider.get_stream_info(good).await.unwrap().uuid, good);
        assert!(matches!(
            provider.get_stream_info(bad).await,
            Err(StorageError::Corrupted(_))
        ));
        assert!(provider.stream_exists(bad).await);

        // The damaged entry survives catalog saves until it is deleted
        provider.save_catalog().await.unwrap();
        let catalog: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(CATALOG_FILE)).unwrap()).unwrap();
        assert_eq!(catalog["streams"].as_array().unwrap().len(), 2);

        provider.on_delete_stream(bad).await.unwrap();
        assert!(!provider.stream_exists(bad).await);
        assert!(!provider.stream_dir(bad).exists());
        assert_eq!(provider.load_catalog().await.unwrap(), vec![good]);
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_stream() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path());
        provider.init().await.unwrap();
        let uuid = provider.new_stream_id().await.unwrap();
        provider
            .on_create_stream(&StreamInfo::new(uuid, Properties::new()))
            .await
            .unwrap();

        // A plain file where the streams directory should be makes the
        // removal fail with something other than NotFound.
        let stream_dir = provider.stream_dir(uuid);
        std::fs::remove_dir_all(&stream_dir).unwrap();
        let streams_dir = dir.path().join(STREAMS_DIR);
        std::fs::remove_dir_all(&streams_dir).unwrap();
        std::fs::write(&streams_dir, b"not a directory").unwrap();

        assert!(provider.on_delete_stream(uuid).await.is_err());
        assert!(provider.stream_exists(uuid).await);

        std::fs::remove_file(&streams_dir).unwrap();
        provider.on_delete_stream(uuid).await.unwrap();
        assert!(!provider.stream_exists(uuid).await);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path());
        provider.init().await.unwrap();
        provider.stop().await.unwrap();
        provider.stop().await.unwrap();
    }
}
