//! Stream Service
//!
//! Entry point of the engine: owns the storage provider and the map of live
//! streams, and routes every operation to the right [`Stream`].
//!
//! ## Lifecycle
//!
//! ```text
//! new ──► init (provider.init, load_catalog, start streams) ──► ... ──► stop
//! ```
//!
//! `init` starts every cataloged stream in parallel. Streams that fail to
//! start are reported together in one `StartFailed` error; the others stay
//! live. After `stop` every operation fails with `Stopped`.
//!
//! ## Locking
//!
//! The stream map sits behind a read-write lock: lookups and listings share
//! it, create and delete take it exclusively.
//!
//! ## Example
//!
//! ```ignore
//! let config = ServiceConfig::from_env()?;
//! let provider = ProviderRegistry::with_defaults().create(&config.storage)?;
//! let service = StreamService::new(config, provider);
//! service.init().await?;
//!
//! let stream = service.create_stream(Properties::new()).await?;
//! let id = service.put(stream.uuid(), Payload::from_json(r#"{"k":1}"#)?).await?;
//!
//! let iterator = service.create_iterator(stream.uuid(), IteratorRequest::first()).await?;
//! let page = service
//!     .get_records(stream.uuid(), iterator, &CancellationToken::new(), 100)
//!     .await?;
//! ```

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streamlog_core::{
    validate_properties, Filter, IteratorRequest, Payload, Properties, StreamInfo, StreamStats,
};
use streamlog_storage::{ProviderRegistry, StorageError, StorageProvider};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};
use crate::iterator::{GetRecordsResponse, IteratorInfo};
use crate::stream::Stream;

pub struct StreamService {
    config: ServiceConfig,
    provider: Arc<dyn StorageProvider>,
    streams: RwLock<HashMap<Uuid, Arc<Stream>>>,
    stopped: AtomicBool,
}

impl StreamService {
    pub fn new(config: ServiceConfig, provider: Arc<dyn StorageProvider>) -> Self {
        Self {
            config,
            provider,
            streams: RwLock::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Build the provider named by `config.storage.type` from `registry`.
    pub fn from_registry(config: ServiceConfig, registry: &ProviderRegistry) -> Result<Self> {
        config.validate()?;
        let provider = registry.create(&config.storage)?;
        Ok(Self::new(config, provider))
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn StorageProvider> {
        &self.provider
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ServiceError::Stopped);
        }
        Ok(())
    }

    /// Initialize storage, load the catalog and start every stream.
    ///
    /// # Errors
    ///
    /// - `Storage(..)`: the provider or its catalog could not be loaded
    /// - `StartFailed`: some streams did not start; the rest are live
    #[tracing::instrument(skip(self), fields(storage = self.provider.name()))]
    pub async fn init(&self) -> Result<()> {
        self.ensure_running()?;
        self.provider.init().await?;
        let ids = self.provider.load_catalog().await?;
        let total = ids.len();

        let started = join_all(ids.into_iter().map(|uuid| {
            let provider = self.provider.clone();
            let config = self.config.streams.clone();
            async move { (uuid, Stream::start(uuid, provider, config).await) }
        }))
        .await;

        let mut details = Vec::new();
        let mut streams = self.streams.write().await;
        for (uuid, result) in started {
            match result {
                Ok(stream) => {
                    streams.insert(uuid, stream);
                }
                Err(e) => {
                    tracing::error!(stream = %uuid, error = %e, "Stream failed to start");
                    details.push(format!("{}: {}", uuid, e));
                }
            }
        }

        tracing::info!(
            streams = streams.len(),
            failed = details.len(),
            "Stream service initialized"
        );

        if details.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::StartFailed {
                failed: details.len(),
                total,
                details,
            })
        }
    }

    /// Create, catalog and start a new stream.
    ///
    /// # Errors
    ///
    /// - `Core(InvalidProperties)`: too many or oversized properties
    /// - `QuotaExceeded`: `max_allowed_streams` reached
    /// - `Storage(..)`: the provider could not create the stream. A failure
    ///   after the catalog insert is reported as is, without rollback.
    #[tracing::instrument(skip(self, properties))]
    pub async fn create_stream(&self, properties: Properties) -> Result<Arc<Stream>> {
        self.ensure_running()?;
        validate_properties(&properties)?;

        let mut streams = self.streams.write().await;
        let cap = self.config.streams.max_allowed_streams;
        if cap > 0 && streams.len() >= cap {
            return Err(ServiceError::QuotaExceeded(format!(
                "{} streams already exist",
                streams.len()
            )));
        }

        let uuid = loop {
            let candidate = self.provider.new_stream_id().await?;
            if !streams.contains_key(&candidate) {
                break candidate;
            }
        };

        self.provider
            .on_create_stream(&StreamInfo::new(uuid, properties))
            .await?;
        let stream = Stream::start(uuid, self.provider.clone(), self.config.streams.clone()).await?;
        streams.insert(uuid, stream.clone());

        tracing::info!(stream = %uuid, "Stream created");
        Ok(stream)
    }

    /// Close a stream, delete its data, then drop it from the map and the
    /// catalog.
    ///
    /// The stream stays listed until its storage is gone, so a failed delete
    /// leaves it closed but reachable and the call can be repeated.
    ///
    /// # Errors
    ///
    /// - `StreamNotFound`: unknown or already deleted
    /// - `Storage(..)`: the provider could not delete the stream's data
    #[tracing::instrument(skip(self))]
    pub async fn delete_stream(&self, uuid: Uuid) -> Result<()> {
        self.ensure_running()?;
        let stream = self.get_stream(uuid).await?;

        stream.close().await?;
        match self.provider.on_delete_stream(uuid).await {
            Ok(()) => {}
            // lost a race with a concurrent delete
            Err(StorageError::StreamNotFound(_)) => return Err(ServiceError::StreamNotFound(uuid)),
            Err(e) => {
                tracing::error!(stream = %uuid, error = %e, "Failed to delete stream storage");
                return Err(e.into());
            }
        }
        self.streams.write().await.remove(&uuid);
        self.provider.save_catalog().await?;

        tracing::info!(stream = %uuid, "Stream deleted");
        Ok(())
    }

    pub async fn get_stream(&self, uuid: Uuid) -> Result<Arc<Stream>> {
        self.ensure_running()?;
        self.streams
            .read()
            .await
            .get(&uuid)
            .cloned()
            .ok_or(ServiceError::StreamNotFound(uuid))
    }

    pub async fn stream_info(&self, uuid: Uuid) -> Result<StreamInfo> {
        self.get_stream(uuid).await?.info().await
    }

    /// Ids of all live streams, sorted.
    pub async fn list_streams(&self) -> Result<Vec<Uuid>> {
        self.ensure_running()?;
        let mut ids: Vec<Uuid> = self.streams.read().await.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Ids of streams whose properties satisfy every filter.
    ///
    /// Each filter sees the properties as a JSON object of strings. A stream
    /// for which a filter fails to evaluate is left out.
    ///
    /// # Errors
    ///
    /// - `Core(InvalidFilter)`: a filter does not compile
    pub async fn list_streams_filtered(&self, filters: &[&str]) -> Result<Vec<Uuid>> {
        self.ensure_running()?;
        let filters = filters
            .iter()
            .map(|source| Filter::compile(source))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let streams: Vec<Arc<Stream>> = self.streams.read().await.values().cloned().collect();
        let mut ids = Vec::new();
        for stream in streams {
            let info = match self.provider.get_stream_info(stream.uuid()).await {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!(stream = %stream.uuid(), error = %e, "Skipping stream in listing");
                    continue;
                }
            };
            let properties = info.properties_value();
            let selected = filters.iter().all(|filter| match filter.matches(&properties) {
                Ok(matched) => matched,
                Err(e) => {
                    tracing::debug!(stream = %info.uuid, filter = filter.source(), error = %e, "Filter failed on stream properties");
                    false
                }
            });
            if selected {
                ids.push(info.uuid);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    pub async fn put(&self, stream: Uuid, payload: Payload) -> Result<u64> {
        self.get_stream(stream).await?.put(payload).await
    }

    pub async fn put_batch(&self, stream: Uuid, payloads: Vec<Payload>) -> Result<Vec<u64>> {
        self.get_stream(stream).await?.put_batch(payloads).await
    }

    pub async fn try_put(&self, stream: Uuid, payload: Payload) -> Result<u64> {
        self.get_stream(stream).await?.try_put(payload).await
    }

    pub async fn wait_readable(&self, stream: Uuid, id: u64, timeout: Duration) -> Result<()> {
        self.get_stream(stream).await?.wait_readable(id, timeout).await
    }

    pub async fn create_iterator(&self, stream: Uuid, request: IteratorRequest) -> Result<Uuid> {
        self.get_stream(stream).await?.add_iterator(request).await
    }

    pub async fn close_iterator(&self, stream: Uuid, iterator: Uuid) -> Result<()> {
        self.get_stream(stream).await?.close_iterator(iterator).await
    }

    pub async fn iterator_info(&self, stream: Uuid, iterator: Uuid) -> Result<IteratorInfo> {
        self.get_stream(stream).await?.iterator_info(iterator).await
    }

    pub async fn list_iterators(&self, stream: Uuid) -> Result<Vec<IteratorInfo>> {
        Ok(self.get_stream(stream).await?.list_iterators().await)
    }

    /// Read from an iterator. `max = 0` asks for the configured ceiling;
    /// larger values are clamped to it.
    pub async fn get_records(
        &self,
        stream: Uuid,
        iterator: Uuid,
        cancel: &CancellationToken,
        max: usize,
    ) -> Result<GetRecordsResponse> {
        let max = self.config.streams.clamp_max(max);
        self.get_stream(stream)
            .await?
            .get_records(iterator, cancel, max)
            .await
    }

    /// Rebuild a stream's index from its data and return the recomputed
    /// statistics.
    pub async fn rebuild_index(&self, stream: Uuid) -> Result<StreamStats> {
        let stream = self.get_stream(stream).await?;
        let stats = self.provider.build_index(stream.uuid()).await?;
        tracing::info!(stream = %stream.uuid(), records = stats.count, "Index rebuilt");
        Ok(stats)
    }

    /// Close every stream, then stop the provider. Later calls are no-ops.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let streams: Vec<Arc<Stream>> = self
            .streams
            .write()
            .await
            .drain()
            .map(|(_, stream)| stream)
            .collect();
        let count = streams.len();

        for result in join_all(streams.iter().map(|stream| stream.close())).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Failed to close stream");
            }
        }

        self.provider.stop().await?;
        tracing::info!(streams = count, "Stream service stopped");
        Ok(())
    }
}
