//! Stream Actor
//!
//! One `Stream` per live stream. It assigns ids, feeds the ingest task, and
//! holds the stream's iterators.
//!
//! ## Architecture
//!
//! ```text
//!  put / put_batch / try_put
//!         │  (ingest lock: id + timestamp assignment, enqueue)
//!         ▼
//!  ┌──────────────┐   bounded mpsc   ┌──────────────────────────────┐
//!  │ IngestState  │ ───────────────► │ ingest task (owns the writer) │
//!  └──────────────┘                  │  select { record, timer }     │
//!                                    └──────────────┬───────────────┘
//!                                                   │ readable last_id (watch)
//!                                                   ▼
//!                                     wait_readable / iterators
//! ```
//!
//! ## Ingest loop
//!
//! - Immediate mode (`bulk_flush_frequency = 0`): every wake-up flushes
//!   whatever is queued.
//! - Batched mode: records accumulate until `bulk_max_size` (flush now) or
//!   until the timer armed by the first record after a flush fires.
//!
//! A flush that still fails after its retries stops the loop and marks the
//! stream degraded. Puts then fail, reads keep working on what was committed.
//!
//! ## Ordering
//!
//! Ids and creation times are assigned while holding the ingest lock and the
//! record is queued before the lock is released, so the channel (and the
//! data on disk) is ordered by id. Creation times are clamped so they never
//! go backwards when the wall clock does.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use streamlog_core::{Filter, IteratorRequest, Payload, Record, StreamInfo, StreamStats};
use streamlog_storage::StorageProvider;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::StreamsConfig;
use crate::error::{Result, ServiceError};
use crate::ingest::IngestBuffer;
use crate::iterator::{GetRecordsResponse, IteratorInfo, StreamIterator};

/// Producer-side state, guarded by the ingest lock.
struct IngestState {
    last_id: u64,
    last_time: Option<DateTime<Utc>>,
    /// `None` once the stream is closing
    sender: Option<mpsc::Sender<Record>>,
}

impl IngestState {
    /// Stamp the next record without committing the allocation.
    fn next_record(&self, payload: Payload) -> Record {
        let now = Utc::now();
        let time = match self.last_time {
            Some(last) if last > now => last,
            _ => now,
        };
        Record::new(self.last_id + 1, time, payload)
    }

    fn commit(&mut self, id: u64, time: DateTime<Utc>) {
        self.last_id = id;
        self.last_time = Some(time);
    }
}

pub struct Stream {
    uuid: Uuid,
    provider: Arc<dyn StorageProvider>,
    config: StreamsConfig,
    ingest: Mutex<IngestState>,
    ingested: RwLock<StreamStats>,
    readable: watch::Receiver<u64>,
    degraded: Arc<AtomicBool>,
    closed: AtomicBool,
    iterators: RwLock<HashMap<Uuid, Arc<StreamIterator>>>,
    ingest_task: Mutex<Option<JoinHandle<()>>>,
    janitor_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Stream {
    /// Open the writer of a cataloged stream and start its ingest task.
    ///
    /// # Errors
    ///
    /// - `Storage(StreamNotFound)`: the stream is not in the catalog
    /// - `Storage(..)`: the writer could not be opened
    #[tracing::instrument(skip(provider, config))]
    pub async fn start(
        uuid: Uuid,
        provider: Arc<dyn StorageProvider>,
        config: StreamsConfig,
    ) -> Result<Arc<Self>> {
        let info = provider.get_stream_info(uuid).await?;

        let mut writer = provider.new_writer(uuid).await?;
        writer.init().await?;
        writer.open().await?;

        let (buffer, sender) = IngestBuffer::new(uuid, writer, &config);
        let (readable_tx, readable_rx) = watch::channel(info.readable.last_id);
        let degraded = Arc::new(AtomicBool::new(false));

        let ingest_task = tokio::spawn(run_ingest(
            uuid,
            buffer,
            readable_tx,
            degraded.clone(),
        ));

        let stream = Arc::new(Self {
            uuid,
            provider,
            ingest: Mutex::new(IngestState {
                last_id: info.readable.last_id,
                last_time: info.readable.last_time,
                sender: Some(sender),
            }),
            ingested: RwLock::new(info.readable.clone()),
            readable: readable_rx,
            degraded,
            closed: AtomicBool::new(false),
            iterators: RwLock::new(HashMap::new()),
            ingest_task: Mutex::new(Some(ingest_task)),
            janitor_task: Mutex::new(None),
            shutdown: CancellationToken::new(),
            config,
        });

        if let Some(idle) = stream.config.iterator_idle_timeout() {
            let janitor = spawn_janitor(&stream, idle, stream.config.iterator_reap_interval());
            *stream.janitor_task.lock().await = Some(janitor);
        }

        tracing::info!(
            stream = %uuid,
            readable = info.readable.count,
            last_id = info.readable.last_id,
            "Stream started"
        );
        Ok(stream)
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Last id visible to readers.
    pub fn readable_last_id(&self) -> u64 {
        *self.readable.borrow()
    }

    fn check_accepting(&self) -> Result<()> {
        if self.is_degraded() {
            return Err(ServiceError::Degraded(self.uuid));
        }
        if self.is_closed() {
            return Err(ServiceError::Closed(self.uuid));
        }
        Ok(())
    }

    /// Error for a send on a channel whose consumer is gone.
    fn send_failed(&self) -> ServiceError {
        if self.is_degraded() {
            ServiceError::Degraded(self.uuid)
        } else {
            ServiceError::Closed(self.uuid)
        }
    }

    async fn observe(&self, id: u64, time: DateTime<Utc>, size: u64) {
        self.ingested.write().await.observe(id, time, size);
    }

    /// Append one record and return its id. Waits while the ingest channel
    /// is full.
    ///
    /// The record is durable once `readable_last_id() >= id`
    /// (see [`Stream::wait_readable`]).
    pub async fn put(&self, payload: Payload) -> Result<u64> {
        self.check_accepting()?;
        let mut state = self.ingest.lock().await;
        let sender = state.sender.clone().ok_or(ServiceError::Closed(self.uuid))?;

        let record = state.next_record(payload);
        let (id, time, size) = (record.id, record.creation_time, self.provider.record_size(&record));
        sender.send(record).await.map_err(|_| self.send_failed())?;
        state.commit(id, time);
        self.observe(id, time, size).await;
        Ok(id)
    }

    /// Append records with consecutive ids, in order.
    ///
    /// If the stream stops midway, the records queued so far keep their ids
    /// and the error is returned.
    pub async fn put_batch(&self, payloads: Vec<Payload>) -> Result<Vec<u64>> {
        self.check_accepting()?;
        let mut state = self.ingest.lock().await;
        let sender = state.sender.clone().ok_or(ServiceError::Closed(self.uuid))?;

        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let record = state.next_record(payload);
            let (id, time, size) = (record.id, record.creation_time, self.provider.record_size(&record));
            sender.send(record).await.map_err(|_| self.send_failed())?;
            state.commit(id, time);
            self.observe(id, time, size).await;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Like [`Stream::put`], but fails with `Busy` instead of waiting for
    /// channel capacity.
    pub async fn try_put(&self, payload: Payload) -> Result<u64> {
        self.check_accepting()?;
        let mut state = self.ingest.lock().await;
        let sender = state.sender.clone().ok_or(ServiceError::Closed(self.uuid))?;

        let record = state.next_record(payload);
        let (id, time, size) = (record.id, record.creation_time, self.provider.record_size(&record));
        sender.try_send(record).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ServiceError::Busy,
            mpsc::error::TrySendError::Closed(_) => self.send_failed(),
        })?;
        state.commit(id, time);
        self.observe(id, time, size).await;
        Ok(id)
    }

    /// Wait until the record `id` is readable.
    ///
    /// # Errors
    ///
    /// - `Cancelled`: `timeout` elapsed first
    /// - `Degraded` / `Closed`: the ingest task ended before reaching `id`
    pub async fn wait_readable(&self, id: u64, timeout: Duration) -> Result<()> {
        let mut readable = self.readable.clone();
        let outcome = tokio::time::timeout(timeout, readable.wait_for(|last| *last >= id))
            .await
            .map(|reached| reached.map(|_| ()));

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(self.send_failed()),
            Err(_) => Err(ServiceError::Cancelled(format!(
                "record {} not readable after {:?}",
                id, timeout
            ))),
        }
    }

    /// Persisted metadata and readable statistics, with the live ingested
    /// statistics and degraded flag of this process.
    pub async fn info(&self) -> Result<StreamInfo> {
        let mut info = self.provider.get_stream_info(self.uuid).await?;
        info.ingested = self.ingested.read().await.clone();
        info.degraded = self.is_degraded();
        Ok(info)
    }

    /// Register an iterator positioned per `request`.
    ///
    /// The request is validated, its filter compiled and the initial seek
    /// performed before anything is registered.
    ///
    /// # Errors
    ///
    /// - `Core(..)`: malformed request or filter expression
    /// - `QuotaExceeded`: `max_iterators_per_stream` reached
    /// - `Storage(RecordNotFound | InvalidSeek)`: the seek target is not readable
    #[tracing::instrument(skip(self, request), fields(stream = %self.uuid))]
    pub async fn add_iterator(&self, request: IteratorRequest) -> Result<Uuid> {
        if self.is_closed() {
            return Err(ServiceError::Closed(self.uuid));
        }
        request.validate()?;
        let position = request.position()?;
        let filter = request.jq_filter.as_deref().map(Filter::compile).transpose()?;
        self.check_iterator_quota(self.iterators.read().await.len())?;

        let uuid = Uuid::new_v4();
        let mut handler = self.provider.new_iterator_handler(self.uuid, uuid).await?;
        let positioned = match handler.open().await {
            Ok(()) => handler.seek(&position).await,
            Err(e) => Err(e),
        };
        if let Err(e) = positioned {
            if let Err(close_err) = handler.close().await {
                tracing::debug!(error = %close_err, "Closing rejected iterator failed");
            }
            return Err(e.into());
        }

        let iterator = Arc::new(StreamIterator::new(
            uuid, self.uuid, request, position, filter, handler,
        ));

        let mut iterators = self.iterators.write().await;
        let admitted = if self.is_closed() {
            Err(ServiceError::Closed(self.uuid))
        } else {
            self.check_iterator_quota(iterators.len())
        };
        if let Err(e) = admitted {
            drop(iterators);
            iterator.close().await?;
            return Err(e);
        }
        iterators.insert(uuid, iterator);

        tracing::debug!(iterator = %uuid, "Iterator created");
        Ok(uuid)
    }

    fn check_iterator_quota(&self, open: usize) -> Result<()> {
        let cap = self.config.max_iterators_per_stream;
        if cap > 0 && open >= cap {
            return Err(ServiceError::QuotaExceeded(format!(
                "stream {} already has {} iterators",
                self.uuid, open
            )));
        }
        Ok(())
    }

    pub async fn close_iterator(&self, uuid: Uuid) -> Result<()> {
        let iterator = self
            .iterators
            .write()
            .await
            .remove(&uuid)
            .ok_or(ServiceError::IteratorNotFound(uuid))?;
        iterator.close().await
    }

    pub async fn get_iterator(&self, uuid: Uuid) -> Result<Arc<StreamIterator>> {
        self.iterators
            .read()
            .await
            .get(&uuid)
            .cloned()
            .ok_or(ServiceError::IteratorNotFound(uuid))
    }

    /// Read from an iterator. `max` is used as given; the service applies
    /// the configured ceiling.
    pub async fn get_records(
        &self,
        iterator: Uuid,
        cancel: &CancellationToken,
        max: usize,
    ) -> Result<GetRecordsResponse> {
        self.get_iterator(iterator)
            .await?
            .get_records(cancel, max)
            .await
    }

    pub async fn iterator_info(&self, uuid: Uuid) -> Result<IteratorInfo> {
        Ok(self.get_iterator(uuid).await?.info().await)
    }

    pub async fn list_iterators(&self) -> Vec<IteratorInfo> {
        let iterators: Vec<Arc<StreamIterator>> =
            self.iterators.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(iterators.len());
        for iterator in iterators {
            infos.push(iterator.info().await);
        }
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    /// Close iterators not read for longer than `idle`. Returns how many
    /// were closed.
    pub async fn reap_idle_iterators(&self, idle: Duration) -> usize {
        let expired: Vec<Arc<StreamIterator>> = {
            let mut iterators = self.iterators.write().await;
            let ids: Vec<Uuid> = iterators
                .iter()
                .filter(|(_, it)| it.idle_for() > idle)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| iterators.remove(id)).collect()
        };

        for iterator in &expired {
            tracing::info!(
                stream = %self.uuid,
                iterator = %iterator.uuid(),
                idle_ms = iterator.idle_for().as_millis() as u64,
                "Closing idle iterator"
            );
            if let Err(e) = iterator.close().await {
                tracing::warn!(iterator = %iterator.uuid(), error = %e, "Failed to close idle iterator");
            }
        }
        expired.len()
    }

    /// Stop accepting records, flush what is queued, close the writer and
    /// every iterator. A second call returns immediately.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();

        // Dropping the last sender lets the ingest task drain and exit.
        self.ingest.lock().await.sender.take();
        if let Some(task) = self.ingest_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::error!(stream = %self.uuid, error = %e, "Ingest task panicked");
            }
        }

        let iterators: Vec<Arc<StreamIterator>> = self
            .iterators
            .write()
            .await
            .drain()
            .map(|(_, it)| it)
            .collect();
        for iterator in iterators {
            if let Err(e) = iterator.close().await {
                tracing::warn!(stream = %self.uuid, iterator = %iterator.uuid(), error = %e, "Failed to close iterator");
            }
        }

        if let Some(task) = self.janitor_task.lock().await.take() {
            let _ = task.await;
        }

        tracing::info!(
            stream = %self.uuid,
            readable_last_id = self.readable_last_id(),
            degraded = self.is_degraded(),
            "Stream closed"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("uuid", &self.uuid)
            .field("storage", &self.provider.name())
            .field("readable_last_id", &self.readable_last_id())
            .field("degraded", &self.is_degraded())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_ingest(
    stream: Uuid,
    mut buffer: IngestBuffer,
    readable: watch::Sender<u64>,
    degraded: Arc<AtomicBool>,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        let received = match deadline {
            Some(at) => tokio::select! {
                record = buffer.recv() => Some(record),
                _ = tokio::time::sleep_until(at) => None,
            },
            None => Some(buffer.recv().await),
        };

        let flush_now = match received {
            // timer fired
            None => true,
            // every sender is gone
            Some(None) => break,
            Some(Some(record)) => {
                buffer.append(record);
                buffer.drain_ready();
                match buffer.flush_frequency() {
                    None => true,
                    Some(_) if buffer.is_full() => true,
                    Some(frequency) => {
                        deadline.get_or_insert_with(|| Instant::now() + frequency);
                        false
                    }
                }
            }
        };

        if flush_now {
            deadline = None;
            if !flush(stream, &mut buffer, &readable, &degraded).await {
                break;
            }
        }
    }

    if !degraded.load(Ordering::SeqCst) {
        // Records queued after the last flush
        buffer.drain_ready();
        while !buffer.is_empty() {
            if !flush(stream, &mut buffer, &readable, &degraded).await {
                break;
            }
            buffer.drain_ready();
        }
    }

    if let Err(e) = buffer.close().await {
        tracing::warn!(stream = %stream, error = %e, "Failed to close writer");
    }
    tracing::debug!(stream = %stream, "Ingest loop stopped");
}

/// Save the pending batch and publish the new readable id. Returns false
/// when the stream must stop ingesting.
async fn flush(
    stream: Uuid,
    buffer: &mut IngestBuffer,
    readable: &watch::Sender<u64>,
    degraded: &AtomicBool,
) -> bool {
    match buffer.save().await {
        Ok(Some(last_id)) => {
            readable.send_replace(last_id);
            true
        }
        Ok(None) => true,
        Err(e) => {
            degraded.store(true, Ordering::SeqCst);
            tracing::error!(
                stream = %stream,
                pending = buffer.len(),
                error = %e,
                "Ingest loop terminated, stream is degraded"
            );
            false
        }
    }
}

fn spawn_janitor(stream: &Arc<Stream>, idle: Duration, period: Duration) -> JoinHandle<()> {
    let weak: Weak<Stream> = Arc::downgrade(stream);
    let shutdown = stream.shutdown.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(stream) = weak.upgrade() else { break };
                    stream.reap_idle_iterators(idle).await;
                }
            }
        }
    })
}
