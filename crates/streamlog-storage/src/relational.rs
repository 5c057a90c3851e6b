//! Relational Storage Backend (SQLite)
//!
//! One catalog table plus one table per stream, accessed through a SQLx pool.
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE streams (
//!     id                        TEXT PRIMARY KEY,   -- stream uuid
//!     creation_date             INTEGER NOT NULL,   -- unix nanos
//!     last_update               INTEGER NOT NULL,
//!     cache_cpt_rows            INTEGER NOT NULL,
//!     cache_size_in_bytes       INTEGER NOT NULL,
//!     cache_first_msg_id        INTEGER NOT NULL,
//!     cache_last_msg_id         INTEGER NOT NULL,
//!     cache_first_msg_timestamp INTEGER,
//!     cache_last_msg_timestamp  INTEGER,
//!     properties                TEXT NOT NULL       -- JSON object
//! );
//!
//! CREATE TABLE <prefix><uuid-simple> (
//!     id        INTEGER PRIMARY KEY,
//!     timestamp INTEGER NOT NULL,
//!     message   TEXT NOT NULL
//! );
//! ```
//!
//! ## Write Path
//!
//! A batch is one transaction: every `INSERT` plus the `UPDATE` of the catalog
//! row's cached statistics. The in-memory `readable` snapshot that bounds
//! iterators is replaced only after `COMMIT` returns, so a reader that sees a
//! new `readable.last_id` can always fetch that row.
//!
//! ## Read Path
//!
//! Iterators fetch `page_size` rows at a time with
//! `WHERE id >= ? AND id <= readable.last_id ORDER BY id`.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use streamlog_core::record::{from_timestamp_nanos, timestamp_nanos};
use streamlog_core::{Payload, Properties, Record, SeekPosition, StreamInfo, StreamStats};
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::RelationalConfig;
use crate::error::{Result, StorageError};
use crate::provider::{check_after_id, IteratorHandler, StorageProvider, StreamWriter};

type Catalog = Arc<RwLock<HashMap<Uuid, StreamInfo>>>;

const CREATE_CATALOG: &str = "CREATE TABLE IF NOT EXISTS streams (
    id TEXT PRIMARY KEY,
    creation_date INTEGER NOT NULL,
    last_update INTEGER NOT NULL,
    cache_cpt_rows INTEGER NOT NULL DEFAULT 0,
    cache_size_in_bytes INTEGER NOT NULL DEFAULT 0,
    cache_first_msg_id INTEGER NOT NULL DEFAULT 0,
    cache_last_msg_id INTEGER NOT NULL DEFAULT 0,
    cache_first_msg_timestamp INTEGER,
    cache_last_msg_timestamp INTEGER,
    properties TEXT NOT NULL DEFAULT '{}'
)";

const UPDATE_CACHE: &str = "UPDATE streams SET
    last_update = ?,
    cache_cpt_rows = ?,
    cache_size_in_bytes = ?,
    cache_first_msg_id = ?,
    cache_last_msg_id = ?,
    cache_first_msg_timestamp = ?,
    cache_last_msg_timestamp = ?
 WHERE id = ?";

/// Normalise a SQLite connection string.
///
/// - `:memory:` (with or without scheme) becomes `sqlite::memory:`
/// - a bare path gets the `sqlite://` scheme
/// - `mode=rwc` is added unless a mode is given, so the file is created on
///   first use
pub fn normalize_dsn(dsn: &str) -> String {
    let dsn = dsn.trim();
    if matches!(dsn, ":memory:" | "sqlite::memory:" | "sqlite://:memory:") {
        return "sqlite::memory:".to_string();
    }

    let mut normalized = if dsn.starts_with("sqlite:") {
        dsn.to_string()
    } else {
        format!("sqlite://{}", dsn)
    };

    if !normalized.contains("mode=") {
        normalized.push(if normalized.contains('?') { '&' } else { '?' });
        normalized.push_str("mode=rwc");
    }
    normalized
}

fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty()
        || !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(StorageError::Core(streamlog_core::Error::InvalidArgument(
            format!("table prefix '{}' must be non-empty [A-Za-z0-9_]", prefix),
        )));
    }
    Ok(())
}

fn optional_nanos(time: &Option<chrono::DateTime<Utc>>) -> Option<i64> {
    time.as_ref().map(timestamp_nanos)
}

fn info_from_row(row: &SqliteRow) -> Result<StreamInfo> {
    let id: String = row.try_get("id")?;
    let uuid = Uuid::parse_str(&id).map_err(|e| {
        StorageError::Corrupted(format!("catalog row has invalid uuid '{}': {}", id, e))
    })?;
    let properties: Properties = serde_json::from_str(row.try_get::<&str, _>("properties")?)?;

    let readable = StreamStats {
        count: row.try_get::<i64, _>("cache_cpt_rows")? as u64,
        size_bytes: row.try_get::<i64, _>("cache_size_in_bytes")? as u64,
        first_id: row.try_get::<i64, _>("cache_first_msg_id")? as u64,
        last_id: row.try_get::<i64, _>("cache_last_msg_id")? as u64,
        first_time: row
            .try_get::<Option<i64>, _>("cache_first_msg_timestamp")?
            .map(from_timestamp_nanos),
        last_time: row
            .try_get::<Option<i64>, _>("cache_last_msg_timestamp")?
            .map(from_timestamp_nanos),
    };

    Ok(StreamInfo {
        uuid,
        creation_time: from_timestamp_nanos(row.try_get("creation_date")?),
        last_update: from_timestamp_nanos(row.try_get("last_update")?),
        properties,
        ingested: readable.clone(),
        readable,
        degraded: false,
    })
}

/// Storage provider backed by SQLite.
pub struct RelationalProvider {
    config: RelationalConfig,
    pool: OnceCell<SqlitePool>,
    catalog: Catalog,
}

impl RelationalProvider {
    pub fn new(config: RelationalConfig) -> Self {
        Self {
            config,
            pool: OnceCell::new(),
            catalog: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn pool(&self) -> Result<&SqlitePool> {
        self.pool.get().ok_or(StorageError::NotInitialized)
    }

    /// Name of the table holding a stream's records.
    pub fn table_name(&self, uuid: Uuid) -> String {
        format!("{}{}", self.config.table_prefix, uuid.simple())
    }

    async fn connect(&self) -> Result<SqlitePool> {
        let dsn = normalize_dsn(&self.config.dsn);
        let options = SqliteConnectOptions::from_str(&dsn)?.create_if_missing(true);
        let mut pool = SqlitePoolOptions::new().max_connections(self.config.max_connections.max(1));
        if dsn == "sqlite::memory:" {
            // The database lives only as long as one connection does
            pool = pool.min_connections(1).idle_timeout(None).max_lifetime(None);
        }
        Ok(pool.connect_with(options).await?)
    }
}

#[async_trait]
impl StorageProvider for RelationalProvider {
    fn name(&self) -> &'static str {
        "relational"
    }

    async fn init(&self) -> Result<()> {
        validate_prefix(&self.config.table_prefix)?;
        let pool = self.pool.get_or_try_init(|| self.connect()).await?;
        sqlx::query(CREATE_CATALOG).execute(pool).await?;
        info!(dsn = %normalize_dsn(&self.config.dsn), "Relational storage initialized");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
        Ok(())
    }

    async fn new_stream_id(&self) -> Result<Uuid> {
        let pool = self.pool()?;
        loop {
            let uuid = Uuid::new_v4();
            if self.catalog.read().await.contains_key(&uuid) {
                continue;
            }
            let row = sqlx::query("SELECT COUNT(*) AS n FROM streams WHERE id = ?")
                .bind(uuid.to_string())
                .fetch_one(pool)
                .await?;
            if row.try_get::<i64, _>("n")? == 0 {
                return Ok(uuid);
            }
        }
    }

    async fn stream_exists(&self, uuid: Uuid) -> bool {
        self.catalog.read().await.contains_key(&uuid)
    }

    async fn load_catalog(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT * FROM streams ORDER BY id")
            .fetch_all(self.pool()?)
            .await?;

        let mut catalog = HashMap::with_capacity(rows.len());
        for row in &rows {
            let info = info_from_row(row)?;
            catalog.insert(info.uuid, info);
        }

        let mut ids: Vec<Uuid> = catalog.keys().copied().collect();
        ids.sort();
        *self.catalog.write().await = catalog;

        info!(streams = ids.len(), "Catalog loaded");
        Ok(ids)
    }

    async fn save_catalog(&self) -> Result<()> {
        // Every catalog change is committed as it happens
        Ok(())
    }

    async fn get_stream_info(&self, uuid: Uuid) -> Result<StreamInfo> {
        self.catalog
            .read()
            .await
            .get(&uuid)
            .cloned()
            .ok_or(StorageError::StreamNotFound(uuid))
    }

    async fn on_create_stream(&self, info: &StreamInfo) -> Result<()> {
        let pool = self.pool()?;
        let mut catalog = self.catalog.write().await;
        if catalog.contains_key(&info.uuid) {
            return Err(StorageError::StreamExists(info.uuid));
        }

        let table = self.table_name(info.uuid);
        let mut tx = pool.begin().await?;
        sqlx::query(&format!(
            "CREATE TABLE {} (id INTEGER PRIMARY KEY, timestamp INTEGER NOT NULL, message TEXT NOT NULL)",
            table
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX {table}_timestamp ON {table} (timestamp)",
            table = table
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO streams (id, creation_date, last_update, properties) VALUES (?, ?, ?, ?)",
        )
        .bind(info.uuid.to_string())
        .bind(timestamp_nanos(&info.creation_time))
        .bind(timestamp_nanos(&info.last_update))
        .bind(serde_json::to_string(&info.properties)?)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        catalog.insert(info.uuid, info.clone());
        info!(stream = %info.uuid, table = %table, "Stream table created");
        Ok(())
    }

    async fn on_delete_stream(&self, uuid: Uuid) -> Result<()> {
        let pool = self.pool()?;
        let mut catalog = self.catalog.write().await;
        if !catalog.contains_key(&uuid) {
            return Err(StorageError::StreamNotFound(uuid));
        }

        let mut tx = pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", self.table_name(uuid)))
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM streams WHERE id = ?")
            .bind(uuid.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        catalog.remove(&uuid);
        info!(stream = %uuid, "Stream table dropped");
        Ok(())
    }

    async fn new_writer(&self, uuid: Uuid) -> Result<Box<dyn StreamWriter>> {
        if !self.stream_exists(uuid).await {
            return Err(StorageError::StreamNotFound(uuid));
        }
        Ok(Box::new(RelationalWriter {
            pool: self.pool()?.clone(),
            catalog: self.catalog.clone(),
            uuid,
            insert_sql: format!(
                "INSERT INTO {} (id, timestamp, message) VALUES (?, ?, ?)",
                self.table_name(uuid)
            ),
            table: self.table_name(uuid),
        }))
    }

    async fn new_iterator_handler(
        &self,
        stream: Uuid,
        iterator: Uuid,
    ) -> Result<Box<dyn IteratorHandler>> {
        if !self.stream_exists(stream).await {
            return Err(StorageError::StreamNotFound(stream));
        }
        Ok(Box::new(RelationalIteratorHandler {
            pool: self.pool()?.clone(),
            catalog: self.catalog.clone(),
            stream,
            iterator,
            table: self.table_name(stream),
            page_size: self.config.page_size.max(1),
            next_id: None,
            saved: None,
            page: VecDeque::new(),
        }))
    }

    async fn build_index(&self, uuid: Uuid) -> Result<StreamStats> {
        let pool = self.pool()?;
        let mut catalog = self.catalog.write().await;
        let info = catalog
            .get_mut(&uuid)
            .ok_or(StorageError::StreamNotFound(uuid))?;

        let table = self.table_name(uuid);
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS n,
                    COALESCE(SUM(LENGTH(CAST(message AS BLOB))), 0) AS size,
                    COALESCE(MIN(id), 0) AS first_id,
                    COALESCE(MAX(id), 0) AS last_id,
                    (SELECT timestamp FROM {table} ORDER BY id ASC LIMIT 1) AS first_ts,
                    (SELECT timestamp FROM {table} ORDER BY id DESC LIMIT 1) AS last_ts
             FROM {table}",
            table = table
        ))
        .fetch_one(pool)
        .await?;

        let stats = StreamStats {
            count: row.try_get::<i64, _>("n")? as u64,
            size_bytes: row.try_get::<i64, _>("size")? as u64,
            first_id: row.try_get::<i64, _>("first_id")? as u64,
            last_id: row.try_get::<i64, _>("last_id")? as u64,
            first_time: row.try_get::<Option<i64>, _>("first_ts")?.map(from_timestamp_nanos),
            last_time: row.try_get::<Option<i64>, _>("last_ts")?.map(from_timestamp_nanos),
        };

        let now = Utc::now();
        bind_cache(sqlx::query(UPDATE_CACHE), now, &stats)
            .bind(uuid.to_string())
            .execute(pool)
            .await?;

        info.readable = stats.clone();
        if info.ingested.last_id < stats.last_id {
            info.ingested = stats.clone();
        }
        info.last_update = now;

        info!(stream = %uuid, records = stats.count, "Statistics rebuilt");
        Ok(stats)
    }
}

fn bind_cache<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    now: chrono::DateTime<Utc>,
    stats: &StreamStats,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(timestamp_nanos(&now))
        .bind(stats.count as i64)
        .bind(stats.size_bytes as i64)
        .bind(stats.first_id as i64)
        .bind(stats.last_id as i64)
        .bind(optional_nanos(&stats.first_time))
        .bind(optional_nanos(&stats.last_time))
}

struct RelationalWriter {
    pool: SqlitePool,
    catalog: Catalog,
    uuid: Uuid,
    table: String,
    insert_sql: String,
}

#[async_trait]
impl StreamWriter for RelationalWriter {
    async fn init(&mut self) -> Result<()> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(&self.table)
            .fetch_one(&self.pool)
            .await?;
        if row.try_get::<i64, _>("n")? == 0 {
            return Err(StorageError::StreamNotFound(self.uuid));
        }
        Ok(())
    }

    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut readable = self
            .catalog
            .read()
            .await
            .get(&self.uuid)
            .map(|info| info.readable.clone())
            .ok_or(StorageError::StreamNotFound(self.uuid))?;

        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(&self.insert_sql)
                .bind(record.id as i64)
                .bind(record.timestamp_nanos())
                .bind(record.payload.as_str())
                .execute(&mut *tx)
                .await?;
            readable.observe(
                record.id,
                record.creation_time,
                record.payload.len() as u64,
            );
        }

        let now = Utc::now();
        bind_cache(sqlx::query(UPDATE_CACHE), now, &readable)
            .bind(self.uuid.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        // Publish only after COMMIT
        if let Some(info) = self.catalog.write().await.get_mut(&self.uuid) {
            info.readable = readable;
            if info.ingested.last_id < info.readable.last_id {
                info.ingested = info.readable.clone();
            }
            info.last_update = now;
        }

        debug!(stream = %self.uuid, records = records.len(), "Batch committed");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct RelationalIteratorHandler {
    pool: SqlitePool,
    catalog: Catalog,
    stream: Uuid,
    iterator: Uuid,
    table: String,
    page_size: usize,
    /// Smallest id the next fetch may return
    next_id: Option<u64>,
    saved: Option<u64>,
    page: VecDeque<(u64, Result<Record>)>,
}

impl RelationalIteratorHandler {
    async fn readable(&self) -> Result<StreamStats> {
        self.catalog
            .read()
            .await
            .get(&self.stream)
            .map(|info| info.readable.clone())
            .ok_or(StorageError::StreamNotFound(self.stream))
    }

    async fn resolve(&self, position: &SeekPosition) -> Result<u64> {
        let readable = self.readable().await?;
        let next = match *position {
            SeekPosition::First => 0,
            SeekPosition::Last => readable.last_id,
            SeekPosition::AfterLast => readable.last_id + 1,
            SeekPosition::AtId(id) => {
                let row = sqlx::query(&format!(
                    "SELECT COUNT(*) AS n FROM {} WHERE id = ? AND id <= ?",
                    self.table
                ))
                .bind(id as i64)
                .bind(readable.last_id as i64)
                .fetch_one(&self.pool)
                .await?;
                if row.try_get::<i64, _>("n")? == 0 {
                    return Err(StorageError::RecordNotFound(format!("message id {}", id)));
                }
                id
            }
            SeekPosition::AfterId(id) => {
                check_after_id(id, &readable)?;
                id + 1
            }
            SeekPosition::AtTimestamp(t) => {
                let row = sqlx::query(&format!(
                    "SELECT MIN(id) AS id FROM {} WHERE timestamp >= ? AND id <= ?",
                    self.table
                ))
                .bind(timestamp_nanos(&t))
                .bind(readable.last_id as i64)
                .fetch_one(&self.pool)
                .await?;
                match row.try_get::<Option<i64>, _>("id")? {
                    Some(id) => id as u64,
                    None => {
                        return Err(StorageError::RecordNotFound(format!(
                            "no record at or after {}",
                            t.to_rfc3339()
                        )))
                    }
                }
            }
        };
        Ok(next)
    }

    async fn fill_page(&mut self, from: u64) -> Result<bool> {
        let readable = self.readable().await?;
        if readable.count == 0 || from > readable.last_id {
            return Ok(false);
        }

        let rows = sqlx::query(&format!(
            "SELECT id, timestamp, message FROM {} WHERE id >= ? AND id <= ? ORDER BY id LIMIT ?",
            self.table
        ))
        .bind(from as i64)
        .bind(readable.last_id as i64)
        .bind(self.page_size as i64)
        .fetch_all(&self.pool)
        .await?;

        for row in &rows {
            let id = row.try_get::<i64, _>("id")? as u64;
            let timestamp: i64 = row.try_get("timestamp")?;
            let message: &str = row.try_get("message")?;
            let record = Payload::from_json(message)
                .map(|payload| Record::new(id, from_timestamp_nanos(timestamp), payload))
                .map_err(|e| StorageError::CorruptedRecord {
                    id,
                    reason: e.to_string(),
                });
            self.page.push_back((id, record));
        }

        debug!(
            stream = %self.stream,
            iterator = %self.iterator,
            from,
            records = rows.len(),
            "Page fetched"
        );
        Ok(!rows.is_empty())
    }
}

#[async_trait]
impl IteratorHandler for RelationalIteratorHandler {
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    async fn seek(&mut self, position: &SeekPosition) -> Result<()> {
        if let Some(saved) = self.saved {
            if self.next_id != Some(saved) {
                self.page.clear();
            }
            self.next_id = Some(saved);
            return Ok(());
        }
        if self.next_id.is_none() {
            self.next_id = Some(self.resolve(position).await?);
        }
        Ok(())
    }

    async fn get_next(&mut self) -> Result<Option<Record>> {
        let next = self.next_id.ok_or(StorageError::NotPositioned)?;
        if self.page.is_empty() && !self.fill_page(next).await? {
            return Ok(None);
        }

        match self.page.pop_front() {
            Some((id, record)) => {
                self.next_id = Some(id + 1);
                record.map(Some)
            }
            None => Ok(None),
        }
    }

    async fn save_seek(&mut self) -> Result<()> {
        self.saved = self.next_id;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.page.clear();
        Ok(())
    }
}
