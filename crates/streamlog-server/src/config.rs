//! Service Configuration
//!
//! ## ServiceConfig
//!
//! Two sections, both optional in the TOML file:
//!
//! - **storage**: backend selection and backend-specific settings (see
//!   [`streamlog_storage::StorageConfig`])
//! - **streams**: ingest batching, back-pressure, quotas and iterator limits
//!
//! ## StreamsConfig
//!
//! - **bulk_flush_frequency**: seconds between timer flushes, 0 = flush every record (default: 1.0)
//! - **bulk_max_size**: records buffered before an early flush (default: 1000)
//! - **channel_buffer_size**: ingest channel capacity (default: 1000)
//! - **max_iterators_per_stream**: 0 = unlimited (default: 100)
//! - **max_message_per_get_operation**: ceiling on `get_records` max (default: 1000)
//! - **max_allowed_streams**: 0 = unlimited (default: 0)
//! - **flush_retries**: write attempts per flush with exponential backoff (default: 3)
//! - **iterator_idle_timeout**: seconds, 0 = iterators never expire (default: 0)
//! - **iterator_reap_interval**: seconds between idle scans (default: 30)
//!
//! ## Example
//!
//! ```toml
//! [storage]
//! type = "relational"
//!
//! [storage.relational]
//! dsn = "sqlite:///var/lib/streamlog/streams.db"
//!
//! [streams]
//! bulk_flush_frequency = 0.5
//! max_allowed_streams = 64
//! ```
//!
//! ## Environment Variables
//!
//! - `STREAMLOG_CONFIG`: path of the TOML file (default: streamlog.toml, optional)
//! - `STREAMLOG_STORAGE_TYPE`: overrides `storage.type`
//! - `STREAMLOG_DATA_DIR`: overrides `storage.file.data_dir`
//! - `STREAMLOG_DSN`: overrides `storage.relational.dsn`

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use streamlog_storage::{StorageConfig, StorageType};

use crate::error::{Result, ServiceError};

pub const DEFAULT_CONFIG_FILE: &str = "streamlog.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub streams: StreamsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamsConfig {
    /// Seconds between timer-driven flushes, 0 = immediate mode (default: 1.0)
    #[serde(default = "default_bulk_flush_frequency")]
    pub bulk_flush_frequency: f64,

    /// Buffered records that force a flush (default: 1000)
    #[serde(default = "default_bulk_max_size")]
    pub bulk_max_size: usize,

    /// Ingest channel capacity (default: 1000)
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,

    /// Open iterators per stream, 0 = unlimited (default: 100)
    #[serde(default = "default_max_iterators_per_stream")]
    pub max_iterators_per_stream: usize,

    /// Server-side ceiling on records per read (default: 1000)
    #[serde(default = "default_max_message_per_get_operation")]
    pub max_message_per_get_operation: usize,

    /// Streams per service, 0 = unlimited (default: 0)
    #[serde(default)]
    pub max_allowed_streams: usize,

    /// Write attempts per flush before the ingest loop gives up (default: 3)
    #[serde(default = "default_flush_retries")]
    pub flush_retries: u32,

    /// Idle seconds after which an iterator is closed, 0 = never (default: 0)
    #[serde(default)]
    pub iterator_idle_timeout: u64,

    /// Seconds between idle iterator scans (default: 30)
    #[serde(default = "default_iterator_reap_interval")]
    pub iterator_reap_interval: u64,
}

fn default_bulk_flush_frequency() -> f64 {
    1.0
}

fn default_bulk_max_size() -> usize {
    1000
}

fn default_channel_buffer_size() -> usize {
    1000
}

fn default_max_iterators_per_stream() -> usize {
    100
}

fn default_max_message_per_get_operation() -> usize {
    1000
}

fn default_flush_retries() -> u32 {
    3
}

fn default_iterator_reap_interval() -> u64 {
    30
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            bulk_flush_frequency: default_bulk_flush_frequency(),
            bulk_max_size: default_bulk_max_size(),
            channel_buffer_size: default_channel_buffer_size(),
            max_iterators_per_stream: default_max_iterators_per_stream(),
            max_message_per_get_operation: default_max_message_per_get_operation(),
            max_allowed_streams: 0,
            flush_retries: default_flush_retries(),
            iterator_idle_timeout: 0,
            iterator_reap_interval: default_iterator_reap_interval(),
        }
    }
}

impl StreamsConfig {
    /// Flush timer period, `None` in immediate mode.
    pub fn flush_frequency(&self) -> Option<Duration> {
        if self.bulk_flush_frequency > 0.0 {
            Some(Duration::from_secs_f64(self.bulk_flush_frequency))
        } else {
            None
        }
    }

    pub fn iterator_idle_timeout(&self) -> Option<Duration> {
        (self.iterator_idle_timeout > 0).then(|| Duration::from_secs(self.iterator_idle_timeout))
    }

    pub fn iterator_reap_interval(&self) -> Duration {
        Duration::from_secs(self.iterator_reap_interval.max(1))
    }

    /// Clamp a requested read size to the configured ceiling. 0 asks for the
    /// ceiling itself.
    pub fn clamp_max(&self, requested: usize) -> usize {
        if requested == 0 {
            self.max_message_per_get_operation
        } else {
            requested.min(self.max_message_per_get_operation)
        }
    }
}

impl ServiceConfig {
    /// Parse a TOML document.
    pub fn from_toml(document: &str) -> Result<Self> {
        let config: ServiceConfig =
            toml::from_str(document).map_err(|e| ServiceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, or defaults when the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(document) => Self::from_toml(&document),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(ServiceError::Config(format!(
                "cannot read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Load the file named by `STREAMLOG_CONFIG` and apply environment overrides.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// [`ServiceConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let path = lookup("STREAMLOG_CONFIG").unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
        let mut config = Self::load(path)?;

        if let Some(storage_type) = lookup("STREAMLOG_STORAGE_TYPE") {
            config.storage.storage_type = storage_type
                .parse::<StorageType>()
                .map_err(|e| ServiceError::Config(e.to_string()))?;
        }
        if let Some(data_dir) = lookup("STREAMLOG_DATA_DIR") {
            config.storage.file.data_dir = data_dir.into();
        }
        if let Some(dsn) = lookup("STREAMLOG_DSN") {
            config.storage.relational.dsn = dsn;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let streams = &self.streams;
        if !streams.bulk_flush_frequency.is_finite() || streams.bulk_flush_frequency < 0.0 {
            return Err(ServiceError::Config(format!(
                "streams.bulk_flush_frequency must be a non-negative number, got {}",
                streams.bulk_flush_frequency
            )));
        }
        if streams.bulk_max_size == 0 {
            return Err(ServiceError::Config(
                "streams.bulk_max_size must be at least 1".to_string(),
            ));
        }
        if streams.channel_buffer_size == 0 {
            return Err(ServiceError::Config(
                "streams.channel_buffer_size must be at least 1".to_string(),
            ));
        }
        if streams.max_message_per_get_operation == 0 {
            return Err(ServiceError::Config(
                "streams.max_message_per_get_operation must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
