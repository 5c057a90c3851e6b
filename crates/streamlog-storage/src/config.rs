//! Storage Configuration
//!
//! This module defines the `[storage]` section of the service configuration.
//!
//! ## StorageConfig
//!
//! - **type**: which backend to build: `file`, `relational` or `in-memory` (default: file)
//! - **file**: data directory and iterator read-ahead for the file backend
//! - **relational**: DSN, table prefix, pool size and page size for SQLite
//! - **memory**: per-stream record cap for the in-memory backend
//!
//! ## Usage
//!
//! ```ignore
//! use streamlog_storage::{StorageConfig, StorageType};
//!
//! // Local file backend
//! let config = StorageConfig {
//!     storage_type: StorageType::File,
//!     file: FileConfig { data_dir: "/var/lib/streamlog".into(), ..Default::default() },
//!     ..Default::default()
//! };
//!
//! // SQLite database
//! let config = StorageConfig {
//!     storage_type: StorageType::Relational,
//!     relational: RelationalConfig { dsn: "sqlite://streams.db".into(), ..Default::default() },
//!     ..Default::default()
//! };
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::StorageError;

/// Backend selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageType {
    #[default]
    File,
    Relational,
    InMemory,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::File => "file",
            StorageType::Relational => "relational",
            StorageType::InMemory => "in-memory",
        }
    }
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(StorageType::File),
            "relational" | "sql" | "sqlite" => Ok(StorageType::Relational),
            "in-memory" | "memory" => Ok(StorageType::InMemory),
            other => Err(StorageError::UnknownStorageType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(rename = "type", default)]
    pub storage_type: StorageType,

    #[serde(default)]
    pub file: FileConfig,

    #[serde(default)]
    pub relational: RelationalConfig,

    #[serde(default)]
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    /// Root directory holding `streams.json` and `streams/<uuid>/` (default: ./data)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Index entries fetched per iterator read-ahead (default: 100)
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// fdatasync data and index after each batch (default: true)
    #[serde(default = "default_sync_on_write")]
    pub sync_on_write: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_page_size() -> usize {
    100
}

fn default_sync_on_write() -> bool {
    true
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            page_size: default_page_size(),
            sync_on_write: default_sync_on_write(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationalConfig {
    /// SQLite connection string (default: sqlite://./data/streamlog.db)
    #[serde(default = "default_dsn")]
    pub dsn: String,

    /// Prefix of per-stream tables (default: stream_)
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,

    /// Connection pool size (default: 5)
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Rows fetched per iterator page (default: 100)
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_dsn() -> String {
    "sqlite://./data/streamlog.db".to_string()
}

fn default_table_prefix() -> String {
    "stream_".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            dsn: default_dsn(),
            table_prefix: default_table_prefix(),
            max_connections: default_max_connections(),
            page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Maximum records kept per stream, 0 = unlimited
    #[serde(default)]
    pub max_records_per_stream: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_type_parse() {
        assert_eq!("file".parse::<StorageType>().unwrap(), StorageType::File);
        assert_eq!(
            "Relational".parse::<StorageType>().unwrap(),
            StorageType::Relational
        );
        assert_eq!(
            "in-memory".parse::<StorageType>().unwrap(),
            StorageType::InMemory
        );
        assert!("redis".parse::<StorageType>().is_err());
    }

    #[test]
    fn test_defaults_from_empty_json() {
        let config: StorageConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.storage_type, StorageType::File);
        assert_eq!(config.file.data_dir, PathBuf::from("./data"));
        assert_eq!(config.relational.table_prefix, "stream_");
        assert_eq!(config.relational.page_size, 100);
        assert_eq!(config.memory.max_records_per_stream, 0);
    }

    #[test]
    fn test_type_key_uses_kebab_case() {
        let config: StorageConfig = serde_json::from_str(r#"{"type":"in-memory"}"#).unwrap();
        assert_eq!(config.storage_type, StorageType::InMemory);
    }
}
