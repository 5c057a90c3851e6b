//! StreamLog Storage Layer
//!
//! This crate implements persistence for StreamLog: the stream catalog, the
//! append path of each stream and the read path of each iterator.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐      batches       ┌───────────────┐
//! │ Ingest task  │ ─────────────────► │ StreamWriter  │
//! └──────────────┘                    └───────┬───────┘
//!                                             │ data + index + readable stats
//!                                             ▼
//!                                   ┌───────────────────┐
//!                                   │  StorageProvider  │ ◄── catalog
//!                                   │  file | sqlite |  │
//!                                   │  in-memory        │
//!                                   └─────────┬─────────┘
//!                                             │ pages
//!                                             ▼
//! ┌──────────────┐      records       ┌───────────────────┐
//! │   Iterator   │ ◄───────────────── │  IteratorHandler  │
//! └──────────────┘                    └───────────────────┘
//! ```
//!
//! ## Backends
//!
//! ### FileProvider
//! `data.jsonl` + `index.bin` per stream. Binary search over fixed-size index
//! entries for id and timestamp seeks, paged read-ahead, rollback of partial
//! writes, index verification and rebuild on load.
//!
//! ### RelationalProvider
//! SQLite through SQLx. One table per stream, one transaction per batch that
//! also refreshes the catalog row's cached statistics.
//!
//! ### MemoryProvider
//! Vectors in process memory with an optional per-stream record cap.
//!
//! ## Usage Example
//!
//! ```ignore
//! use streamlog_storage::{ProviderRegistry, StorageConfig};
//!
//! let provider = ProviderRegistry::with_defaults().create(&StorageConfig::default())?;
//! provider.init().await?;
//!
//! let uuid = provider.new_stream_id().await?;
//! provider.on_create_stream(&StreamInfo::new(uuid, Properties::new())).await?;
//!
//! let mut writer = provider.new_writer(uuid).await?;
//! writer.init().await?;
//! writer.open().await?;
//! writer.write(&records).await?;
//! ```

pub mod config;
pub mod error;
pub mod file;
pub mod memory;
pub mod provider;
pub mod registry;
pub mod relational;

pub use config::{FileConfig, MemoryConfig, RelationalConfig, StorageConfig, StorageType};
pub use error::{Result, StorageError};
pub use file::FileProvider;
pub use memory::MemoryProvider;
pub use provider::{IteratorHandler, StorageProvider, StreamWriter};
pub use registry::{ProviderFactory, ProviderRegistry};
pub use relational::{normalize_dsn, RelationalProvider};
