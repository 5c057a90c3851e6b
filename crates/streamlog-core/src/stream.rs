//! Stream Metadata Types
//!
//! ## StreamInfo
//! Everything the catalog knows about a stream: identity, timestamps, the
//! free-form `properties` map, and two statistics blocks.
//!
//! ## Statistics Blocks
//!
//! - **ingested**: everything accepted by the producer path, including
//!   records still waiting in the ingest buffer
//! - **readable**: everything durably persisted and visible to iterators
//!
//! `readable` never leads `ingested`: `readable.count <= ingested.count` and
//! `readable.last_id <= ingested.last_id`. Backends advance `readable` only
//! after a batch commits.
//!
//! ## Properties Limits
//!
//! At most 32 entries, keys 1..=64 bytes, values up to 256 bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::record::Record;

/// Free-form string properties attached to a stream
pub type Properties = BTreeMap<String, String>;

pub const MAX_PROPERTIES: usize = 32;
pub const MAX_PROPERTY_KEY_LEN: usize = 64;
pub const MAX_PROPERTY_VALUE_LEN: usize = 256;

/// Check the properties map against the catalog limits.
pub fn validate_properties(properties: &Properties) -> Result<()> {
    if properties.len() > MAX_PROPERTIES {
        return Err(Error::InvalidProperties(format!(
            "{} entries exceeds limit of {}",
            properties.len(),
            MAX_PROPERTIES
        )));
    }

    for (key, value) in properties {
        if key.is_empty() || key.len() > MAX_PROPERTY_KEY_LEN {
            return Err(Error::InvalidProperties(format!(
                "key '{}' must be 1..={} bytes",
                key, MAX_PROPERTY_KEY_LEN
            )));
        }
        if value.len() > MAX_PROPERTY_VALUE_LEN {
            return Err(Error::InvalidProperties(format!(
                "value of '{}' exceeds {} bytes",
                key, MAX_PROPERTY_VALUE_LEN
            )));
        }
    }

    Ok(())
}

/// Count/size/range statistics over a set of records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    pub count: u64,
    pub size_bytes: u64,
    pub first_id: u64,
    pub last_id: u64,
    pub first_time: Option<DateTime<Utc>>,
    pub last_time: Option<DateTime<Utc>>,
}

impl StreamStats {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Account for one more record appended after the current last one.
    pub fn observe(&mut self, id: u64, time: DateTime<Utc>, size_bytes: u64) {
        if self.count == 0 {
            self.first_id = id;
            self.first_time = Some(time);
        }
        self.count += 1;
        self.size_bytes += size_bytes;
        self.last_id = id;
        self.last_time = Some(time);
    }

    /// Account for a batch of records, using their encoded size.
    pub fn observe_batch(&mut self, records: &[Record], sizes: &[u64]) {
        for (record, size) in records.iter().zip(sizes) {
            self.observe(record.id, record.creation_time, *size);
        }
    }
}

/// Metadata of a stream as kept in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub uuid: Uuid,
    pub creation_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub ingested: StreamStats,
    #[serde(default)]
    pub readable: StreamStats,
    /// Set when the ingest loop stopped on a storage fault
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

impl StreamInfo {
    pub fn new(uuid: Uuid, properties: Properties) -> Self {
        let now = Utc::now();
        Self {
            uuid,
            creation_time: now,
            last_update: now,
            properties,
            ingested: StreamStats::default(),
            readable: StreamStats::default(),
            degraded: false,
        }
    }

    /// Properties as a JSON object, the input of listing filters.
    pub fn properties_value(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.properties
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect(),
        )
    }
}
