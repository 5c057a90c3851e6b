//! Record Data Structure
//!
//! This module defines the [`Record`] type - the unit producers append into a
//! stream and iterators replay.
//!
//! ## Structure
//! - **id**: dense, monotonically increasing sequence number within a stream,
//!   starting at 1
//! - **creation_time**: wall-clock time assigned at ingress, never decreasing
//!   within a stream
//! - **payload**: opaque JSON value, kept as raw text so it round-trips
//!   through the file backend byte for byte
//!
//! ## Line Encoding
//!
//! The file backend stores one record per line:
//!
//! ```text
//! {"i":42,"d":"2024-05-01T12:00:00.123456789Z","m":{"k":1}}\n
//! ```
//!
//! Payloads never contain a raw line break: [`Payload::from_json`] re-encodes
//! pretty-printed input in compact form.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::{Error, Result};

/// Opaque JSON payload carried by a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Box<RawValue>);

impl Payload {
    /// Build a payload from JSON text, validating it and stripping line breaks.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: Box<RawValue> = serde_json::from_str(json)?;
        if raw.get().contains(['\n', '\r']) {
            let value: serde_json::Value = serde_json::from_str(raw.get())?;
            return Self::from_value(&value);
        }
        Ok(Self(raw))
    }

    /// Build a payload from an in-memory JSON value.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        Ok(Self(serde_json::value::to_raw_value(value)?))
    }

    /// Raw JSON text of the payload.
    pub fn as_str(&self) -> &str {
        self.0.get()
    }

    /// Parse the payload into a JSON value (used by filters).
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(self.0.get())?)
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.0.get().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.get().is_empty()
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for Payload {}

impl std::fmt::Display for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const LINE_OPEN: &[u8] = b"{\"i\":";
const TIME_OPEN: &[u8] = b",\"d\":\"";
const PAYLOAD_OPEN: &[u8] = b"\",\"m\":";
const LINE_CLOSE: &[u8] = b"}\n";

/// A single immutable record in a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Sequence number within the stream
    #[serde(rename = "i")]
    pub id: u64,

    /// Ingress timestamp
    #[serde(rename = "d")]
    pub creation_time: DateTime<Utc>,

    /// Payload
    #[serde(rename = "m")]
    pub payload: Payload,
}

impl Record {
    pub fn new(id: u64, creation_time: DateTime<Utc>, payload: Payload) -> Self {
        Self {
            id,
            creation_time,
            payload,
        }
    }

    /// Creation time as nanoseconds since the Unix epoch.
    ///
    /// Saturates outside the representable range (years 1677..2262).
    pub fn timestamp_nanos(&self) -> i64 {
        timestamp_nanos(&self.creation_time)
    }

    fn time_text(&self) -> String {
        self.creation_time.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    /// Length in bytes of [`Record::encode_line`]'s output, without encoding.
    pub fn encoded_len(&self) -> usize {
        LINE_OPEN.len()
            + self.id.checked_ilog10().map_or(1, |d| d as usize + 1)
            + TIME_OPEN.len()
            + self.time_text().len()
            + PAYLOAD_OPEN.len()
            + self.payload.len()
            + LINE_CLOSE.len()
    }

    /// Encode as a single LF-terminated JSON line.
    pub fn encode_line(&self) -> Result<Vec<u8>> {
        let mut line = Vec::with_capacity(self.payload.len() + 64);
        line.extend_from_slice(LINE_OPEN);
        line.extend_from_slice(self.id.to_string().as_bytes());
        line.extend_from_slice(TIME_OPEN);
        line.extend_from_slice(self.time_text().as_bytes());
        line.extend_from_slice(PAYLOAD_OPEN);
        line.extend_from_slice(self.payload.as_str().as_bytes());
        line.extend_from_slice(LINE_CLOSE);
        Ok(line)
    }

    /// Decode a line produced by [`Record::encode_line`]. A trailing LF is optional.
    pub fn decode_line(line: &[u8]) -> Result<Self> {
        let trimmed = match line.last() {
            Some(b'\n') => &line[..line.len() - 1],
            _ => line,
        };
        if trimmed.is_empty() {
            return Err(Error::InvalidArgument("empty record line".to_string()));
        }
        Ok(serde_json::from_slice(trimmed)?)
    }
}

/// Nanoseconds since epoch, saturating at the `i64` bounds.
pub fn timestamp_nanos(time: &DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt().unwrap_or(if time.timestamp() < 0 {
        i64::MIN
    } else {
        i64::MAX
    })
}

/// Inverse of [`timestamp_nanos`].
pub fn from_timestamp_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_nanos(nanos)
}
