//! Iterator Requests and Seek Policies
//!
//! An iterator request positions a cursor inside a stream. On the wire it is a
//! single JSON object:
//!
//! ```text
//! {
//!   "iteratorType": "AT_MESSAGE_ID",
//!   "messageId": 100,
//!   "jqFilter": ".level == \"warn\"",
//!   "name": "alerts"
//! }
//! ```
//!
//! Unknown fields are rejected. `messageId` is required for `AT_MESSAGE_ID`
//! and `AFTER_MESSAGE_ID`, `timestamp` (RFC3339, UTC `Z`) for `AT_TIMESTAMP`.
//!
//! ## Seek Policies
//!
//! | Policy | Position |
//! |--------|----------|
//! | `FIRST_MESSAGE` | first record |
//! | `LAST_MESSAGE` | last record |
//! | `AFTER_LAST_MESSAGE` | one past the last record |
//! | `AT_MESSAGE_ID(x)` | the record with id `x`, which must exist |
//! | `AFTER_MESSAGE_ID(x)` | smallest id greater than `x`, with `x <= last_id` |
//! | `AT_TIMESTAMP(t)` | smallest id whose creation time is `>= t` |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MAX_FILTER_LEN: usize = 512;
pub const MAX_NAME_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IteratorType {
    FirstMessage,
    LastMessage,
    AfterLastMessage,
    AtMessageId,
    AfterMessageId,
    AtTimestamp,
}

/// Resolved starting position of an iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPosition {
    First,
    Last,
    AfterLast,
    AtId(u64),
    AfterId(u64),
    AtTimestamp(DateTime<Utc>),
}

/// Iterator creation payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IteratorRequest {
    pub iterator_type: IteratorType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "rfc3339_utc")]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jq_filter: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl IteratorRequest {
    pub fn new(iterator_type: IteratorType) -> Self {
        Self {
            iterator_type,
            message_id: None,
            timestamp: None,
            jq_filter: None,
            name: None,
        }
    }

    pub fn first() -> Self {
        Self::new(IteratorType::FirstMessage)
    }

    pub fn last() -> Self {
        Self::new(IteratorType::LastMessage)
    }

    pub fn after_last() -> Self {
        Self::new(IteratorType::AfterLastMessage)
    }

    pub fn at_id(id: u64) -> Self {
        Self {
            message_id: Some(id),
            ..Self::new(IteratorType::AtMessageId)
        }
    }

    pub fn after_id(id: u64) -> Self {
        Self {
            message_id: Some(id),
            ..Self::new(IteratorType::AfterMessageId)
        }
    }

    pub fn at_timestamp(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..Self::new(IteratorType::AtTimestamp)
        }
    }

    pub fn with_filter(mut self, expression: impl Into<String>) -> Self {
        self.jq_filter = Some(expression.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Parse and validate a JSON request body.
    pub fn from_json(body: &str) -> Result<Self> {
        let request: Self = serde_json::from_str(body)
            .map_err(|e| Error::InvalidRequest(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    /// Check field presence and lengths for the chosen iterator type.
    pub fn validate(&self) -> Result<()> {
        match self.iterator_type {
            IteratorType::AtMessageId | IteratorType::AfterMessageId => {
                if self.message_id.is_none() {
                    return Err(Error::InvalidRequest(
                        "messageId is required for this iteratorType".to_string(),
                    ));
                }
            }
            IteratorType::AtTimestamp => {
                if self.timestamp.is_none() {
                    return Err(Error::InvalidRequest(
                        "timestamp is required for AT_TIMESTAMP".to_string(),
                    ));
                }
            }
            _ => {}
        }

        if let Some(filter) = &self.jq_filter {
            let len = filter.chars().count();
            if len == 0 || len > MAX_FILTER_LEN {
                return Err(Error::InvalidRequest(format!(
                    "jqFilter must be 1..={} characters",
                    MAX_FILTER_LEN
                )));
            }
        }

        if let Some(name) = &self.name {
            let len = name.chars().count();
            if len == 0 || len > MAX_NAME_LEN {
                return Err(Error::InvalidRequest(format!(
                    "name must be 1..={} characters",
                    MAX_NAME_LEN
                )));
            }
        }

        Ok(())
    }

    /// Resolve the request into a seek position.
    pub fn position(&self) -> Result<SeekPosition> {
        self.validate()?;
        let position = match self.iterator_type {
            IteratorType::FirstMessage => SeekPosition::First,
            IteratorType::LastMessage => SeekPosition::Last,
            IteratorType::AfterLastMessage => SeekPosition::AfterLast,
            IteratorType::AtMessageId => SeekPosition::AtId(self.message_id.unwrap_or_default()),
            IteratorType::AfterMessageId => {
                SeekPosition::AfterId(self.message_id.unwrap_or_default())
            }
            IteratorType::AtTimestamp => match self.timestamp {
                Some(t) => SeekPosition::AtTimestamp(t),
                None => {
                    return Err(Error::InvalidRequest(
                        "timestamp is required for AT_TIMESTAMP".to_string(),
                    ))
                }
            },
        };
        Ok(position)
    }
}

/// RFC3339 timestamps that must be expressed in UTC with a `Z` suffix.
mod rfc3339_utc {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(t) => serializer.serialize_str(&t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(s) => {
                if !s.ends_with('Z') {
                    return Err(D::Error::custom("timestamp must be RFC3339 UTC with 'Z' suffix"));
                }
                DateTime::parse_from_rfc3339(&s)
                    .map(|t| Some(t.with_timezone(&Utc)))
                    .map_err(D::Error::custom)
            }
        }
    }
}
