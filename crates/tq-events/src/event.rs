//! Telemetry event records and their persisted line format.
//!
//! One event persists as one tab-separated line:
//!
//! ```text
//! owner \t name \t timestamp (RFC 3339) \t dimensions (JSON) \t measurements (JSON)
//! ```
//!
//! JSON encoding escapes control characters inside strings, so neither field
//! separator can appear inside a field.

use std::str::FromStr;

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tq_common::{EventNaming, UserId};

/// Base type stamped on every uploaded in-game event.
pub const IN_GAME_BASE_TYPE: &str = "Microsoft.XboxLive.InGame";

/// Schema version of the rendered upload envelope.
const ENVELOPE_VERSION: &str = "2.1";

const FIELD_COUNT: usize = 5;

/// Years RFC 3339 can carry as four digits.
const TIMESTAMP_YEARS: std::ops::RangeInclusive<i32> = 0..=9999;

static EVENT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("event name pattern is valid"));

/// Errors constructing or parsing an [`EventRecord`].
#[derive(Error, Debug)]
pub enum EventParseError {
    #[error("expected 5 tab-separated fields, found {found}")]
    MissingFields { found: usize },

    #[error("event line is not valid UTF-8")]
    NotUtf8,

    #[error("invalid owner id {0:?}")]
    InvalidOwner(String),

    #[error("invalid event name {0:?}: must match [A-Za-z][A-Za-z0-9_]*")]
    InvalidName(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(#[from] chrono::ParseError),

    #[error("timestamp year {0} is outside 0000-9999")]
    TimestampOutOfRange(i32),

    #[error("invalid {field} JSON: {source}")]
    InvalidJson {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl From<EventParseError> for tq_common::Error {
    fn from(err: EventParseError) -> Self {
        tq_common::Error::InvalidEvent(err.to_string())
    }
}

/// One immutable telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    owner: UserId,
    name: String,
    dimensions: Value,
    measurements: Value,
    timestamp: DateTime<Utc>,
}

impl EventRecord {
    /// Create an event, validating its name and timestamp.
    pub fn new(
        owner: UserId,
        name: impl Into<String>,
        dimensions: Value,
        measurements: Value,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, EventParseError> {
        let name = name.into();
        if !EVENT_NAME.is_match(&name) {
            return Err(EventParseError::InvalidName(name));
        }
        if !TIMESTAMP_YEARS.contains(&timestamp.year()) {
            return Err(EventParseError::TimestampOutOfRange(timestamp.year()));
        }
        Ok(Self {
            owner,
            name,
            dimensions,
            measurements,
            timestamp,
        })
    }

    /// Create an event stamped with the current time.
    pub fn now(
        owner: UserId,
        name: impl Into<String>,
        dimensions: Value,
        measurements: Value,
    ) -> Result<Self, EventParseError> {
        Self::new(owner, name, dimensions, measurements, Utc::now())
    }

    /// Create an event from JSON text. Blank text means no data (`null`).
    pub fn from_json_text(
        owner: UserId,
        name: impl Into<String>,
        dimensions: &str,
        measurements: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, EventParseError> {
        let dimensions = parse_json_field("dimensions", dimensions)?;
        let measurements = parse_json_field("measurements", measurements)?;
        Self::new(owner, name, dimensions, measurements, timestamp)
    }

    pub fn owner(&self) -> UserId {
        self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimensions(&self) -> &Value {
        &self.dimensions
    }

    pub fn measurements(&self) -> &Value {
        &self.measurements
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// `prefix + title_id + "." + name`.
    pub fn full_name(&self, naming: &EventNaming) -> String {
        naming.full_name(&self.name)
    }

    /// Render the persisted line, without the trailing newline.
    pub fn serialize(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}",
            self.owner,
            self.name,
            self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            self.dimensions,
            self.measurements
        )
    }

    /// Parse a persisted line. A trailing `\n` or `\r\n` is ignored.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, EventParseError> {
        let line = std::str::from_utf8(bytes).map_err(|_| EventParseError::NotUtf8)?;
        line.parse()
    }

    /// The upload-service envelope for this event, one JSON object per line.
    pub fn render_upload_line(&self, naming: &EventNaming) -> Value {
        let time = self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
        json!({
            "ver": ENVELOPE_VERSION,
            "name": self.full_name(naming),
            "time": time,
            "iKey": naming.ikey(),
            "data": {
                "baseType": IN_GAME_BASE_TYPE,
                "baseData": {
                    "name": self.name,
                    "titleId": naming.title_id.to_string(),
                    "userId": self.owner.to_string(),
                    "ver": 1,
                    "properties": self.dimensions,
                    "measurements": self.measurements,
                }
            }
        })
    }
}

impl FromStr for EventRecord {
    type Err = EventParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end_matches(['\n', '\r']);
        let fields: Vec<&str> = line.splitn(FIELD_COUNT, '\t').collect();
        let &[owner, name, timestamp, dimensions, measurements] = fields.as_slice() else {
            return Err(EventParseError::MissingFields {
                found: fields.len(),
            });
        };

        let owner = owner
            .parse::<UserId>()
            .map_err(|_| EventParseError::InvalidOwner(owner.to_string()))?;
        let timestamp = DateTime::parse_from_rfc3339(timestamp)?.with_timezone(&Utc);
        let dimensions = serde_json::from_str(dimensions).map_err(|source| {
            EventParseError::InvalidJson {
                field: "dimensions",
                source,
            }
        })?;
        let measurements = serde_json::from_str(measurements).map_err(|source| {
            EventParseError::InvalidJson {
                field: "measurements",
                source,
            }
        })?;

        Self::new(owner, name, dimensions, measurements, timestamp)
    }
}

fn parse_json_field(field: &'static str, text: &str) -> Result<Value, EventParseError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(|source| EventParseError::InvalidJson { field, source })
}
