//! Domain event envelope.
//!
//! Every fact exchanged between HRIS and its sibling services travels as a
//! [`DomainEvent`]. The envelope is generic: it carries an entity noun, an
//! action verb, a type-erased id and an opaque JSON payload.
//!
//! ## Wire format
//!
//! ```json
//! {
//!   "entity_type": "employee",
//!   "event_type": "created",
//!   "entity_id": 42,
//!   "data": { "name": "Ada" },
//!   "timestamp": "2024-05-01T12:00:00+00:00",
//!   "source": "hris",
//!   "correlation_id": "6f1c...",
//!   "version": 1
//! }
//! ```
//!
//! The format is not symmetric. Outbound messages always carry the split
//! `entity_type` / `event_type` fields and the origin under `source`. Inbound
//! parsing also accepts producers that send a combined `"entity.action"`
//! string in `event_type` with no `entity_type`, and the legacy
//! `source_service` key for the origin.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Origin recorded when an inbound message names no source.
pub const UNKNOWN_SOURCE: &str = "unknown";

/// Schema version stamped on events that don't specify one.
pub const DEFAULT_VERSION: u32 = 1;

/// Errors raised while decoding an event from the wire.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid event envelope: {0}")]
    Envelope(String),

    #[error("Invalid timestamp '{value}': {message}")]
    Timestamp { value: String, message: String },
}

/// Primary key of the entity an event is about.
///
/// Producers and consumers don't agree on id representation (SSO uses
/// strings, HRIS uses integers), so the envelope keeps whichever was sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Int(i64),
    Str(String),
}

impl EntityId {
    /// Integer view of the id, parsing string ids when they hold a number.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            EntityId::Int(id) => Some(*id),
            EntityId::Str(s) => s.parse().ok(),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Int(id) => write!(f, "{}", id),
            EntityId::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        EntityId::Int(id)
    }
}

impl From<i32> for EntityId {
    fn from(id: i32) -> Self {
        EntityId::Int(id.into())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        EntityId::Str(id)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        EntityId::Str(id.to_string())
    }
}

impl From<uuid::Uuid> for EntityId {
    fn from(id: uuid::Uuid) -> Self {
        EntityId::Str(id.to_string())
    }
}

/// Canonical envelope for cross-service facts.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    /// Domain noun, e.g. "user" or "employee".
    pub entity_type: String,
    /// Verb, e.g. "created", "updated", "deleted".
    pub event_action: String,
    pub entity_id: EntityId,
    /// Consumer-defined payload.
    pub data: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    /// Producing service. Consumers compare it with their own name to skip
    /// events they published themselves.
    pub source_service: String,
    /// Tracing id. Not used for deduplication.
    pub correlation_id: String,
    pub version: u32,
}

impl DomainEvent {
    /// Create an event stamped with the current time, a fresh correlation id
    /// and schema version 1.
    pub fn new(
        entity_type: impl Into<String>,
        event_action: impl Into<String>,
        entity_id: impl Into<EntityId>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            event_action: event_action.into(),
            entity_id: entity_id.into(),
            data: Map::new(),
            timestamp: Utc::now(),
            source_service: String::new(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            version: DEFAULT_VERSION,
        }
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    /// Replace the payload with any serializable value.
    ///
    /// Values that don't serialize to a JSON object leave the payload empty.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Self {
        self.data = match serde_json::to_value(payload) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        self
    }

    pub fn with_source(mut self, source_service: impl Into<String>) -> Self {
        self.source_service = source_service.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Routing key used both for publishing and for handler lookup.
    ///
    /// No escaping is applied: an entity type or action containing `.` yields
    /// an ambiguous key.
    pub fn routing_key(&self) -> String {
        routing_key(&self.entity_type, &self.event_action)
    }

    /// Deserialize the payload into a handler-specific shape.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.data.clone()))
    }

    /// Build an event from a decoded wire message.
    pub fn from_value(value: &Value) -> Result<Self, EventError> {
        let wire = WireEventIn::deserialize(value)?;
        wire.into_event()
    }

    /// Decode an event from a raw JSON message body.
    pub fn from_slice(body: &[u8]) -> Result<Self, EventError> {
        let value: Value = serde_json::from_slice(body)?;
        Self::from_value(&value)
    }

    /// Wire representation of the event.
    pub fn to_value(&self) -> Value {
        let wire = WireEventOut {
            entity_type: &self.entity_type,
            event_type: &self.event_action,
            entity_id: &self.entity_id,
            data: &self.data,
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, false),
            source: &self.source_service,
            correlation_id: &self.correlation_id,
            version: self.version,
        };
        // Serializing borrowed strings and maps into a Value cannot fail.
        serde_json::to_value(wire).unwrap_or(Value::Null)
    }

    /// Wire representation as JSON bytes.
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_value())
    }
}

/// Derive the routing key for an entity/action pair.
pub fn routing_key(entity_type: &str, event_action: &str) -> String {
    format!("{}.{}", entity_type, event_action)
}

#[derive(Serialize)]
struct WireEventOut<'a> {
    entity_type: &'a str,
    event_type: &'a str,
    entity_id: &'a EntityId,
    data: &'a Map<String, Value>,
    timestamp: String,
    source: &'a str,
    correlation_id: &'a str,
    version: u32,
}

#[derive(Deserialize)]
struct WireEventIn {
    #[serde(default)]
    entity_type: Option<String>,
    event_type: String,
    entity_id: EntityId,
    #[serde(default)]
    data: Option<Map<String, Value>>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    source_service: Option<String>,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    version: Option<u32>,
}

impl WireEventIn {
    fn into_event(self) -> Result<DomainEvent, EventError> {
        let (entity_type, event_action) = match self.entity_type {
            Some(entity_type) => (entity_type, self.event_type),
            None => match self.event_type.split_once('.') {
                Some((entity, action)) => (entity.to_string(), action.to_string()),
                None => {
                    return Err(EventError::Envelope(format!(
                        "missing entity_type and event_type '{}' is not of the form entity.action",
                        self.event_type
                    )))
                }
            },
        };

        let timestamp = match self.timestamp {
            Some(raw) => parse_timestamp(&raw)?,
            None => Utc::now(),
        };

        Ok(DomainEvent {
            entity_type,
            event_action,
            entity_id: self.entity_id,
            data: self.data.unwrap_or_default(),
            timestamp,
            source_service: self
                .source
                .or(self.source_service)
                .unwrap_or_else(|| UNKNOWN_SOURCE.to_string()),
            correlation_id: self.correlation_id.unwrap_or_default(),
            version: self.version.unwrap_or(DEFAULT_VERSION),
        })
    }
}

/// Parse an ISO-8601 timestamp. Values without an offset are taken as UTC.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, EventError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    // Python's `str(datetime)` uses a space instead of `T`.
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|e| EventError::Timestamp {
            value: raw.to_string(),
            message: e.to_string(),
        })
}
