//! # Event Envelope
//!
//! Wire envelope for every event published to the topic exchange.
//!
//! ## Envelope Fields
//!
//! - `event_name`: Dot-delimited topic, also used verbatim as the routing key
//! - `event_id`: Fresh UUID v4 per envelope
//! - `event_timestamp`: UTC creation time, second precision, literal `Z` suffix
//! - `source`: Tag of the producing system
//! - `payload`: Opaque JSON object
//!
//! The body carries exactly these five top-level fields.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DispatchError;

/// Event payload: JSON object with string keys
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Top-level keys of an envelope body, in wire order
pub const ENVELOPE_FIELDS: [&str; 5] = [
    "event_name",
    "event_id",
    "event_timestamp",
    "source",
    "payload",
];

/// Timestamp format on the wire (`2024-05-01T12:00:00Z`)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Envelope-wrapped event, built right before publish and dropped after
///
/// # Examples
///
/// ```rust
/// use event_dispatch::EventEnvelope;
/// use serde_json::json;
///
/// let payload = json!({"sample_id": 1, "creator_id": 2})
///     .as_object()
///     .cloned()
///     .unwrap();
///
/// let envelope = EventEnvelope::new("sample.lifecycle.created", "event_sim", payload).unwrap();
/// assert_eq!(envelope.routing_key(), "sample.lifecycle.created");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventEnvelope {
    /// Hierarchical event name (routing key)
    pub event_name: String,

    /// Unique event identifier
    pub event_id: Uuid,

    /// Creation time, truncated to whole seconds
    #[serde(with = "wire_timestamp")]
    pub event_timestamp: DateTime<Utc>,

    /// Producing system
    pub source: String,

    /// Event-specific data
    pub payload: Payload,
}

impl EventEnvelope {
    /// Create a new envelope stamped with the current time
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::InvalidEventName` if `event_name` is empty.
    pub fn new(
        event_name: impl Into<String>,
        source: impl Into<String>,
        payload: Payload,
    ) -> Result<Self, DispatchError> {
        Self::stamped(event_name, source, payload, Utc::now())
    }

    /// Create an envelope with an explicit creation time
    ///
    /// Sub-second precision is dropped so the in-memory value matches the wire.
    pub fn stamped(
        event_name: impl Into<String>,
        source: impl Into<String>,
        payload: Payload,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, DispatchError> {
        let event_name = event_name.into();
        if event_name.is_empty() {
            return Err(DispatchError::InvalidEventName);
        }

        Ok(Self {
            event_name,
            event_id: Uuid::new_v4(),
            event_timestamp: timestamp.trunc_subsecs(0),
            source: source.into(),
            payload,
        })
    }

    /// Routing key for this envelope (the event name, untouched)
    pub fn routing_key(&self) -> &str {
        &self.event_name
    }

    /// Canonical JSON encoding
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, DispatchError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a body produced by [`EventEnvelope::to_json_bytes`]
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

mod wire_timestamp {
    use super::TIMESTAMP_FORMAT;
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&ts.format(TIMESTAMP_FORMAT))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

/// Validate a decoded envelope body
///
/// # Validation Rules
///
/// - `event_name`: Non-empty string
/// - `event_id`: String parsing as a UUID
/// - `event_timestamp`: String in `YYYY-MM-DDTHH:MM:SSZ` form
/// - `source`: Non-empty string
/// - `payload`: JSON object
/// - No other top-level keys
///
/// # Errors
///
/// Returns a descriptive error string if validation fails
pub fn validate_envelope_fields(envelope: &serde_json::Value) -> Result<(), String> {
    let fields = envelope.as_object().ok_or("Envelope must be a JSON object")?;
    if let Some(extra) = fields
        .keys()
        .find(|key| !ENVELOPE_FIELDS.contains(&key.as_str()))
    {
        return Err(format!("Unexpected envelope field: {extra}"));
    }

    let event_name = envelope
        .get("event_name")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid event_name")?;

    if event_name.is_empty() {
        return Err("event_name cannot be empty".to_string());
    }

    let event_id = envelope
        .get("event_id")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid event_id")?;

    Uuid::parse_str(event_id).map_err(|e| format!("event_id is not a UUID: {e}"))?;

    let timestamp = envelope
        .get("event_timestamp")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid event_timestamp")?;

    chrono::NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
        .map_err(|e| format!("event_timestamp is not YYYY-MM-DDTHH:MM:SSZ: {e}"))?;

    let source = envelope
        .get("source")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid source")?;

    if source.is_empty() {
        return Err("source cannot be empty".to_string());
    }

    envelope
        .get("payload")
        .and_then(|v| v.as_object())
        .ok_or("Missing or invalid payload")?;

    Ok(())
}
