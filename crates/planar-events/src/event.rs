//! The event type carried on the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(Ulid);

impl EventId {
    /// Create a new random event ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Get the inner ULID.
    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event emitted by an actor.
///
/// `event_type` is a dotted name (`plate.step_completed`); `source` is
/// the emitting actor's id; `payload` is an arbitrary JSON object so the
/// bus stays agnostic of every subsystem's vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub event_type: String,
    pub source: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            source: source.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// A string field of the payload, when present.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// A numeric field of the payload, when present.
    pub fn payload_u64(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(Value::as_u64)
    }

    /// Flattened JSON form for transport to external observers.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "event_id": self.event_id.to_string(),
            "event_type": self.event_type,
            "source": self.source,
            "timestamp": self.timestamp.to_rfc3339(),
            "payload": self.payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_accessors() {
        let event = Event::new(
            "plate.mover_assigned",
            "plate-P1",
            json!({ "plate_id": "P1", "mover_id": 2 }),
        );
        assert_eq!(event.payload_str("plate_id"), Some("P1"));
        assert_eq!(event.payload_u64("mover_id"), Some(2));
        assert_eq!(event.payload_str("missing"), None);
    }

    #[test]
    fn json_form_carries_identity() {
        let event = Event::new("mover.released", "mover-1", json!({}));
        let value = event.to_json();
        assert_eq!(value["event_type"], "mover.released");
        assert_eq!(value["source"], "mover-1");
        assert_eq!(value["event_id"], event.event_id.to_string());
    }
}
