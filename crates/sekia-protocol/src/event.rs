// SPDX-License-Identifier: MIT OR Apache-2.0
//! The [`Event`] record: an unsigned broadcast fact published on the bus.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unordered mapping from string keys to JSON values, used for event and
/// command payloads.
pub type Payload = BTreeMap<String, serde_json::Value>;

/// A fact broadcast on the bus.
///
/// Immutable once published; `id` uniquely identifies this emission
/// attempt (it is not a correlation id across retries).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Event {
    /// Unique identifier for this emission (random 128 bits, hex).
    pub id: String,

    /// Dotted lowercase event type, e.g. `"gmail.message.received"`.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Origin identifier: `agent:<name>` or `workflow:<name>`.
    pub source: String,

    /// UTC instant the event was created.
    pub timestamp: DateTime<Utc>,

    /// Event-specific data.
    pub payload: Payload,

    /// Unrecognized top-level fields, preserved verbatim for forwarding.
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Event {
    /// Construct a new event with a freshly generated id and the current
    /// time as its timestamp.
    #[must_use]
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: new_event_id(),
            event_type: event_type.into(),
            source: source.into(),
            timestamp: Utc::now(),
            payload,
            extra: BTreeMap::new(),
        }
    }

    /// Source identifier for an event published by workflow `name`.
    #[must_use]
    pub fn workflow_source(name: &str) -> String {
        format!("workflow:{name}")
    }

    /// Source identifier for an event published by agent `name`.
    #[must_use]
    pub fn agent_source(name: &str) -> String {
        format!("agent:{name}")
    }
}

/// Generate a random 128-bit identifier as lowercase hex, suitable for
/// [`Event::id`] or a [`crate::Command`] nonce.
#[must_use]
pub fn new_event_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_through_json() {
        let mut payload = Payload::new();
        payload.insert("from".into(), json!("alice@example.com"));
        let event = Event::new(
            "gmail.message.received",
            Event::agent_source("gmail"),
            payload,
        );
        let wire = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn unknown_fields_are_preserved() {
        let wire = serde_json::json!({
            "id": "abc",
            "type": "gmail.message.received",
            "source": "agent:gmail",
            "timestamp": "2026-01-01T00:00:00Z",
            "payload": {},
            "trace_id": "xyz",
        });
        let event: Event = serde_json::from_value(wire).unwrap();
        assert_eq!(
            event.extra.get("trace_id"),
            Some(&serde_json::json!("xyz"))
        );
        let back = serde_json::to_value(&event).unwrap();
        assert_eq!(back["trace_id"], serde_json::json!("xyz"));
    }

    #[test]
    fn ids_are_unique() {
        let a = new_event_id();
        let b = new_event_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32); // 128 bits as hex
    }
}
