//! Event types for the in-process bus

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Where an event entered this process
///
/// `Broker` marks events the bridge reconstructed from a broker delivery.
/// The bridge's local-to-broker leg checks this tag once and skips such
/// events, which prevents publish/consume feedback loops.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventOrigin {
    Local,
    Broker,
}

/// A domain event on the in-process bus
///
/// Events are identified by a dotted name (`transaction.created`,
/// `stock.level_changed`) and carry their fields as a JSON object. Date
/// fields are represented as ISO-8601 strings; building an event through
/// [`LocalEvent::from_serializable`] gets that for free because `chrono`
/// types serialize to RFC 3339.
#[derive(Clone, Debug)]
pub struct LocalEvent {
    pub name: String,
    pub payload: Map<String, Value>,
    pub origin: EventOrigin,
    pub occurred_at: DateTime<Utc>,
}

impl LocalEvent {
    pub fn new(name: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            payload,
            origin: EventOrigin::Local,
            occurred_at: Utc::now(),
        }
    }

    /// Build an event from any serializable value
    ///
    /// The value must serialize to a JSON object; anything else yields an
    /// event with an empty payload and a warning, since a payload object is
    /// required on the wire.
    pub fn from_serializable<T: Serialize>(name: impl Into<String>, fields: &T) -> Self {
        let name = name.into();
        let payload = match serde_json::to_value(fields) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                log::warn!(
                    "Event '{}' fields serialized to non-object JSON ({}), publishing empty payload",
                    name,
                    json_type_name(&other)
                );
                Map::new()
            }
            Err(e) => {
                log::warn!("Failed to serialize fields for event '{}': {}", name, e);
                Map::new()
            }
        };
        Self::new(name, payload)
    }

    pub(crate) fn with_origin(mut self, origin: EventOrigin) -> Self {
        self.origin = origin;
        self
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Subscription filter for bus subscribers
#[derive(Clone, Debug)]
pub enum EventFilter {
    /// Receive every event (used by the bridge's forwarding leg)
    All,
    /// Receive only events whose name is in the list
    Named(Vec<String>),
}

impl EventFilter {
    pub fn accepts(&self, event: &LocalEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Named(names) => names.iter().any(|n| n == &event.name),
        }
    }
}
