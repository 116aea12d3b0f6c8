//! Event types flowing through the kernel.
//!
//! Two shapes exist:
//!
//! - [`Event`]: the generic, routable envelope the event bus delivers. Its
//!   `event_type` is the routing key and `id` its identity.
//! - [`DomainEvent`]: a versioned fact raised by an aggregate. Domain events are
//!   buffered, adapted into [`Event`]s and delivered through the bus.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use wiz_kernel_core::event::{DomainEvent, Event};
//!
//! let domain = DomainEvent::new("agent.created", "agent-1", 1, json!({ "name": "Ada" }));
//! let event = Event::from(&domain);
//!
//! assert_eq!(event.event_type, "agent.created");
//! assert_eq!(event.correlation_id.as_deref(), Some("agent-1"));
//! assert_eq!(event.data["name"], "Ada");
//! assert_eq!(event.data["version"], 1);
//! ```

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Generate an identifier of the form `{unix_millis}-{random}`.
#[must_use]
pub fn generate_event_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect();
    format!("{}-{suffix}", Utc::now().timestamp_millis())
}

/// A generic event delivered by the event bus.
///
/// Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique identity.
    pub id: String,
    /// Routing key.
    #[serde(rename = "type")]
    pub event_type: String,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Optional correlation id linking related events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Free-form payload.
    pub data: Value,
}

impl Event {
    /// Create an event with a generated id and the current time.
    #[must_use]
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: generate_event_id(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            correlation_id: None,
            data,
        }
    }

    /// Replace the generated id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Replace the timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A versioned fact raised by an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    /// Unique identity, `{unix_millis}-{random}`.
    pub event_id: String,
    /// Event name, used as the routing key once adapted.
    pub event_name: String,
    /// When the fact occurred.
    pub occurred_on: DateTime<Utc>,
    /// Per-aggregate version.
    pub version: u64,
    /// The aggregate that raised the event.
    pub aggregate_id: String,
    /// Event payload.
    pub data: Value,
}

impl DomainEvent {
    /// Create a domain event occurring now.
    #[must_use]
    pub fn new(
        event_name: impl Into<String>,
        aggregate_id: impl Into<String>,
        version: u64,
        data: Value,
    ) -> Self {
        Self {
            event_id: generate_event_id(),
            event_name: event_name.into(),
            occurred_on: Utc::now(),
            version,
            aggregate_id: aggregate_id.into(),
            data,
        }
    }

    /// Replace the occurrence time.
    #[must_use]
    pub const fn occurred_at(mut self, occurred_on: DateTime<Utc>) -> Self {
        self.occurred_on = occurred_on;
        self
    }

    /// Rebuild a domain event from a generic event produced by [`Event::from`].
    ///
    /// Returns `None` when the event lacks the domain metadata fields.
    #[must_use]
    pub fn from_event(event: &Event) -> Option<Self> {
        let object = event.data.as_object()?;
        let event_id = object.get("eventId")?.as_str()?.to_owned();
        let aggregate_id = object.get("aggregateId")?.as_str()?.to_owned();
        let version = object.get("version")?.as_u64()?;

        let mut data = object.clone();
        data.remove("eventId");
        data.remove("aggregateId");
        data.remove("version");

        Some(Self {
            event_id,
            event_name: event.event_type.clone(),
            occurred_on: event.timestamp,
            version,
            aggregate_id,
            data: Value::Object(data),
        })
    }
}

impl From<&DomainEvent> for Event {
    /// Adapt a domain event onto the generic event envelope.
    ///
    /// Object payload fields are flattened into `data` alongside `eventId`,
    /// `aggregateId` and `version`; a non-object payload is kept under `payload`.
    fn from(domain: &DomainEvent) -> Self {
        let mut data = match &domain.data {
            Value::Object(fields) => fields.clone(),
            Value::Null => Map::new(),
            other => {
                let mut fields = Map::new();
                fields.insert("payload".to_owned(), other.clone());
                fields
            }
        };
        data.insert("eventId".to_owned(), Value::from(domain.event_id.clone()));
        data.insert(
            "aggregateId".to_owned(),
            Value::from(domain.aggregate_id.clone()),
        );
        data.insert("version".to_owned(), Value::from(domain.version));

        Self {
            id: domain.event_id.clone(),
            event_type: domain.event_name.clone(),
            timestamp: domain.occurred_on,
            correlation_id: Some(domain.aggregate_id.clone()),
            data: Value::Object(data),
        }
    }
}

/// Per-call buffer of domain events raised while a command executes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainEvents {
    events: Vec<DomainEvent>,
}

impl DomainEvents {
    /// Create an empty buffer.
    #[must_use]
    pub const fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Queue an event.
    pub fn add(&mut self, event: DomainEvent) {
        self.events.push(event);
    }

    /// Events queued so far.
    #[must_use]
    pub fn events(&self) -> &[DomainEvent] {
        &self.events
    }

    /// Drop every queued event.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Number of queued events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Take the queued events, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generated_ids_have_timestamp_prefix() {
        let id = generate_event_id();
        let (millis, suffix) = id.split_once('-').unwrap_or(("", ""));
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 9);
        assert_ne!(generate_event_id(), id);
    }

    #[test]
    fn domain_event_adapts_to_generic_event() {
        let domain = DomainEvent::new("agent.created", "agent-7", 3, json!({ "name": "Ada" }));
        let event = Event::from(&domain);

        assert_eq!(event.id, domain.event_id);
        assert_eq!(event.event_type, "agent.created");
        assert_eq!(event.timestamp, domain.occurred_on);
        assert_eq!(event.correlation_id.as_deref(), Some("agent-7"));
        assert_eq!(event.data["name"], "Ada");
        assert_eq!(event.data["eventId"], domain.event_id.as_str());
        assert_eq!(event.data["aggregateId"], "agent-7");
        assert_eq!(event.data["version"], 3);
    }

    #[test]
    fn scalar_payload_is_kept_under_payload_key() {
        let domain = DomainEvent::new("counter.bumped", "c-1", 1, json!(42));
        let event = Event::from(&domain);
        assert_eq!(event.data["payload"], 42);
    }

    #[test]
    fn adapted_event_converts_back() {
        let domain = DomainEvent::new("agent.renamed", "agent-2", 5, json!({ "to": "Bob" }));
        let back = DomainEvent::from_event(&Event::from(&domain));
        assert_eq!(back, Some(domain));
    }

    #[test]
    fn plain_event_is_not_a_domain_event() {
        let event = Event::new("user.created", json!({ "id": 1 }));
        assert!(DomainEvent::from_event(&event).is_none());
    }

    #[test]
    fn event_serializes_type_field() {
        let event = Event::new("user.created", json!({})).with_id("e1");
        let value = serde_json::to_value(&event).unwrap_or_default();
        assert_eq!(value["type"], "user.created");
        assert_eq!(value["id"], "e1");
        assert!(value.get("correlationId").is_none());
    }

    #[test]
    fn domain_event_buffer_takes_and_clears() {
        let mut buffer = DomainEvents::new();
        buffer.add(DomainEvent::new("a", "x", 1, Value::Null));
        buffer.add(DomainEvent::new("b", "x", 2, Value::Null));
        assert_eq!(buffer.len(), 2);

        let taken = buffer.take();
        assert_eq!(taken.len(), 2);
        assert!(buffer.is_empty());

        buffer.add(DomainEvent::new("c", "x", 3, Value::Null));
        buffer.clear();
        assert!(buffer.events().is_empty());
    }
}
