use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::upcaster::UpcasterRegistry;

// ============================================================================
// Event Envelope - Immutable Domain Event Record
// ============================================================================
//
// Wraps a domain event payload with identity, ordering and tracing metadata.
// The stored form is `RawEvent` (payload kept as JSON); typed envelopes are
// produced by decoding through the upcaster registry.
//
// ============================================================================

/// Who/what caused an event, for tracing across aggregates.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct EventMetadata {
    pub user_id: Option<Uuid>,
    pub correlation_id: Uuid,
    pub causation_id: Option<Uuid>,
    pub source: String,
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl EventMetadata {
    pub fn new(correlation_id: Uuid, source: impl Into<String>) -> Self {
        Self {
            user_id: None,
            correlation_id,
            causation_id: None,
            source: source.into(),
            extra: HashMap::new(),
        }
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_causation(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Generic Event Envelope - wraps any domain event payload with metadata
///
/// `sequence_number` is 0 until the event log assigns it during append.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EventEnvelope<E> {
    // Event Identity
    pub event_id: Uuid,
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub sequence_number: i64,

    // Event Type Information
    pub event_type: String,
    pub event_version: i32,

    // Event Payload
    pub event_data: E,

    pub metadata: EventMetadata,

    // Set by the writer, never by the store
    pub timestamp: DateTime<Utc>,
}

/// Stored representation: payload kept as opaque JSON.
pub type RawEvent = EventEnvelope<serde_json::Value>;

impl<E> EventEnvelope<E> {
    pub fn new(
        aggregate_id: Uuid,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        event_version: i32,
        event_data: E,
        metadata: EventMetadata,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            sequence_number: 0,
            event_type: event_type.into(),
            event_version,
            event_data,
            metadata,
            timestamp: Utc::now(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Replace the payload, keeping every other field.
    pub fn map_data<F, T>(self, f: F) -> EventEnvelope<T>
    where
        F: FnOnce(E) -> T,
    {
        EventEnvelope {
            event_id: self.event_id,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            sequence_number: self.sequence_number,
            event_type: self.event_type,
            event_version: self.event_version,
            event_data: f(self.event_data),
            metadata: self.metadata,
            timestamp: self.timestamp,
        }
    }
}

impl<E: DomainEvent> EventEnvelope<E> {
    /// Build an envelope whose type/version come from the event itself.
    pub fn from_event(
        aggregate_id: Uuid,
        aggregate_type: impl Into<String>,
        event: E,
        metadata: EventMetadata,
    ) -> Self {
        let event_type = event.event_type();
        let event_version = event.event_version();
        Self::new(aggregate_id, aggregate_type, event_type, event_version, event, metadata)
    }

    pub fn encode(&self) -> Result<RawEvent, serde_json::Error> {
        let data = self.event_data.to_payload()?;
        Ok(EventEnvelope {
            event_id: self.event_id,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type.clone(),
            sequence_number: self.sequence_number,
            event_type: self.event_type.clone(),
            event_version: self.event_version,
            event_data: data,
            metadata: self.metadata.clone(),
            timestamp: self.timestamp,
        })
    }
}

impl RawEvent {
    /// Same event with its payload migrated to the newest registered version.
    pub fn upcast(&self, upcasters: &UpcasterRegistry) -> RawEvent {
        let (version, payload) = upcasters.upcast(&self.event_type, self.event_version, self.event_data.clone());
        let mut upcasted = self.clone();
        upcasted.event_version = version;
        upcasted.event_data = payload;
        upcasted
    }

    /// Upcast to the newest known payload version, then decode.
    pub fn decode<E: DomainEvent>(
        &self,
        upcasters: &UpcasterRegistry,
    ) -> Result<Decoded<E>, serde_json::Error> {
        let (version, payload) = upcasters.upcast(&self.event_type, self.event_version, self.event_data.clone());
        match E::from_payload(&self.event_type, version, payload)? {
            Some(event) => Ok(Decoded::Known(event)),
            None => Ok(Decoded::Unrecognized {
                event_type: self.event_type.clone(),
                event_version: version,
            }),
        }
    }
}

/// Result of decoding a stored payload into a typed event.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<E> {
    Known(E),
    /// Event type no longer (or not yet) understood by this code.
    Unrecognized { event_type: String, event_version: i32 },
}

// ============================================================================
// Domain Event Trait
// ============================================================================

/// Typed payload union keyed by `event_type` + `event_version`.
pub trait DomainEvent: Sized + Send + Sync {
    fn event_type(&self) -> &'static str;

    fn event_version(&self) -> i32 {
        1
    }

    fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error>;

    /// Returns `Ok(None)` for an event type this enum does not know.
    fn from_payload(
        event_type: &str,
        event_version: i32,
        payload: serde_json::Value,
    ) -> Result<Option<Self>, serde_json::Error>;
}

// ============================================================================
// Event Serialization Helpers
// ============================================================================

pub fn serialize_event<E: Serialize>(event: &E) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

pub fn deserialize_event<E: for<'de> Deserialize<'de>>(json: &str) -> Result<E, serde_json::Error> {
    serde_json::from_str(json)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct Renamed {
        name: String,
    }

    #[derive(Clone, Debug, PartialEq)]
    enum TestEvent {
        Renamed(Renamed),
    }

    impl DomainEvent for TestEvent {
        fn event_type(&self) -> &'static str {
            "Renamed"
        }

        fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
            match self {
                TestEvent::Renamed(e) => serde_json::to_value(e),
            }
        }

        fn from_payload(
            event_type: &str,
            _event_version: i32,
            payload: serde_json::Value,
        ) -> Result<Option<Self>, serde_json::Error> {
            match event_type {
                "Renamed" => Ok(Some(TestEvent::Renamed(serde_json::from_value(payload)?))),
                _ => Ok(None),
            }
        }
    }

    #[test]
    fn test_event_envelope_creation() {
        let aggregate_id = Uuid::new_v4();
        let correlation_id = Uuid::new_v4();

        let envelope = EventEnvelope::from_event(
            aggregate_id,
            "Thing",
            TestEvent::Renamed(Renamed { name: "a".into() }),
            EventMetadata::new(correlation_id, "test"),
        );

        assert_eq!(envelope.aggregate_id, aggregate_id);
        assert_eq!(envelope.sequence_number, 0);
        assert_eq!(envelope.event_type, "Renamed");
        assert_eq!(envelope.event_version, 1);
        assert_eq!(envelope.metadata.correlation_id, correlation_id);
    }

    #[test]
    fn test_encode_then_decode_known_event() {
        let envelope = EventEnvelope::from_event(
            Uuid::new_v4(),
            "Thing",
            TestEvent::Renamed(Renamed { name: "b".into() }),
            EventMetadata::default(),
        );

        let raw = envelope.encode().unwrap();
        assert_eq!(raw.event_data, json!({"name": "b"}));

        let decoded: Decoded<TestEvent> = raw.decode(&UpcasterRegistry::new()).unwrap();
        assert_eq!(decoded, Decoded::Known(TestEvent::Renamed(Renamed { name: "b".into() })));
    }

    #[test]
    fn test_unknown_event_type_is_unrecognized_not_error() {
        let raw: RawEvent = EventEnvelope::new(
            Uuid::new_v4(),
            "Thing",
            "LegacyThingArchived",
            3,
            json!({}),
            EventMetadata::default(),
        );

        let decoded: Decoded<TestEvent> = raw.decode(&UpcasterRegistry::new()).unwrap();
        assert_eq!(
            decoded,
            Decoded::Unrecognized {
                event_type: "LegacyThingArchived".into(),
                event_version: 3
            }
        );
    }

    #[test]
    fn test_metadata_builders() {
        let user = Uuid::new_v4();
        let cause = Uuid::new_v4();
        let metadata = EventMetadata::new(Uuid::new_v4(), "api")
            .with_user(user)
            .with_causation(cause)
            .with_extra("tenant", "eu-1");

        assert_eq!(metadata.user_id, Some(user));
        assert_eq!(metadata.causation_id, Some(cause));
        assert_eq!(metadata.extra.get("tenant").map(String::as_str), Some("eu-1"));
    }
}
