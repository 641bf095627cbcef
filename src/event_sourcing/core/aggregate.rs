use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use super::event::{Decoded, DomainEvent, EventEnvelope, EventMetadata, RawEvent};
use super::upcaster::UpcasterRegistry;

// ============================================================================
// Aggregate Root Pattern - Event Sourcing Core
// ============================================================================
//
// Key Principles:
// 1. State is derived from events (not stored directly, except as snapshots)
// 2. Commands are validated before emitting events
// 3. Events are applied immediately and buffered until the repository saves
// 4. `version` is the sequence number of the last *persisted* event applied
// 5. Applying events is CPU-only and never suspends
//
// ============================================================================

/// Generic Aggregate trait - all event-sourced aggregates implement this
///
/// `Default` is the zero state a brand-new aggregate starts from. Serde is
/// required so the state can be snapshotted.
pub trait Aggregate: Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const AGGREGATE_TYPE: &'static str;

    type Event: DomainEvent + Clone + std::fmt::Debug;
    type Command;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Apply an event to update state
    fn apply_event(&mut self, event: &Self::Event) -> Result<(), Self::Error>;

    /// Handle command and emit events (business logic)
    fn handle_command(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;
}

/// An event produced by a command that has not been persisted yet.
#[derive(Debug, Clone)]
pub struct PendingEvent<E> {
    pub event: E,
    pub metadata: EventMetadata,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("failed to decode {event_type} v{event_version} at sequence {sequence_number}: {source}")]
    Decode {
        event_type: String,
        event_version: i32,
        sequence_number: i64,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to apply {event_type} at sequence {sequence_number}: {message}")]
    Rejected {
        event_type: String,
        sequence_number: i64,
        message: String,
    },

    #[error("event for aggregate {found} cannot be applied to aggregate {expected}")]
    WrongAggregate { expected: Uuid, found: Uuid },

    #[error("out of order event: aggregate at version {version}, got sequence {sequence_number}")]
    OutOfOrder { version: i64, sequence_number: i64 },
}

/// In-memory reconstruction of one aggregate instance.
#[derive(Debug, Clone)]
pub struct AggregateRoot<A: Aggregate> {
    id: Uuid,
    version: i64,
    state: A,
    uncommitted: Vec<PendingEvent<A::Event>>,
    snapshot_sequence: i64,
    snapshot_taken_at: Option<DateTime<Utc>>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// Fresh aggregate in its zero state.
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            version: 0,
            state: A::default(),
            uncommitted: Vec::new(),
            snapshot_sequence: 0,
            snapshot_taken_at: None,
        }
    }

    pub fn from_snapshot(id: Uuid, state: A, last_event_sequence: i64, taken_at: DateTime<Utc>) -> Self {
        Self {
            id,
            version: last_event_sequence,
            state,
            uncommitted: Vec::new(),
            snapshot_sequence: last_event_sequence,
            snapshot_taken_at: Some(taken_at),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn aggregate_type(&self) -> &'static str {
        A::AGGREGATE_TYPE
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    pub fn uncommitted_events(&self) -> &[PendingEvent<A::Event>] {
        &self.uncommitted
    }

    pub fn has_uncommitted_events(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    pub fn snapshot_sequence(&self) -> i64 {
        self.snapshot_sequence
    }

    pub fn snapshot_taken_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot_taken_at
    }

    /// Handle a command: validate, apply resulting events, buffer them.
    ///
    /// All-or-nothing: if any produced event fails to apply, state is unchanged.
    pub fn execute(&mut self, command: &A::Command, metadata: &EventMetadata) -> Result<usize, A::Error> {
        let events = self.state.handle_command(command)?;

        let mut next = self.state.clone();
        for event in &events {
            next.apply_event(event)?;
        }
        self.state = next;

        let count = events.len();
        let now = Utc::now();
        self.uncommitted.extend(events.into_iter().map(|event| PendingEvent {
            event,
            metadata: metadata.clone(),
            timestamp: now,
        }));
        Ok(count)
    }

    /// Apply and buffer a single event produced outside `handle_command`.
    pub fn record(&mut self, event: A::Event, metadata: EventMetadata) -> Result<(), A::Error> {
        self.state.apply_event(&event)?;
        self.uncommitted.push(PendingEvent {
            event,
            metadata,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Apply a persisted event during load/replay.
    ///
    /// Returns `Ok(false)` when the event type is unknown to this aggregate;
    /// the version still advances so it matches the highest sequence seen.
    pub fn apply_stored(&mut self, raw: &RawEvent, upcasters: &UpcasterRegistry) -> Result<bool, ApplyError> {
        if raw.aggregate_id != self.id {
            return Err(ApplyError::WrongAggregate {
                expected: self.id,
                found: raw.aggregate_id,
            });
        }
        if raw.sequence_number <= self.version {
            return Err(ApplyError::OutOfOrder {
                version: self.version,
                sequence_number: raw.sequence_number,
            });
        }

        let decoded = raw.decode::<A::Event>(upcasters).map_err(|source| ApplyError::Decode {
            event_type: raw.event_type.clone(),
            event_version: raw.event_version,
            sequence_number: raw.sequence_number,
            source,
        })?;

        let applied = match decoded {
            Decoded::Known(event) => {
                self.state.apply_event(&event).map_err(|e| ApplyError::Rejected {
                    event_type: raw.event_type.clone(),
                    sequence_number: raw.sequence_number,
                    message: e.to_string(),
                })?;
                true
            }
            Decoded::Unrecognized { event_type, event_version } => {
                tracing::warn!(
                    aggregate_id = %self.id,
                    aggregate_type = A::AGGREGATE_TYPE,
                    event_type = %event_type,
                    event_version = event_version,
                    sequence_number = raw.sequence_number,
                    "Skipping unrecognized event type"
                );
                false
            }
        };

        self.version = raw.sequence_number;
        Ok(applied)
    }

    /// Encode the uncommitted buffer for append. Sequence numbers are left to the store.
    pub fn uncommitted_envelopes(&self) -> Result<Vec<RawEvent>, serde_json::Error> {
        self.uncommitted
            .iter()
            .map(|pending| {
                EventEnvelope::from_event(self.id, A::AGGREGATE_TYPE, pending.event.clone(), pending.metadata.clone())
                    .with_timestamp(pending.timestamp)
                    .encode()
            })
            .collect()
    }

    pub(crate) fn mark_committed(&mut self, new_version: i64) {
        self.uncommitted.clear();
        self.version = new_version;
    }

    pub(crate) fn mark_snapshotted(&mut self, last_event_sequence: i64, taken_at: DateTime<Utc>) {
        self.snapshot_sequence = last_event_sequence;
        self.snapshot_taken_at = Some(taken_at);
    }

    pub fn events_since_snapshot(&self) -> u64 {
        (self.version - self.snapshot_sequence).max(0) as u64
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    struct Counter {
        total: i64,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum CounterEvent {
        Added(i64),
    }

    #[derive(Debug, thiserror::Error)]
    #[error("counter would go negative")]
    struct Negative;

    impl DomainEvent for CounterEvent {
        fn event_type(&self) -> &'static str {
            "Added"
        }

        fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
            let CounterEvent::Added(n) = self;
            Ok(json!({ "n": n }))
        }

        fn from_payload(
            event_type: &str,
            _event_version: i32,
            payload: serde_json::Value,
        ) -> Result<Option<Self>, serde_json::Error> {
            #[derive(Deserialize)]
            struct Body {
                n: i64,
            }
            match event_type {
                "Added" => Ok(Some(CounterEvent::Added(serde_json::from_value::<Body>(payload)?.n))),
                _ => Ok(None),
            }
        }
    }

    impl Aggregate for Counter {
        const AGGREGATE_TYPE: &'static str = "Counter";
        type Event = CounterEvent;
        type Command = Vec<i64>;
        type Error = Negative;

        fn apply_event(&mut self, event: &Self::Event) -> Result<(), Self::Error> {
            let CounterEvent::Added(n) = event;
            if self.total + n < 0 {
                return Err(Negative);
            }
            self.total += n;
            Ok(())
        }

        fn handle_command(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
            Ok(command.iter().map(|n| CounterEvent::Added(*n)).collect())
        }
    }

    fn stored(id: Uuid, seq: i64, event_type: &str, data: serde_json::Value) -> RawEvent {
        let mut raw = EventEnvelope::new(id, "Counter", event_type, 1, data, EventMetadata::default());
        raw.sequence_number = seq;
        raw
    }

    #[test]
    fn test_execute_buffers_and_applies() {
        let mut root = AggregateRoot::<Counter>::new(Uuid::new_v4());
        let count = root.execute(&vec![2, 3], &EventMetadata::default()).unwrap();

        assert_eq!(count, 2);
        assert_eq!(root.state().total, 5);
        assert_eq!(root.version(), 0);
        assert_eq!(root.uncommitted_events().len(), 2);
    }

    #[test]
    fn test_execute_is_all_or_nothing() {
        let mut root = AggregateRoot::<Counter>::new(Uuid::new_v4());
        let result = root.execute(&vec![2, -5], &EventMetadata::default());

        assert!(result.is_err());
        assert_eq!(root.state().total, 0);
        assert!(!root.has_uncommitted_events());
    }

    #[test]
    fn test_apply_stored_advances_version_and_skips_unknown() {
        let id = Uuid::new_v4();
        let mut root = AggregateRoot::<Counter>::new(id);
        let upcasters = UpcasterRegistry::new();

        assert!(root.apply_stored(&stored(id, 1, "Added", json!({"n": 4})), &upcasters).unwrap());
        assert!(!root.apply_stored(&stored(id, 2, "Retired", json!({})), &upcasters).unwrap());

        assert_eq!(root.version(), 2);
        assert_eq!(root.state().total, 4);
    }

    #[test]
    fn test_apply_stored_rejects_regression_and_foreign_events() {
        let id = Uuid::new_v4();
        let mut root = AggregateRoot::<Counter>::new(id);
        let upcasters = UpcasterRegistry::new();
        root.apply_stored(&stored(id, 1, "Added", json!({"n": 1})), &upcasters).unwrap();

        let again = root.apply_stored(&stored(id, 1, "Added", json!({"n": 1})), &upcasters);
        assert!(matches!(again, Err(ApplyError::OutOfOrder { .. })));

        let foreign = root.apply_stored(&stored(Uuid::new_v4(), 2, "Added", json!({"n": 1})), &upcasters);
        assert!(matches!(foreign, Err(ApplyError::WrongAggregate { .. })));
    }

    #[test]
    fn test_uncommitted_envelopes_carry_metadata() {
        let id = Uuid::new_v4();
        let correlation_id = Uuid::new_v4();
        let mut root = AggregateRoot::<Counter>::new(id);
        root.execute(&vec![7], &EventMetadata::new(correlation_id, "test")).unwrap();

        let envelopes = root.uncommitted_envelopes().unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].aggregate_type, "Counter");
        assert_eq!(envelopes[0].event_data, json!({"n": 7}));
        assert_eq!(envelopes[0].metadata.correlation_id, correlation_id);

        root.mark_committed(1);
        assert_eq!(root.version(), 1);
        assert!(!root.has_uncommitted_events());
        assert_eq!(root.events_since_snapshot(), 1);
    }
}
