use chrono::{DateTime, Utc};
use std::marker::PhantomData;
use uuid::Uuid;

use crate::event_sourcing::core::{Aggregate, AggregateRoot, ApplyError, Decoded, RawEvent, UpcasterRegistry};

// ============================================================================
// Replay Targets - type-erased aggregates
// ============================================================================
//
// The replay engine works with aggregate types chosen at runtime (by name),
// so every registered aggregate is reached through these object-safe traits.
//
// ============================================================================

pub trait ReplayTarget: Send + Sync {
    fn aggregate_id(&self) -> Uuid;

    fn version(&self) -> i64;

    /// Apply the next event. `Ok(false)` = unknown event type, skipped.
    fn apply(&mut self, event: &RawEvent, upcasters: &UpcasterRegistry) -> Result<bool, ApplyError>;

    /// Decode without applying (dry run). `Ok(false)` = unknown event type.
    fn check(&self, event: &RawEvent, upcasters: &UpcasterRegistry) -> Result<bool, ApplyError>;

    fn snapshot_state(&self) -> Result<serde_json::Value, serde_json::Error>;
}

impl<A: Aggregate> ReplayTarget for AggregateRoot<A> {
    fn aggregate_id(&self) -> Uuid {
        self.id()
    }

    fn version(&self) -> i64 {
        AggregateRoot::version(self)
    }

    fn apply(&mut self, event: &RawEvent, upcasters: &UpcasterRegistry) -> Result<bool, ApplyError> {
        self.apply_stored(event, upcasters)
    }

    fn check(&self, event: &RawEvent, upcasters: &UpcasterRegistry) -> Result<bool, ApplyError> {
        match event.decode::<A::Event>(upcasters) {
            Ok(Decoded::Known(_)) => Ok(true),
            Ok(Decoded::Unrecognized { .. }) => Ok(false),
            Err(source) => Err(ApplyError::Decode {
                event_type: event.event_type.clone(),
                event_version: event.event_version,
                sequence_number: event.sequence_number,
                source,
            }),
        }
    }

    fn snapshot_state(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self.state())
    }
}

pub trait AggregateFactory: Send + Sync {
    fn aggregate_type(&self) -> &'static str;

    /// Zero-state instance.
    fn create(&self, aggregate_id: Uuid) -> Box<dyn ReplayTarget>;

    /// Instance restored from snapshot state.
    fn restore(
        &self,
        aggregate_id: Uuid,
        state: serde_json::Value,
        last_event_sequence: i64,
        taken_at: DateTime<Utc>,
    ) -> Result<Box<dyn ReplayTarget>, serde_json::Error>;
}

/// Factory for any `Aggregate`, used by `ReplayEngine::register_aggregate`.
pub struct RootFactory<A>(PhantomData<fn() -> A>);

impl<A> Default for RootFactory<A> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<A: Aggregate> AggregateFactory for RootFactory<A> {
    fn aggregate_type(&self) -> &'static str {
        A::AGGREGATE_TYPE
    }

    fn create(&self, aggregate_id: Uuid) -> Box<dyn ReplayTarget> {
        Box::new(AggregateRoot::<A>::new(aggregate_id))
    }

    fn restore(
        &self,
        aggregate_id: Uuid,
        state: serde_json::Value,
        last_event_sequence: i64,
        taken_at: DateTime<Utc>,
    ) -> Result<Box<dyn ReplayTarget>, serde_json::Error> {
        let state: A = serde_json::from_value(state)?;
        Ok(Box::new(AggregateRoot::from_snapshot(
            aggregate_id,
            state,
            last_event_sequence,
            taken_at,
        )))
    }
}
