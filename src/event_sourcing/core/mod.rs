// ============================================================================
// Event Sourcing Core - Generic Infrastructure Abstractions
// ============================================================================
//
// Generic, reusable building blocks that work with ANY aggregate:
// event records, payload versioning, aggregate roots and the error taxonomy.
// No storage or domain code lives here.
//
// ============================================================================

pub mod aggregate;
pub mod clock;
pub mod errors;
pub mod event;
pub mod upcaster;

pub use aggregate::{Aggregate, AggregateRoot, ApplyError, PendingEvent};
pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::{BoxError, EventStoreError, SnapshotError};
pub use event::{
    deserialize_event, serialize_event, Decoded, DomainEvent, EventEnvelope, EventMetadata, RawEvent,
};
pub use upcaster::{UpcastFn, UpcasterRegistry};
