// ============================================================================
// Event Sourcing Store - Generic Persistence Layer
// ============================================================================
//
// The event log port plus its backends. All components work with ANY
// aggregate/event type; payloads are stored as JSON.
//
// ============================================================================

pub mod event_store;
pub mod memory;
pub mod schema;
pub mod scylla_store;

pub use event_store::{shard_for, tail_changes, ChangeRecord, EventCursor, EventLogStore, FeedPosition};
pub use memory::InMemoryEventStore;
pub use schema::create_schema;
pub use scylla_store::{ScyllaEventStore, ScyllaEventStoreConfig};
