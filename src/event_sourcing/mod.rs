// ============================================================================
// Event Sourcing Infrastructure
// ============================================================================
//
// Generic, reusable event sourcing infrastructure.
// Domain-specific code is in src/domain/
//
// ============================================================================

pub mod core;
pub mod repository;
pub mod snapshot;
pub mod store;

pub use core::*;
pub use repository::{AggregateRepository, RepositoryError};
pub use snapshot::{InMemorySnapshotStore, ScyllaSnapshotStore, Snapshot, SnapshotContext, SnapshotPolicy, SnapshotStore};
pub use store::*;
