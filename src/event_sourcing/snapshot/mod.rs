use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::event_sourcing::core::SnapshotError;

// ============================================================================
// Snapshot Store - Disposable cache of aggregate state
// ============================================================================
//
// A snapshot is a pure function of the event prefix 1..last_event_sequence.
// Deleting every snapshot loses nothing; loads fall back to longer replay.
// Nothing in here ever gates an event append.
//
// ============================================================================

pub mod memory;
pub mod policy;
pub mod scylla_store;

pub use memory::InMemorySnapshotStore;
pub use policy::{SnapshotContext, SnapshotPolicy};
pub use scylla_store::ScyllaSnapshotStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    /// Monotonically increasing per aggregate
    pub snapshot_version: i64,
    pub state: serde_json::Value,
    pub last_event_sequence: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist a new snapshot and return its `snapshot_version`.
    async fn save(
        &self,
        aggregate_id: Uuid,
        aggregate_type: &str,
        state: serde_json::Value,
        last_event_sequence: i64,
        metadata: HashMap<String, String>,
    ) -> Result<i64, SnapshotError>;

    async fn latest(&self, aggregate_id: Uuid) -> Result<Option<Snapshot>, SnapshotError>;

    /// All snapshots of an aggregate, newest first.
    async fn list(&self, aggregate_id: Uuid) -> Result<Vec<Snapshot>, SnapshotError>;

    /// Delete all but the newest `keep` snapshots; `keep = 0` deletes every one.
    ///
    /// Returns how many were deleted.
    async fn prune(&self, aggregate_id: Uuid, keep: usize) -> Result<usize, SnapshotError>;

    /// Drop every snapshot of an aggregate (replay with state reset).
    async fn delete_all(&self, aggregate_id: Uuid) -> Result<usize, SnapshotError>;
}
