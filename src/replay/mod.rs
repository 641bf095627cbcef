// ============================================================================
// Replay Engine - re-derive state from the event log
// ============================================================================
//
// Three entry points, all tracked as jobs:
// - replay_aggregate:       one aggregate, strict sequence order
// - rebuild_projection:     events of the projection's types, cursor order,
//                           checkpointed and resumable
// - replay_from_timestamp:  platform-wide, k-way merged by cursor, feeding
//                           aggregates, projections and/or the message bus
//
// Cancellation is honoured at batch boundaries only. A job that is cancelled
// or fails mid-stream still returns what it managed to process.
//
// ============================================================================

pub mod engine;
pub mod job;
pub mod projection;
pub mod reader;
pub mod target;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::event_sourcing::core::BoxError;
use crate::event_sourcing::store::EventCursor;

pub use engine::{ReplayEngine, TimestampReplayOptions};
pub use job::{CancelSignal, JobRegistry, JobStatus, ReplayJob, ReplayKind};
pub use projection::{
    Handled, InMemoryProjectionCheckpointStore, Projection, ProjectionCheckpoint, ProjectionCheckpointStore,
    ProjectionError, ScyllaProjectionCheckpointStore,
};
pub use reader::{EventSource, MergedEventReader};
pub use target::{AggregateFactory, ReplayTarget, RootFactory};

pub type ProgressCallback = Arc<dyn Fn(&ReplayProgress) + Send + Sync>;

#[derive(Clone)]
pub struct ReplayOptions {
    /// Clear persisted materialized state (snapshots, projection store) first
    pub reset_state: bool,
    /// Read and decode everything, write nothing
    pub dry_run: bool,
    pub from_sequence: Option<i64>,
    pub to_sequence: Option<i64>,
    pub batch_size: usize,
    /// Projection checkpoint interval, in events
    pub checkpoint_every: u64,
    pub cancel: Option<CancelSignal>,
    pub progress: Option<ProgressCallback>,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            reset_state: false,
            dry_run: false,
            from_sequence: None,
            to_sequence: None,
            batch_size: 500,
            checkpoint_every: 1000,
            cancel: None,
            progress: None,
        }
    }
}

impl std::fmt::Debug for ReplayOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayOptions")
            .field("reset_state", &self.reset_state)
            .field("dry_run", &self.dry_run)
            .field("from_sequence", &self.from_sequence)
            .field("to_sequence", &self.to_sequence)
            .field("batch_size", &self.batch_size)
            .field("checkpoint_every", &self.checkpoint_every)
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

/// Reported to the progress callback after every batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayProgress {
    pub job_id: Uuid,
    pub kind: ReplayKind,
    pub processed: u64,
    pub skipped: u64,
    pub last_cursor: Option<EventCursor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayReport {
    pub job_id: Uuid,
    pub kind: ReplayKind,
    /// Events handled by at least one target
    pub processed: u64,
    /// Unknown event types and per-aggregate duplicates
    pub skipped: u64,
    pub aggregates_rebuilt: u64,
    pub republished: u64,
    pub dead_lettered: u64,
    pub last_cursor: Option<EventCursor>,
    /// Last sequence number handled (aggregate replay)
    pub last_sequence: i64,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ReplayReport {
    pub fn new(job_id: Uuid, kind: ReplayKind, dry_run: bool) -> Self {
        Self {
            job_id,
            kind,
            processed: 0,
            skipped: 0,
            aggregates_rebuilt: 0,
            republished: 0,
            dead_lettered: 0,
            last_cursor: None,
            last_sequence: 0,
            dry_run,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn progress(&self) -> ReplayProgress {
        ReplayProgress {
            job_id: self.job_id,
            kind: self.kind,
            processed: self.processed,
            skipped: self.skipped,
            last_cursor: self.last_cursor,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("replay failed after {} events: {source}", report.processed)]
    PartialFailure {
        report: Box<ReplayReport>,
        #[source]
        source: BoxError,
    },

    #[error("replay cancelled after {} events", report.processed)]
    Cancelled { report: Box<ReplayReport> },

    #[error("no projection registered as {0}")]
    UnknownProjection(String),

    #[error("no aggregate factory registered for {0}")]
    UnknownAggregateType(String),

    #[error("re-publication requested but no publish pipeline is configured")]
    PublisherNotConfigured,
}

impl ReplayError {
    /// Partial progress, when the job got far enough to have any.
    pub fn report(&self) -> Option<&ReplayReport> {
        match self {
            ReplayError::PartialFailure { report, .. } | ReplayError::Cancelled { report } => Some(&**report),
            _ => None,
        }
    }
}
