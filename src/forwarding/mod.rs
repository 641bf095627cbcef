// ============================================================================
// Forwarding - event log -> integration bus, at least once
// ============================================================================

pub mod checkpoint;
pub mod coordinator;
pub mod dead_letter;
pub mod envelope;
pub mod forwarder;
pub mod pipeline;

use uuid::Uuid;

use crate::event_sourcing::core::EventStoreError;
use crate::messaging::PublishError;
use crate::utils::IsTransient;

pub use checkpoint::{CheckpointError, CheckpointStore, InMemoryCheckpointStore, ScyllaCheckpointStore};
pub use coordinator::ForwarderCoordinator;
pub use dead_letter::{
    DeadLetter, DeadLetterError, DeadLetterStats, DeadLetterStore, ErrorSink, InMemoryDeadLetterStore,
    ScyllaDeadLetterStore,
};
pub use envelope::{DefaultEnvelopeMapper, EnvelopeMapper, IntegrationEvent, MappingError};
pub use forwarder::{EventForwarder, ForwarderConfig, ForwarderReport};
pub use pipeline::{PublishOutcome, PublishPipeline};

#[derive(Debug, thiserror::Error)]
pub enum ForwardingError {
    /// Bus still failing after the configured attempts; checkpoint not advanced.
    #[error("transient forwarding failure: {0}")]
    Transient(#[source] PublishError),

    /// Unpublishable event and no error sink to route it to.
    #[error("event {event_id} cannot be published: {reason}")]
    Permanent { event_id: Uuid, reason: String },

    #[error("error sink failed: {0}")]
    ErrorSink(#[from] DeadLetterError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error("forwarder for shard {shard} did not finish: {reason}")]
    TaskFailed { shard: u32, reason: String },
}

impl ForwardingError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, ForwardingError::Permanent { .. })
    }
}

impl IsTransient for ForwardingError {
    fn is_transient(&self) -> bool {
        ForwardingError::is_transient(self)
    }
}
