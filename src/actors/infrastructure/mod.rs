// ============================================================================
// Infrastructure Actors
// ============================================================================
//
// Reusable infrastructure actors for system concerns:
// - Dead letter queue (error sink of the forwarding pipeline)
//
// ============================================================================

mod dlq;

pub use dlq::{DeadLetterActor, GetDeadLetterStats, GetDeadLetters, RecordDeadLetter};
