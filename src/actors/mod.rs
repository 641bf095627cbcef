// ============================================================================
// Actors Module
// ============================================================================
//
// Actor-based infrastructure for asynchronous, concurrent operations.
//
// Structure:
// - infrastructure/ - Concrete infrastructure actors (Dead Letter Queue)
//
// Note: Aggregates are driven by command handlers and the repository, NOT
//       actors. Actors are reserved for infrastructure concerns only.
//
// ============================================================================

mod infrastructure;

pub use infrastructure::{DeadLetterActor, GetDeadLetterStats, GetDeadLetters, RecordDeadLetter};
