// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// This module contains domain-specific aggregates and business logic.
// Each aggregate has its own subdirectory with:
// - Value objects
// - Events
// - Commands
// - Errors
// - Aggregate implementation
// - Command handler
// - Read-model projections
//
// This layer is completely separate from the event sourcing infrastructure.
//
// ============================================================================

pub mod inventory;
