// ============================================================================
// Inventory Domain - Business Logic for the Inventory Item Aggregate
// ============================================================================
//
// This module contains ALL inventory-specific code:
// - Value objects (Sku, ItemStatus)
// - Events (ItemCreated, StockChanged, ItemDiscontinued) and their upcasters
// - Commands (CreateItem, AdjustStock, Discontinue)
// - Errors (InventoryError enum)
// - Aggregate (InventoryItem with business rules)
// - Command Handler (InventoryCommandHandler)
// - Projection (StockLevelProjection read model)
//
// This is completely separate from the generic event sourcing infrastructure.
//
// ============================================================================

pub mod aggregate;
pub mod command_handler;
pub mod commands;
pub mod errors;
pub mod events;
pub mod projection;
pub mod value_objects;

// Re-export for convenience
pub use aggregate::*;
pub use command_handler::*;
pub use commands::*;
pub use errors::*;
pub use events::*;
pub use projection::*;
pub use value_objects::*;
