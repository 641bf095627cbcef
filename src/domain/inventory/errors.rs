use uuid::Uuid;

// ============================================================================
// Inventory Business Rule Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InventoryError {
    #[error("Item already exists")]
    AlreadyExists,

    #[error("Item {0} has not been created")]
    NotCreated(Uuid),

    #[error("Item has been discontinued")]
    Discontinued,

    #[error("Insufficient stock: {available} available, {requested} requested")]
    InsufficientStock { available: i64, requested: i64 },

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(i64),

    #[error("Invalid SKU: {0:?}")]
    InvalidSku(String),

    #[error("Item name cannot be empty")]
    EmptyName,

    #[error("Aggregate not initialized")]
    NotInitialized,
}
