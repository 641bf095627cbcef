// ============================================================================
// Inventory Commands - Represent user intent
// ============================================================================

#[derive(Debug, Clone)]
pub enum InventoryCommand {
    CreateItem {
        sku: String,
        name: String,
        initial_quantity: i64,
    },
    /// Positive delta = received, negative = shipped/shrinkage
    AdjustStock {
        delta: i64,
        reason: String,
    },
    Discontinue {
        reason: Option<String>,
    },
}
