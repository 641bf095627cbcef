use serde::{Deserialize, Serialize};

use super::errors::InventoryError;

// ============================================================================
// Inventory Value Objects
// ============================================================================

/// Stock keeping unit: non-empty, uppercase alphanumerics and dashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sku(String);

impl Sku {
    pub fn parse(raw: &str) -> Result<Self, InventoryError> {
        let sku = raw.trim().to_uppercase();
        if sku.is_empty() || !sku.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(InventoryError::InvalidSku(raw.to_string()));
        }
        Ok(Self(sku))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Sku {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    /// Zero state: no ItemCreated yet
    #[default]
    Unregistered,
    Active,
    /// Soft-deleted; history stays in the log
    Discontinued,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sku_is_normalized() {
        assert_eq!(Sku::parse(" abc-123 ").unwrap().as_str(), "ABC-123");
    }

    #[test]
    fn test_invalid_sku_is_rejected() {
        assert!(matches!(Sku::parse(""), Err(InventoryError::InvalidSku(_))));
        assert!(matches!(Sku::parse("a b"), Err(InventoryError::InvalidSku(_))));
    }

    #[test]
    fn test_sku_serializes_as_plain_string() {
        let sku = Sku::parse("W-1").unwrap();
        assert_eq!(serde_json::to_string(&sku).unwrap(), "\"W-1\"");
    }
}
