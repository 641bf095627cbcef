use serde::{Deserialize, Serialize};

use crate::event_sourcing::core::Aggregate;
use super::commands::InventoryCommand;
use super::errors::InventoryError;
use super::events::*;
use super::value_objects::{ItemStatus, Sku};

// ============================================================================
// Inventory Item Aggregate - Domain Logic
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub sku: Option<Sku>,
    pub name: String,
    pub quantity: i64,
    pub status: ItemStatus,
    pub discontinued_reason: Option<String>,
}

impl InventoryItem {
    fn ensure_active(&self) -> Result<(), InventoryError> {
        match self.status {
            ItemStatus::Active => Ok(()),
            ItemStatus::Discontinued => Err(InventoryError::Discontinued),
            ItemStatus::Unregistered => Err(InventoryError::NotInitialized),
        }
    }
}

// ============================================================================
// Aggregate Trait Implementation
// ============================================================================

impl Aggregate for InventoryItem {
    const AGGREGATE_TYPE: &'static str = "InventoryItem";

    type Event = InventoryEvent;
    type Command = InventoryCommand;
    type Error = InventoryError;

    fn apply_event(&mut self, event: &Self::Event) -> Result<(), Self::Error> {
        match event {
            InventoryEvent::Created(e) => {
                if self.status != ItemStatus::Unregistered {
                    return Err(InventoryError::AlreadyExists);
                }
                self.sku = Some(e.sku.clone());
                self.name = e.name.clone();
                self.quantity = e.initial_quantity;
                self.status = ItemStatus::Active;
            }
            InventoryEvent::StockChanged(e) => {
                self.quantity += e.delta;
            }
            InventoryEvent::Discontinued(e) => {
                self.status = ItemStatus::Discontinued;
                self.discontinued_reason = e.reason.clone();
            }
        }
        Ok(())
    }

    fn handle_command(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            InventoryCommand::CreateItem {
                sku,
                name,
                initial_quantity,
            } => {
                if self.status != ItemStatus::Unregistered {
                    return Err(InventoryError::AlreadyExists);
                }
                if name.trim().is_empty() {
                    return Err(InventoryError::EmptyName);
                }
                if *initial_quantity < 0 {
                    return Err(InventoryError::InvalidQuantity(*initial_quantity));
                }
                Ok(vec![InventoryEvent::Created(ItemCreated {
                    sku: Sku::parse(sku)?,
                    name: name.trim().to_string(),
                    initial_quantity: *initial_quantity,
                })])
            }
            InventoryCommand::AdjustStock { delta, reason } => {
                self.ensure_active()?;
                if *delta == 0 {
                    return Err(InventoryError::InvalidQuantity(0));
                }
                if self.quantity + delta < 0 {
                    return Err(InventoryError::InsufficientStock {
                        available: self.quantity,
                        requested: -delta,
                    });
                }
                Ok(vec![InventoryEvent::StockChanged(StockChanged {
                    delta: *delta,
                    reason: reason.clone(),
                })])
            }
            InventoryCommand::Discontinue { reason } => {
                self.ensure_active()?;
                Ok(vec![InventoryEvent::Discontinued(ItemDiscontinued {
                    reason: reason.clone(),
                })])
            }
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn created(quantity: i64) -> InventoryItem {
        let mut item = InventoryItem::default();
        let events = item
            .handle_command(&InventoryCommand::CreateItem {
                sku: "w-1".into(),
                name: "Widget".into(),
                initial_quantity: quantity,
            })
            .unwrap();
        for event in &events {
            item.apply_event(event).unwrap();
        }
        item
    }

    #[test]
    fn test_create_item() {
        let item = created(10);
        assert_eq!(item.status, ItemStatus::Active);
        assert_eq!(item.quantity, 10);
        assert_eq!(item.sku.as_ref().map(Sku::as_str), Some("W-1"));
    }

    #[test]
    fn test_cannot_create_twice() {
        let item = created(1);
        let result = item.handle_command(&InventoryCommand::CreateItem {
            sku: "w-1".into(),
            name: "Widget".into(),
            initial_quantity: 1,
        });
        assert_eq!(result.unwrap_err(), InventoryError::AlreadyExists);
    }

    #[test]
    fn test_stock_cannot_go_negative() {
        let item = created(3);
        let result = item.handle_command(&InventoryCommand::AdjustStock {
            delta: -5,
            reason: "order".into(),
        });
        assert_eq!(
            result.unwrap_err(),
            InventoryError::InsufficientStock {
                available: 3,
                requested: 5
            }
        );
    }

    #[test]
    fn test_discontinued_item_rejects_adjustments() {
        let mut item = created(3);
        let events = item
            .handle_command(&InventoryCommand::Discontinue {
                reason: Some("end of line".into()),
            })
            .unwrap();
        item.apply_event(&events[0]).unwrap();

        assert_eq!(item.status, ItemStatus::Discontinued);
        assert_eq!(item.quantity, 3);
        let result = item.handle_command(&InventoryCommand::AdjustStock {
            delta: 1,
            reason: "found".into(),
        });
        assert_eq!(result.unwrap_err(), InventoryError::Discontinued);
    }

    #[test]
    fn test_commands_on_unregistered_item_fail() {
        let item = InventoryItem::default();
        let result = item.handle_command(&InventoryCommand::Discontinue { reason: None });
        assert_eq!(result.unwrap_err(), InventoryError::NotInitialized);
    }
}
