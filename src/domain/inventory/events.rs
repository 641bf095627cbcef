use serde::{Deserialize, Serialize};

use crate::event_sourcing::core::{DomainEvent, UpcasterRegistry};
use super::value_objects::Sku;

// ============================================================================
// Inventory Events - Domain Events for the Inventory Item Aggregate
// ============================================================================

/// Inventory Event - Union type for all inventory item events
#[derive(Debug, Clone, PartialEq)]
pub enum InventoryEvent {
    Created(ItemCreated),
    StockChanged(StockChanged),
    Discontinued(ItemDiscontinued),
}

pub const ITEM_CREATED: &str = "ItemCreated";
pub const STOCK_CHANGED: &str = "StockChanged";
pub const ITEM_DISCONTINUED: &str = "ItemDiscontinued";

impl DomainEvent for InventoryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InventoryEvent::Created(_) => ITEM_CREATED,
            InventoryEvent::StockChanged(_) => STOCK_CHANGED,
            InventoryEvent::Discontinued(_) => ITEM_DISCONTINUED,
        }
    }

    fn event_version(&self) -> i32 {
        match self {
            InventoryEvent::StockChanged(_) => StockChanged::VERSION,
            _ => 1,
        }
    }

    fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            InventoryEvent::Created(e) => serde_json::to_value(e),
            InventoryEvent::StockChanged(e) => serde_json::to_value(e),
            InventoryEvent::Discontinued(e) => serde_json::to_value(e),
        }
    }

    fn from_payload(
        event_type: &str,
        _event_version: i32,
        payload: serde_json::Value,
    ) -> Result<Option<Self>, serde_json::Error> {
        let event = match event_type {
            ITEM_CREATED => InventoryEvent::Created(serde_json::from_value(payload)?),
            STOCK_CHANGED => InventoryEvent::StockChanged(serde_json::from_value(payload)?),
            ITEM_DISCONTINUED => InventoryEvent::Discontinued(serde_json::from_value(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

// ============================================================================
// Individual Event Types
// ============================================================================

/// Item Created - Initial event in an item's lifecycle
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ItemCreated {
    pub sku: Sku,
    pub name: String,
    pub initial_quantity: i64,
}

/// Stock Changed - On-hand quantity adjusted
///
/// v1 carried only `delta`; v2 added `reason`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StockChanged {
    pub delta: i64,
    pub reason: String,
}

impl StockChanged {
    pub const VERSION: i32 = 2;
}

/// Item Discontinued - Soft delete, the item stays readable
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ItemDiscontinued {
    pub reason: Option<String>,
}

/// Payload migrations for every historical inventory event version.
pub fn upcasters() -> UpcasterRegistry {
    UpcasterRegistry::new().register(STOCK_CHANGED, 1, |mut payload| {
        if let Some(body) = payload.as_object_mut() {
            body.entry("reason").or_insert_with(|| "unspecified".into());
        }
        payload
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::{Decoded, EventEnvelope, EventMetadata};
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_stock_changed_is_written_as_v2() {
        let event = InventoryEvent::StockChanged(StockChanged {
            delta: -2,
            reason: "sold".into(),
        });
        assert_eq!(event.event_type(), "StockChanged");
        assert_eq!(event.event_version(), 2);
        assert_eq!(event.to_payload().unwrap(), json!({"delta": -2, "reason": "sold"}));
    }

    #[test]
    fn test_v1_stock_changed_decodes_through_upcaster() {
        let stored = EventEnvelope::new(
            Uuid::new_v4(),
            "InventoryItem",
            STOCK_CHANGED,
            1,
            json!({"delta": 5}),
            EventMetadata::default(),
        );

        let decoded = stored.decode::<InventoryEvent>(&upcasters()).unwrap();
        assert_eq!(
            decoded,
            Decoded::Known(InventoryEvent::StockChanged(StockChanged {
                delta: 5,
                reason: "unspecified".into()
            }))
        );
    }

    #[test]
    fn test_unknown_event_type_is_not_an_error() {
        let decoded = InventoryEvent::from_payload("PriceChanged", 1, json!({})).unwrap();
        assert!(decoded.is_none());
    }
}
