use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::event_sourcing::core::{DomainEvent, RawEvent};
use crate::replay::{Handled, Projection, ProjectionError};
use super::events::*;

// ============================================================================
// Stock Level Projection - current quantity per item
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StockLevel {
    pub aggregate_id: Uuid,
    pub sku: String,
    pub name: String,
    pub quantity: i64,
    pub discontinued: bool,
    pub last_sequence: i64,
}

#[derive(Default)]
pub struct StockLevelProjection {
    levels: RwLock<BTreeMap<Uuid, StockLevel>>,
}

impl StockLevelProjection {
    pub const NAME: &'static str = "stock_levels";

    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, aggregate_id: Uuid) -> Option<StockLevel> {
        self.levels.read().await.get(&aggregate_id).cloned()
    }

    /// Every item, ordered by aggregate id.
    pub async fn all(&self) -> Vec<StockLevel> {
        self.levels.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl Projection for StockLevelProjection {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn interested_event_types(&self) -> HashSet<String> {
        [ITEM_CREATED, STOCK_CHANGED, ITEM_DISCONTINUED]
            .into_iter()
            .map(String::from)
            .collect()
    }

    async fn handle_event(&self, event: &RawEvent) -> Result<Handled, ProjectionError> {
        let decoded = InventoryEvent::from_payload(&event.event_type, event.event_version, event.event_data.clone())
            .map_err(|source| ProjectionError::Decode {
                event_type: event.event_type.clone(),
                source,
            })?;
        let Some(decoded) = decoded else {
            return Ok(Handled::Unrecognized);
        };

        let mut levels = self.levels.write().await;
        let level = levels.entry(event.aggregate_id).or_insert_with(|| StockLevel {
            aggregate_id: event.aggregate_id,
            ..StockLevel::default()
        });
        match decoded {
            InventoryEvent::Created(e) => {
                level.sku = e.sku.to_string();
                level.name = e.name;
                level.quantity = e.initial_quantity;
            }
            InventoryEvent::StockChanged(e) => level.quantity += e.delta,
            InventoryEvent::Discontinued(_) => level.discontinued = true,
        }
        level.last_sequence = event.sequence_number;
        Ok(Handled::Applied)
    }

    async fn reset(&self) -> Result<(), ProjectionError> {
        self.levels.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::{EventEnvelope, EventMetadata};
    use serde_json::json;

    fn raw(id: Uuid, seq: i64, event_type: &str, data: serde_json::Value) -> RawEvent {
        let mut event = EventEnvelope::new(id, "InventoryItem", event_type, 1, data, EventMetadata::default());
        event.sequence_number = seq;
        event
    }

    #[tokio::test]
    async fn test_folds_stock_changes() {
        let projection = StockLevelProjection::new();
        let id = Uuid::new_v4();

        let created = raw(id, 1, ITEM_CREATED, json!({"sku": "W-1", "name": "Widget", "initial_quantity": 5}));
        let changed = raw(id, 2, STOCK_CHANGED, json!({"delta": -2, "reason": "sold"}));
        let gone = raw(id, 3, ITEM_DISCONTINUED, json!({"reason": null}));
        for event in [&created, &changed, &gone] {
            assert_eq!(projection.handle_event(event).await.unwrap(), Handled::Applied);
        }

        let level = projection.get(id).await.unwrap();
        assert_eq!(level.quantity, 3);
        assert!(level.discontinued);
        assert_eq!(level.last_sequence, 3);
    }

    #[tokio::test]
    async fn test_unknown_type_and_reset() {
        let projection = StockLevelProjection::new();
        let id = Uuid::new_v4();
        let unknown = raw(id, 1, "PriceChanged", json!({}));
        assert_eq!(projection.handle_event(&unknown).await.unwrap(), Handled::Unrecognized);

        let created = raw(id, 1, ITEM_CREATED, json!({"sku": "W-1", "name": "Widget", "initial_quantity": 5}));
        projection.handle_event(&created).await.unwrap();
        projection.reset().await.unwrap();
        assert!(projection.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_an_error() {
        let projection = StockLevelProjection::new();
        let broken = raw(Uuid::new_v4(), 1, STOCK_CHANGED, json!({"delta": "lots"}));
        assert!(matches!(
            projection.handle_event(&broken).await,
            Err(ProjectionError::Decode { .. })
        ));
    }
}
