use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::event_sourcing::core::RawEvent;
use crate::messaging::BusMessage;

// ============================================================================
// Integration Event Envelope
// ============================================================================
//
// The public shape of a domain event on the bus. `message_id` is the event id,
// so consumers can drop the duplicates at-least-once delivery produces.
// Partition key is the aggregate id: one aggregate, one partition, in order.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationEvent {
    pub message_id: Uuid,
    pub topic: String,
    pub partition_key: String,
    pub event_type: String,
    pub event_version: i32,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub sequence_number: i64,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub causation_id: Option<Uuid>,
    pub payload: serde_json::Value,
    /// Denormalized context for consumers (source, user, tenant, ...)
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl IntegrationEvent {
    pub fn to_bus_message(&self) -> Result<BusMessage, serde_json::Error> {
        Ok(BusMessage {
            topic: self.topic.clone(),
            key: self.partition_key.clone(),
            payload: serde_json::to_vec(self)?,
            headers: vec![
                ("message_id".to_string(), self.message_id.to_string()),
                ("event_type".to_string(), self.event_type.clone()),
                ("event_version".to_string(), self.event_version.to_string()),
                ("aggregate_type".to_string(), self.aggregate_type.clone()),
                ("correlation_id".to_string(), self.correlation_id.to_string()),
            ],
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("event cannot be published: {0}")]
    Unpublishable(String),

    #[error("integration event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Turns a stored (already upcast) event into its integration form.
pub trait EnvelopeMapper: Send + Sync {
    fn map(&self, event: &RawEvent) -> Result<IntegrationEvent, MappingError>;
}

#[derive(Debug, Clone, Default)]
pub struct DefaultEnvelopeMapper {
    topic_prefix: String,
}

impl DefaultEnvelopeMapper {
    pub fn new(topic_prefix: impl Into<String>) -> Self {
        Self {
            topic_prefix: topic_prefix.into(),
        }
    }

    /// `{prefix}{aggregate type, lowercase}-events`
    pub fn topic_for(&self, aggregate_type: &str) -> String {
        format!("{}{}-events", self.topic_prefix, aggregate_type.to_lowercase())
    }
}

impl EnvelopeMapper for DefaultEnvelopeMapper {
    fn map(&self, event: &RawEvent) -> Result<IntegrationEvent, MappingError> {
        if event.aggregate_type.is_empty() {
            return Err(MappingError::Unpublishable(format!(
                "event {} has no aggregate type",
                event.event_id
            )));
        }

        let metadata = &event.metadata;
        let mut context: BTreeMap<String, String> = metadata
            .extra
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !metadata.source.is_empty() {
            context.insert("source".to_string(), metadata.source.clone());
        }
        if let Some(user_id) = metadata.user_id {
            context.insert("user_id".to_string(), user_id.to_string());
        }

        Ok(IntegrationEvent {
            message_id: event.event_id,
            topic: self.topic_for(&event.aggregate_type),
            partition_key: event.aggregate_id.to_string(),
            event_type: event.event_type.clone(),
            event_version: event.event_version,
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id,
            sequence_number: event.sequence_number,
            occurred_at: event.timestamp,
            correlation_id: metadata.correlation_id,
            causation_id: metadata.causation_id,
            payload: event.event_data.clone(),
            context,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::{EventEnvelope, EventMetadata};
    use serde_json::json;

    fn event() -> RawEvent {
        let metadata = EventMetadata::new(Uuid::new_v4(), "inventory-api")
            .with_user(Uuid::new_v4())
            .with_extra("warehouse", "ams-1");
        let mut raw = EventEnvelope::new(Uuid::new_v4(), "InventoryItem", "ItemCreated", 1, json!({"sku": "A"}), metadata);
        raw.sequence_number = 1;
        raw
    }

    #[test]
    fn test_default_mapping() {
        let raw = event();
        let mapped = DefaultEnvelopeMapper::new("prod.").map(&raw).unwrap();

        assert_eq!(mapped.message_id, raw.event_id);
        assert_eq!(mapped.topic, "prod.inventoryitem-events");
        assert_eq!(mapped.partition_key, raw.aggregate_id.to_string());
        assert_eq!(mapped.context.get("warehouse").map(String::as_str), Some("ams-1"));
        assert_eq!(mapped.context.get("source").map(String::as_str), Some("inventory-api"));
        assert!(mapped.context.contains_key("user_id"));
    }

    #[test]
    fn test_bus_message_carries_dedupe_header() {
        let raw = event();
        let message = DefaultEnvelopeMapper::default().map(&raw).unwrap().to_bus_message().unwrap();

        assert_eq!(message.header("message_id"), Some(raw.event_id.to_string().as_str()));
        let body: IntegrationEvent = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(body.payload, json!({"sku": "A"}));
    }

    #[test]
    fn test_missing_aggregate_type_is_unpublishable() {
        let mut raw = event();
        raw.aggregate_type.clear();
        assert!(matches!(
            DefaultEnvelopeMapper::default().map(&raw),
            Err(MappingError::Unpublishable(_))
        ));
    }
}
