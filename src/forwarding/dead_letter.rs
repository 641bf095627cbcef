use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scylla::client::session::Session;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::event_sourcing::core::{BoxError, RawEvent};

// ============================================================================
// Dead Letters - events the bus will never accept
// ============================================================================
//
// A dead letter is keyed by the event id: routing the same poison event twice
// (forwarder restart) bumps `failure_count` instead of adding a row.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Event id of the poison event
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub event_type: String,
    pub sequence_number: i64,
    pub topic: Option<String>,
    /// The stored event, as JSON
    pub payload: String,
    pub error_message: String,
    pub failure_count: i32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_event(event: &RawEvent, topic: Option<String>, error_message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: event.event_id,
            aggregate_id: event.aggregate_id,
            aggregate_type: event.aggregate_type.clone(),
            event_type: event.event_type.clone(),
            sequence_number: event.sequence_number,
            topic,
            payload: serde_json::to_string(event).unwrap_or_else(|_| event.event_data.to_string()),
            error_message: error_message.into(),
            failure_count: 1,
            first_failed_at: now,
            last_failed_at: now,
        }
    }

    fn merge_into(self, existing: &DeadLetter) -> DeadLetter {
        DeadLetter {
            failure_count: existing.failure_count + self.failure_count,
            first_failed_at: existing.first_failed_at.min(self.first_failed_at),
            ..self
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeadLetterStats {
    pub total_messages: u64,
    pub by_event_type: HashMap<String, u64>,
}

impl DeadLetterStats {
    fn from_letters<'a>(letters: impl Iterator<Item = &'a str>) -> Self {
        let mut stats = DeadLetterStats::default();
        for event_type in letters {
            stats.total_messages += 1;
            *stats.by_event_type.entry(event_type.to_string()).or_default() += 1;
        }
        stats
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("dead letter persistence failure during {operation}: {source}")]
    Persistence {
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("dead letter sink unavailable: {0}")]
    Unavailable(String),
}

impl DeadLetterError {
    pub fn persistence<E>(operation: &'static str) -> impl FnOnce(E) -> Self
    where
        E: Into<BoxError>,
    {
        move |e| DeadLetterError::Persistence {
            operation,
            source: e.into(),
        }
    }
}

/// Where the publish pipeline routes permanently unpublishable events.
#[async_trait]
pub trait ErrorSink: Send + Sync {
    async fn record(&self, dead_letter: DeadLetter) -> Result<(), DeadLetterError>;
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Insert, or merge with an existing entry for the same event.
    async fn record(&self, dead_letter: DeadLetter) -> Result<(), DeadLetterError>;

    /// Most recent failures first.
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>, DeadLetterError>;

    async fn stats(&self) -> Result<DeadLetterStats, DeadLetterError>;
}

#[derive(Default)]
pub struct InMemoryDeadLetterStore {
    letters: RwLock<HashMap<Uuid, DeadLetter>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, event_id: Uuid) -> Option<DeadLetter> {
        self.letters.read().await.get(&event_id).cloned()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn record(&self, dead_letter: DeadLetter) -> Result<(), DeadLetterError> {
        let mut letters = self.letters.write().await;
        let merged = match letters.get(&dead_letter.id) {
            Some(existing) => dead_letter.merge_into(existing),
            None => dead_letter,
        };
        letters.insert(merged.id, merged);
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>, DeadLetterError> {
        let mut letters: Vec<DeadLetter> = self.letters.read().await.values().cloned().collect();
        letters.sort_by(|a, b| b.last_failed_at.cmp(&a.last_failed_at));
        letters.truncate(limit);
        Ok(letters)
    }

    async fn stats(&self) -> Result<DeadLetterStats, DeadLetterError> {
        let letters = self.letters.read().await;
        Ok(DeadLetterStats::from_letters(letters.values().map(|l| l.event_type.as_str())))
    }
}

type DeadLetterRow = (
    Uuid,
    Uuid,
    String,
    String,
    i64,
    Option<String>,
    String,
    String,
    i32,
    DateTime<Utc>,
    DateTime<Utc>,
);

const SELECT_DEAD_LETTERS: &str = "SELECT id, aggregate_id, aggregate_type, event_type, sequence_number, \
     topic, payload, error_message, failure_count, first_failed_at, last_failed_at FROM dead_letters";

pub struct ScyllaDeadLetterStore {
    session: Arc<Session>,
}

impl ScyllaDeadLetterStore {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    fn decode(row: DeadLetterRow) -> DeadLetter {
        let (
            id,
            aggregate_id,
            aggregate_type,
            event_type,
            sequence_number,
            topic,
            payload,
            error_message,
            failure_count,
            first_failed_at,
            last_failed_at,
        ) = row;
        DeadLetter {
            id,
            aggregate_id,
            aggregate_type,
            event_type,
            sequence_number,
            topic,
            payload,
            error_message,
            failure_count,
            first_failed_at,
            last_failed_at,
        }
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<DeadLetter>, DeadLetterError> {
        let result = self
            .session
            .query_unpaged(format!("{SELECT_DEAD_LETTERS} WHERE id = ?"), (id,))
            .await
            .map_err(DeadLetterError::persistence("read dead letter"))?;
        let rows = result
            .into_rows_result()
            .map_err(DeadLetterError::persistence("read dead letter"))?;
        Ok(rows
            .maybe_first_row::<DeadLetterRow>()
            .map_err(DeadLetterError::persistence("read dead letter"))?
            .map(Self::decode))
    }
}

#[async_trait]
impl DeadLetterStore for ScyllaDeadLetterStore {
    async fn record(&self, dead_letter: DeadLetter) -> Result<(), DeadLetterError> {
        // Single writer (the dead letter actor), so read-merge-write is safe
        let merged = match self.fetch(dead_letter.id).await? {
            Some(existing) => dead_letter.merge_into(&existing),
            None => dead_letter,
        };

        self.session
            .query_unpaged(
                "INSERT INTO dead_letters (id, aggregate_id, aggregate_type, event_type, sequence_number, \
                 topic, payload, error_message, failure_count, first_failed_at, last_failed_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    merged.id,
                    merged.aggregate_id,
                    &merged.aggregate_type,
                    &merged.event_type,
                    merged.sequence_number,
                    &merged.topic,
                    &merged.payload,
                    &merged.error_message,
                    merged.failure_count,
                    merged.first_failed_at,
                    merged.last_failed_at,
                ),
            )
            .await
            .map_err(DeadLetterError::persistence("insert dead letter"))?;
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>, DeadLetterError> {
        let result = self
            .session
            .query_unpaged(SELECT_DEAD_LETTERS, &[])
            .await
            .map_err(DeadLetterError::persistence("list dead letters"))?;
        let rows = result
            .into_rows_result()
            .map_err(DeadLetterError::persistence("list dead letters"))?;

        let mut letters = Vec::new();
        for row in rows
            .rows::<DeadLetterRow>()
            .map_err(DeadLetterError::persistence("list dead letters"))?
        {
            letters.push(Self::decode(
                row.map_err(DeadLetterError::persistence("list dead letters"))?,
            ));
        }
        letters.sort_by(|a, b| b.last_failed_at.cmp(&a.last_failed_at));
        letters.truncate(limit);
        Ok(letters)
    }

    async fn stats(&self) -> Result<DeadLetterStats, DeadLetterError> {
        let result = self
            .session
            .query_unpaged("SELECT event_type FROM dead_letters", &[])
            .await
            .map_err(DeadLetterError::persistence("dead letter stats"))?;
        let rows = result
            .into_rows_result()
            .map_err(DeadLetterError::persistence("dead letter stats"))?;

        let mut event_types = Vec::new();
        for row in rows
            .rows::<(String,)>()
            .map_err(DeadLetterError::persistence("dead letter stats"))?
        {
            let (event_type,) = row.map_err(DeadLetterError::persistence("dead letter stats"))?;
            event_types.push(event_type);
        }
        Ok(DeadLetterStats::from_letters(event_types.iter().map(String::as_str)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::{EventEnvelope, EventMetadata};
    use serde_json::json;

    fn poison(event_type: &str) -> RawEvent {
        EventEnvelope::new(Uuid::new_v4(), "InventoryItem", event_type, 1, json!({}), EventMetadata::default())
    }

    #[tokio::test]
    async fn test_same_event_twice_bumps_failure_count() {
        let store = InMemoryDeadLetterStore::new();
        let event = poison("ItemCreated");

        store.record(DeadLetter::from_event(&event, None, "too large")).await.unwrap();
        store.record(DeadLetter::from_event(&event, None, "too large again")).await.unwrap();

        let letter = store.get(event.event_id).await.unwrap();
        assert_eq!(letter.failure_count, 2);
        assert_eq!(letter.error_message, "too large again");
        assert_eq!(store.list(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stats_group_by_event_type() {
        let store = InMemoryDeadLetterStore::new();
        for event_type in ["ItemCreated", "ItemCreated", "StockChanged"] {
            store
                .record(DeadLetter::from_event(&poison(event_type), None, "rejected"))
                .await
                .unwrap();
        }

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.by_event_type.get("ItemCreated"), Some(&2));
        assert_eq!(store.list(2).await.unwrap().len(), 2);
    }
}
