use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scylla::client::session::Session;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::event_sourcing::core::{BoxError, RawEvent};
use crate::event_sourcing::store::EventCursor;
use crate::forwarding::CheckpointError;

// ============================================================================
// Projections - read models folded from a filtered event stream
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Applied,
    /// Event type (or version) this projection no longer understands
    Unrecognized,
}

#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("projection could not decode {event_type}: {source}")]
    Decode {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("projection storage failure: {0}")]
    Storage(#[source] BoxError),
}

#[async_trait]
pub trait Projection: Send + Sync {
    fn name(&self) -> &str;

    fn interested_event_types(&self) -> HashSet<String>;

    async fn handle_event(&self, event: &RawEvent) -> Result<Handled, ProjectionError>;

    /// Drop all materialized state.
    async fn reset(&self) -> Result<(), ProjectionError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionCheckpoint {
    pub projection_name: String,
    /// Last event handled; the rebuild resumes strictly after it
    pub cursor: EventCursor,
    pub events_processed: u64,
    /// Highest sequence handled per aggregate, so events stamped before the
    /// cursor but committed after it are still picked up on resume
    pub delivered: HashMap<Uuid, i64>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait ProjectionCheckpointStore: Send + Sync {
    async fn load(&self, projection_name: &str) -> Result<Option<ProjectionCheckpoint>, CheckpointError>;

    async fn save(&self, checkpoint: &ProjectionCheckpoint) -> Result<(), CheckpointError>;

    async fn clear(&self, projection_name: &str) -> Result<(), CheckpointError>;
}

#[derive(Default)]
pub struct InMemoryProjectionCheckpointStore {
    checkpoints: RwLock<HashMap<String, ProjectionCheckpoint>>,
}

impl InMemoryProjectionCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectionCheckpointStore for InMemoryProjectionCheckpointStore {
    async fn load(&self, projection_name: &str) -> Result<Option<ProjectionCheckpoint>, CheckpointError> {
        Ok(self.checkpoints.read().await.get(projection_name).cloned())
    }

    async fn save(&self, checkpoint: &ProjectionCheckpoint) -> Result<(), CheckpointError> {
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.projection_name.clone(), checkpoint.clone());
        Ok(())
    }

    async fn clear(&self, projection_name: &str) -> Result<(), CheckpointError> {
        self.checkpoints.write().await.remove(projection_name);
        Ok(())
    }
}

pub struct ScyllaProjectionCheckpointStore {
    session: Arc<Session>,
}

impl ScyllaProjectionCheckpointStore {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl ProjectionCheckpointStore for ScyllaProjectionCheckpointStore {
    async fn load(&self, projection_name: &str) -> Result<Option<ProjectionCheckpoint>, CheckpointError> {
        let result = self
            .session
            .query_unpaged(
                "SELECT occurred_at, aggregate_id, sequence_number, events_processed, delivered, updated_at \
                 FROM projection_checkpoints WHERE projection_name = ?",
                (projection_name,),
            )
            .await
            .map_err(CheckpointError::persistence("load projection checkpoint"))?;
        let rows = result
            .into_rows_result()
            .map_err(CheckpointError::persistence("load projection checkpoint"))?;
        let Some((occurred_at, aggregate_id, sequence_number, events_processed, delivered, updated_at)) = rows
            .maybe_first_row::<(i64, Uuid, i64, i64, Option<HashMap<Uuid, i64>>, DateTime<Utc>)>()
            .map_err(CheckpointError::persistence("load projection checkpoint"))?
        else {
            return Ok(None);
        };

        let timestamp = DateTime::<Utc>::from_timestamp_micros(occurred_at).ok_or_else(|| {
            CheckpointError::persistence("decode projection checkpoint")(format!("timestamp {occurred_at} out of range"))
        })?;
        Ok(Some(ProjectionCheckpoint {
            projection_name: projection_name.to_string(),
            cursor: EventCursor {
                timestamp,
                aggregate_id,
                sequence_number,
            },
            events_processed: events_processed.max(0) as u64,
            delivered: delivered.unwrap_or_default(),
            updated_at,
        }))
    }

    async fn save(&self, checkpoint: &ProjectionCheckpoint) -> Result<(), CheckpointError> {
        self.session
            .query_unpaged(
                "INSERT INTO projection_checkpoints (projection_name, occurred_at, aggregate_id, \
                 sequence_number, events_processed, delivered, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
                (
                    &checkpoint.projection_name,
                    checkpoint.cursor.timestamp.timestamp_micros(),
                    checkpoint.cursor.aggregate_id,
                    checkpoint.cursor.sequence_number,
                    checkpoint.events_processed as i64,
                    &checkpoint.delivered,
                    checkpoint.updated_at,
                ),
            )
            .await
            .map_err(CheckpointError::persistence("save projection checkpoint"))?;
        Ok(())
    }

    async fn clear(&self, projection_name: &str) -> Result<(), CheckpointError> {
        self.session
            .query_unpaged(
                "DELETE FROM projection_checkpoints WHERE projection_name = ?",
                (projection_name,),
            )
            .await
            .map_err(CheckpointError::persistence("clear projection checkpoint"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_checkpoint_save_load_clear() {
        let store = InMemoryProjectionCheckpointStore::new();
        let checkpoint = ProjectionCheckpoint {
            projection_name: "stock_levels".to_string(),
            cursor: EventCursor::at(Utc::now()),
            events_processed: 42,
            delivered: HashMap::from([(Uuid::new_v4(), 7)]),
            updated_at: Utc::now(),
        };

        store.save(&checkpoint).await.unwrap();
        assert_eq!(store.load("stock_levels").await.unwrap(), Some(checkpoint));

        store.clear("stock_levels").await.unwrap();
        assert!(store.load("stock_levels").await.unwrap().is_none());
    }
}
