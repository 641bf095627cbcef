use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scylla::client::session::Session;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::event_sourcing::core::BoxError;
use crate::event_sourcing::store::FeedPosition;

// ============================================================================
// Forwarder Checkpoints
// ============================================================================
//
// One row per (forwarder_id, shard). Written only by the forwarder that owns
// the shard, and only with positions the bus has confirmed.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint persistence failure during {operation}: {source}")]
    Persistence {
        operation: &'static str,
        #[source]
        source: BoxError,
    },
}

impl CheckpointError {
    pub fn persistence<E>(operation: &'static str) -> impl FnOnce(E) -> Self
    where
        E: Into<BoxError>,
    {
        move |e| CheckpointError::Persistence {
            operation,
            source: e.into(),
        }
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, forwarder_id: &str, shard: u32) -> Result<Option<FeedPosition>, CheckpointError>;

    async fn save(&self, forwarder_id: &str, shard: u32, position: FeedPosition) -> Result<(), CheckpointError>;
}

#[derive(Default)]
pub struct InMemoryCheckpointStore {
    positions: RwLock<HashMap<(String, u32), (FeedPosition, DateTime<Utc>)>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn updated_at(&self, forwarder_id: &str, shard: u32) -> Option<DateTime<Utc>> {
        self.positions
            .read()
            .await
            .get(&(forwarder_id.to_string(), shard))
            .map(|(_, at)| *at)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, forwarder_id: &str, shard: u32) -> Result<Option<FeedPosition>, CheckpointError> {
        Ok(self
            .positions
            .read()
            .await
            .get(&(forwarder_id.to_string(), shard))
            .map(|(position, _)| *position))
    }

    async fn save(&self, forwarder_id: &str, shard: u32, position: FeedPosition) -> Result<(), CheckpointError> {
        self.positions
            .write()
            .await
            .insert((forwarder_id.to_string(), shard), (position, Utc::now()));
        Ok(())
    }
}

pub struct ScyllaCheckpointStore {
    session: Arc<Session>,
}

impl ScyllaCheckpointStore {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl CheckpointStore for ScyllaCheckpointStore {
    async fn load(&self, forwarder_id: &str, shard: u32) -> Result<Option<FeedPosition>, CheckpointError> {
        let result = self
            .session
            .query_unpaged(
                "SELECT feed_offset, aggregate_id, sequence_number FROM forwarder_checkpoints \
                 WHERE forwarder_id = ? AND shard = ?",
                (forwarder_id, shard as i32),
            )
            .await
            .map_err(CheckpointError::persistence("load checkpoint"))?;

        let rows = result
            .into_rows_result()
            .map_err(CheckpointError::persistence("load checkpoint"))?;
        let row = rows
            .maybe_first_row::<(i64, Uuid, i64)>()
            .map_err(CheckpointError::persistence("load checkpoint"))?;

        Ok(row.map(|(offset, aggregate_id, sequence_number)| FeedPosition {
            offset,
            aggregate_id,
            sequence_number,
        }))
    }

    async fn save(&self, forwarder_id: &str, shard: u32, position: FeedPosition) -> Result<(), CheckpointError> {
        self.session
            .query_unpaged(
                "INSERT INTO forwarder_checkpoints (forwarder_id, shard, feed_offset, aggregate_id, \
                 sequence_number, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
                (
                    forwarder_id,
                    shard as i32,
                    position.offset,
                    position.aggregate_id,
                    position.sequence_number,
                    Utc::now(),
                ),
            )
            .await
            .map_err(CheckpointError::persistence("save checkpoint"))?;
        Ok(())
    }
}
