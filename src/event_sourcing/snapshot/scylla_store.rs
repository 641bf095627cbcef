use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scylla::client::session::Session;
use scylla::statement::batch::Batch;
use scylla::value::{CqlValue, Row};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::{Snapshot, SnapshotStore};
use crate::event_sourcing::core::SnapshotError;

// ============================================================================
// ScyllaDB Snapshot Store
// ============================================================================
//
// One partition per aggregate, newest snapshot first. `snapshot_version` is
// allocated with a conditional batch on the static head_version column, so
// two concurrent saves can never reuse a version.
//
// ============================================================================

const SAVE_ATTEMPTS: u32 = 3;

const SELECT_SNAPSHOTS: &str = "SELECT snapshot_version, aggregate_type, state, last_event_sequence, taken_at, metadata \
     FROM snapshots WHERE aggregate_id = ?";

type SnapshotRow = (Option<i64>, Option<String>, Option<String>, Option<i64>, Option<i64>, Option<String>);

pub struct ScyllaSnapshotStore {
    session: Arc<Session>,
}

impl ScyllaSnapshotStore {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    async fn head_version(&self, aggregate_id: Uuid) -> Result<Option<i64>, SnapshotError> {
        let result = self
            .session
            .query_unpaged(
                "SELECT head_version FROM snapshots WHERE aggregate_id = ? LIMIT 1",
                (aggregate_id,),
            )
            .await
            .map_err(SnapshotError::persistence("read head"))?;
        let rows = result
            .into_rows_result()
            .map_err(SnapshotError::persistence("read head"))?;
        Ok(rows
            .maybe_first_row::<(Option<i64>,)>()
            .map_err(SnapshotError::persistence("read head"))?
            .and_then(|(v,)| v))
    }

    fn decode(aggregate_id: Uuid, row: SnapshotRow) -> Result<Option<Snapshot>, SnapshotError> {
        let (snapshot_version, aggregate_type, state, last_event_sequence, taken_at, metadata) = row;
        // Static-only rows (head without snapshot) have no state
        let (Some(snapshot_version), Some(state), Some(last_event_sequence), Some(taken_at)) =
            (snapshot_version, state, last_event_sequence, taken_at)
        else {
            return Ok(None);
        };
        let timestamp = DateTime::<Utc>::from_timestamp_micros(taken_at)
            .ok_or_else(|| SnapshotError::persistence("decode")(format!("timestamp {taken_at} out of range")))?;
        Ok(Some(Snapshot {
            aggregate_id,
            aggregate_type: aggregate_type.unwrap_or_default(),
            snapshot_version,
            state: serde_json::from_str(&state)?,
            last_event_sequence,
            timestamp,
            metadata: match metadata {
                Some(m) => serde_json::from_str(&m)?,
                None => HashMap::new(),
            },
        }))
    }

    async fn select(&self, aggregate_id: Uuid, limit: Option<i32>) -> Result<Vec<Snapshot>, SnapshotError> {
        let result = match limit {
            Some(limit) => {
                self.session
                    .query_unpaged(format!("{SELECT_SNAPSHOTS} LIMIT ?"), (aggregate_id, limit))
                    .await
            }
            None => self.session.query_unpaged(SELECT_SNAPSHOTS, (aggregate_id,)).await,
        }
        .map_err(SnapshotError::persistence("read snapshots"))?;

        let rows = result
            .into_rows_result()
            .map_err(SnapshotError::persistence("read snapshots"))?;
        let mut snapshots = Vec::new();
        for row in rows
            .rows::<SnapshotRow>()
            .map_err(SnapshotError::persistence("read snapshots"))?
        {
            let row = row.map_err(SnapshotError::persistence("read snapshots"))?;
            if let Some(snapshot) = Self::decode(aggregate_id, row)? {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    async fn delete_versions(&self, aggregate_id: Uuid, versions: &[i64]) -> Result<(), SnapshotError> {
        for version in versions {
            self.session
                .query_unpaged(
                    "DELETE FROM snapshots WHERE aggregate_id = ? AND snapshot_version = ?",
                    (aggregate_id, *version),
                )
                .await
                .map_err(SnapshotError::persistence("delete snapshot"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for ScyllaSnapshotStore {
    async fn save(
        &self,
        aggregate_id: Uuid,
        aggregate_type: &str,
        state: serde_json::Value,
        last_event_sequence: i64,
        metadata: HashMap<String, String>,
    ) -> Result<i64, SnapshotError> {
        let state = serde_json::to_string(&state)?;
        let metadata = serde_json::to_string(&metadata)?;

        for attempt in 1..=SAVE_ATTEMPTS {
            let head = self.head_version(aggregate_id).await?;
            let snapshot_version = head.unwrap_or(0) + 1;

            let mut batch = Batch::default();
            let mut values: Vec<Vec<CqlValue>> = Vec::new();
            match head {
                None => {
                    batch.append_statement(
                        "UPDATE snapshots SET head_version = ? WHERE aggregate_id = ? IF head_version = null",
                    );
                    values.push(vec![CqlValue::BigInt(snapshot_version), CqlValue::Uuid(aggregate_id)]);
                }
                Some(current) => {
                    batch.append_statement(
                        "UPDATE snapshots SET head_version = ? WHERE aggregate_id = ? IF head_version = ?",
                    );
                    values.push(vec![
                        CqlValue::BigInt(snapshot_version),
                        CqlValue::Uuid(aggregate_id),
                        CqlValue::BigInt(current),
                    ]);
                }
            }
            batch.append_statement(
                "INSERT INTO snapshots (aggregate_id, snapshot_version, aggregate_type, state, \
                 last_event_sequence, taken_at, metadata) VALUES (?, ?, ?, ?, ?, ?, ?)",
            );
            values.push(vec![
                CqlValue::Uuid(aggregate_id),
                CqlValue::BigInt(snapshot_version),
                CqlValue::Text(aggregate_type.to_string()),
                CqlValue::Text(state.clone()),
                CqlValue::BigInt(last_event_sequence),
                CqlValue::BigInt(Utc::now().timestamp_micros()),
                CqlValue::Text(metadata.clone()),
            ]);

            let result = self
                .session
                .batch(&batch, values)
                .await
                .map_err(SnapshotError::persistence("save"))?;

            let applied = result
                .into_rows_result()
                .ok()
                .and_then(|rows| rows.maybe_first_row::<Row>().ok().flatten())
                .is_some_and(|row| matches!(row.columns.first(), Some(Some(CqlValue::Boolean(true)))));

            if applied {
                tracing::debug!(
                    aggregate_id = %aggregate_id,
                    snapshot_version = snapshot_version,
                    last_event_sequence = last_event_sequence,
                    "Saved snapshot"
                );
                return Ok(snapshot_version);
            }

            tracing::debug!(
                aggregate_id = %aggregate_id,
                attempt = attempt,
                "Snapshot version race, retrying"
            );
        }

        Err(SnapshotError::VersionRace(aggregate_id))
    }

    async fn latest(&self, aggregate_id: Uuid) -> Result<Option<Snapshot>, SnapshotError> {
        Ok(self.select(aggregate_id, Some(1)).await?.into_iter().next())
    }

    async fn list(&self, aggregate_id: Uuid) -> Result<Vec<Snapshot>, SnapshotError> {
        self.select(aggregate_id, None).await
    }

    async fn prune(&self, aggregate_id: Uuid, keep: usize) -> Result<usize, SnapshotError> {
        let snapshots = self.list(aggregate_id).await?;
        let stale: Vec<i64> = snapshots
            .iter()
            .skip(keep)
            .map(|s| s.snapshot_version)
            .collect();
        self.delete_versions(aggregate_id, &stale).await?;

        if !stale.is_empty() {
            tracing::info!(
                aggregate_id = %aggregate_id,
                deleted = stale.len(),
                kept = snapshots.len() - stale.len(),
                "🧹 Pruned snapshots"
            );
        }
        Ok(stale.len())
    }

    async fn delete_all(&self, aggregate_id: Uuid) -> Result<usize, SnapshotError> {
        let versions: Vec<i64> = self
            .list(aggregate_id)
            .await?
            .iter()
            .map(|s| s.snapshot_version)
            .collect();
        // head_version stays so versions keep increasing after a reset
        self.delete_versions(aggregate_id, &versions).await?;
        Ok(versions.len())
    }
}
