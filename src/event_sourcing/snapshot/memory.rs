use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Snapshot, SnapshotStore};
use crate::event_sourcing::core::SnapshotError;

/// Snapshots per aggregate, kept in ascending `snapshot_version` order.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<Uuid, Vec<Snapshot>>>,
    fail_saves: AtomicBool,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` fail (exercises failure-tolerant snapshotting).
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub async fn count(&self, aggregate_id: Uuid) -> usize {
        self.snapshots
            .read()
            .await
            .get(&aggregate_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(
        &self,
        aggregate_id: Uuid,
        aggregate_type: &str,
        state: serde_json::Value,
        last_event_sequence: i64,
        metadata: HashMap<String, String>,
    ) -> Result<i64, SnapshotError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(SnapshotError::persistence("save")("snapshot store unavailable"));
        }

        let mut snapshots = self.snapshots.write().await;
        let history = snapshots.entry(aggregate_id).or_default();
        let snapshot_version = history.last().map(|s| s.snapshot_version + 1).unwrap_or(1);

        history.push(Snapshot {
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
            snapshot_version,
            state,
            last_event_sequence,
            timestamp: Utc::now(),
            metadata,
        });
        Ok(snapshot_version)
    }

    async fn latest(&self, aggregate_id: Uuid) -> Result<Option<Snapshot>, SnapshotError> {
        Ok(self
            .snapshots
            .read()
            .await
            .get(&aggregate_id)
            .and_then(|history| history.last().cloned()))
    }

    async fn list(&self, aggregate_id: Uuid) -> Result<Vec<Snapshot>, SnapshotError> {
        Ok(self
            .snapshots
            .read()
            .await
            .get(&aggregate_id)
            .map(|history| history.iter().rev().cloned().collect())
            .unwrap_or_default())
    }

    async fn prune(&self, aggregate_id: Uuid, keep: usize) -> Result<usize, SnapshotError> {
        let mut snapshots = self.snapshots.write().await;
        let Some(history) = snapshots.get_mut(&aggregate_id) else {
            return Ok(0);
        };
        let excess = history.len().saturating_sub(keep);
        history.drain(..excess);
        Ok(excess)
    }

    async fn delete_all(&self, aggregate_id: Uuid) -> Result<usize, SnapshotError> {
        Ok(self
            .snapshots
            .write()
            .await
            .remove(&aggregate_id)
            .map(|history| history.len())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_snapshot_versions_increase() {
        let store = InMemorySnapshotStore::new();
        let id = Uuid::new_v4();

        assert_eq!(store.save(id, "Item", json!({"n": 1}), 10, HashMap::new()).await.unwrap(), 1);
        assert_eq!(store.save(id, "Item", json!({"n": 2}), 20, HashMap::new()).await.unwrap(), 2);

        let latest = store.latest(id).await.unwrap().unwrap();
        assert_eq!(latest.snapshot_version, 2);
        assert_eq!(latest.last_event_sequence, 20);
        assert!(store.latest(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prune_keeps_newest() {
        let store = InMemorySnapshotStore::new();
        let id = Uuid::new_v4();
        for seq in [10, 20, 30, 40] {
            store.save(id, "Item", json!({}), seq, HashMap::new()).await.unwrap();
        }

        assert_eq!(store.prune(id, 2).await.unwrap(), 2);
        let remaining: Vec<i64> = store.list(id).await.unwrap().iter().map(|s| s.last_event_sequence).collect();
        assert_eq!(remaining, vec![40, 30]);

        assert_eq!(store.prune(id, 5).await.unwrap(), 0);
        assert_eq!(store.count(id).await, 2);
    }

    #[tokio::test]
    async fn test_prune_to_zero_deletes_everything() {
        let store = InMemorySnapshotStore::new();
        let id = Uuid::new_v4();
        for seq in [10, 20, 30] {
            store.save(id, "Item", json!({}), seq, HashMap::new()).await.unwrap();
        }

        assert_eq!(store.prune(id, 0).await.unwrap(), 3);
        assert!(store.latest(id).await.unwrap().is_none());
        assert!(store.list(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_saves_and_delete_all() {
        let store = InMemorySnapshotStore::new();
        let id = Uuid::new_v4();
        store.save(id, "Item", json!({}), 1, HashMap::new()).await.unwrap();

        store.set_fail_saves(true);
        assert!(store.save(id, "Item", json!({}), 2, HashMap::new()).await.is_err());

        assert_eq!(store.delete_all(id).await.unwrap(), 1);
        assert_eq!(store.count(id).await, 0);
    }
}
