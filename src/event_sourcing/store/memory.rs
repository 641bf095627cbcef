use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::event_store::{shard_for, ChangeRecord, EventCursor, EventLogStore, FeedPosition};
use crate::event_sourcing::core::{EventStoreError, RawEvent};

// ============================================================================
// In-Memory Event Log
// ============================================================================
//
// Single write lock = the compare-and-swap. Secondary indexes and the change
// feed are updated under the same lock, so they never disagree with the log.
//
// ============================================================================

#[derive(Default)]
struct AggregateStream {
    aggregate_type: String,
    events: Vec<RawEvent>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<Uuid, AggregateStream>,
    by_type: BTreeMap<(String, EventCursor), ()>,
    by_aggregate_type: BTreeMap<(String, EventCursor), ()>,
    feed: Vec<Vec<FeedPosition>>,
    next_offset: i64,
}

impl Inner {
    fn event_at(&self, aggregate_id: Uuid, sequence_number: i64) -> Option<&RawEvent> {
        let stream = self.streams.get(&aggregate_id)?;
        let index = usize::try_from(sequence_number - 1).ok()?;
        stream.events.get(index)
    }

    fn scan_index(
        &self,
        index: &BTreeMap<(String, EventCursor), ()>,
        key: &str,
        after: EventCursor,
        limit: usize,
    ) -> Vec<RawEvent> {
        index
            .range((Bound::Excluded((key.to_string(), after)), Bound::Unbounded))
            .take_while(|((k, _), _)| k == key)
            .filter_map(|((_, cursor), _)| self.event_at(cursor.aggregate_id, cursor.sequence_number))
            .take(limit)
            .cloned()
            .collect()
    }
}

pub struct InMemoryEventStore {
    inner: RwLock<Inner>,
    shard_count: u32,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::with_shards(1)
    }

    pub fn with_shards(shard_count: u32) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            inner: RwLock::new(Inner {
                feed: vec![Vec::new(); shard_count as usize],
                next_offset: 1,
                ..Inner::default()
            }),
            shard_count,
        }
    }

    /// Total committed events across every aggregate.
    pub async fn event_count(&self) -> usize {
        self.inner.read().await.streams.values().map(|s| s.events.len()).sum()
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn validate_append(
    aggregate_id: Uuid,
    aggregate_type: &str,
    expected_version: i64,
    events: &[RawEvent],
) -> Result<(), EventStoreError> {
    if events.is_empty() {
        return Err(EventStoreError::InvalidAppend("cannot append an empty event list".into()));
    }
    if expected_version < 0 {
        return Err(EventStoreError::InvalidAppend(format!(
            "expected version must not be negative, got {expected_version}"
        )));
    }
    if let Some(foreign) = events
        .iter()
        .find(|e| e.aggregate_id != aggregate_id || e.aggregate_type != aggregate_type)
    {
        return Err(EventStoreError::InvalidAppend(format!(
            "event {} belongs to {} {}, not {} {}",
            foreign.event_id, foreign.aggregate_type, foreign.aggregate_id, aggregate_type, aggregate_id
        )));
    }
    Ok(())
}

#[async_trait]
impl EventLogStore for InMemoryEventStore {
    async fn append(
        &self,
        aggregate_id: Uuid,
        aggregate_type: &str,
        expected_version: i64,
        events: Vec<RawEvent>,
    ) -> Result<i64, EventStoreError> {
        validate_append(aggregate_id, aggregate_type, expected_version, &events)?;

        let mut inner = self.inner.write().await;

        let current = inner
            .streams
            .get(&aggregate_id)
            .map(|s| s.events.len() as i64)
            .unwrap_or(0);
        if current != expected_version {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected: expected_version,
                actual: current,
            });
        }
        if let Some(stream) = inner.streams.get(&aggregate_id) {
            if stream.aggregate_type != aggregate_type {
                return Err(EventStoreError::InvalidAppend(format!(
                    "aggregate {aggregate_id} is a {}, not a {aggregate_type}",
                    stream.aggregate_type
                )));
            }
        }

        let shard = shard_for(aggregate_id, self.shard_count) as usize;
        let event_count = events.len();
        let mut version = expected_version;

        for mut event in events {
            version += 1;
            event.sequence_number = version;
            let cursor = EventCursor::of(&event);

            inner.by_type.insert((event.event_type.clone(), cursor), ());
            inner.by_aggregate_type.insert((aggregate_type.to_string(), cursor), ());

            let offset = inner.next_offset;
            inner.next_offset += 1;
            inner.feed[shard].push(FeedPosition {
                offset,
                aggregate_id,
                sequence_number: version,
            });

            inner
                .streams
                .entry(aggregate_id)
                .or_insert_with(|| AggregateStream {
                    aggregate_type: aggregate_type.to_string(),
                    events: Vec::new(),
                })
                .events
                .push(event);
        }

        tracing::debug!(
            aggregate_id = %aggregate_id,
            aggregate_type = %aggregate_type,
            new_version = version,
            event_count = event_count,
            "Appended events to in-memory log"
        );

        Ok(version)
    }

    async fn read_range(
        &self,
        aggregate_id: Uuid,
        from_sequence: i64,
        to_sequence: Option<i64>,
    ) -> Result<Vec<RawEvent>, EventStoreError> {
        let inner = self.inner.read().await;
        let Some(stream) = inner.streams.get(&aggregate_id) else {
            return Ok(Vec::new());
        };

        let from = from_sequence.max(1);
        let to = to_sequence.unwrap_or(i64::MAX);
        Ok(stream
            .events
            .iter()
            .filter(|e| e.sequence_number >= from && e.sequence_number <= to)
            .cloned()
            .collect())
    }

    async fn read_by_type(
        &self,
        event_type: &str,
        after: EventCursor,
        limit: usize,
    ) -> Result<Vec<RawEvent>, EventStoreError> {
        let inner = self.inner.read().await;
        Ok(inner.scan_index(&inner.by_type, event_type, after, limit))
    }

    async fn read_by_aggregate_type(
        &self,
        aggregate_type: &str,
        after: EventCursor,
        limit: usize,
    ) -> Result<Vec<RawEvent>, EventStoreError> {
        let inner = self.inner.read().await;
        Ok(inner.scan_index(&inner.by_aggregate_type, aggregate_type, after, limit))
    }

    async fn aggregate_types(&self) -> Result<Vec<String>, EventStoreError> {
        let inner = self.inner.read().await;
        let mut types: Vec<String> = inner.streams.values().map(|s| s.aggregate_type.clone()).collect();
        types.sort();
        types.dedup();
        Ok(types)
    }

    async fn current_version(&self, aggregate_id: Uuid) -> Result<i64, EventStoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .streams
            .get(&aggregate_id)
            .map(|s| s.events.len() as i64)
            .unwrap_or(0))
    }

    fn shard_count(&self) -> u32 {
        self.shard_count
    }

    async fn read_changes(
        &self,
        shard: u32,
        after: Option<FeedPosition>,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, EventStoreError> {
        let inner = self.inner.read().await;
        let Some(feed) = inner.feed.get(shard as usize) else {
            return Err(EventStoreError::UnknownShard {
                shard,
                shard_count: self.shard_count,
            });
        };

        let start = match after {
            Some(position) => feed.partition_point(|p| *p <= position),
            None => 0,
        };

        Ok(feed[start..]
            .iter()
            .take(limit)
            .filter_map(|position| {
                inner
                    .event_at(position.aggregate_id, position.sequence_number)
                    .map(|event| ChangeRecord {
                        shard,
                        position: *position,
                        event: event.clone(),
                    })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::{EventEnvelope, EventMetadata};
    use crate::event_sourcing::store::tail_changes;
    use chrono::{Duration, Utc};
    use futures_util::StreamExt;
    use serde_json::json;
    use std::sync::Arc;

    fn event(aggregate_id: Uuid, event_type: &str) -> RawEvent {
        EventEnvelope::new(aggregate_id, "Item", event_type, 1, json!({}), EventMetadata::default())
    }

    #[tokio::test]
    async fn test_append_assigns_consecutive_sequence_numbers() {
        let store = InMemoryEventStore::new();
        let id = Uuid::new_v4();

        let v = store.append(id, "Item", 0, vec![event(id, "A"), event(id, "B")]).await.unwrap();
        assert_eq!(v, 2);
        let v = store.append(id, "Item", 2, vec![event(id, "C")]).await.unwrap();
        assert_eq!(v, 3);

        let seqs: Vec<i64> = store
            .read_range(id, 1, None)
            .await
            .unwrap()
            .iter()
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(store.current_version(id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_stale_expected_version_conflicts_and_writes_nothing() {
        let store = InMemoryEventStore::new();
        let id = Uuid::new_v4();
        store.append(id, "Item", 0, vec![event(id, "A")]).await.unwrap();

        let err = store.append(id, "Item", 0, vec![event(id, "B")]).await.unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::ConcurrencyConflict { expected: 0, actual: 1, .. }
        ));
        assert_eq!(store.event_count().await, 1);
        assert_eq!(store.read_by_type("B", EventCursor::beginning(), 10).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_invalid_appends_rejected() {
        let store = InMemoryEventStore::new();
        let id = Uuid::new_v4();

        assert!(matches!(
            store.append(id, "Item", 0, vec![]).await,
            Err(EventStoreError::InvalidAppend(_))
        ));
        assert!(matches!(
            store.append(id, "Item", 0, vec![event(Uuid::new_v4(), "A")]).await,
            Err(EventStoreError::InvalidAppend(_))
        ));
    }

    #[tokio::test]
    async fn test_read_range_bounds_are_inclusive() {
        let store = InMemoryEventStore::new();
        let id = Uuid::new_v4();
        let events = (0..5).map(|_| event(id, "A")).collect();
        store.append(id, "Item", 0, events).await.unwrap();

        let seqs: Vec<i64> = store
            .read_range(id, 2, Some(4))
            .await
            .unwrap()
            .iter()
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert!(store.read_range(Uuid::new_v4(), 1, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_by_type_pages_with_cursor() {
        let store = InMemoryEventStore::new();
        let base = Utc::now();
        for i in 0..5 {
            let id = Uuid::new_v4();
            let e = event(id, "Tick").with_timestamp(base + Duration::seconds(i));
            store.append(id, "Item", 0, vec![e, event(id, "Other")]).await.unwrap();
        }

        let first = store.read_by_type("Tick", EventCursor::beginning(), 3).await.unwrap();
        assert_eq!(first.len(), 3);
        let rest = store
            .read_by_type("Tick", EventCursor::of(&first[2]), 10)
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);
        assert!(rest[0].timestamp > first[2].timestamp);

        let from_third = store
            .read_by_type("Tick", EventCursor::at(base + Duration::seconds(2)), 10)
            .await
            .unwrap();
        assert_eq!(from_third.len(), 3);

        let by_aggregate_type = store
            .read_by_aggregate_type("Item", EventCursor::beginning(), 100)
            .await
            .unwrap();
        assert_eq!(by_aggregate_type.len(), 10);
        assert_eq!(store.aggregate_types().await.unwrap(), vec!["Item".to_string()]);
    }

    #[tokio::test]
    async fn test_change_feed_is_sharded_and_resumable() {
        let store = InMemoryEventStore::with_shards(2);
        let even = Uuid::from_u128(4);
        let odd = Uuid::from_u128(7);
        store.append(even, "Item", 0, vec![event(even, "A"), event(even, "B")]).await.unwrap();
        store.append(odd, "Item", 0, vec![event(odd, "A")]).await.unwrap();

        let shard0 = store.read_changes(0, None, 10).await.unwrap();
        assert_eq!(shard0.len(), 2);
        assert!(shard0.iter().all(|c| c.event.aggregate_id == even));

        let resumed = store.read_changes(0, Some(shard0[0].position), 10).await.unwrap();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].event.sequence_number, 2);

        assert_eq!(store.read_changes(1, None, 10).await.unwrap().len(), 1);
        assert!(store.read_changes(5, None, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_tail_changes_picks_up_new_appends() {
        let store = Arc::new(InMemoryEventStore::new());
        let id = Uuid::new_v4();
        store.append(id, "Item", 0, vec![event(id, "A")]).await.unwrap();

        let dyn_store: Arc<dyn EventLogStore> = store.clone();
        let mut tail = Box::pin(tail_changes(dyn_store, 0, None, std::time::Duration::from_millis(5), 10));

        let first = tail.next().await.unwrap().unwrap();
        assert_eq!(first.event.sequence_number, 1);

        store.append(id, "Item", 1, vec![event(id, "B")]).await.unwrap();
        let second = tokio::time::timeout(std::time::Duration::from_secs(1), tail.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.event.sequence_number, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_at_same_version_admit_exactly_one() {
        let store = Arc::new(InMemoryEventStore::new());
        let id = Uuid::new_v4();
        store.append(id, "Item", 0, vec![event(id, "A")]).await.unwrap();

        let writers: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.append(id, "Item", 1, vec![event(id, "B"), event(id, "C")]).await })
            })
            .collect();

        let mut won = 0;
        let mut conflicted = 0;
        for writer in writers {
            match writer.await.unwrap() {
                Ok(version) => {
                    assert_eq!(version, 3);
                    won += 1;
                }
                Err(EventStoreError::ConcurrencyConflict { expected: 1, actual: 3, .. }) => conflicted += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(won, 1);
        assert_eq!(conflicted, 15);
        assert_eq!(store.current_version(id).await.unwrap(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_appenders_leave_gapless_history() {
        let store = Arc::new(InMemoryEventStore::new());
        let id = Uuid::new_v4();

        let writers: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    for _ in 0..10 {
                        loop {
                            let version = store.current_version(id).await.unwrap();
                            match store.append(id, "Item", version, vec![event(id, "A")]).await {
                                Ok(_) => break,
                                Err(e) if e.is_conflict() => tokio::task::yield_now().await,
                                Err(e) => panic!("unexpected error: {e}"),
                            }
                        }
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let seqs: Vec<i64> = store
            .read_range(id, 1, None)
            .await
            .unwrap()
            .iter()
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(seqs, (1..=80).collect::<Vec<i64>>());
        assert_eq!(store.read_changes(0, None, 1000).await.unwrap().len(), 80);
    }
}
