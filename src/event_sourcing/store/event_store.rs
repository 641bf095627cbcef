use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::event_sourcing::core::{EventStoreError, RawEvent};

// ============================================================================
// Event Log Store - Append-only, per-aggregate ordered log
// ============================================================================
//
// Contract:
// 1. `append` is ONE atomic compare-and-swap on the aggregate's head sequence.
//    Sequence numbers are assigned by the store: expected_version+1 ..
// 2. `read_range` returns ascending, inclusive bounds
// 3. Time-ordered reads use `EventCursor` as an exclusive start key
// 4. The change feed is split into shards; an aggregate always maps to the
//    same shard, so per-aggregate order is preserved within a shard
//
// ============================================================================

/// Exclusive start key for time-ordered reads.
///
/// Ordering is `(timestamp, aggregate_id, sequence_number)`, which breaks
/// timestamp ties by aggregate id deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventCursor {
    pub timestamp: DateTime<Utc>,
    pub aggregate_id: Uuid,
    pub sequence_number: i64,
}

impl EventCursor {
    /// Positioned just before every event stamped `timestamp`, so reads start inclusively.
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            aggregate_id: Uuid::nil(),
            sequence_number: 0,
        }
    }

    pub fn beginning() -> Self {
        Self::at(DateTime::<Utc>::MIN_UTC)
    }

    pub fn of(event: &RawEvent) -> Self {
        Self {
            timestamp: event.timestamp,
            aggregate_id: event.aggregate_id,
            sequence_number: event.sequence_number,
        }
    }
}

/// Position in one shard of the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeedPosition {
    /// Backend-specific commit order (commit counter in memory, write time in Scylla)
    pub offset: i64,
    pub aggregate_id: Uuid,
    pub sequence_number: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub shard: u32,
    pub position: FeedPosition,
    pub event: RawEvent,
}

/// Shard owning an aggregate's change feed entries.
pub fn shard_for(aggregate_id: Uuid, shard_count: u32) -> u32 {
    (aggregate_id.as_u128() % u128::from(shard_count.max(1))) as u32
}

#[async_trait]
pub trait EventLogStore: Send + Sync {
    /// Atomically append `events` if the aggregate's head sequence equals `expected_version`.
    ///
    /// Returns the new head sequence.
    async fn append(
        &self,
        aggregate_id: Uuid,
        aggregate_type: &str,
        expected_version: i64,
        events: Vec<RawEvent>,
    ) -> Result<i64, EventStoreError>;

    /// Events for one aggregate, ascending, `from_sequence..=to_sequence`.
    async fn read_range(
        &self,
        aggregate_id: Uuid,
        from_sequence: i64,
        to_sequence: Option<i64>,
    ) -> Result<Vec<RawEvent>, EventStoreError>;

    /// Events of one type strictly after `after`, in cursor order.
    async fn read_by_type(
        &self,
        event_type: &str,
        after: EventCursor,
        limit: usize,
    ) -> Result<Vec<RawEvent>, EventStoreError>;

    /// Events of one aggregate type strictly after `after`, in cursor order.
    async fn read_by_aggregate_type(
        &self,
        aggregate_type: &str,
        after: EventCursor,
        limit: usize,
    ) -> Result<Vec<RawEvent>, EventStoreError>;

    /// Every aggregate type that has at least one committed event.
    async fn aggregate_types(&self) -> Result<Vec<String>, EventStoreError>;

    /// Highest committed sequence number, 0 for an unknown aggregate.
    async fn current_version(&self, aggregate_id: Uuid) -> Result<i64, EventStoreError>;

    fn shard_count(&self) -> u32;

    /// Next committed changes in `shard` strictly after `after`. Finite per call.
    async fn read_changes(
        &self,
        shard: u32,
        after: Option<FeedPosition>,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, EventStoreError>;
}

struct TailState {
    store: Arc<dyn EventLogStore>,
    shard: u32,
    position: Option<FeedPosition>,
    buffer: VecDeque<ChangeRecord>,
    poll_interval: Duration,
    batch_size: usize,
    idle: bool,
}

/// Infinite, restartable stream over one shard of the change feed.
///
/// Restart by calling again with the last confirmed position. A read failure
/// is yielded as an `Err` item and the stream keeps going from the same
/// position after `poll_interval`.
pub fn tail_changes(
    store: Arc<dyn EventLogStore>,
    shard: u32,
    from: Option<FeedPosition>,
    poll_interval: Duration,
    batch_size: usize,
) -> impl Stream<Item = Result<ChangeRecord, EventStoreError>> + Send {
    let state = TailState {
        store,
        shard,
        position: from,
        buffer: VecDeque::new(),
        poll_interval,
        batch_size: batch_size.max(1),
        idle: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(record) = state.buffer.pop_front() {
                state.position = Some(record.position);
                return Some((Ok(record), state));
            }

            if state.idle {
                tokio::time::sleep(state.poll_interval).await;
            }

            match state
                .store
                .read_changes(state.shard, state.position, state.batch_size)
                .await
            {
                Ok(records) => {
                    state.idle = records.is_empty();
                    state.buffer.extend(records);
                }
                Err(e) => {
                    state.idle = true;
                    return Some((Err(e), state));
                }
            }
        }
    })
}
