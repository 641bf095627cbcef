use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::event_sourcing::core::{EventStoreError, RawEvent};
use crate::event_sourcing::store::{EventCursor, EventLogStore};

// ============================================================================
// Merged Event Reader
// ============================================================================
//
// Each index (one event type or one aggregate type) is already sorted by
// cursor. The reader keeps one page per index and always yields the smallest
// head, so the merged stream is in (timestamp, aggregate_id, sequence) order.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventSource {
    EventType(String),
    AggregateType(String),
}

struct Lane {
    source: EventSource,
    after: EventCursor,
    buffer: VecDeque<RawEvent>,
    exhausted: bool,
}

pub struct MergedEventReader {
    store: Arc<dyn EventLogStore>,
    lanes: Vec<Lane>,
    page_size: usize,
    until: Option<DateTime<Utc>>,
    last: Option<EventCursor>,
}

impl MergedEventReader {
    /// Read every source strictly after `after`.
    pub fn new(store: Arc<dyn EventLogStore>, sources: Vec<EventSource>, after: EventCursor, page_size: usize) -> Self {
        let lanes = sources
            .into_iter()
            .map(|source| Lane {
                source,
                after,
                buffer: VecDeque::new(),
                exhausted: false,
            })
            .collect();
        Self {
            store,
            lanes,
            page_size: page_size.max(1),
            until: None,
            last: None,
        }
    }

    /// Stop after events stamped `until` (inclusive).
    pub fn until(mut self, until: Option<DateTime<Utc>>) -> Self {
        self.until = until;
        self
    }

    /// Up to `max` events in cursor order; empty once every source is drained.
    pub async fn next_batch(&mut self, max: usize) -> Result<Vec<RawEvent>, EventStoreError> {
        let mut batch = Vec::with_capacity(max.min(self.page_size));
        while batch.len() < max.max(1) {
            self.fill().await?;

            let next = self
                .lanes
                .iter()
                .enumerate()
                .filter_map(|(i, lane)| lane.buffer.front().map(|event| (EventCursor::of(event), i)))
                .min();
            let Some((cursor, lane)) = next else {
                break;
            };

            let Some(event) = self.lanes[lane].buffer.pop_front() else {
                break;
            };
            if self.last == Some(cursor) {
                continue;
            }
            self.last = Some(cursor);
            batch.push(event);
        }
        Ok(batch)
    }

    async fn fill(&mut self) -> Result<(), EventStoreError> {
        for lane in self.lanes.iter_mut() {
            if !lane.buffer.is_empty() || lane.exhausted {
                continue;
            }

            let page = match &lane.source {
                EventSource::EventType(event_type) => {
                    self.store.read_by_type(event_type, lane.after, self.page_size).await?
                }
                EventSource::AggregateType(aggregate_type) => {
                    self.store
                        .read_by_aggregate_type(aggregate_type, lane.after, self.page_size)
                        .await?
                }
            };

            lane.exhausted = page.len() < self.page_size;
            if let Some(last) = page.last() {
                lane.after = EventCursor::of(last);
            }
            for event in page {
                if self.until.is_some_and(|until| event.timestamp > until) {
                    lane.exhausted = true;
                    break;
                }
                lane.buffer.push_back(event);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::{EventEnvelope, EventMetadata};
    use crate::event_sourcing::store::InMemoryEventStore;
    use chrono::Duration;
    use serde_json::json;
    use uuid::Uuid;

    fn event(id: Uuid, aggregate_type: &str, event_type: &str, at: DateTime<Utc>) -> RawEvent {
        EventEnvelope::new(id, aggregate_type, event_type, 1, json!({}), EventMetadata::default()).with_timestamp(at)
    }

    #[tokio::test]
    async fn test_merges_sources_in_cursor_order() {
        let store = Arc::new(InMemoryEventStore::new());
        let base = Utc::now();
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);

        store
            .append(a, "Item", 0, vec![
                event(a, "Item", "Created", base),
                event(a, "Item", "Changed", base + Duration::seconds(2)),
            ])
            .await
            .unwrap();
        store
            .append(b, "Order", 0, vec![
                event(b, "Order", "Placed", base),
                event(b, "Order", "Shipped", base + Duration::seconds(1)),
            ])
            .await
            .unwrap();

        let mut reader = MergedEventReader::new(
            store,
            vec![EventSource::AggregateType("Order".into()), EventSource::AggregateType("Item".into())],
            EventCursor::beginning(),
            1,
        );
        let batch = reader.next_batch(10).await.unwrap();
        let order: Vec<(&str, Uuid)> = batch.iter().map(|e| (e.event_type.as_str(), e.aggregate_id)).collect();

        // equal timestamps tie-break on aggregate id
        assert_eq!(order, vec![("Created", a), ("Placed", b), ("Shipped", b), ("Changed", a)]);
        assert!(reader.next_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_until_bounds_the_range() {
        let store = Arc::new(InMemoryEventStore::new());
        let base = Utc::now();
        let id = Uuid::new_v4();
        let events = (0..5).map(|i| event(id, "Item", "Changed", base + Duration::seconds(i))).collect();
        store.append(id, "Item", 0, events).await.unwrap();

        let mut reader = MergedEventReader::new(
            store,
            vec![EventSource::EventType("Changed".into())],
            EventCursor::at(base + Duration::seconds(1)),
            2,
        )
        .until(Some(base + Duration::seconds(3)));

        let mut seen = Vec::new();
        loop {
            let batch = reader.next_batch(2).await.unwrap();
            if batch.is_empty() {
                break;
            }
            seen.extend(batch.into_iter().map(|e| e.sequence_number));
        }
        assert_eq!(seen, vec![2, 3, 4]);
    }
}
