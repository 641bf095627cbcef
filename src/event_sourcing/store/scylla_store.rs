use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures_util::TryStreamExt;
use scylla::client::session::Session;
use scylla::statement::batch::{Batch, BatchType};
use scylla::value::{CqlValue, Row};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use super::event_store::{shard_for, ChangeRecord, EventCursor, EventLogStore, FeedPosition};
use super::memory::validate_append;
use super::schema::{MICROS_PER_DAY, MICROS_PER_HOUR};
use crate::event_sourcing::core::{EventMetadata, EventStoreError, RawEvent};

// ============================================================================
// ScyllaDB Event Log
// ============================================================================
//
// Write path (one aggregate):
// 1. Read the static head (feed ordering + aggregate type check)
// 2. Write hint rows (indexes, feed, buckets) in one UNLOGGED batch
// 3. ONE conditional single-partition batch on event_log:
//      UPDATE head_sequence = new IF head_sequence = expected
//      INSERT each event row
//    The version check and the write are the same LWT. Step 1 only fails
//    fast on an obviously stale version; the LWT is the authority.
//
// Read path: hint rows are only trusted once the matching event_log row
// (same event_id) is visible. Hints of a lost CAS are orphans and skipped.
//
// Feed offsets (written_at) and the reader's horizon both come from cluster
// time (`now()` on the coordinator), never from the writer host's clock. A
// reader trusts rows older than `settle_window`; that is safe while
//   coordinator clock skew + hint batch latency < settle_window
// The writer enforces the latency half: if the hint batch took longer than
// `hint_deadline` it gives up before the LWT, leaving only orphans behind.
// The LWT itself must land within `orphan_grace` of the hints.
//
// ============================================================================

const INDEX_BY_TYPE: &str = "type";
const INDEX_BY_AGGREGATE_TYPE: &str = "aggregate_type";
const INDEX_FEED: &str = "feed";
const AGGREGATE_TYPES_SCOPE: &str = "all";
const PAGE_SIZE: i32 = 500;

const SELECT_EVENTS: &str = "SELECT sequence_number, event_id, event_type, event_version, event_data, \
     metadata, occurred_at, aggregate_type FROM event_log \
     WHERE aggregate_id = ? AND sequence_number >= ? AND sequence_number <= ?";

type EventRow = (i64, Uuid, String, i32, String, String, i64, Option<String>);
type HintRow = (i64, String, i64, Uuid, Uuid);

#[derive(Debug, Clone)]
pub struct ScyllaEventStoreConfig {
    pub shard_count: u32,
    /// Feed rows younger than this are not read yet
    pub settle_window: Duration,
    /// A feed hint with no visible log row is held back until it is this old
    pub orphan_grace: Duration,
    /// Longest a hint batch may take before the append is abandoned; must be
    /// below `settle_window` with room for coordinator clock skew
    pub hint_deadline: Duration,
}

impl Default for ScyllaEventStoreConfig {
    fn default() -> Self {
        Self {
            shard_count: 4,
            settle_window: Duration::seconds(2),
            orphan_grace: Duration::seconds(30),
            hint_deadline: Duration::seconds(1),
        }
    }
}

pub struct ScyllaEventStore {
    session: Arc<Session>,
    config: ScyllaEventStoreConfig,
}

fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(us: i64) -> Result<DateTime<Utc>, EventStoreError> {
    DateTime::from_timestamp_micros(us)
        .ok_or_else(|| EventStoreError::persistence("decode timestamp")(format!("timestamp {us} out of range")))
}

/// First feed offset of an append: cluster time, but strictly after the
/// aggregate's previous offset so feed order follows sequence order.
fn feed_offset(cluster_now: DateTime<Utc>, head_feed_at: i64) -> i64 {
    micros(cluster_now).max(head_feed_at + 1)
}

/// Newest feed offset a reader may trust at `cluster_now`.
fn feed_horizon(cluster_now: DateTime<Utc>, settle_window: Duration) -> i64 {
    micros(cluster_now) - settle_window.num_microseconds().unwrap_or(0)
}

fn within(elapsed: std::time::Duration, limit: Duration) -> bool {
    limit.to_std().is_ok_and(|limit| elapsed < limit)
}

fn index_table(index_name: &str) -> &'static str {
    match index_name {
        INDEX_BY_TYPE => "events_by_type",
        _ => "events_by_aggregate_type",
    }
}

fn index_key_column(index_name: &str) -> &'static str {
    match index_name {
        INDEX_BY_TYPE => "event_type",
        _ => "aggregate_type",
    }
}

impl ScyllaEventStore {
    pub fn new(session: Arc<Session>, config: ScyllaEventStoreConfig) -> Self {
        Self { session, config }
    }

    /// Coordinator wall clock.
    async fn cluster_now(&self) -> Result<DateTime<Utc>, EventStoreError> {
        let result = self
            .session
            .query_unpaged("SELECT toUnixTimestamp(now()) FROM system.local", ())
            .await
            .map_err(EventStoreError::persistence("read cluster time"))?;
        let rows = result
            .into_rows_result()
            .map_err(EventStoreError::persistence("read cluster time"))?;
        let (millis,) = rows
            .first_row::<(i64,)>()
            .map_err(EventStoreError::persistence("read cluster time"))?;
        DateTime::from_timestamp_millis(millis).ok_or_else(|| {
            EventStoreError::persistence("read cluster time")(format!("timestamp {millis} out of range"))
        })
    }

    async fn head(&self, aggregate_id: Uuid) -> Result<Option<(i64, i64, Option<String>)>, EventStoreError> {
        let result = self
            .session
            .query_unpaged(
                "SELECT head_sequence, head_feed_at, aggregate_type FROM event_log WHERE aggregate_id = ? LIMIT 1",
                (aggregate_id,),
            )
            .await
            .map_err(EventStoreError::persistence("read head"))?;

        let rows = result
            .into_rows_result()
            .map_err(EventStoreError::persistence("read head"))?;
        let head = rows
            .maybe_first_row::<(Option<i64>, Option<i64>, Option<String>)>()
            .map_err(EventStoreError::persistence("read head"))?;

        Ok(head.and_then(|(sequence, feed_at, aggregate_type)| {
            sequence.map(|s| (s, feed_at.unwrap_or(0), aggregate_type))
        }))
    }

    fn decode_row(aggregate_id: Uuid, row: EventRow) -> Result<RawEvent, EventStoreError> {
        let (sequence_number, event_id, event_type, event_version, event_data, metadata, occurred_at, aggregate_type) =
            row;
        let metadata: EventMetadata = serde_json::from_str(&metadata)?;
        Ok(RawEvent {
            event_id,
            aggregate_id,
            aggregate_type: aggregate_type.unwrap_or_default(),
            sequence_number,
            event_type,
            event_version,
            event_data: serde_json::from_str(&event_data)?,
            metadata,
            timestamp: from_micros(occurred_at)?,
        })
    }

    /// The committed event at `(aggregate_id, sequence_number)`, if any.
    async fn event_at(&self, aggregate_id: Uuid, sequence_number: i64) -> Result<Option<RawEvent>, EventStoreError> {
        let result = self
            .session
            .query_unpaged(SELECT_EVENTS, (aggregate_id, sequence_number, sequence_number))
            .await
            .map_err(EventStoreError::persistence("verify hint"))?;
        let rows = result
            .into_rows_result()
            .map_err(EventStoreError::persistence("verify hint"))?;
        match rows
            .maybe_first_row::<EventRow>()
            .map_err(EventStoreError::persistence("verify hint"))?
        {
            Some(row) => Ok(Some(Self::decode_row(aggregate_id, row)?)),
            None => Ok(None),
        }
    }

    async fn buckets(&self, index_name: &str, index_key: &str, from_bucket: i64) -> Result<Vec<i64>, EventStoreError> {
        let result = self
            .session
            .query_unpaged(
                "SELECT bucket FROM index_buckets WHERE index_name = ? AND index_key = ? AND bucket >= ?",
                (index_name, index_key, from_bucket),
            )
            .await
            .map_err(EventStoreError::persistence("read buckets"))?;
        let rows = result
            .into_rows_result()
            .map_err(EventStoreError::persistence("read buckets"))?;

        let mut buckets = Vec::new();
        for row in rows.rows::<(i64,)>().map_err(EventStoreError::persistence("read buckets"))? {
            let (bucket,) = row.map_err(EventStoreError::persistence("read buckets"))?;
            buckets.push(bucket);
        }
        buckets.sort_unstable();
        Ok(buckets)
    }

    async fn hint_page(
        &self,
        cql: &str,
        partition: (CqlValue, i64),
        after: (i64, String, i64),
    ) -> Result<Vec<HintRow>, EventStoreError> {
        let (key, bucket) = partition;
        let (ts, aggregate_key, sequence_number) = after;
        let result = self
            .session
            .query_unpaged(cql, (key, bucket, ts, aggregate_key, sequence_number, PAGE_SIZE))
            .await
            .map_err(EventStoreError::persistence("read hints"))?;
        let rows = result
            .into_rows_result()
            .map_err(EventStoreError::persistence("read hints"))?;

        let mut hints = Vec::new();
        for row in rows.rows::<HintRow>().map_err(EventStoreError::persistence("read hints"))? {
            hints.push(row.map_err(EventStoreError::persistence("read hints"))?);
        }
        Ok(hints)
    }

    async fn read_index(
        &self,
        index_name: &str,
        index_key: &str,
        after: EventCursor,
        limit: usize,
    ) -> Result<Vec<RawEvent>, EventStoreError> {
        let cql = format!(
            "SELECT occurred_at, aggregate_key, sequence_number, aggregate_id, event_id FROM {} \
             WHERE {} = ? AND day = ? AND (occurred_at, aggregate_key, sequence_number) > (?, ?, ?) LIMIT ?",
            index_table(index_name),
            index_key_column(index_name),
        );

        let start = micros(after.timestamp);
        let mut out = Vec::new();
        if limit == 0 {
            return Ok(out);
        }

        for day in self.buckets(index_name, index_key, start.div_euclid(MICROS_PER_DAY)).await? {
            let mut position = (start, after.aggregate_id.to_string(), after.sequence_number);
            loop {
                let hints = self
                    .hint_page(&cql, (CqlValue::Text(index_key.to_string()), day), position.clone())
                    .await?;
                let page_len = hints.len();

                for (occurred_at, aggregate_key, sequence_number, aggregate_id, event_id) in hints {
                    position = (occurred_at, aggregate_key, sequence_number);
                    match self.event_at(aggregate_id, sequence_number).await? {
                        Some(event) if event.event_id == event_id => {
                            out.push(event);
                            if out.len() >= limit {
                                return Ok(out);
                            }
                        }
                        _ => {
                            tracing::trace!(
                                aggregate_id = %aggregate_id,
                                sequence_number = sequence_number,
                                index = index_name,
                                "Skipping unverified index hint"
                            );
                        }
                    }
                }

                if page_len < PAGE_SIZE as usize {
                    break;
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl EventLogStore for ScyllaEventStore {
    async fn append(
        &self,
        aggregate_id: Uuid,
        aggregate_type: &str,
        expected_version: i64,
        events: Vec<RawEvent>,
    ) -> Result<i64, EventStoreError> {
        validate_append(aggregate_id, aggregate_type, expected_version, &events)?;

        let head = self.head(aggregate_id).await?;
        let (head_sequence, head_feed_at) = match &head {
            Some((sequence, feed_at, stored_type)) => {
                if let Some(stored_type) = stored_type {
                    if stored_type != aggregate_type {
                        return Err(EventStoreError::InvalidAppend(format!(
                            "aggregate {aggregate_id} is a {stored_type}, not a {aggregate_type}"
                        )));
                    }
                }
                (*sequence, *feed_at)
            }
            None => (0, 0),
        };
        if head_sequence != expected_version {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected: expected_version,
                actual: head_sequence,
            });
        }

        let started = Instant::now();
        let first_written_at = feed_offset(self.cluster_now().await?, head_feed_at);
        let shard = shard_for(aggregate_id, self.config.shard_count) as i32;
        let aggregate_key = aggregate_id.to_string();

        let mut hints = Batch::new(BatchType::Unlogged);
        let mut hint_values: Vec<Vec<CqlValue>> = Vec::new();
        let mut log = Batch::default();
        let mut log_values: Vec<Vec<CqlValue>> = Vec::new();

        let new_version = expected_version + events.len() as i64;
        let last_written_at = first_written_at + events.len() as i64 - 1;
        if expected_version == 0 {
            log.append_statement(
                "UPDATE event_log SET head_sequence = ?, head_feed_at = ?, aggregate_type = ? \
                 WHERE aggregate_id = ? IF head_sequence = null",
            );
            log_values.push(vec![
                CqlValue::BigInt(new_version),
                CqlValue::BigInt(last_written_at),
                CqlValue::Text(aggregate_type.to_string()),
                CqlValue::Uuid(aggregate_id),
            ]);
        } else {
            log.append_statement(
                "UPDATE event_log SET head_sequence = ?, head_feed_at = ?, aggregate_type = ? \
                 WHERE aggregate_id = ? IF head_sequence = ?",
            );
            log_values.push(vec![
                CqlValue::BigInt(new_version),
                CqlValue::BigInt(last_written_at),
                CqlValue::Text(aggregate_type.to_string()),
                CqlValue::Uuid(aggregate_id),
                CqlValue::BigInt(expected_version),
            ]);
        }

        hints.append_statement("INSERT INTO aggregate_types (scope, aggregate_type) VALUES (?, ?)");
        hint_values.push(vec![
            CqlValue::Text(AGGREGATE_TYPES_SCOPE.to_string()),
            CqlValue::Text(aggregate_type.to_string()),
        ]);

        for (i, event) in events.iter().enumerate() {
            let sequence_number = expected_version + 1 + i as i64;
            let occurred_at = micros(event.timestamp);
            let written_at = first_written_at + i as i64;
            let day = occurred_at.div_euclid(MICROS_PER_DAY);
            let hour = written_at.div_euclid(MICROS_PER_HOUR);

            for (index_name, index_key) in [(INDEX_BY_TYPE, &event.event_type), (INDEX_BY_AGGREGATE_TYPE, &event.aggregate_type)] {
                hints.append_statement(
                    format!(
                        "INSERT INTO {} ({}, day, occurred_at, aggregate_key, sequence_number, aggregate_id, event_id) \
                         VALUES (?, ?, ?, ?, ?, ?, ?)",
                        index_table(index_name),
                        index_key_column(index_name)
                    )
                    .as_str(),
                );
                hint_values.push(vec![
                    CqlValue::Text(index_key.clone()),
                    CqlValue::BigInt(day),
                    CqlValue::BigInt(occurred_at),
                    CqlValue::Text(aggregate_key.clone()),
                    CqlValue::BigInt(sequence_number),
                    CqlValue::Uuid(aggregate_id),
                    CqlValue::Uuid(event.event_id),
                ]);
                hints.append_statement("INSERT INTO index_buckets (index_name, index_key, bucket) VALUES (?, ?, ?)");
                hint_values.push(vec![
                    CqlValue::Text(index_name.to_string()),
                    CqlValue::Text(index_key.clone()),
                    CqlValue::BigInt(day),
                ]);
            }

            hints.append_statement(
                "INSERT INTO event_feed (shard, hour, written_at, aggregate_key, sequence_number, aggregate_id, event_id) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            );
            hint_values.push(vec![
                CqlValue::Int(shard),
                CqlValue::BigInt(hour),
                CqlValue::BigInt(written_at),
                CqlValue::Text(aggregate_key.clone()),
                CqlValue::BigInt(sequence_number),
                CqlValue::Uuid(aggregate_id),
                CqlValue::Uuid(event.event_id),
            ]);
            hints.append_statement("INSERT INTO index_buckets (index_name, index_key, bucket) VALUES (?, ?, ?)");
            hint_values.push(vec![
                CqlValue::Text(INDEX_FEED.to_string()),
                CqlValue::Text(shard.to_string()),
                CqlValue::BigInt(hour),
            ]);

            log.append_statement(
                "INSERT INTO event_log (aggregate_id, sequence_number, event_id, event_type, event_version, \
                 event_data, metadata, occurred_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            );
            log_values.push(vec![
                CqlValue::Uuid(aggregate_id),
                CqlValue::BigInt(sequence_number),
                CqlValue::Uuid(event.event_id),
                CqlValue::Text(event.event_type.clone()),
                CqlValue::Int(event.event_version),
                CqlValue::Text(serde_json::to_string(&event.event_data)?),
                CqlValue::Text(serde_json::to_string(&event.metadata)?),
                CqlValue::BigInt(occurred_at),
            ]);
        }

        self.session
            .batch(&hints, hint_values)
            .await
            .map_err(EventStoreError::persistence("write hints"))?;

        let hint_latency = started.elapsed();
        if !within(hint_latency, self.config.hint_deadline) {
            tracing::warn!(
                aggregate_id = %aggregate_id,
                hint_latency_ms = hint_latency.as_millis() as u64,
                "Hint batch too slow, abandoning append before commit"
            );
            return Err(EventStoreError::persistence("write hints")(format!(
                "hint batch took {}ms, over the {}ms deadline",
                hint_latency.as_millis(),
                self.config.hint_deadline.num_milliseconds()
            )));
        }

        let result = self
            .session
            .batch(&log, log_values)
            .await
            .map_err(EventStoreError::persistence("append"))?;

        let applied = result
            .into_rows_result()
            .ok()
            .and_then(|rows| rows.maybe_first_row::<Row>().ok().flatten())
            .and_then(|row| match row.columns.first() {
                Some(Some(CqlValue::Boolean(applied))) => Some(*applied),
                _ => None,
            })
            .unwrap_or(false);

        if !applied {
            let actual = self.current_version(aggregate_id).await?;
            tracing::debug!(
                aggregate_id = %aggregate_id,
                expected = expected_version,
                actual = actual,
                "Conditional append not applied"
            );
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected: expected_version,
                actual,
            });
        }

        if !within(started.elapsed(), self.config.orphan_grace) {
            tracing::error!(
                aggregate_id = %aggregate_id,
                new_version = new_version,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Append committed after the orphan grace period; feed readers may have skipped it"
            );
        }

        tracing::info!(
            aggregate_id = %aggregate_id,
            aggregate_type = %aggregate_type,
            new_version = new_version,
            event_count = events.len(),
            "✅ Appended events to event log"
        );

        Ok(new_version)
    }

    async fn read_range(
        &self,
        aggregate_id: Uuid,
        from_sequence: i64,
        to_sequence: Option<i64>,
    ) -> Result<Vec<RawEvent>, EventStoreError> {
        let mut rows = self
            .session
            .query_iter(
                SELECT_EVENTS,
                (aggregate_id, from_sequence.max(1), to_sequence.unwrap_or(i64::MAX)),
            )
            .await
            .map_err(EventStoreError::persistence("read range"))?
            .rows_stream::<EventRow>()
            .map_err(EventStoreError::persistence("read range"))?;

        let mut events = Vec::new();
        while let Some(row) = rows
            .try_next()
            .await
            .map_err(EventStoreError::persistence("read range"))?
        {
            events.push(Self::decode_row(aggregate_id, row)?);
        }

        tracing::debug!(
            aggregate_id = %aggregate_id,
            from_sequence = from_sequence,
            event_count = events.len(),
            "Loaded event range"
        );
        Ok(events)
    }

    async fn read_by_type(
        &self,
        event_type: &str,
        after: EventCursor,
        limit: usize,
    ) -> Result<Vec<RawEvent>, EventStoreError> {
        self.read_index(INDEX_BY_TYPE, event_type, after, limit).await
    }

    async fn read_by_aggregate_type(
        &self,
        aggregate_type: &str,
        after: EventCursor,
        limit: usize,
    ) -> Result<Vec<RawEvent>, EventStoreError> {
        self.read_index(INDEX_BY_AGGREGATE_TYPE, aggregate_type, after, limit).await
    }

    async fn aggregate_types(&self) -> Result<Vec<String>, EventStoreError> {
        let result = self
            .session
            .query_unpaged(
                "SELECT aggregate_type FROM aggregate_types WHERE scope = ?",
                (AGGREGATE_TYPES_SCOPE,),
            )
            .await
            .map_err(EventStoreError::persistence("list aggregate types"))?;
        let rows = result
            .into_rows_result()
            .map_err(EventStoreError::persistence("list aggregate types"))?;

        let mut types = Vec::new();
        for row in rows
            .rows::<(String,)>()
            .map_err(EventStoreError::persistence("list aggregate types"))?
        {
            types.push(row.map_err(EventStoreError::persistence("list aggregate types"))?.0);
        }
        Ok(types)
    }

    async fn current_version(&self, aggregate_id: Uuid) -> Result<i64, EventStoreError> {
        Ok(self.head(aggregate_id).await?.map(|(sequence, _, _)| sequence).unwrap_or(0))
    }

    fn shard_count(&self) -> u32 {
        self.config.shard_count
    }

    async fn read_changes(
        &self,
        shard: u32,
        after: Option<FeedPosition>,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, EventStoreError> {
        if shard >= self.config.shard_count {
            return Err(EventStoreError::UnknownShard {
                shard,
                shard_count: self.config.shard_count,
            });
        }

        let cluster_now = self.cluster_now().await?;
        let now = micros(cluster_now);
        let horizon = feed_horizon(cluster_now, self.config.settle_window);
        let grace = self.config.orphan_grace.num_microseconds().unwrap_or(0);
        let shard_key = shard.to_string();

        let (start_offset, start_key, start_sequence) = match after {
            Some(p) => (p.offset, p.aggregate_id.to_string(), p.sequence_number),
            None => (i64::MIN, String::new(), 0),
        };
        let from_bucket = if after.is_some() {
            start_offset.div_euclid(MICROS_PER_HOUR)
        } else {
            i64::MIN
        };

        let cql = "SELECT written_at, aggregate_key, sequence_number, aggregate_id, event_id FROM event_feed \
                   WHERE shard = ? AND hour = ? AND (written_at, aggregate_key, sequence_number) > (?, ?, ?) LIMIT ?";

        let mut out = Vec::new();
        for hour in self.buckets(INDEX_FEED, &shard_key, from_bucket).await? {
            if hour > horizon.div_euclid(MICROS_PER_HOUR) {
                break;
            }
            let mut position = (start_offset, start_key.clone(), start_sequence);
            loop {
                let hints = self
                    .hint_page(cql, (CqlValue::Int(shard as i32), hour), position.clone())
                    .await?;
                let page_len = hints.len();

                for (written_at, aggregate_key, sequence_number, aggregate_id, event_id) in hints {
                    if written_at > horizon {
                        return Ok(out);
                    }
                    position = (written_at, aggregate_key, sequence_number);

                    match self.event_at(aggregate_id, sequence_number).await? {
                        Some(event) if event.event_id == event_id => {
                            out.push(ChangeRecord {
                                shard,
                                position: FeedPosition {
                                    offset: written_at,
                                    aggregate_id,
                                    sequence_number,
                                },
                                event,
                            });
                            if out.len() >= limit {
                                return Ok(out);
                            }
                        }
                        Some(_) => {
                            tracing::debug!(
                                aggregate_id = %aggregate_id,
                                sequence_number = sequence_number,
                                "Skipping orphaned feed hint (lost append race)"
                            );
                        }
                        None if now - written_at < grace => {
                            // Append may still be in flight; never skip past it
                            return Ok(out);
                        }
                        None => {
                            tracing::warn!(
                                aggregate_id = %aggregate_id,
                                sequence_number = sequence_number,
                                shard = shard,
                                "Skipping feed hint with no committed event after grace period"
                            );
                        }
                    }
                }

                if page_len < PAGE_SIZE as usize {
                    break;
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_micros_round_trip() {
        let ts = DateTime::from_timestamp_micros(1_700_000_000_123_456).unwrap();
        assert_eq!(from_micros(micros(ts)).unwrap(), ts);
    }

    #[test]
    fn test_aggregate_key_text_order_matches_uuid_order() {
        let mut ids: Vec<Uuid> = (0..50).map(|_| Uuid::new_v4()).collect();
        let mut keys: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        ids.sort();
        keys.sort();
        let sorted: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_index_tables() {
        assert_eq!(index_table(INDEX_BY_TYPE), "events_by_type");
        assert_eq!(index_key_column(INDEX_BY_AGGREGATE_TYPE), "aggregate_type");
    }

    #[test]
    fn test_default_config_holds_back_fresh_feed_rows() {
        let config = ScyllaEventStoreConfig::default();
        assert!(config.hint_deadline < config.settle_window);
        assert!(config.settle_window < config.orphan_grace);
    }

    #[test]
    fn test_feed_offset_follows_cluster_time_and_never_goes_back() {
        let now = DateTime::from_timestamp_micros(1_700_000_000_000_000).unwrap();
        assert_eq!(feed_offset(now, 0), micros(now));

        // previous append came through a coordinator running ahead
        let ahead = micros(now) + 5_000;
        assert_eq!(feed_offset(now, ahead), ahead + 1);
    }

    #[test]
    fn test_hint_written_within_deadline_is_behind_no_horizon() {
        let config = ScyllaEventStoreConfig::default();
        let taken = DateTime::from_timestamp_micros(1_700_000_000_000_000).unwrap();
        let written_at = feed_offset(taken, 0);

        // the slowest accepted hint batch lands just before the deadline
        let landed = taken + config.hint_deadline - Duration::milliseconds(1);
        assert!(within(
            (config.hint_deadline - Duration::milliseconds(1)).to_std().unwrap(),
            config.hint_deadline
        ));
        // no reader at or before that moment has passed it
        assert!(feed_horizon(landed, config.settle_window) < written_at);
        // with up to settle_window - hint_deadline of coordinator skew
        let skew = config.settle_window - config.hint_deadline - Duration::milliseconds(1);
        assert!(feed_horizon(landed + skew, config.settle_window) < written_at);
    }

    #[test]
    fn test_slow_hint_batch_is_rejected() {
        let deadline = Duration::seconds(1);
        assert!(within(std::time::Duration::from_millis(999), deadline));
        assert!(!within(std::time::Duration::from_millis(1000), deadline));
        assert!(!within(std::time::Duration::from_secs(3), deadline));
        assert!(!within(std::time::Duration::ZERO, Duration::seconds(-1)));
    }
}
