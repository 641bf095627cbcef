use scylla::client::session::Session;

// ============================================================================
// CQL Schema
// ============================================================================
//
// event_log                 - source of truth, one partition per aggregate.
//                             Static head_sequence is the CAS target.
// events_by_type            - (eventType, day) index, hint rows
// events_by_aggregate_type  - (aggregateType, day) index, hint rows
// event_feed                - (shard, hour) change feed, hint rows
// index_buckets             - which day/hour buckets exist per index key
// aggregate_types           - every aggregate type ever appended
//
// Hint rows are written before the conditional append and verified against
// event_log on read (matching event_id). Timestamps are microseconds (bigint)
// so cursors survive the round trip unchanged. Index clustering uses the
// aggregate id as canonical text, whose lexical order equals UUID byte order.
//
// ============================================================================

pub const EVENT_LOG_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS event_log (
        aggregate_id uuid,
        sequence_number bigint,
        head_sequence bigint static,
        head_feed_at bigint static,
        aggregate_type text static,
        event_id uuid,
        event_type text,
        event_version int,
        event_data text,
        metadata text,
        occurred_at bigint,
        PRIMARY KEY ((aggregate_id), sequence_number)
    ) WITH CLUSTERING ORDER BY (sequence_number ASC)",
    "CREATE TABLE IF NOT EXISTS events_by_type (
        event_type text,
        day bigint,
        occurred_at bigint,
        aggregate_key text,
        sequence_number bigint,
        aggregate_id uuid,
        event_id uuid,
        PRIMARY KEY ((event_type, day), occurred_at, aggregate_key, sequence_number)
    )",
    "CREATE TABLE IF NOT EXISTS events_by_aggregate_type (
        aggregate_type text,
        day bigint,
        occurred_at bigint,
        aggregate_key text,
        sequence_number bigint,
        aggregate_id uuid,
        event_id uuid,
        PRIMARY KEY ((aggregate_type, day), occurred_at, aggregate_key, sequence_number)
    )",
    "CREATE TABLE IF NOT EXISTS event_feed (
        shard int,
        hour bigint,
        written_at bigint,
        aggregate_key text,
        sequence_number bigint,
        aggregate_id uuid,
        event_id uuid,
        PRIMARY KEY ((shard, hour), written_at, aggregate_key, sequence_number)
    )",
    "CREATE TABLE IF NOT EXISTS index_buckets (
        index_name text,
        index_key text,
        bucket bigint,
        PRIMARY KEY ((index_name, index_key), bucket)
    )",
    "CREATE TABLE IF NOT EXISTS aggregate_types (
        scope text,
        aggregate_type text,
        PRIMARY KEY ((scope), aggregate_type)
    )",
];

pub const SNAPSHOT_TABLES: &[&str] = &["CREATE TABLE IF NOT EXISTS snapshots (
        aggregate_id uuid,
        snapshot_version bigint,
        head_version bigint static,
        aggregate_type text,
        state text,
        last_event_sequence bigint,
        taken_at bigint,
        metadata text,
        PRIMARY KEY ((aggregate_id), snapshot_version)
    ) WITH CLUSTERING ORDER BY (snapshot_version DESC)"];

pub const CHECKPOINT_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS forwarder_checkpoints (
        forwarder_id text,
        shard int,
        feed_offset bigint,
        aggregate_id uuid,
        sequence_number bigint,
        updated_at timestamp,
        PRIMARY KEY ((forwarder_id), shard)
    )",
    "CREATE TABLE IF NOT EXISTS projection_checkpoints (
        projection_name text PRIMARY KEY,
        occurred_at bigint,
        aggregate_id uuid,
        sequence_number bigint,
        events_processed bigint,
        delivered map<uuid, bigint>,
        updated_at timestamp
    )",
];

pub const DEAD_LETTER_TABLES: &[&str] = &["CREATE TABLE IF NOT EXISTS dead_letters (
        id uuid PRIMARY KEY,
        aggregate_id uuid,
        aggregate_type text,
        event_type text,
        sequence_number bigint,
        topic text,
        payload text,
        error_message text,
        failure_count int,
        first_failed_at timestamp,
        last_failed_at timestamp
    )"];

pub const MICROS_PER_HOUR: i64 = 3_600_000_000;
pub const MICROS_PER_DAY: i64 = 24 * MICROS_PER_HOUR;

/// Create the keyspace (if missing), switch to it and create every table.
pub async fn create_schema(
    session: &Session,
    keyspace: &str,
    replication_factor: u32,
) -> anyhow::Result<()> {
    session
        .query_unpaged(
            format!(
                "CREATE KEYSPACE IF NOT EXISTS {keyspace} WITH REPLICATION = \
                 {{'class': 'SimpleStrategy', 'replication_factor': {replication_factor}}}"
            ),
            &[],
        )
        .await?;
    session.use_keyspace(keyspace, false).await?;

    let tables = EVENT_LOG_TABLES
        .iter()
        .chain(SNAPSHOT_TABLES)
        .chain(CHECKPOINT_TABLES)
        .chain(DEAD_LETTER_TABLES);
    for ddl in tables {
        session.query_unpaged(*ddl, &[]).await?;
    }

    tracing::info!(keyspace = %keyspace, "✅ Schema ready");
    Ok(())
}
