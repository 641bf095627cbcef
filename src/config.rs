use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

use std::sync::Arc;

use crate::event_sourcing::core::Aggregate;
use crate::event_sourcing::repository::AggregateRepository;
use crate::event_sourcing::snapshot::{SnapshotPolicy, SnapshotStore};
use crate::event_sourcing::store::{EventLogStore, ScyllaEventStoreConfig};
use crate::forwarding::ForwarderConfig;

// ============================================================================
// Application Configuration
// ============================================================================
//
// Read once at startup from EVENTCORE_* environment variables. Unset values
// fall back to the defaults below; a value that is set but does not parse is
// an error, never silently replaced.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub scylla_nodes: Vec<String>,
    pub keyspace: String,
    pub replication_factor: u32,
    pub kafka_brokers: String,
    pub forwarder_id: String,
    /// Change feed shard count of the event log
    pub feed_shards: u32,
    /// Shards this process forwards; None = all of them
    pub shards: Option<Vec<u32>>,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
    pub metrics_port: u16,
    /// 0 disables count-based snapshots
    pub snapshot_every: u64,
    /// None disables time-based snapshots
    pub snapshot_interval: Option<Duration>,
    /// Snapshots kept per aggregate after each new one; None keeps all
    pub snapshot_keep: Option<usize>,
    pub topic_prefix: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scylla_nodes: vec!["127.0.0.1:9042".to_string()],
            keyspace: "event_store".to_string(),
            replication_factor: 1,
            kafka_brokers: "127.0.0.1:9092".to_string(),
            forwarder_id: "event-forwarder".to_string(),
            feed_shards: 4,
            shards: None,
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(10),
            metrics_port: 9090,
            snapshot_every: 100,
            snapshot_interval: None,
            snapshot_keep: Some(3),
            topic_prefix: String::new(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (the environment in production, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let config = Self {
            scylla_nodes: get("EVENTCORE_SCYLLA_NODES")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.scylla_nodes),
            keyspace: get("EVENTCORE_KEYSPACE").unwrap_or(defaults.keyspace),
            replication_factor: parse(&get, "EVENTCORE_REPLICATION_FACTOR")?.unwrap_or(defaults.replication_factor),
            kafka_brokers: get("EVENTCORE_KAFKA_BROKERS").unwrap_or(defaults.kafka_brokers),
            forwarder_id: get("EVENTCORE_FORWARDER_ID").unwrap_or(defaults.forwarder_id),
            feed_shards: parse(&get, "EVENTCORE_FEED_SHARDS")?.unwrap_or(defaults.feed_shards),
            shards: match get("EVENTCORE_SHARDS") {
                Some(raw) => Some(
                    split_list(&raw)
                        .iter()
                        .map(|s| s.parse::<u32>())
                        .collect::<Result<Vec<_>, _>>()
                        .with_context(|| format!("EVENTCORE_SHARDS must be a comma separated list of shard numbers, got {raw:?}"))?,
                ),
                None => defaults.shards,
            },
            batch_size: parse(&get, "EVENTCORE_BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            poll_interval: parse(&get, "EVENTCORE_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            shutdown_timeout: parse(&get, "EVENTCORE_SHUTDOWN_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_timeout),
            metrics_port: parse(&get, "EVENTCORE_METRICS_PORT")?.unwrap_or(defaults.metrics_port),
            snapshot_every: parse(&get, "EVENTCORE_SNAPSHOT_EVERY")?.unwrap_or(defaults.snapshot_every),
            snapshot_interval: parse(&get, "EVENTCORE_SNAPSHOT_INTERVAL_SECS")?
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .or(defaults.snapshot_interval),
            snapshot_keep: match parse::<usize, _>(&get, "EVENTCORE_SNAPSHOT_KEEP")? {
                Some(0) => None,
                Some(keep) => Some(keep),
                None => defaults.snapshot_keep,
            },
            topic_prefix: get("EVENTCORE_TOPIC_PREFIX").unwrap_or(defaults.topic_prefix),
        };

        if config.batch_size == 0 {
            anyhow::bail!("EVENTCORE_BATCH_SIZE must be at least 1");
        }
        if config.feed_shards == 0 {
            anyhow::bail!("EVENTCORE_FEED_SHARDS must be at least 1");
        }
        if let Some(shard) = config.shards.iter().flatten().find(|s| **s >= config.feed_shards) {
            anyhow::bail!("shard {shard} is out of range for {} feed shards", config.feed_shards);
        }
        Ok(config)
    }

    pub fn forwarder_config(&self) -> ForwarderConfig {
        ForwarderConfig {
            forwarder_id: self.forwarder_id.clone(),
            batch_size: self.batch_size,
            poll_interval: self.poll_interval,
            shutdown_timeout: self.shutdown_timeout,
        }
    }

    pub fn event_store_config(&self) -> ScyllaEventStoreConfig {
        ScyllaEventStoreConfig {
            shard_count: self.feed_shards,
            ..Default::default()
        }
    }

    /// Count, time, hybrid or never, depending on which triggers are enabled.
    pub fn snapshot_policy(&self) -> Result<SnapshotPolicy> {
        let interval = self
            .snapshot_interval
            .map(chrono::Duration::from_std)
            .transpose()
            .context("snapshot interval is too large")?;

        Ok(match (self.snapshot_every, interval) {
            (0, None) => SnapshotPolicy::Never,
            (every, None) => SnapshotPolicy::EveryNEvents(every),
            (0, Some(interval)) => SnapshotPolicy::Interval(interval),
            (every, Some(interval)) => SnapshotPolicy::Hybrid { every, interval },
        })
    }

    /// Repository with the configured snapshot policy and retention.
    pub fn aggregate_repository<A: Aggregate>(
        &self,
        events: Arc<dyn EventLogStore>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Result<AggregateRepository<A>> {
        let repository = AggregateRepository::new(events, snapshots, self.snapshot_policy()?);
        Ok(match self.snapshot_keep {
            Some(keep) => repository.with_snapshot_retention(keep),
            None => repository,
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse<T, G>(get: &G, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| raw.parse::<T>().with_context(|| format!("invalid value for {key}: {raw:?}")))
        .transpose()
}
