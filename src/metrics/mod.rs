mod server;

use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::sync::Arc;

use crate::utils::{CircuitState, StateObserver};

pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Provides metrics for:
// - Event log appends and concurrency conflicts
// - Snapshot saves and (ignored) failures
// - Replay jobs and progress
// - Forwarding throughput, publish failures, checkpoint positions
// - Retry attempts, Dead Letter Queue, circuit breaker transitions
//
// All metrics are registered with Prometheus and can be scraped via /metrics
// ============================================================================

/// Central metrics registry for the entire application
pub struct Metrics {
    registry: Registry,

    // Write path
    pub events_appended: IntCounterVec,
    pub append_conflicts: IntCounterVec,
    pub append_duration: HistogramVec,

    // Snapshots
    pub snapshots_saved: IntCounterVec,
    pub snapshot_failures: IntCounterVec,

    // Replay
    pub replay_events: IntCounterVec,
    pub replay_jobs: IntCounterVec,

    // Forwarding
    pub events_forwarded: IntCounterVec,
    pub publish_failures: IntCounterVec,
    pub forward_duration: HistogramVec,
    pub checkpoint_offset: IntGaugeVec,

    // Retry Metrics
    pub retry_attempts_total: IntCounterVec,

    // DLQ Metrics
    pub dlq_messages_total: IntCounter,
    pub dlq_messages_by_event_type: IntCounterVec,

    // Circuit Breaker Metrics
    pub circuit_breaker_state: IntGaugeVec,
    pub circuit_breaker_transitions: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let events_appended = IntCounterVec::new(
            Opts::new("events_appended_total", "Events committed to the event log"),
            &["aggregate_type"],
        )?;
        registry.register(Box::new(events_appended.clone()))?;

        let append_conflicts = IntCounterVec::new(
            Opts::new("append_conflicts_total", "Appends rejected by the expected-version check"),
            &["aggregate_type"],
        )?;
        registry.register(Box::new(append_conflicts.clone()))?;

        let append_duration = HistogramVec::new(
            HistogramOpts::new("append_duration_seconds", "Conditional append latency")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["aggregate_type"],
        )?;
        registry.register(Box::new(append_duration.clone()))?;

        let snapshots_saved = IntCounterVec::new(
            Opts::new("snapshots_saved_total", "Snapshots written"),
            &["aggregate_type"],
        )?;
        registry.register(Box::new(snapshots_saved.clone()))?;

        let snapshot_failures = IntCounterVec::new(
            Opts::new("snapshot_failures_total", "Snapshot saves that failed and were ignored"),
            &["aggregate_type"],
        )?;
        registry.register(Box::new(snapshot_failures.clone()))?;

        let replay_events = IntCounterVec::new(
            Opts::new("replay_events_total", "Events handled by replay jobs"),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(replay_events.clone()))?;

        let replay_jobs = IntCounterVec::new(
            Opts::new("replay_jobs_total", "Finished replay jobs"),
            &["kind", "status"],
        )?;
        registry.register(Box::new(replay_jobs.clone()))?;

        let events_forwarded = IntCounterVec::new(
            Opts::new("events_forwarded_total", "Events confirmed by the message bus"),
            &["event_type"],
        )?;
        registry.register(Box::new(events_forwarded.clone()))?;

        let publish_failures = IntCounterVec::new(
            Opts::new("publish_failures_total", "Failed publish attempts"),
            &["kind"],
        )?;
        registry.register(Box::new(publish_failures.clone()))?;

        let forward_duration = HistogramVec::new(
            HistogramOpts::new("forward_duration_seconds", "Time from feed read to bus confirmation")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["event_type"],
        )?;
        registry.register(Box::new(forward_duration.clone()))?;

        let checkpoint_offset = IntGaugeVec::new(
            Opts::new("forwarder_checkpoint_offset", "Last persisted change feed offset"),
            &["forwarder_id", "shard"],
        )?;
        registry.register(Box::new(checkpoint_offset.clone()))?;

        let retry_attempts_total = IntCounterVec::new(
            Opts::new("retry_attempts_total", "Total retry attempts"),
            &["operation"],
        )?;
        registry.register(Box::new(retry_attempts_total.clone()))?;

        let dlq_messages_total = IntCounter::new("dlq_messages_total", "Total messages in dead letter queue")?;
        registry.register(Box::new(dlq_messages_total.clone()))?;

        let dlq_messages_by_event_type = IntCounterVec::new(
            Opts::new("dlq_messages_by_event_type", "DLQ messages by event type"),
            &["event_type"],
        )?;
        registry.register(Box::new(dlq_messages_by_event_type.clone()))?;

        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new("circuit_breaker_state", "Circuit breaker state (0=Closed, 1=HalfOpen, 2=Open)"),
            &["breaker"],
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        let circuit_breaker_transitions = IntCounterVec::new(
            Opts::new("circuit_breaker_transitions_total", "Circuit breaker state transitions"),
            &["breaker", "to_state"],
        )?;
        registry.register(Box::new(circuit_breaker_transitions.clone()))?;

        Ok(Self {
            registry,
            events_appended,
            append_conflicts,
            append_duration,
            snapshots_saved,
            snapshot_failures,
            replay_events,
            replay_jobs,
            events_forwarded,
            publish_failures,
            forward_duration,
            checkpoint_offset,
            retry_attempts_total,
            dlq_messages_total,
            dlq_messages_by_event_type,
            circuit_breaker_state,
            circuit_breaker_transitions,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_append(&self, aggregate_type: &str, event_count: usize, duration_secs: f64) {
        self.events_appended
            .with_label_values(&[aggregate_type])
            .inc_by(event_count as u64);
        self.append_duration.with_label_values(&[aggregate_type]).observe(duration_secs);
    }

    pub fn record_conflict(&self, aggregate_type: &str) {
        self.append_conflicts.with_label_values(&[aggregate_type]).inc();
    }

    pub fn record_snapshot(&self, aggregate_type: &str, success: bool) {
        if success {
            self.snapshots_saved.with_label_values(&[aggregate_type]).inc();
        } else {
            self.snapshot_failures.with_label_values(&[aggregate_type]).inc();
        }
    }

    pub fn record_replay_events(&self, kind: &str, processed: u64, skipped: u64) {
        self.replay_events.with_label_values(&[kind, "processed"]).inc_by(processed);
        self.replay_events.with_label_values(&[kind, "skipped"]).inc_by(skipped);
    }

    pub fn record_replay_job(&self, kind: &str, status: &str) {
        self.replay_jobs.with_label_values(&[kind, status]).inc();
    }

    pub fn record_forwarded(&self, event_type: &str, duration_secs: f64) {
        self.events_forwarded.with_label_values(&[event_type]).inc();
        self.forward_duration.with_label_values(&[event_type]).observe(duration_secs);
    }

    pub fn record_publish_failure(&self, kind: &str) {
        self.publish_failures.with_label_values(&[kind]).inc();
    }

    pub fn set_checkpoint(&self, forwarder_id: &str, shard: u32, offset: i64) {
        self.checkpoint_offset
            .with_label_values(&[forwarder_id, &shard.to_string()])
            .set(offset);
    }

    /// Helper to record retry attempt
    pub fn record_retry_attempt(&self, operation: &str) {
        self.retry_attempts_total.with_label_values(&[operation]).inc();
    }

    /// Helper to record DLQ message
    pub fn record_dlq_message(&self, event_type: &str) {
        self.dlq_messages_total.inc();
        self.dlq_messages_by_event_type.with_label_values(&[event_type]).inc();
    }

    pub fn record_circuit_breaker_state(&self, breaker: &str, state: CircuitState) {
        self.circuit_breaker_state
            .with_label_values(&[breaker])
            .set(state.as_gauge());
        self.circuit_breaker_transitions
            .with_label_values(&[breaker, state.as_str()])
            .inc();
    }

    /// Observer to hand to `CircuitBreaker::with_observer`.
    pub fn circuit_breaker_observer(self: &Arc<Self>, breaker: &str) -> StateObserver {
        let metrics = self.clone();
        let breaker = breaker.to_string();
        Arc::new(move |state| metrics.record_circuit_breaker_state(&breaker, state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(metrics: &Metrics, name: &str) -> f64 {
        metrics
            .registry()
            .gather()
            .iter()
            .find(|m| m.name() == name)
            .map(|m| m.metric.iter().map(|x| x.counter.value.unwrap_or(0.0)).sum())
            .unwrap_or(0.0)
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_dlq_message("ItemCreated");
        assert!(!metrics.registry().gather().is_empty());
    }

    #[test]
    fn test_record_append_counts_events() {
        let metrics = Metrics::new().unwrap();
        metrics.record_append("InventoryItem", 3, 0.002);
        metrics.record_append("InventoryItem", 1, 0.001);
        metrics.record_conflict("InventoryItem");

        assert_eq!(counter(&metrics, "events_appended_total"), 4.0);
        assert_eq!(counter(&metrics, "append_conflicts_total"), 1.0);
    }

    #[test]
    fn test_record_dlq_message() {
        let metrics = Metrics::new().unwrap();
        metrics.record_dlq_message("ItemCreated");
        metrics.record_dlq_message("StockChanged");
        assert_eq!(counter(&metrics, "dlq_messages_total"), 2.0);
    }

    #[test]
    fn test_circuit_breaker_observer_updates_gauge() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let observer = metrics.circuit_breaker_observer("redpanda");
        observer(CircuitState::Open);

        let gathered = metrics.registry().gather();
        let state = gathered.iter().find(|m| m.name() == "circuit_breaker_state").unwrap();
        assert_eq!(state.metric[0].gauge.value, Some(2.0));
        assert_eq!(counter(&metrics, "circuit_breaker_transitions_total"), 1.0);
    }
}
