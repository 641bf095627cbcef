use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::checkpoint::CheckpointStore;
use super::forwarder::{EventForwarder, ForwarderConfig, ForwarderReport};
use super::pipeline::PublishPipeline;
use super::ForwardingError;
use crate::event_sourcing::store::EventLogStore;
use crate::metrics::Metrics;

// ============================================================================
// Forwarder Coordinator
// ============================================================================
//
// One forwarder task per change feed shard. Shards are disjoint sets of
// aggregates, so per-aggregate order holds with every shard running in
// parallel. Shutdown is a single watch signal observed by every task.
//
// ============================================================================

pub struct ForwarderCoordinator {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(u32, JoinHandle<Result<ForwarderReport, ForwardingError>>)>,
}

impl ForwarderCoordinator {
    /// Start forwarders for `shards` (every shard of the store when `None`).
    pub fn start(
        store: Arc<dyn EventLogStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        pipeline: Arc<PublishPipeline>,
        config: ForwarderConfig,
        shards: Option<Vec<u32>>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let shards = shards.unwrap_or_else(|| (0..store.shard_count()).collect());

        let tasks = shards
            .into_iter()
            .map(|shard| {
                let mut forwarder = EventForwarder::new(
                    shard,
                    config.clone(),
                    store.clone(),
                    checkpoints.clone(),
                    pipeline.clone(),
                );
                if let Some(metrics) = &metrics {
                    forwarder = forwarder.with_metrics(metrics.clone());
                }
                (shard, tokio::spawn(forwarder.run(shutdown.subscribe())))
            })
            .collect::<Vec<_>>();

        tracing::info!(
            forwarder_id = %config.forwarder_id,
            shards = tasks.len(),
            "🚀 Forwarder coordinator started"
        );
        Self { shutdown, tasks }
    }

    pub fn shard_count(&self) -> usize {
        self.tasks.len()
    }

    /// Signal every shard, then wait for each to persist its final checkpoint.
    pub async fn shutdown(self) -> Vec<Result<ForwarderReport, ForwardingError>> {
        tracing::info!(shards = self.tasks.len(), "Stopping forwarders");
        self.shutdown.send_replace(true);

        let mut reports = Vec::with_capacity(self.tasks.len());
        for (shard, task) in self.tasks {
            let report = match task.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(shard = shard, error = %e, "Forwarder task panicked or was cancelled");
                    Err(ForwardingError::TaskFailed { shard, reason: e.to_string() })
                }
            };
            reports.push(report);
        }
        reports
    }
}
