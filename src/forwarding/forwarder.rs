use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::checkpoint::CheckpointStore;
use super::pipeline::{PublishOutcome, PublishPipeline};
use super::ForwardingError;
use crate::event_sourcing::core::EventStoreError;
use crate::event_sourcing::store::{tail_changes, ChangeRecord, EventLogStore, FeedPosition};
use crate::metrics::Metrics;

// ============================================================================
// Event Forwarder - one change feed shard -> message bus
// ============================================================================
//
// Cycle: read batch from tail_changes(checkpoint) -> publish each event
// (confirmed) -> persist checkpoint. The checkpoint only ever holds positions
// the bus confirmed (or that were dead-lettered), so a crash re-publishes at
// most the unconfirmed tail of one batch and never skips an event.
//
// Shutdown: stop reading, let the in-flight batch finish (bounded by
// shutdown_timeout), persist the last confirmed position.
//
// ============================================================================

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub forwarder_id: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            forwarder_id: "event-forwarder".to_string(),
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwarderReport {
    pub shard: u32,
    pub forwarded: u64,
    pub dead_lettered: u64,
    pub batches: u64,
    pub position: Option<FeedPosition>,
    /// True when the shutdown timeout cut an in-flight batch short
    pub interrupted: bool,
}

pub struct EventForwarder {
    shard: u32,
    config: ForwarderConfig,
    store: Arc<dyn EventLogStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    pipeline: Arc<PublishPipeline>,
    metrics: Option<Arc<Metrics>>,
}

impl EventForwarder {
    pub fn new(
        shard: u32,
        config: ForwarderConfig,
        store: Arc<dyn EventLogStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        pipeline: Arc<PublishPipeline>,
    ) -> Self {
        Self {
            shard,
            config,
            store,
            checkpoints,
            pipeline,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Forward until `shutdown` flips to true (or its sender is dropped).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<ForwarderReport, ForwardingError> {
        let shard = self.shard;
        if shard >= self.store.shard_count() {
            return Err(EventStoreError::UnknownShard {
                shard,
                shard_count: self.store.shard_count(),
            }
            .into());
        }

        let mut report = ForwarderReport {
            shard,
            position: self.checkpoints.load(&self.config.forwarder_id, shard).await?,
            ..Default::default()
        };

        tracing::info!(
            forwarder_id = %self.config.forwarder_id,
            shard = shard,
            checkpoint = ?report.position,
            "▶️ Forwarder started"
        );

        let batches = tail_changes(
            self.store.clone(),
            shard,
            report.position,
            self.config.poll_interval,
            self.config.batch_size,
        )
        .ready_chunks(self.config.batch_size.max(1));
        tokio::pin!(batches);

        loop {
            let batch = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                next = batches.next() => match next {
                    Some(batch) => batch,
                    None => break,
                },
            };

            let before = report.position;
            let result = {
                let work = self.forward_batch(batch, &mut report);
                tokio::pin!(work);
                let timeout = self.config.shutdown_timeout;
                let deadline = async {
                    shutdown_requested(&mut shutdown).await;
                    tokio::time::sleep(timeout).await;
                };
                tokio::select! {
                    result = &mut work => Some(result),
                    _ = deadline => None,
                }
            };

            match result {
                Some(Ok(())) => {
                    report.batches += 1;
                    if report.position != before {
                        if let Err(e) = self.persist(report.position).await {
                            // Next batch retries; an old checkpoint only means duplicates
                            tracing::warn!(shard = shard, error = %e, "Checkpoint save failed");
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::error!(shard = shard, error = %e, "Forwarder stopped on error");
                    self.persist(report.position).await?;
                    return Err(e);
                }
                None => {
                    report.interrupted = true;
                    tracing::warn!(
                        shard = shard,
                        timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                        "Shutdown timeout hit mid-batch, keeping last confirmed position"
                    );
                    break;
                }
            }
        }

        self.persist(report.position).await?;
        tracing::info!(
            forwarder_id = %self.config.forwarder_id,
            shard = shard,
            forwarded = report.forwarded,
            dead_lettered = report.dead_lettered,
            checkpoint = ?report.position,
            "⏹️ Forwarder stopped"
        );
        Ok(report)
    }

    async fn forward_batch(
        &self,
        batch: Vec<Result<ChangeRecord, EventStoreError>>,
        report: &mut ForwarderReport,
    ) -> Result<(), ForwardingError> {
        for item in batch {
            let record = match item {
                Ok(record) => record,
                Err(e) => {
                    // tail_changes retries the same position itself
                    tracing::warn!(shard = self.shard, error = %e, "Change feed read failed");
                    continue;
                }
            };

            match self.pipeline.publish(&record.event).await? {
                PublishOutcome::Published => report.forwarded += 1,
                PublishOutcome::DeadLettered => report.dead_lettered += 1,
            }
            report.position = Some(record.position);
        }
        Ok(())
    }

    async fn persist(&self, position: Option<FeedPosition>) -> Result<(), ForwardingError> {
        let Some(position) = position else {
            return Ok(());
        };
        self.checkpoints
            .save(&self.config.forwarder_id, self.shard, position)
            .await?;
        if let Some(metrics) = &self.metrics {
            metrics.set_checkpoint(&self.config.forwarder_id, self.shard, position.offset);
        }
        tracing::info!(
            shard = self.shard,
            offset = position.offset,
            aggregate_id = %position.aggregate_id,
            sequence_number = position.sequence_number,
            "Checkpoint advanced"
        );
        Ok(())
    }
}

/// Resolves once shutdown is requested; a dropped sender counts as a request.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
