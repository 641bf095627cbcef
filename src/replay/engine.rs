use chrono::{DateTime, Utc};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use super::job::{CancelSignal, JobRegistry, ReplayJob, ReplayKind};
use super::projection::{Handled, Projection, ProjectionCheckpoint, ProjectionCheckpointStore, ProjectionError};
use super::reader::{EventSource, MergedEventReader};
use super::target::{AggregateFactory, ReplayTarget, RootFactory};
use super::{ReplayError, ReplayOptions, ReplayReport};
use crate::event_sourcing::core::{Aggregate, BoxError, RawEvent, UpcasterRegistry};
use crate::event_sourcing::repository::snapshot_metadata;
use crate::event_sourcing::snapshot::SnapshotStore;
use crate::event_sourcing::store::{EventCursor, EventLogStore};
use crate::forwarding::{CheckpointError, PublishOutcome, PublishPipeline};
use crate::metrics::Metrics;

// ============================================================================
// Replay Engine
// ============================================================================

#[derive(Debug, Clone)]
pub struct TimestampReplayOptions {
    pub from: DateTime<Utc>,
    /// Inclusive upper bound; None = everything committed so far
    pub to: Option<DateTime<Utc>>,
    /// Empty = every aggregate type
    pub aggregate_types: Vec<String>,
    /// Empty = every event type
    pub event_types: Vec<String>,
    pub rebuild_aggregates: bool,
    /// Feed every registered projection interested in the event type
    pub apply_to_projections: bool,
    /// Re-publish through the forwarding pipeline
    pub republish: bool,
    pub options: ReplayOptions,
}

impl TimestampReplayOptions {
    pub fn since(from: DateTime<Utc>) -> Self {
        Self {
            from,
            to: None,
            aggregate_types: Vec::new(),
            event_types: Vec::new(),
            rebuild_aggregates: false,
            apply_to_projections: false,
            republish: false,
            options: ReplayOptions::default(),
        }
    }
}

enum Interrupt {
    Cancelled,
    Failed(BoxError),
}

impl<E> From<E> for Interrupt
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(e: E) -> Self {
        Interrupt::Failed(Box::new(e))
    }
}

/// Highest sequence handled per aggregate.
///
/// The merged read is ordered by writer-set timestamps, so a lower sequence
/// can arrive after a higher one. Anything the reader has not yet yielded
/// below an incoming event is read from the log and handled first.
#[derive(Default)]
struct SequenceTracker {
    delivered: HashMap<Uuid, i64>,
}

#[derive(Debug, PartialEq, Eq)]
enum Admission {
    /// Handled earlier, through a gap read
    Delivered,
    Next,
    /// Sequences `from..=to` must be handled before the event
    Gap { from: i64, to: i64 },
}

impl SequenceTracker {
    fn seeded(delivered: HashMap<Uuid, i64>) -> Self {
        Self { delivered }
    }

    fn admit(&self, event: &RawEvent) -> Admission {
        let last = self.delivered.get(&event.aggregate_id).copied().unwrap_or(0);
        if event.sequence_number <= last {
            tracing::debug!(
                aggregate_id = %event.aggregate_id,
                sequence_number = event.sequence_number,
                last_delivered = last,
                "Event already handled"
            );
            Admission::Delivered
        } else if event.sequence_number == last + 1 {
            Admission::Next
        } else {
            Admission::Gap {
                from: last + 1,
                to: event.sequence_number - 1,
            }
        }
    }

    fn delivered(&mut self, aggregate_id: Uuid, sequence_number: i64) {
        let last = self.delivered.entry(aggregate_id).or_insert(0);
        *last = (*last).max(sequence_number);
    }

    fn positions(&self) -> &HashMap<Uuid, i64> {
        &self.delivered
    }
}

struct RebuiltAggregate {
    aggregate_type: &'static str,
    target: Box<dyn ReplayTarget>,
}

pub struct ReplayEngine {
    events: Arc<dyn EventLogStore>,
    snapshots: Arc<dyn SnapshotStore>,
    projection_checkpoints: Arc<dyn ProjectionCheckpointStore>,
    upcasters: UpcasterRegistry,
    factories: HashMap<&'static str, Arc<dyn AggregateFactory>>,
    projections: HashMap<String, Arc<dyn Projection>>,
    publisher: Option<Arc<PublishPipeline>>,
    metrics: Option<Arc<Metrics>>,
    jobs: JobRegistry,
}

impl ReplayEngine {
    pub fn new(
        events: Arc<dyn EventLogStore>,
        snapshots: Arc<dyn SnapshotStore>,
        projection_checkpoints: Arc<dyn ProjectionCheckpointStore>,
    ) -> Self {
        Self {
            events,
            snapshots,
            projection_checkpoints,
            upcasters: UpcasterRegistry::new(),
            factories: HashMap::new(),
            projections: HashMap::new(),
            publisher: None,
            metrics: None,
            jobs: JobRegistry::new(),
        }
    }

    pub fn with_upcasters(mut self, upcasters: UpcasterRegistry) -> Self {
        self.upcasters = upcasters;
        self
    }

    pub fn register_aggregate<A: Aggregate>(self) -> Self {
        self.register_factory(Arc::new(RootFactory::<A>::default()))
    }

    pub fn register_factory(mut self, factory: Arc<dyn AggregateFactory>) -> Self {
        self.factories.insert(factory.aggregate_type(), factory);
        self
    }

    pub fn register_projection(mut self, projection: Arc<dyn Projection>) -> Self {
        self.projections.insert(projection.name().to_string(), projection);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<PublishPipeline>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn jobs(&self) -> Vec<ReplayJob> {
        self.jobs.list()
    }

    pub fn job(&self, id: Uuid) -> Option<ReplayJob> {
        self.jobs.get(id)
    }

    /// Ask a running job to stop at its next batch boundary.
    pub fn cancel(&self, id: Uuid) -> bool {
        self.jobs.cancel(id)
    }

    // ========================================================================
    // Aggregate replay
    // ========================================================================

    /// Re-apply one aggregate's events (optionally bounded) in sequence order.
    ///
    /// Without `reset_state` or `from_sequence` the replay starts from the
    /// latest snapshot. The rebuilt state is written back as a fresh snapshot
    /// unless `dry_run` or the range skipped a prefix of the history.
    pub async fn replay_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: Uuid,
        options: ReplayOptions,
    ) -> Result<ReplayReport, ReplayError> {
        let factory = self
            .factories
            .get(aggregate_type)
            .cloned()
            .ok_or_else(|| ReplayError::UnknownAggregateType(aggregate_type.to_string()))?;

        let (job_id, cancel) = self.jobs.create(
            ReplayKind::Aggregate,
            format!("{aggregate_type}/{aggregate_id}"),
            options.cancel.clone(),
        );
        self.jobs.start(job_id);
        tracing::info!(
            job_id = %job_id,
            aggregate_type = %aggregate_type,
            aggregate_id = %aggregate_id,
            reset_state = options.reset_state,
            dry_run = options.dry_run,
            "🔁 Aggregate replay started"
        );

        let mut report = ReplayReport::new(job_id, ReplayKind::Aggregate, options.dry_run);
        let outcome = self
            .run_aggregate_replay(factory.as_ref(), aggregate_id, &options, &cancel, &mut report)
            .await;
        self.finish(report, &options, outcome)
    }

    async fn run_aggregate_replay(
        &self,
        factory: &dyn AggregateFactory,
        aggregate_id: Uuid,
        options: &ReplayOptions,
        cancel: &CancelSignal,
        report: &mut ReplayReport,
    ) -> Result<(), Interrupt> {
        if options.reset_state && !options.dry_run {
            let deleted = self.snapshots.delete_all(aggregate_id).await?;
            tracing::info!(aggregate_id = %aggregate_id, deleted = deleted, "Cleared snapshots before replay");
        }

        let mut target = match (options.reset_state, options.from_sequence) {
            (false, None) => self.restore(factory, aggregate_id, options.to_sequence).await,
            _ => factory.create(aggregate_id),
        };
        let base_version = target.version();
        let mut next = options.from_sequence.unwrap_or(base_version + 1).max(1);
        // Starting past version+1 leaves a hole in the state
        let complete_prefix = next <= base_version + 1;
        let batch_size = options.batch_size.max(1) as i64;

        loop {
            if cancel.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }

            let upper = match options.to_sequence {
                Some(to) => (next + batch_size - 1).min(to),
                None => next + batch_size - 1,
            };
            if upper < next {
                break;
            }

            let batch = self.events.read_range(aggregate_id, next, Some(upper)).await?;
            let Some(last_sequence) = batch.last().map(|e| e.sequence_number) else {
                break;
            };
            let drained = (batch.len() as i64) < upper - next + 1;

            for event in &batch {
                let known = if options.dry_run {
                    target.check(event, &self.upcasters)?
                } else {
                    target.apply(event, &self.upcasters)?
                };
                if known {
                    report.processed += 1;
                } else {
                    report.skipped += 1;
                    if options.dry_run {
                        tracing::warn!(
                            aggregate_id = %aggregate_id,
                            event_type = %event.event_type,
                            sequence_number = event.sequence_number,
                            "Unrecognized event type (dry run)"
                        );
                    }
                }
                report.last_sequence = event.sequence_number;
                report.last_cursor = Some(EventCursor::of(event));
            }

            self.batch_done(report, options);
            next = last_sequence + 1;
            if drained {
                break;
            }
        }

        if !options.dry_run {
            report.aggregates_rebuilt = 1;
            let advanced = target.version() > base_version || options.reset_state;
            if complete_prefix && advanced && target.version() > 0 {
                self.write_snapshot(factory.aggregate_type(), target.as_ref()).await;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Projection rebuild
    // ========================================================================

    /// Stream the projection's event types in cursor order into its handler.
    ///
    /// With `reset_state` the projection and its checkpoint are cleared
    /// first; otherwise the rebuild resumes after the last checkpoint.
    pub async fn rebuild_projection(&self, name: &str, options: ReplayOptions) -> Result<ReplayReport, ReplayError> {
        let projection = self
            .projections
            .get(name)
            .cloned()
            .ok_or_else(|| ReplayError::UnknownProjection(name.to_string()))?;

        let (job_id, cancel) = self
            .jobs
            .create(ReplayKind::Projection, name.to_string(), options.cancel.clone());
        self.jobs.start(job_id);
        tracing::info!(
            job_id = %job_id,
            projection = %name,
            reset_state = options.reset_state,
            dry_run = options.dry_run,
            "🔁 Projection rebuild started"
        );

        let mut report = ReplayReport::new(job_id, ReplayKind::Projection, options.dry_run);
        let outcome = self
            .run_projection_rebuild(projection.as_ref(), &options, &cancel, &mut report)
            .await;
        self.finish(report, &options, outcome)
    }

    async fn run_projection_rebuild(
        &self,
        projection: &dyn Projection,
        options: &ReplayOptions,
        cancel: &CancelSignal,
        report: &mut ReplayReport,
    ) -> Result<(), Interrupt> {
        let name = projection.name();
        let mut after = EventCursor::beginning();
        let mut total = 0u64;
        let mut tracker = SequenceTracker::default();

        if options.reset_state {
            if !options.dry_run {
                projection.reset().await?;
                self.projection_checkpoints.clear(name).await?;
                tracing::info!(projection = %name, "Projection state cleared");
            }
        } else if let Some(checkpoint) = self.projection_checkpoints.load(name).await? {
            tracing::info!(
                projection = %name,
                events_processed = checkpoint.events_processed,
                cursor = ?checkpoint.cursor,
                "Resuming projection rebuild from checkpoint"
            );
            after = checkpoint.cursor;
            total = checkpoint.events_processed;
            tracker = SequenceTracker::seeded(checkpoint.delivered);
        }

        let interest = projection.interested_event_types();
        let mut event_types: Vec<String> = interest.iter().cloned().collect();
        event_types.sort();
        let sources = event_types.into_iter().map(EventSource::EventType).collect();
        let mut reader = MergedEventReader::new(self.events.clone(), sources, after, options.batch_size);
        let checkpoint_every = options.checkpoint_every.max(1);
        let mut since_checkpoint = 0u64;

        loop {
            if cancel.is_cancelled() {
                if !options.dry_run {
                    self.checkpoint_quietly(name, report.last_cursor, total, &tracker).await;
                }
                return Err(Interrupt::Cancelled);
            }

            let batch = reader.next_batch(options.batch_size).await?;
            if batch.is_empty() {
                break;
            }

            for event in batch {
                let cursor = EventCursor::of(&event);
                let earlier = match tracker.admit(&event) {
                    Admission::Delivered => {
                        report.last_cursor = Some(cursor);
                        continue;
                    }
                    Admission::Next => Vec::new(),
                    Admission::Gap { from, to } => {
                        let mut gap = self.events.read_range(event.aggregate_id, from, Some(to)).await?;
                        gap.retain(|e| interest.contains(&e.event_type));
                        gap
                    }
                };

                for item in earlier.iter().chain(std::iter::once(&event)) {
                    if let Err(e) = self.project(projection, item, options.dry_run, report).await {
                        if !options.dry_run {
                            self.checkpoint_quietly(name, report.last_cursor, total, &tracker).await;
                        }
                        return Err(e.into());
                    }
                    tracker.delivered(item.aggregate_id, item.sequence_number);
                    total += 1;
                    since_checkpoint += 1;
                }
                report.last_cursor = Some(cursor);

                if since_checkpoint >= checkpoint_every && !options.dry_run {
                    self.checkpoint_quietly(name, report.last_cursor, total, &tracker).await;
                    since_checkpoint = 0;
                }
            }

            self.batch_done(report, options);
        }

        if !options.dry_run {
            self.save_checkpoint(name, report.last_cursor, total, &tracker).await?;
        }
        Ok(())
    }

    async fn project(
        &self,
        projection: &dyn Projection,
        event: &RawEvent,
        dry_run: bool,
        report: &mut ReplayReport,
    ) -> Result<(), ProjectionError> {
        let handled = if dry_run {
            Handled::Applied
        } else {
            projection.handle_event(&event.upcast(&self.upcasters)).await?
        };

        match handled {
            Handled::Applied => report.processed += 1,
            Handled::Unrecognized => {
                report.skipped += 1;
                tracing::warn!(
                    projection = %projection.name(),
                    event_type = %event.event_type,
                    event_version = event.event_version,
                    "Projection skipped unrecognized event"
                );
            }
        }
        Ok(())
    }

    async fn save_checkpoint(
        &self,
        name: &str,
        cursor: Option<EventCursor>,
        events_processed: u64,
        tracker: &SequenceTracker,
    ) -> Result<(), CheckpointError> {
        let Some(cursor) = cursor else {
            return Ok(());
        };
        self.projection_checkpoints
            .save(&ProjectionCheckpoint {
                projection_name: name.to_string(),
                cursor,
                events_processed,
                delivered: tracker.positions().clone(),
                updated_at: Utc::now(),
            })
            .await?;
        tracing::debug!(projection = %name, events_processed = events_processed, "Projection checkpoint saved");
        Ok(())
    }

    // A lost intermediate checkpoint only means re-handling events on resume
    async fn checkpoint_quietly(
        &self,
        name: &str,
        cursor: Option<EventCursor>,
        events_processed: u64,
        tracker: &SequenceTracker,
    ) {
        if let Err(e) = self.save_checkpoint(name, cursor, events_processed, tracker).await {
            tracing::warn!(projection = %name, error = %e, "Projection checkpoint save failed");
        }
    }

    // ========================================================================
    // Platform-wide replay
    // ========================================================================

    /// Replay every matching event from a timestamp, merged across indexes
    /// in `(timestamp, aggregate_id, sequence_number)` order.
    pub async fn replay_from_timestamp(&self, request: TimestampReplayOptions) -> Result<ReplayReport, ReplayError> {
        if request.republish && self.publisher.is_none() {
            return Err(ReplayError::PublisherNotConfigured);
        }
        if request.rebuild_aggregates {
            if let Some(unknown) = request
                .aggregate_types
                .iter()
                .find(|t| !self.factories.contains_key(t.as_str()))
            {
                return Err(ReplayError::UnknownAggregateType(unknown.clone()));
            }
        }

        let range = format!(
            "{}..{}",
            request.from.to_rfc3339(),
            request.to.map(|t| t.to_rfc3339()).unwrap_or_else(|| "now".to_string())
        );
        let (job_id, cancel) = self
            .jobs
            .create(ReplayKind::Timestamp, range.clone(), request.options.cancel.clone());
        self.jobs.start(job_id);
        tracing::info!(
            job_id = %job_id,
            range = %range,
            rebuild_aggregates = request.rebuild_aggregates,
            apply_to_projections = request.apply_to_projections,
            republish = request.republish,
            dry_run = request.options.dry_run,
            "🔁 Timestamp replay started"
        );

        let mut report = ReplayReport::new(job_id, ReplayKind::Timestamp, request.options.dry_run);
        let outcome = self.run_timestamp_replay(&request, &cancel, &mut report).await;
        self.finish(report, &request.options, outcome)
    }

    async fn run_timestamp_replay(
        &self,
        request: &TimestampReplayOptions,
        cancel: &CancelSignal,
        report: &mut ReplayReport,
    ) -> Result<(), Interrupt> {
        let options = &request.options;
        let dry_run = options.dry_run;

        let sources = self.timestamp_sources(request).await?;
        let aggregate_filter: HashSet<&str> = request.aggregate_types.iter().map(String::as_str).collect();

        let mut projections: Vec<(&Arc<dyn Projection>, HashSet<String>)> = Vec::new();
        if request.apply_to_projections {
            let mut names: Vec<&String> = self.projections.keys().collect();
            names.sort();
            for name in names {
                if let Some(projection) = self.projections.get(name) {
                    projections.push((projection, projection.interested_event_types()));
                }
            }
        }

        let mut reader = MergedEventReader::new(
            self.events.clone(),
            sources,
            EventCursor::at(request.from),
            options.batch_size,
        )
        .until(request.to);
        let mut tracker = SequenceTracker::default();
        let mut rebuilt: HashMap<Uuid, RebuiltAggregate> = HashMap::new();
        let window = EventCursor::at(request.from);
        let event_filter: HashSet<&str> = request.event_types.iter().map(String::as_str).collect();

        loop {
            if cancel.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }

            let batch = reader.next_batch(options.batch_size).await?;
            if batch.is_empty() {
                break;
            }

            for event in batch {
                report.last_cursor = Some(EventCursor::of(&event));
                if !aggregate_filter.is_empty() && !aggregate_filter.contains(event.aggregate_type.as_str()) {
                    continue;
                }

                let earlier = match tracker.admit(&event) {
                    Admission::Delivered => continue,
                    Admission::Next => Vec::new(),
                    Admission::Gap { from, to } => {
                        let mut gap = self.events.read_range(event.aggregate_id, from, Some(to)).await?;
                        gap.retain(|e| {
                            EventCursor::of(e) > window
                                && request.to.map_or(true, |to| e.timestamp <= to)
                                && (event_filter.is_empty() || event_filter.contains(e.event_type.as_str()))
                        });
                        gap
                    }
                };

                for item in earlier.iter().chain(std::iter::once(&event)) {
                    self.replay_event(item, request, &projections, &mut rebuilt, report).await?;
                    tracker.delivered(item.aggregate_id, item.sequence_number);
                }
            }

            self.batch_done(report, options);
        }

        if request.rebuild_aggregates && !dry_run {
            for aggregate in rebuilt.values() {
                self.write_snapshot(aggregate.aggregate_type, aggregate.target.as_ref()).await;
            }
            report.aggregates_rebuilt = rebuilt.len() as u64;
        }
        Ok(())
    }

    async fn replay_event(
        &self,
        event: &RawEvent,
        request: &TimestampReplayOptions,
        projections: &[(&Arc<dyn Projection>, HashSet<String>)],
        rebuilt: &mut HashMap<Uuid, RebuiltAggregate>,
        report: &mut ReplayReport,
    ) -> Result<(), Interrupt> {
        let dry_run = request.options.dry_run;
        let mut delivered = false;
        let mut unrecognized = false;

        if request.rebuild_aggregates {
            match self.aggregate_for(rebuilt, event, dry_run).await? {
                Some(aggregate) => {
                    let known = if dry_run {
                        aggregate.target.check(event, &self.upcasters)?
                    } else if event.sequence_number > aggregate.target.version() {
                        aggregate.target.apply(event, &self.upcasters)?
                    } else {
                        true
                    };
                    delivered |= known;
                    unrecognized |= !known;
                }
                None => tracing::warn!(
                    aggregate_type = %event.aggregate_type,
                    aggregate_id = %event.aggregate_id,
                    "No aggregate factory registered, event not re-applied"
                ),
            }
        }

        if !projections.is_empty() {
            let upcast = event.upcast(&self.upcasters);
            for (projection, interest) in projections {
                if !interest.contains(&event.event_type) {
                    continue;
                }
                if dry_run {
                    delivered = true;
                    continue;
                }
                match projection.handle_event(&upcast).await? {
                    Handled::Applied => delivered = true,
                    Handled::Unrecognized => unrecognized = true,
                }
            }
        }

        if let (true, Some(publisher)) = (request.republish, &self.publisher) {
            if !dry_run {
                match publisher.publish(event).await? {
                    PublishOutcome::Published => report.republished += 1,
                    PublishOutcome::DeadLettered => report.dead_lettered += 1,
                }
            }
            delivered = true;
        }

        if delivered || !unrecognized {
            report.processed += 1;
        } else {
            report.skipped += 1;
        }
        Ok(())
    }

    async fn timestamp_sources(&self, request: &TimestampReplayOptions) -> Result<Vec<EventSource>, Interrupt> {
        if !request.event_types.is_empty() {
            let mut event_types = request.event_types.clone();
            event_types.sort();
            event_types.dedup();
            return Ok(event_types.into_iter().map(EventSource::EventType).collect());
        }

        let mut aggregate_types = if request.aggregate_types.is_empty() {
            self.events.aggregate_types().await?
        } else {
            request.aggregate_types.clone()
        };
        aggregate_types.sort();
        aggregate_types.dedup();
        Ok(aggregate_types.into_iter().map(EventSource::AggregateType).collect())
    }

    /// Instance for the event's aggregate, brought up to `sequence_number - 1`
    /// on first sight and whenever filtered-out events left a gap.
    async fn aggregate_for<'a>(
        &self,
        rebuilt: &'a mut HashMap<Uuid, RebuiltAggregate>,
        event: &RawEvent,
        dry_run: bool,
    ) -> Result<Option<&'a mut RebuiltAggregate>, Interrupt> {
        let Some(factory) = self.factories.get(event.aggregate_type.as_str()) else {
            return Ok(None);
        };

        let aggregate = match rebuilt.entry(event.aggregate_id) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                let target = if dry_run {
                    factory.create(event.aggregate_id)
                } else {
                    self.restore(factory.as_ref(), event.aggregate_id, Some(event.sequence_number - 1))
                        .await
                };
                slot.insert(RebuiltAggregate {
                    aggregate_type: factory.aggregate_type(),
                    target,
                })
            }
        };

        if !dry_run && event.sequence_number > aggregate.target.version() + 1 {
            let gap = self
                .events
                .read_range(
                    event.aggregate_id,
                    aggregate.target.version() + 1,
                    Some(event.sequence_number - 1),
                )
                .await?;
            for missing in &gap {
                aggregate.target.apply(missing, &self.upcasters)?;
            }
        }
        Ok(Some(aggregate))
    }

    // ========================================================================
    // Shared helpers
    // ========================================================================

    /// Latest usable snapshot at or below `max_sequence`, else the zero state.
    async fn restore(
        &self,
        factory: &dyn AggregateFactory,
        aggregate_id: Uuid,
        max_sequence: Option<i64>,
    ) -> Box<dyn ReplayTarget> {
        let snapshot = match self.snapshots.latest(aggregate_id).await {
            Ok(Some(snapshot)) if max_sequence.is_none_or(|max| snapshot.last_event_sequence <= max) => snapshot,
            Ok(_) => return factory.create(aggregate_id),
            Err(e) => {
                tracing::warn!(aggregate_id = %aggregate_id, error = %e, "Snapshot read failed, replaying from the start");
                return factory.create(aggregate_id);
            }
        };

        match factory.restore(aggregate_id, snapshot.state, snapshot.last_event_sequence, snapshot.timestamp) {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!(
                    aggregate_id = %aggregate_id,
                    snapshot_version = snapshot.snapshot_version,
                    error = %e,
                    "Snapshot state unreadable, replaying from the start"
                );
                factory.create(aggregate_id)
            }
        }
    }

    // Snapshot failures never fail a replay
    async fn write_snapshot(&self, aggregate_type: &str, target: &dyn ReplayTarget) {
        let aggregate_id = target.aggregate_id();
        let result = match target.snapshot_state() {
            Ok(state) => self
                .snapshots
                .save(aggregate_id, aggregate_type, state, target.version(), snapshot_metadata("replay"))
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_snapshot(aggregate_type, result.is_ok());
        }
        match result {
            Ok(snapshot_version) => tracing::info!(
                aggregate_id = %aggregate_id,
                aggregate_type = %aggregate_type,
                snapshot_version = snapshot_version,
                last_event_sequence = target.version(),
                "📸 Snapshot written after replay"
            ),
            Err(e) => tracing::warn!(
                aggregate_id = %aggregate_id,
                aggregate_type = %aggregate_type,
                error = %e,
                "Snapshot after replay failed (ignored)"
            ),
        }
    }

    fn batch_done(&self, report: &ReplayReport, options: &ReplayOptions) {
        self.jobs.progress(report.job_id, report.processed, report.skipped);
        if let Some(progress) = &options.progress {
            progress(&report.progress());
        }
        tracing::debug!(
            job_id = %report.job_id,
            processed = report.processed,
            skipped = report.skipped,
            "Replay batch done"
        );
    }

    fn finish(
        &self,
        mut report: ReplayReport,
        options: &ReplayOptions,
        outcome: Result<(), Interrupt>,
    ) -> Result<ReplayReport, ReplayError> {
        report.finished_at = Some(Utc::now());
        if let Some(progress) = &options.progress {
            progress(&report.progress());
        }

        let kind = report.kind.as_str();
        let status = match &outcome {
            Ok(()) => "completed",
            Err(Interrupt::Cancelled) => "cancelled",
            Err(Interrupt::Failed(_)) => "failed",
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_replay_events(kind, report.processed, report.skipped);
            metrics.record_replay_job(kind, status);
        }

        match outcome {
            Ok(()) => {
                self.jobs.complete(&report);
                tracing::info!(
                    job_id = %report.job_id,
                    kind = kind,
                    processed = report.processed,
                    skipped = report.skipped,
                    aggregates_rebuilt = report.aggregates_rebuilt,
                    republished = report.republished,
                    dry_run = report.dry_run,
                    "✅ Replay job finished"
                );
                Ok(report)
            }
            Err(Interrupt::Cancelled) => {
                self.jobs.fail(&report, "cancelled");
                tracing::warn!(
                    job_id = %report.job_id,
                    kind = kind,
                    processed = report.processed,
                    "Replay job cancelled"
                );
                Err(ReplayError::Cancelled {
                    report: Box::new(report),
                })
            }
            Err(Interrupt::Failed(source)) => {
                self.jobs.fail(&report, source.to_string());
                tracing::error!(
                    job_id = %report.job_id,
                    kind = kind,
                    processed = report.processed,
                    error = %source,
                    "Replay job failed"
                );
                Err(ReplayError::PartialFailure {
                    report: Box::new(report),
                    source,
                })
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
