use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::core::{
    Aggregate, AggregateRoot, ApplyError, Clock, EventStoreError, SnapshotError, SystemClock, UpcasterRegistry,
};
use super::snapshot::{SnapshotContext, SnapshotPolicy, SnapshotStore};
use super::store::EventLogStore;
use crate::metrics::Metrics;

// ============================================================================
// Aggregate Repository
// ============================================================================
//
// load = latest snapshot (if any) + tail replay from the event log
// save = ONE conditional append at expected_version = aggregate.version
//
// ConcurrencyConflict is returned to the caller untouched: re-running a
// command against fresh state may produce different events, so retry belongs
// to the command handler. Snapshots are written in background tasks and their
// failures are only logged. A snapshot counts as taken from the moment it is
// scheduled, for every clone of the repository, so loads racing an in-flight
// save never schedule the same snapshot twice.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error("failed to rebuild aggregate: {0}")]
    Apply(#[from] ApplyError),

    #[error("failed to encode events: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("aggregate {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

impl RepositoryError {
    /// "Please retry": re-load, re-run the command, re-save.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RepositoryError::Store(e) if e.is_retryable())
    }
}

pub struct AggregateRepository<A: Aggregate> {
    events: Arc<dyn EventLogStore>,
    snapshots: Arc<dyn SnapshotStore>,
    policy: SnapshotPolicy,
    upcasters: UpcasterRegistry,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
    snapshot_keep: Option<usize>,
    pending_snapshots: Arc<Mutex<Vec<JoinHandle<()>>>>,
    scheduled: Arc<Mutex<HashMap<Uuid, ScheduledSnapshot>>>,
    _aggregate: PhantomData<fn() -> A>,
}

#[derive(Debug, Clone, Copy)]
struct ScheduledSnapshot {
    sequence: i64,
    at: DateTime<Utc>,
}

impl<A: Aggregate> Clone for AggregateRepository<A> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
            snapshots: self.snapshots.clone(),
            policy: self.policy.clone(),
            upcasters: self.upcasters.clone(),
            clock: self.clock.clone(),
            metrics: self.metrics.clone(),
            snapshot_keep: self.snapshot_keep,
            pending_snapshots: self.pending_snapshots.clone(),
            scheduled: self.scheduled.clone(),
            _aggregate: PhantomData,
        }
    }
}

impl<A: Aggregate> AggregateRepository<A> {
    pub fn new(events: Arc<dyn EventLogStore>, snapshots: Arc<dyn SnapshotStore>, policy: SnapshotPolicy) -> Self {
        Self {
            events,
            snapshots,
            policy,
            upcasters: UpcasterRegistry::new(),
            clock: Arc::new(SystemClock),
            metrics: None,
            snapshot_keep: None,
            pending_snapshots: Arc::new(Mutex::new(Vec::new())),
            scheduled: Arc::new(Mutex::new(HashMap::new())),
            _aggregate: PhantomData,
        }
    }

    pub fn with_upcasters(mut self, upcasters: UpcasterRegistry) -> Self {
        self.upcasters = upcasters;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// After each successful snapshot, delete all but the newest `keep`.
    pub fn with_snapshot_retention(mut self, keep: usize) -> Self {
        self.snapshot_keep = Some(keep);
        self
    }

    pub fn policy(&self) -> &SnapshotPolicy {
        &self.policy
    }

    /// Rebuild an aggregate: snapshot (if any) + every later event.
    ///
    /// An aggregate with no history comes back in its zero state at version 0.
    pub async fn load(&self, aggregate_id: Uuid) -> Result<AggregateRoot<A>, RepositoryError> {
        let mut root = self.rebuild(aggregate_id).await?;
        self.maybe_snapshot(&mut root);
        Ok(root)
    }

    /// Like `load`, but an aggregate with no history is an error.
    pub async fn load_existing(&self, aggregate_id: Uuid) -> Result<AggregateRoot<A>, RepositoryError> {
        let root = self.load(aggregate_id).await?;
        if root.version() == 0 {
            return Err(RepositoryError::NotFound(aggregate_id));
        }
        Ok(root)
    }

    pub async fn exists(&self, aggregate_id: Uuid) -> Result<bool, RepositoryError> {
        Ok(self.events.current_version(aggregate_id).await? > 0)
    }

    /// Append the aggregate's uncommitted events at `expected_version = root.version()`.
    ///
    /// Returns the new version. On `ConcurrencyConflict` the buffer is kept
    /// and the aggregate must be re-loaded.
    pub async fn save(&self, root: &mut AggregateRoot<A>) -> Result<i64, RepositoryError> {
        if !root.has_uncommitted_events() {
            return Ok(root.version());
        }

        let envelopes = root.uncommitted_envelopes()?;
        let event_count = envelopes.len();
        let started = Instant::now();

        let result = self
            .events
            .append(root.id(), A::AGGREGATE_TYPE, root.version(), envelopes)
            .await;

        let new_version = match result {
            Ok(version) => version,
            Err(e) => {
                if e.is_conflict() {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_conflict(A::AGGREGATE_TYPE);
                    }
                    tracing::warn!(
                        aggregate_id = %root.id(),
                        aggregate_type = A::AGGREGATE_TYPE,
                        expected_version = root.version(),
                        error = %e,
                        "Concurrency conflict on save"
                    );
                } else {
                    tracing::error!(
                        aggregate_id = %root.id(),
                        aggregate_type = A::AGGREGATE_TYPE,
                        error = %e,
                        "Failed to append events"
                    );
                }
                return Err(e.into());
            }
        };

        root.mark_committed(new_version);
        if let Some(metrics) = &self.metrics {
            metrics.record_append(A::AGGREGATE_TYPE, event_count, started.elapsed().as_secs_f64());
        }

        tracing::info!(
            aggregate_id = %root.id(),
            aggregate_type = A::AGGREGATE_TYPE,
            new_version = new_version,
            event_count = event_count,
            "✅ Saved aggregate"
        );

        self.maybe_snapshot(root);
        Ok(new_version)
    }

    /// Write a snapshot of the current state right away, ignoring the policy.
    ///
    /// Returns the new `snapshot_version`.
    pub async fn snapshot_now(&self, aggregate_id: Uuid) -> Result<i64, RepositoryError> {
        let mut root = self.rebuild(aggregate_id).await?;
        if root.version() == 0 {
            return Err(RepositoryError::NotFound(aggregate_id));
        }

        let state = serde_json::to_value(root.state()).map_err(SnapshotError::from)?;
        let snapshot_version = self
            .snapshots
            .save(aggregate_id, A::AGGREGATE_TYPE, state, root.version(), snapshot_metadata("manual"))
            .await?;
        root.mark_snapshotted(root.version(), self.clock.now());

        if let Some(metrics) = &self.metrics {
            metrics.record_snapshot(A::AGGREGATE_TYPE, true);
        }
        tracing::info!(
            aggregate_id = %aggregate_id,
            snapshot_version = snapshot_version,
            last_event_sequence = root.version(),
            "📸 Manual snapshot saved"
        );
        if let Some(keep) = self.snapshot_keep {
            self.snapshots.prune(aggregate_id, keep).await?;
        }
        Ok(snapshot_version)
    }

    /// Wait for every background snapshot task started so far.
    pub async fn flush_snapshots(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut pending = self.pending_snapshots.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *pending)
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Snapshot task did not complete");
            }
        }
    }

    async fn rebuild(&self, aggregate_id: Uuid) -> Result<AggregateRoot<A>, RepositoryError> {
        let mut root = match self.latest_snapshot(aggregate_id).await {
            Some(root) => root,
            None => AggregateRoot::new(aggregate_id),
        };

        let tail = self.events.read_range(aggregate_id, root.version() + 1, None).await?;
        let replayed = tail.len();
        for event in &tail {
            root.apply_stored(event, &self.upcasters)?;
        }

        tracing::debug!(
            aggregate_id = %aggregate_id,
            aggregate_type = A::AGGREGATE_TYPE,
            snapshot_sequence = root.snapshot_sequence(),
            replayed = replayed,
            version = root.version(),
            "Loaded aggregate"
        );
        Ok(root)
    }

    // Any snapshot problem means "replay from the start", never a failed load
    async fn latest_snapshot(&self, aggregate_id: Uuid) -> Option<AggregateRoot<A>> {
        let snapshot = match self.snapshots.latest(aggregate_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(
                    aggregate_id = %aggregate_id,
                    error = %e,
                    "Snapshot read failed, replaying full history"
                );
                return None;
            }
        };

        match serde_json::from_value::<A>(snapshot.state) {
            Ok(state) => Some(AggregateRoot::from_snapshot(
                aggregate_id,
                state,
                snapshot.last_event_sequence,
                snapshot.timestamp,
            )),
            Err(e) => {
                tracing::warn!(
                    aggregate_id = %aggregate_id,
                    snapshot_version = snapshot.snapshot_version,
                    error = %e,
                    "Snapshot state unreadable, replaying full history"
                );
                None
            }
        }
    }

    fn maybe_snapshot(&self, root: &mut AggregateRoot<A>) {
        let aggregate_id = root.id();
        let mut ctx = SnapshotContext {
            version: root.version(),
            last_snapshot_sequence: root.snapshot_sequence(),
            last_snapshot_at: root.snapshot_taken_at(),
            now: self.clock.now(),
        };

        let state = {
            let mut scheduled = self.scheduled.lock().unwrap_or_else(PoisonError::into_inner);
            // kept after the save lands: a load that read the snapshot store
            // before it did must still see it
            if let Some(s) = scheduled.get(&aggregate_id) {
                if s.sequence > ctx.last_snapshot_sequence {
                    ctx.last_snapshot_sequence = s.sequence;
                    ctx.last_snapshot_at = Some(s.at);
                }
            }
            if !self.policy.should_snapshot(&ctx) {
                return;
            }

            let state = match serde_json::to_value(root.state()) {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(aggregate_id = %aggregate_id, error = %e, "Could not serialize snapshot state");
                    return;
                }
            };
            scheduled.insert(
                aggregate_id,
                ScheduledSnapshot {
                    sequence: ctx.version,
                    at: ctx.now,
                },
            );
            state
        };
        root.mark_snapshotted(ctx.version, ctx.now);

        let snapshots = self.snapshots.clone();
        let metrics = self.metrics.clone();
        let scheduled = self.scheduled.clone();
        let keep = self.snapshot_keep;
        let version = ctx.version;

        let handle = tokio::spawn(async move {
            let result = snapshots
                .save(aggregate_id, A::AGGREGATE_TYPE, state, version, snapshot_metadata("policy"))
                .await;
            if let Some(metrics) = &metrics {
                metrics.record_snapshot(A::AGGREGATE_TYPE, result.is_ok());
            }
            match result {
                Ok(snapshot_version) => {
                    tracing::info!(
                        aggregate_id = %aggregate_id,
                        aggregate_type = A::AGGREGATE_TYPE,
                        snapshot_version = snapshot_version,
                        last_event_sequence = version,
                        "📸 Snapshot saved"
                    );
                    if let Some(keep) = keep {
                        if let Err(e) = snapshots.prune(aggregate_id, keep).await {
                            tracing::warn!(
                                aggregate_id = %aggregate_id,
                                keep = keep,
                                error = %e,
                                "Snapshot prune failed (ignored)"
                            );
                        }
                    }
                }
                Err(e) => {
                    // let the next load try again
                    let mut scheduled = scheduled.lock().unwrap_or_else(PoisonError::into_inner);
                    if scheduled.get(&aggregate_id).is_some_and(|s| s.sequence == version) {
                        scheduled.remove(&aggregate_id);
                    }
                    tracing::warn!(
                        aggregate_id = %aggregate_id,
                        aggregate_type = A::AGGREGATE_TYPE,
                        last_event_sequence = version,
                        error = %e,
                        "Snapshot save failed (ignored)"
                    );
                }
            }
        });

        let mut pending = self.pending_snapshots.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }
}

pub(crate) fn snapshot_metadata(trigger: &str) -> HashMap<String, String> {
    HashMap::from([("trigger".to_string(), trigger.to_string())])
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::{DomainEvent, EventMetadata, ManualClock};
    use crate::event_sourcing::snapshot::InMemorySnapshotStore;
    use crate::event_sourcing::store::InMemoryEventStore;
    use chrono::{Duration, Utc};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    struct Tally {
        values: Vec<i64>,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Recorded(i64);

    #[derive(Debug, thiserror::Error)]
    #[error("never")]
    struct Never;

    impl DomainEvent for Recorded {
        fn event_type(&self) -> &'static str {
            "Recorded"
        }

        fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
            Ok(json!({ "value": self.0 }))
        }

        fn from_payload(
            event_type: &str,
            _event_version: i32,
            payload: serde_json::Value,
        ) -> Result<Option<Self>, serde_json::Error> {
            #[derive(Deserialize)]
            struct Body {
                value: i64,
            }
            match event_type {
                "Recorded" => Ok(Some(Recorded(serde_json::from_value::<Body>(payload)?.value))),
                _ => Ok(None),
            }
        }
    }

    impl Aggregate for Tally {
        const AGGREGATE_TYPE: &'static str = "Tally";
        type Event = Recorded;
        type Command = i64;
        type Error = Never;

        fn apply_event(&mut self, event: &Self::Event) -> Result<(), Self::Error> {
            self.values.push(event.0);
            Ok(())
        }

        fn handle_command(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
            Ok(vec![Recorded(*command)])
        }
    }

    struct Fixture {
        events: Arc<InMemoryEventStore>,
        snapshots: Arc<InMemorySnapshotStore>,
        repo: AggregateRepository<Tally>,
    }

    fn fixture(policy: SnapshotPolicy) -> Fixture {
        let events = Arc::new(InMemoryEventStore::new());
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let repo = AggregateRepository::new(events.clone(), snapshots.clone(), policy);
        Fixture { events, snapshots, repo }
    }

    async fn record(repo: &AggregateRepository<Tally>, id: Uuid, value: i64) -> i64 {
        let mut root = repo.load(id).await.unwrap();
        root.execute(&value, &EventMetadata::default()).unwrap();
        let version = repo.save(&mut root).await.unwrap();
        repo.flush_snapshots().await;
        version
    }

    #[tokio::test]
    async fn test_load_unknown_aggregate_is_zero_state() {
        let f = fixture(SnapshotPolicy::Never);
        let id = Uuid::new_v4();

        let root = f.repo.load(id).await.unwrap();
        assert_eq!(root.version(), 0);
        assert_eq!(root.state(), &Tally::default());
        assert!(!f.repo.exists(id).await.unwrap());
        assert!(matches!(f.repo.load_existing(id).await, Err(RepositoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_save_advances_version_and_clears_buffer() {
        let f = fixture(SnapshotPolicy::Never);
        let id = Uuid::new_v4();

        let mut root = f.repo.load(id).await.unwrap();
        root.execute(&1, &EventMetadata::default()).unwrap();
        root.execute(&2, &EventMetadata::default()).unwrap();
        assert_eq!(f.repo.save(&mut root).await.unwrap(), 2);
        assert_eq!(root.version(), 2);
        assert!(!root.has_uncommitted_events());

        // nothing buffered is a no-op
        assert_eq!(f.repo.save(&mut root).await.unwrap(), 2);
        assert_eq!(f.events.current_version(id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stale_save_is_conflict_and_not_retried() {
        let f = fixture(SnapshotPolicy::Never);
        let id = Uuid::new_v4();
        record(&f.repo, id, 1).await;

        let mut first = f.repo.load(id).await.unwrap();
        let mut second = f.repo.load(id).await.unwrap();
        first.execute(&2, &EventMetadata::default()).unwrap();
        second.execute(&3, &EventMetadata::default()).unwrap();

        f.repo.save(&mut first).await.unwrap();
        let err = f.repo.save(&mut second).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(second.has_uncommitted_events());
        assert_eq!(f.events.current_version(id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_then_tail_replay_matches_full_replay() {
        let f = fixture(SnapshotPolicy::EveryNEvents(3));
        let id = Uuid::new_v4();
        for value in 1..=7 {
            record(&f.repo, id, value).await;
        }
        f.repo.flush_snapshots().await;

        let snapshots = f.snapshots.list(id).await.unwrap();
        let covered: Vec<i64> = snapshots.iter().map(|s| s.last_event_sequence).collect();
        assert_eq!(covered, vec![6, 3]);

        let loaded = f.repo.load(id).await.unwrap();
        assert_eq!(loaded.snapshot_sequence(), 6);

        let plain = AggregateRepository::<Tally>::new(
            f.events.clone(),
            Arc::new(InMemorySnapshotStore::new()),
            SnapshotPolicy::Never,
        );
        let full = plain.load(id).await.unwrap();
        assert_eq!(loaded.state(), full.state());
        assert_eq!(loaded.version(), 7);
    }

    #[tokio::test]
    async fn test_snapshot_failure_never_fails_save() {
        let f = fixture(SnapshotPolicy::EveryNEvents(1));
        f.snapshots.set_fail_saves(true);
        let id = Uuid::new_v4();

        assert_eq!(record(&f.repo, id, 5).await, 1);
        f.repo.flush_snapshots().await;
        assert_eq!(f.snapshots.count(id).await, 0);

        let root = f.repo.load(id).await.unwrap();
        assert_eq!(root.state().values, vec![5]);
    }

    #[tokio::test]
    async fn test_time_based_policy_uses_clock() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let f = fixture(SnapshotPolicy::Interval(Duration::minutes(10)));
        let repo = f.repo.clone().with_clock(clock.clone());
        let id = Uuid::new_v4();

        record(&repo, id, 1).await; // no snapshot yet: due
        repo.flush_snapshots().await;
        assert_eq!(f.snapshots.count(id).await, 1);

        let mut root = repo.load(id).await.unwrap();
        root.execute(&2, &EventMetadata::default()).unwrap();
        repo.save(&mut root).await.unwrap();
        repo.flush_snapshots().await;
        assert_eq!(f.snapshots.count(id).await, 1);

        clock.advance(Duration::minutes(11));
        root.execute(&3, &EventMetadata::default()).unwrap();
        repo.save(&mut root).await.unwrap();
        repo.flush_snapshots().await;
        assert_eq!(f.snapshots.count(id).await, 2);
    }

    #[tokio::test]
    async fn test_snapshot_now_and_unreadable_snapshot_fallback() {
        let f = fixture(SnapshotPolicy::Never);
        let id = Uuid::new_v4();
        record(&f.repo, id, 4).await;

        assert_eq!(f.repo.snapshot_now(id).await.unwrap(), 1);
        assert!(matches!(
            f.repo.snapshot_now(Uuid::new_v4()).await,
            Err(RepositoryError::NotFound(_))
        ));

        f.snapshots
            .save(id, "Tally", json!("garbage"), 1, HashMap::new())
            .await
            .unwrap();
        let root = f.repo.load(id).await.unwrap();
        assert_eq!(root.state().values, vec![4]);
        assert_eq!(root.snapshot_sequence(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_snapshot_is_not_scheduled_twice() {
        let f = fixture(SnapshotPolicy::EveryNEvents(100));
        let id = Uuid::new_v4();

        // background saves only get to run at the end
        for value in 1..=250 {
            let mut root = f.repo.load(id).await.unwrap();
            root.execute(&value, &EventMetadata::default()).unwrap();
            f.repo.save(&mut root).await.unwrap();
        }
        f.repo.flush_snapshots().await;

        let covered: Vec<i64> = f.snapshots.list(id).await.unwrap().iter().map(|s| s.last_event_sequence).collect();
        assert_eq!(covered, vec![200, 100]);

        // a clone shares what is scheduled
        let clone = f.repo.clone();
        let root = clone.load(id).await.unwrap();
        clone.flush_snapshots().await;
        assert_eq!(root.snapshot_sequence(), 200);
        assert_eq!(f.snapshots.count(id).await, 2);
    }

    #[tokio::test]
    async fn test_failed_snapshot_is_retried_on_next_load() {
        let f = fixture(SnapshotPolicy::EveryNEvents(2));
        let id = Uuid::new_v4();
        record(&f.repo, id, 1).await;

        f.snapshots.set_fail_saves(true);
        record(&f.repo, id, 2).await;
        assert_eq!(f.snapshots.count(id).await, 0);

        f.snapshots.set_fail_saves(false);
        f.repo.load(id).await.unwrap();
        f.repo.flush_snapshots().await;
        assert_eq!(f.snapshots.latest(id).await.unwrap().unwrap().last_event_sequence, 2);
    }

    #[tokio::test]
    async fn test_retention_prunes_after_each_snapshot() {
        let events = Arc::new(InMemoryEventStore::new());
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let repo = AggregateRepository::<Tally>::new(events, snapshots.clone(), SnapshotPolicy::EveryNEvents(2))
            .with_snapshot_retention(2);
        let id = Uuid::new_v4();

        for value in 1..=8 {
            record(&repo, id, value).await;
        }
        let covered: Vec<i64> = snapshots.list(id).await.unwrap().iter().map(|s| s.last_event_sequence).collect();
        assert_eq!(covered, vec![8, 6]);

        record(&repo, id, 9).await;
        repo.snapshot_now(id).await.unwrap();
        let covered: Vec<i64> = snapshots.list(id).await.unwrap().iter().map(|s| s.last_event_sequence).collect();
        assert_eq!(covered, vec![9, 8]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_from_same_version_admit_exactly_one() {
        let f = fixture(SnapshotPolicy::Never);
        let id = Uuid::new_v4();
        record(&f.repo, id, 0).await;

        // everyone loads version 1 before anyone saves
        let loaded = Arc::new(tokio::sync::Barrier::new(12));
        let writers: Vec<_> = (0..12)
            .map(|value| {
                let repo = f.repo.clone();
                let loaded = loaded.clone();
                tokio::spawn(async move {
                    let mut root = repo.load(id).await.unwrap();
                    assert_eq!(root.version(), 1);
                    root.execute(&value, &EventMetadata::default()).unwrap();
                    loaded.wait().await;
                    repo.save(&mut root).await
                })
            })
            .collect();

        let mut saved = 0;
        let mut conflicts = 0;
        for writer in writers {
            match writer.await.unwrap() {
                Ok(version) => {
                    assert_eq!(version, 2);
                    saved += 1;
                }
                Err(RepositoryError::Store(EventStoreError::ConcurrencyConflict { expected: 1, .. })) => {
                    conflicts += 1
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(saved, 1);
        assert_eq!(conflicts, 11);
        assert_eq!(f.events.current_version(id).await.unwrap(), 2);
    }
}
