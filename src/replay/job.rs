use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

use super::ReplayReport;

// ============================================================================
// Replay Jobs
// ============================================================================
//
// Pending -> Running -> Completed | Failed
//
// A cancelled job ends Failed with its partial counts; it is never dropped.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReplayKind {
    Aggregate,
    Projection,
    Timestamp,
}

impl ReplayKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplayKind::Aggregate => "aggregate",
            ReplayKind::Projection => "projection",
            ReplayKind::Timestamp => "timestamp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayJob {
    pub id: Uuid,
    pub kind: ReplayKind,
    /// Aggregate id, projection name or time range being replayed
    pub target: String,
    pub status: JobStatus,
    pub processed: u64,
    pub skipped: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Cooperative cancellation flag, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct JobEntry {
    job: ReplayJob,
    cancel: CancelSignal,
}

#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, JobEntry>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a pending job. Uses the caller's cancel signal when given.
    pub fn create(&self, kind: ReplayKind, target: String, cancel: Option<CancelSignal>) -> (Uuid, CancelSignal) {
        let id = Uuid::now_v7();
        let cancel = cancel.unwrap_or_default();
        let job = ReplayJob {
            id,
            kind,
            target,
            status: JobStatus::Pending,
            processed: 0,
            skipped: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.lock().insert(
            id,
            JobEntry {
                job,
                cancel: cancel.clone(),
            },
        );
        (id, cancel)
    }

    pub fn start(&self, id: Uuid) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.job.status = JobStatus::Running;
            entry.job.started_at = Some(Utc::now());
        }
    }

    pub fn progress(&self, id: Uuid, processed: u64, skipped: u64) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.job.processed = processed;
            entry.job.skipped = skipped;
        }
    }

    pub fn complete(&self, report: &ReplayReport) {
        self.finish(report, JobStatus::Completed);
    }

    pub fn fail(&self, report: &ReplayReport, reason: impl Into<String>) {
        self.finish(report, JobStatus::Failed { reason: reason.into() });
    }

    fn finish(&self, report: &ReplayReport, status: JobStatus) {
        if let Some(entry) = self.lock().get_mut(&report.job_id) {
            entry.job.status = status;
            entry.job.processed = report.processed;
            entry.job.skipped = report.skipped;
            entry.job.finished_at = Some(Utc::now());
        }
    }

    /// Request cancellation; false when the job is unknown or already finished.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.lock().get(&id) {
            Some(entry) if matches!(entry.job.status, JobStatus::Pending | JobStatus::Running) => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: Uuid) -> Option<ReplayJob> {
        self.lock().get(&id).map(|entry| entry.job.clone())
    }

    /// Every known job, oldest first.
    pub fn list(&self) -> Vec<ReplayJob> {
        let mut jobs: Vec<ReplayJob> = self.lock().values().map(|entry| entry.job.clone()).collect();
        jobs.sort_by_key(|job| (job.created_at, job.id));
        jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_lifecycle() {
        let registry = JobRegistry::new();
        let (id, _cancel) = registry.create(ReplayKind::Projection, "stock_levels".into(), None);
        assert_eq!(registry.get(id).unwrap().status, JobStatus::Pending);

        registry.start(id);
        registry.progress(id, 10, 1);
        assert_eq!(registry.get(id).unwrap().status, JobStatus::Running);
        assert_eq!(registry.get(id).unwrap().processed, 10);

        let report = ReplayReport::new(id, ReplayKind::Projection, false);
        registry.complete(&report);
        let job = registry.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.finished_at.is_some());
        assert!(!registry.cancel(id));
    }

    #[test]
    fn test_cancel_flips_shared_signal() {
        let registry = JobRegistry::new();
        let external = CancelSignal::new();
        let (id, signal) = registry.create(ReplayKind::Aggregate, "x".into(), Some(external.clone()));

        assert!(registry.cancel(id));
        assert!(signal.is_cancelled());
        assert!(external.is_cancelled());
        assert!(!registry.cancel(Uuid::new_v4()));
        assert_eq!(registry.list().len(), 1);
    }
}
