//! Job Tracker
//!
//! Pollable, single-flight background jobs. At most one job per kind runs at
//! a time; a second start request joins the running job. Every state change
//! is published on a `watch` channel for subscribers and kept for polling.
//!
//! State machine: `Running -> Completed | Failed | Cancelled`. Terminal
//! states are final; progress reported after cancellation is ignored.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

// =============================================================================
// Job Model
// =============================================================================

/// Kind of background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Preload of every collection
    FullPreload,
    /// Re-warm of the most accessed entities
    Warmup,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::FullPreload => "full_preload",
            JobKind::Warmup => "warmup",
        }
    }

    /// Step names, in execution order.
    pub fn steps(&self) -> Vec<String> {
        let steps: &[&str] = match self {
            JobKind::FullPreload => &super::preload::PRELOAD_STEPS,
            JobKind::Warmup => &["warmup"],
        };
        steps.iter().map(|s| s.to_string()).collect()
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

/// Pollable job record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreloadJob {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub steps: Vec<String>,
    /// Index of the step in progress (steps.len() once done)
    pub step_index: usize,
    pub current_step: Option<String>,
    /// 0.0 - 100.0
    pub percent: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub triggered_by: String,
    pub error: Option<String>,
    #[serde(skip)]
    step_items: u64,
    #[serde(skip)]
    step_done: u64,
}

impl PreloadJob {
    fn new(kind: JobKind, triggered_by: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            status: JobStatus::Running,
            steps: kind.steps(),
            step_index: 0,
            current_step: None,
            percent: 0.0,
            started_at: Utc::now(),
            completed_at: None,
            triggered_by: triggered_by.to_string(),
            error: None,
            step_items: 0,
            step_done: 0,
        }
    }

    fn recompute_percent(&mut self) {
        let total = self.steps.len().max(1) as f64;
        let partial = if self.step_items == 0 {
            0.0
        } else {
            (self.step_done.min(self.step_items) as f64) / self.step_items as f64
        };
        let done = self.step_index.min(self.steps.len()) as f64;
        self.percent = (((done + partial) / total) * 100.0).min(100.0);
    }

    fn begin_step(&mut self, name: &str, items: u64) {
        if let Some(index) = self.steps.iter().position(|s| s == name) {
            self.step_index = index;
        }
        self.current_step = Some(name.to_string());
        self.step_items = items;
        self.step_done = 0;
        self.recompute_percent();
    }

    fn advance(&mut self, items: u64) {
        self.step_done = self.step_done.saturating_add(items);
        self.recompute_percent();
    }

    fn complete_step(&mut self) {
        self.step_index = (self.step_index + 1).min(self.steps.len());
        self.step_items = 0;
        self.step_done = 0;
        self.recompute_percent();
    }

    fn finish(&mut self, status: JobStatus, error: Option<String>) {
        self.status = status;
        self.completed_at = Some(Utc::now());
        self.error = error;
        if status == JobStatus::Completed {
            self.step_index = self.steps.len();
            self.current_step = None;
            self.percent = 100.0;
        }
    }
}

// =============================================================================
// Tracker
// =============================================================================

#[derive(Debug)]
struct JobEntry {
    job: PreloadJob,
    tx: watch::Sender<PreloadJob>,
}

/// In-process job registry.
#[derive(Debug, Default)]
pub struct JobTracker {
    jobs: Mutex<HashMap<String, JobEntry>>,
}

impl JobTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start a job of `kind`, or join the one already running.
    ///
    /// Returns the job and whether it was newly created. Finished jobs of the
    /// same kind are pruned when a new one starts.
    pub fn start_job(&self, kind: JobKind, triggered_by: &str) -> (PreloadJob, bool) {
        let mut jobs = self.jobs.lock();

        if let Some(running) = jobs
            .values()
            .find(|e| e.job.kind == kind && e.job.status == JobStatus::Running)
        {
            debug!(job_id = %running.job.id, %kind, "Joining running job");
            return (running.job.clone(), false);
        }

        jobs.retain(|_, e| e.job.kind != kind);

        let job = PreloadJob::new(kind, triggered_by);
        let (tx, _rx) = watch::channel(job.clone());
        jobs.insert(
            job.id.clone(),
            JobEntry {
                job: job.clone(),
                tx,
            },
        );
        info!(job_id = %job.id, %kind, triggered_by, "Started job");
        (job, true)
    }

    /// Progress handle for a job.
    pub fn handle(self: &Arc<Self>, id: &str) -> Result<JobHandle> {
        if !self.jobs.lock().contains_key(id) {
            return Err(Error::JobNotFound(id.to_string()));
        }
        Ok(JobHandle {
            tracker: Arc::clone(self),
            id: id.to_string(),
        })
    }

    pub fn get_job(&self, id: &str) -> Result<PreloadJob> {
        self.jobs
            .lock()
            .get(id)
            .map(|e| e.job.clone())
            .ok_or_else(|| Error::JobNotFound(id.to_string()))
    }

    /// Mark a running job cancelled. Returns false if it already finished.
    pub fn cancel(&self, id: &str) -> Result<bool> {
        let cancelled = self.update(id, |job| job.finish(JobStatus::Cancelled, None))?;
        if cancelled {
            info!(job_id = id, "Cancelled job");
        }
        Ok(cancelled)
    }

    /// Receiver seeing every later state of the job.
    pub fn subscribe(&self, id: &str) -> Result<watch::Receiver<PreloadJob>> {
        self.jobs
            .lock()
            .get(id)
            .map(|e| e.tx.subscribe())
            .ok_or_else(|| Error::JobNotFound(id.to_string()))
    }

    /// Most recently started job of a kind.
    pub fn latest(&self, kind: JobKind) -> Option<PreloadJob> {
        self.jobs
            .lock()
            .values()
            .filter(|e| e.job.kind == kind)
            .max_by_key(|e| e.job.started_at)
            .map(|e| e.job.clone())
    }

    pub fn list(&self) -> Vec<PreloadJob> {
        let mut jobs: Vec<PreloadJob> = self.jobs.lock().values().map(|e| e.job.clone()).collect();
        jobs.sort_by_key(|j| j.started_at);
        jobs
    }

    /// Apply `change` to a running job. Returns false if the job is finished.
    fn update<F>(&self, id: &str, change: F) -> Result<bool>
    where
        F: FnOnce(&mut PreloadJob),
    {
        let mut jobs = self.jobs.lock();
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| Error::JobNotFound(id.to_string()))?;
        if entry.job.status.is_terminal() {
            return Ok(false);
        }
        change(&mut entry.job);
        entry.tx.send_replace(entry.job.clone());
        Ok(true)
    }
}

/// Progress reporter for one job, held by the worker running it.
#[derive(Debug, Clone)]
pub struct JobHandle {
    tracker: Arc<JobTracker>,
    id: String,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn begin_step(&self, name: &str, items: u64) {
        self.apply(|job| job.begin_step(name, items));
    }

    pub fn advance(&self, items: u64) {
        self.apply(|job| job.advance(items));
    }

    pub fn complete_step(&self) {
        self.apply(PreloadJob::complete_step);
    }

    pub fn complete(&self) {
        self.apply(|job| job.finish(JobStatus::Completed, None));
    }

    pub fn fail(&self, error: &str) {
        self.apply(|job| job.finish(JobStatus::Failed, Some(error.to_string())));
    }

    pub fn is_cancelled(&self) -> bool {
        self.tracker
            .get_job(&self.id)
            .map(|job| job.status == JobStatus::Cancelled)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> Result<PreloadJob> {
        self.tracker.get_job(&self.id)
    }

    fn apply<F: FnOnce(&mut PreloadJob)>(&self, change: F) {
        if let Err(e) = self.tracker.update(&self.id, change) {
            warn!(job_id = %self.id, error = %e, "Progress for unknown job");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_single_flight_per_kind() {
        let tracker = JobTracker::new();
        let (first, is_new) = tracker.start_job(JobKind::FullPreload, "admin");
        assert!(is_new);

        let (second, is_new) = tracker.start_job(JobKind::FullPreload, "scheduler");
        assert!(!is_new);
        assert_eq!(first.id, second.id);

        let (warmup, is_new) = tracker.start_job(JobKind::Warmup, "nightly");
        assert!(is_new);
        assert_ne!(warmup.id, first.id);
    }

    #[tokio::test]
    async fn test_concurrent_starts_share_one_job() {
        let tracker = JobTracker::new();
        let a = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.start_job(JobKind::FullPreload, "a") }
        });
        let b = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.start_job(JobKind::FullPreload, "b") }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert_eq!(a.0.id, b.0.id);
        assert_ne!(a.1, b.1);
    }

    #[test]
    fn test_progress_percent() {
        let tracker = JobTracker::new();
        let (job, _) = tracker.start_job(JobKind::FullPreload, "admin");
        let handle = tracker.handle(&job.id).unwrap();

        handle.begin_step("division", 10);
        handle.advance(5);
        let snapshot = handle.snapshot().unwrap();
        assert_eq!(snapshot.current_step.as_deref(), Some("division"));
        assert!((snapshot.percent - 12.5).abs() < 1e-9);

        handle.complete_step();
        handle.begin_step("section", 0);
        assert!((handle.snapshot().unwrap().percent - 25.0).abs() < 1e-9);
        assert_eq!(handle.snapshot().unwrap().step_index, 1);

        handle.complete();
        let done = tracker.get_job(&job.id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.percent, 100.0);
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn test_cancel_ignores_later_progress() {
        let tracker = JobTracker::new();
        let (job, _) = tracker.start_job(JobKind::FullPreload, "admin");
        let handle = tracker.handle(&job.id).unwrap();

        assert!(tracker.cancel(&job.id).unwrap());
        assert!(handle.is_cancelled());
        handle.complete();
        assert_eq!(tracker.get_job(&job.id).unwrap().status, JobStatus::Cancelled);
        assert!(!tracker.cancel(&job.id).unwrap());

        let (next, is_new) = tracker.start_job(JobKind::FullPreload, "admin");
        assert!(is_new);
        assert_matches!(tracker.get_job(&job.id), Err(Error::JobNotFound(_)));
        assert_eq!(tracker.latest(JobKind::FullPreload).unwrap().id, next.id);
    }

    #[test]
    fn test_failed_job_records_error() {
        let tracker = JobTracker::new();
        let (job, _) = tracker.start_job(JobKind::Warmup, "nightly");
        tracker.handle(&job.id).unwrap().fail("source down");

        let failed = tracker.get_job(&job.id).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("source down"));
    }

    #[tokio::test]
    async fn test_subscribe_sees_changes() {
        let tracker = JobTracker::new();
        let (job, _) = tracker.start_job(JobKind::FullPreload, "admin");
        let mut rx = tracker.subscribe(&job.id).unwrap();
        let handle = tracker.handle(&job.id).unwrap();

        handle.begin_step("division", 4);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().current_step.as_deref(), Some("division"));

        assert_matches!(tracker.subscribe("missing"), Err(Error::JobNotFound(_)));
    }

    #[test]
    fn test_unknown_job() {
        let tracker = JobTracker::new();
        assert_matches!(tracker.get_job("nope"), Err(Error::JobNotFound(_)));
        assert_matches!(tracker.handle("nope"), Err(Error::JobNotFound(_)));
    }
}
