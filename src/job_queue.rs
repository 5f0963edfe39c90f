//! In-memory job queue
//!
//! The queue mirrors recent jobs for sub-second UI polling and owns the
//! single active-job slot. One lock protects the job map, the active
//! slot and the per-pipeline history. The in-memory write is
//! authoritative for the UI; the persisted row is best-effort.

use crate::error::{EngineError, EngineResult};
use crate::job::{Job, JobStatus, JobUpdate};
use crate::pipeline::{Constraints, Usage};
use crate::storage::Storage;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Most recent jobs kept per pipeline
const HISTORY_LIMIT: usize = 10;

#[derive(Default)]
struct QueueInner {
    jobs: HashMap<i64, Job>,
    active_job: Option<i64>,
    history: HashMap<i64, VecDeque<i64>>,
}

/// Thread-safe in-memory job manager
#[derive(Default)]
pub struct JobQueue {
    inner: Mutex<QueueInner>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job and claim the active slot. Fails when another
    /// job is already running; admission control lives here only.
    pub fn create_job(
        &self,
        job_id: i64,
        pipeline_id: i64,
        total_seeds: i64,
        status: JobStatus,
    ) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        if let Some(active) = inner.active_job {
            return Err(EngineError::JobConflict(active));
        }
        inner
            .jobs
            .insert(job_id, Job::new(job_id, pipeline_id, total_seeds, status));
        inner.active_job = Some(job_id);
        let history = inner.history.entry(pipeline_id).or_default();
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(job_id);
        Ok(())
    }

    /// Defensive copy of a job's mirror
    pub fn get_job(&self, job_id: i64) -> Option<Job> {
        self.inner.lock().jobs.get(&job_id).cloned()
    }

    /// Apply a field update to the mirror. A terminal status releases
    /// the active slot and stamps `completed_at` when not provided.
    pub fn update_job(&self, job_id: i64, update: &JobUpdate) -> bool {
        let mut inner = self.inner.lock();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return false;
        };
        update.apply(job);
        if let Some(status) = update.status {
            if status.is_terminal() {
                if update.completed_at.is_none() && job.completed_at.is_none() {
                    job.completed_at = Some(chrono::Utc::now().to_rfc3339());
                }
                if inner.active_job == Some(job_id) {
                    inner.active_job = None;
                }
            }
        }
        true
    }

    /// Flip the mirror to `cancelled`; the running worker observes this
    /// at its next check point
    pub fn cancel_job(&self, job_id: i64) -> bool {
        let mut inner = self.inner.lock();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return false;
        };
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(chrono::Utc::now().to_rfc3339());
        if inner.active_job == Some(job_id) {
            inner.active_job = None;
        }
        true
    }

    /// Remove a job from the mirror and its pipeline history
    pub fn delete_job(&self, job_id: i64) -> bool {
        let mut inner = self.inner.lock();
        let Some(job) = inner.jobs.remove(&job_id) else {
            return false;
        };
        if let Some(history) = inner.history.get_mut(&job.pipeline_id) {
            history.retain(|id| *id != job_id);
        }
        if inner.active_job == Some(job_id) {
            inner.active_job = None;
        }
        true
    }

    /// The currently running job, if any
    pub fn get_active_job(&self) -> Option<Job> {
        let inner = self.inner.lock();
        inner.active_job.and_then(|id| inner.jobs.get(&id).cloned())
    }

    /// Up to the last ten jobs of a pipeline, most recent first
    pub fn get_pipeline_history(&self, pipeline_id: i64) -> Vec<Job> {
        let inner = self.inner.lock();
        inner
            .history
            .get(&pipeline_id)
            .map(|ids| {
                ids.iter()
                    .rev()
                    .filter_map(|id| inner.jobs.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// True when the mirror reports a cancelled job
    pub fn is_cancelled(&self, job_id: i64) -> bool {
        self.get_job(job_id)
            .map(|job| job.status == JobStatus::Cancelled)
            .unwrap_or(false)
    }

    /// Bump `records_generated`, returning the new count
    pub fn bump_records_generated(&self, job_id: i64) -> Option<i64> {
        let mut inner = self.inner.lock();
        let job = inner.jobs.get_mut(&job_id)?;
        job.records_generated += 1;
        Some(job.records_generated)
    }

    /// Bump `records_failed`, returning the new count
    pub fn bump_records_failed(&self, job_id: i64) -> Option<i64> {
        let mut inner = self.inner.lock();
        let job = inner.jobs.get_mut(&job_id)?;
        job.records_failed += 1;
        Some(job.records_failed)
    }

    /// Add an execution's token usage to the job's cumulative usage,
    /// returning a snapshot for persistence
    pub fn add_usage(&self, job_id: i64, delta: &Usage) -> Option<Usage> {
        let mut inner = self.inner.lock();
        let job = inner.jobs.get_mut(&job_id)?;
        job.usage.add_tokens(delta);
        Some(job.usage.clone())
    }

    /// Update the mirror first (it drives UI polling), then the storage
    /// row. Storage failures are logged, not propagated: the mirror is
    /// authoritative and the row is eventually consistent.
    pub async fn update_and_persist(
        &self,
        job_id: i64,
        storage: Option<&Storage>,
        update: &JobUpdate,
    ) -> bool {
        if !self.update_job(job_id, update) {
            return false;
        }
        if let Some(storage) = storage {
            if let Err(e) = storage.update_job(job_id, update).await {
                tracing::warn!("failed to persist job {job_id} update: {e}");
            }
        }
        true
    }

    /// Centralised constraint enforcement: when the job's cumulative
    /// usage exceeds a limit, perform the full `stopped` transition in
    /// memory and storage. Returns true when the job was stopped.
    pub async fn stop_if_exceeded(
        &self,
        job_id: i64,
        storage: Option<&Storage>,
        constraints: &Constraints,
    ) -> bool {
        let Some(job) = self.get_job(job_id) else {
            return false;
        };
        if job.status != JobStatus::Running {
            return job.status == JobStatus::Stopped;
        }
        let Some(limit) = constraints.is_exceeded(&job.usage) else {
            return false;
        };

        tracing::info!("[job {job_id}] stopped: {limit} exceeded");
        let mut usage = job.usage.clone();
        usage.finish();
        self.update_and_persist(
            job_id,
            storage,
            &JobUpdate::new()
                .status(JobStatus::Stopped)
                .error(format!("Constraint exceeded: {limit}"))
                .completed_at(chrono::Utc::now().to_rfc3339())
                .usage(usage),
        )
        .await
    }
}
