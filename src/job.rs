//! Job domain types

use crate::pipeline::Usage;
use serde::{Deserialize, Serialize};

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    /// A pipeline constraint was hit; behaves like `Cancelled` from the
    /// seed loop's perspective
    Stopped,
}

impl JobStatus {
    /// Terminal statuses release the active-job slot
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            "stopped" => Some(JobStatus::Stopped),
            _ => None,
        }
    }
}

/// A batch of pipeline executions driven from a seed file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub pipeline_id: i64,
    pub status: JobStatus,
    pub total_seeds: i64,
    #[serde(default)]
    pub current_seed: i64,
    #[serde(default)]
    pub records_generated: i64,
    #[serde(default)]
    pub records_failed: i64,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub current_block: String,
    #[serde(default)]
    pub current_step: String,
    #[serde(default)]
    pub error: String,
    /// ISO-8601 start timestamp
    pub started_at: String,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub usage: Usage,
}

impl Job {
    pub fn new(id: i64, pipeline_id: i64, total_seeds: i64, status: JobStatus) -> Self {
        Self {
            id,
            pipeline_id,
            status,
            total_seeds,
            current_seed: 0,
            records_generated: 0,
            records_failed: 0,
            progress: 0.0,
            current_block: String::new(),
            current_step: String::new(),
            error: String::new(),
            started_at: chrono::Utc::now().to_rfc3339(),
            completed_at: None,
            created_at: None,
            usage: Usage::default(),
        }
    }
}

/// Field-wise update applied to a job, in memory and in storage.
/// Unset fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub total_seeds: Option<i64>,
    pub current_seed: Option<i64>,
    pub records_generated: Option<i64>,
    pub records_failed: Option<i64>,
    pub progress: Option<f64>,
    pub current_block: Option<String>,
    pub current_step: Option<String>,
    pub error: Option<String>,
    pub completed_at: Option<String>,
    pub usage: Option<Usage>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn total_seeds(mut self, total: i64) -> Self {
        self.total_seeds = Some(total);
        self
    }

    pub fn current_seed(mut self, seed: i64) -> Self {
        self.current_seed = Some(seed);
        self
    }

    pub fn records_generated(mut self, count: i64) -> Self {
        self.records_generated = Some(count);
        self
    }

    pub fn records_failed(mut self, count: i64) -> Self {
        self.records_failed = Some(count);
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn current_block(mut self, block: impl Into<String>) -> Self {
        self.current_block = Some(block.into());
        self
    }

    pub fn current_step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn completed_at(mut self, at: impl Into<String>) -> Self {
        self.completed_at = Some(at.into());
        self
    }

    pub fn usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Apply this update to an in-memory job
    pub fn apply(&self, job: &mut Job) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(total) = self.total_seeds {
            job.total_seeds = total;
        }
        if let Some(seed) = self.current_seed {
            job.current_seed = seed;
        }
        if let Some(count) = self.records_generated {
            job.records_generated = count;
        }
        if let Some(count) = self.records_failed {
            job.records_failed = count;
        }
        if let Some(progress) = self.progress {
            job.progress = progress;
        }
        if let Some(block) = &self.current_block {
            job.current_block = block.clone();
        }
        if let Some(step) = &self.current_step {
            job.current_step = step.clone();
        }
        if let Some(error) = &self.error {
            job.error = error.clone();
        }
        if let Some(at) = &self.completed_at {
            job.completed_at = Some(at.clone());
        }
        if let Some(usage) = &self.usage {
            job.usage = usage.clone();
        }
    }
}
