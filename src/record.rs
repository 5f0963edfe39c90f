//! Record domain types

use crate::pipeline::{StateMap, TraceEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Review status of a persisted record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Accepted,
    Rejected,
    Edited,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Accepted => "accepted",
            RecordStatus::Rejected => "rejected",
            RecordStatus::Edited => "edited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RecordStatus::Pending),
            "accepted" => Some(RecordStatus::Accepted),
            "rejected" => Some(RecordStatus::Rejected),
            "edited" => Some(RecordStatus::Edited),
            _ => None,
        }
    }
}

/// Record data before insertion (id and timestamps come from storage)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRecord {
    /// Serialized final output of the execution
    #[serde(default)]
    pub output: String,
    /// The seed input the execution started from
    #[serde(default)]
    pub metadata: StateMap,
    /// Per-block execution history
    #[serde(default)]
    pub trace: Vec<TraceEntry>,
}

/// The persisted artifact of one execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub output: String,
    pub metadata: StateMap,
    pub status: RecordStatus,
    #[serde(default)]
    pub pipeline_id: Option<i64>,
    #[serde(default)]
    pub job_id: Option<i64>,
    #[serde(default)]
    pub trace: Vec<TraceEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The mutable field group of a record; unset fields stay unchanged
#[derive(Debug, Clone, Default)]
pub struct RecordUpdate {
    pub output: Option<String>,
    pub status: Option<RecordStatus>,
    pub metadata: Option<StateMap>,
}

impl RecordUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn status(mut self, status: RecordStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn metadata(mut self, metadata: StateMap) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.output.is_none() && self.status.is_none() && self.metadata.is_none()
    }
}
