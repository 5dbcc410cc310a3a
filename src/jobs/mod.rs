//! Analysis job lifecycle.

mod manager;

pub use manager::{JobManager, JobManagerHandle, SubmitRequest};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::analysis::{AnalysisMode, AnalysisResult};

/// Lifecycle state of a job.
///
/// `pending -> queued -> analyzing -> processing -> completed`, with
/// `processing -> queued` as the bounded retry edge and any non-terminal
/// state able to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Analyzing,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Analyzing => "analyzing",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "queued" => Some(JobStatus::Queued),
            "analyzing" => Some(JobStatus::Analyzing),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Holding the single inference slot.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Analyzing | JobStatus::Processing)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Queued)
            | (Queued, Analyzing)
            | (Analyzing, Processing)
            | (Processing, Completed)
            | (Processing, Queued) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted job record.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub advisor_id: String,
    pub mode: AnalysisMode,
    pub enable_retrieval: bool,
    pub status: JobStatus,
    pub current_step: String,
    pub progress_percentage: u8,
    pub retry_count: u32,
    /// Claim generation; every write from an executor must quote it.
    pub attempt: u32,
    pub error: Option<String>,
    pub image_path: PathBuf,
    pub image_sha256: String,
    pub result: Option<AnalysisResult>,
    pub retrieved_profile_ids: Option<Vec<i64>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
}

impl Job {
    pub fn view(&self) -> JobView {
        JobView {
            job_id: self.id.clone(),
            status: self.status,
            current_step: self.current_step.clone(),
            progress_percentage: self.progress_percentage,
            error: self.error.clone(),
            retry_count: self.retry_count,
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }
}

/// Client-facing status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: String,
    pub status: JobStatus,
    pub current_step: String,
    pub progress_percentage: u8,
    pub error: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}
