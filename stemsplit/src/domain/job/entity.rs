//! Job entity and its value types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobStatus;

/// A named output file produced by the separation stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Public name clients use in download URLs (e.g. `vocals`).
    pub name: String,
    /// File path relative to the job's own directory.
    pub file: String,
}

impl Artifact {
    pub fn new(name: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file: file.into(),
        }
    }
}

/// Why a job ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// A collaborator reported an error retrying cannot fix.
    Permanent,
    /// The attempt ran past the job timeout.
    Timeout,
    /// Transient errors persisted until the attempt budget ran out.
    AttemptsExhausted,
    /// The job could not be handed to the work queue.
    EnqueueFailed,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::Timeout => "timeout",
            Self::AttemptsExhausted => "attempts_exhausted",
            Self::EnqueueFailed => "enqueue_failed",
        }
    }
}

/// Structured failure cause stored on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub reason: FailureReason,
    pub message: String,
    /// Pipeline stage the failure happened in, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<JobStatus>,
}

impl JobFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            stage: None,
        }
    }

    pub fn in_stage(mut self, stage: JobStatus) -> Self {
        self.stage = Some(stage);
        self
    }
}

/// The unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Canonical input used for dedup.
    pub input_key: String,
    /// The URL handed to the downloader.
    pub source_url: String,
    pub status: JobStatus,
    pub progress: u8,
    /// Admission identity charged for the job.
    pub owner_client: String,
    pub attempt_count: u32,
    /// Populated only once the job is completed.
    pub artifacts: Vec<Artifact>,
    /// Populated only once the job failed.
    pub error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Look up a recorded artifact by its exact public name.
    pub fn artifact(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.name == name)
    }

    /// Whether `expires_at` has passed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Expired || self.expires_at.is_some_and(|exp| now >= exp)
    }

    /// Wall-clock processing time for finished jobs.
    pub fn processing_time(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|done| done - self.created_at)
    }
}

/// Data needed to create a job; everything else is derived by the store.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub input_key: String,
    pub source_url: String,
    pub owner_client: String,
}
