//! API request and response models (DTOs).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{FailureReason, Job, JobStatus};

/// Added to `now` for the completion estimate of a running job.
const ESTIMATED_REMAINING_MINUTES: i64 = 3;

/// Body of `POST /separate`.
#[derive(Debug, Clone, Deserialize)]
pub struct SeparateRequest {
    pub url: String,
}

/// Reply to an accepted or joined submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeparateResponse {
    pub job_id: String,
    pub status: JobStatus,
    /// `true` when the submission joined a job created earlier.
    pub deduplicated: bool,
    pub status_url: String,
}

/// A downloadable artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactLink {
    pub name: String,
    pub download_url: String,
}

/// Failure details of a failed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobErrorBody {
    pub reason: FailureReason,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<JobStatus>,
}

/// Reply of `GET /status/{job_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<ArtifactLink>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobErrorBody>,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<DateTime<Utc>>,
}

pub fn status_url(job_id: &str) -> String {
    format!("/status/{job_id}")
}

pub fn download_url(job_id: &str, name: &str) -> String {
    format!("/download/{job_id}/{name}")
}

impl StatusResponse {
    /// Render `job` as seen at `now`. Artifacts are listed only while they
    /// can actually be downloaded.
    pub fn from_job(job: Job, now: DateTime<Utc>) -> Self {
        let artifacts = (job.status == JobStatus::Completed && !job.is_expired_at(now)).then(|| {
            job.artifacts
                .iter()
                .map(|a| ArtifactLink {
                    name: a.name.clone(),
                    download_url: download_url(&job.id, &a.name),
                })
                .collect()
        });
        let estimated_completion = (!job.status.is_terminal())
            .then(|| now + Duration::minutes(ESTIMATED_REMAINING_MINUTES));

        Self {
            artifacts,
            error: job.error.map(|e| JobErrorBody {
                reason: e.reason,
                message: e.message,
                stage: e.stage,
            }),
            estimated_completion,
            job_id: job.id,
            status: job.status,
            progress: job.progress,
            attempt_count: job.attempt_count,
            created_at: job.created_at,
            updated_at: job.updated_at,
            expires_at: job.expires_at,
        }
    }
}

/// Query of `GET /jobs`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Row of `GET /jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub source_url: String,
    pub owner_client: String,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobSummary {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
            source_url: job.source_url,
            owner_client: job.owner_client,
            attempt_count: job.attempt_count,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobListResponse {
    pub items: Vec<JobSummary>,
    pub limit: i64,
    pub offset: i64,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub cpu_usage: f32,
    pub memory_usage: f32,
    pub components: Vec<ComponentHealth>,
}

/// Component health status.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: String,
    pub message: Option<String>,
}
