//! Job and work-queue row models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::ms_to_datetime;
use crate::domain::{Artifact, Job, JobFailure, JobStatus};
use crate::{Error, Result};

/// Row of the `jobs` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    pub input_key: String,
    pub source_url: String,
    /// One of `pending|fetching|transforming|completed|failed|expired`
    pub status: String,
    pub progress: i64,
    pub owner_client: String,
    pub attempt_count: i64,
    /// JSON array of artifacts
    pub artifacts: String,
    /// JSON failure object
    pub error: Option<String>,
    /// Unix epoch milliseconds (UTC)
    pub created_at: i64,
    pub updated_at: i64,
    pub expires_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl TryFrom<JobDbModel> for Job {
    type Error = Error;

    fn try_from(row: JobDbModel) -> Result<Self> {
        let status = JobStatus::parse(&row.status).ok_or_else(|| {
            Error::Other(format!("job {} has unknown status '{}'", row.id, row.status))
        })?;
        let artifacts: Vec<Artifact> = serde_json::from_str(&row.artifacts)?;
        let error: Option<JobFailure> = row.error.as_deref().map(serde_json::from_str).transpose()?;

        Ok(Job {
            id: row.id,
            input_key: row.input_key,
            source_url: row.source_url,
            status,
            progress: row.progress.clamp(0, 100) as u8,
            owner_client: row.owner_client,
            attempt_count: row.attempt_count.max(0) as u32,
            artifacts,
            error,
            created_at: ms_to_datetime(row.created_at),
            updated_at: ms_to_datetime(row.updated_at),
            expires_at: row.expires_at.map(ms_to_datetime),
            completed_at: row.completed_at.map(ms_to_datetime),
        })
    }
}

/// Row of the `work_queue` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueueEntryDbModel {
    pub job_id: String,
    pub available_at: i64,
    pub enqueued_at: i64,
    pub lease_token: Option<String>,
    pub lease_expires_at: Option<i64>,
    /// Times this entry has been leased
    pub deliveries: i64,
}
