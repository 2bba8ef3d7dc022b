//! Job store repository.
//!
//! `compare_and_set_status` is the only way a job changes after creation.
//! Every write names the status (and optionally the attempt number) it
//! expects to find; a mismatch leaves the row untouched and reports
//! [`Error::Conflict`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::database::models::JobDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::{datetime_to_ms, now_ms};
use crate::domain::{Artifact, Job, JobFailure, JobStatus, NewJob};
use crate::{Error, Result};

/// Maximum page size for job listings.
pub const MAX_LIST_LIMIT: i64 = 100;

/// Extra fields written together with a status change.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    /// Only apply if the stored attempt count equals this value.
    pub expected_attempt: Option<u32>,
    /// Bump `attempt_count` by one (a worker pickup).
    pub increment_attempt: bool,
    /// Raise progress to this value; lower values are ignored.
    pub progress: Option<u8>,
    pub artifacts: Option<Vec<Artifact>>,
    pub error: Option<JobFailure>,
    pub expires_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TransitionFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at_attempt(mut self, attempt: u32) -> Self {
        self.expected_attempt = Some(attempt);
        self
    }

    pub fn pickup(mut self) -> Self {
        self.increment_attempt = true;
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn artifacts(mut self, artifacts: Vec<Artifact>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn error(mut self, error: JobFailure) -> Self {
        self.error = Some(error);
        self
    }

    pub fn expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn completed_at(mut self, completed_at: DateTime<Utc>) -> Self {
        self.completed_at = Some(completed_at);
        self
    }
}

/// Filter for job listings. Results are newest first.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub owner_client: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            owner_client: None,
            limit: MAX_LIST_LIMIT,
            offset: 0,
        }
    }
}

/// Job store trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new job in `pending`.
    async fn create_job(&self, job: &NewJob) -> Result<Job>;
    async fn get_job(&self, id: &str) -> Result<Job>;
    /// Move `id` from `expected` to `next` and write `fields`, atomically.
    async fn compare_and_set_status(
        &self,
        id: &str,
        expected: JobStatus,
        next: JobStatus,
        fields: TransitionFields,
    ) -> Result<Job>;
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;
    async fn count_by_status(&self) -> Result<Vec<(JobStatus, i64)>>;
    /// Number of jobs holding a quota slot, per owner.
    async fn active_counts_by_owner(&self) -> Result<Vec<(String, i64)>>;
    /// Active jobs plus completed jobs still inside retention.
    async fn list_dedup_candidates(&self, now: DateTime<Utc>) -> Result<Vec<Job>>;
    /// Completed or failed jobs whose `expires_at` has passed.
    async fn list_due_for_expiry(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>>;
    /// Delete up to `limit` expired records whose `expires_at` is before `cutoff`.
    async fn delete_expired_before(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64>;
}

/// SQLx implementation of [`JobRepository`].
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn into_jobs(rows: Vec<JobDbModel>) -> Result<Vec<Job>> {
    rows.into_iter().map(Job::try_from).collect()
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn create_job(&self, job: &NewJob) -> Result<Job> {
        let row = retry_on_sqlite_busy("create_job", || async {
            let now = now_ms();
            let row = sqlx::query_as::<_, JobDbModel>(
                r#"
                INSERT INTO jobs (id, input_key, source_url, status, progress, owner_client,
                                  attempt_count, artifacts, created_at, updated_at)
                VALUES (?, ?, ?, 'pending', 0, ?, 0, '[]', ?, ?)
                RETURNING *
                "#,
            )
            .bind(&job.id)
            .bind(&job.input_key)
            .bind(&job.source_url)
            .bind(&job.owner_client)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
            Ok(row)
        })
        .await?;
        Job::try_from(row)
    }

    async fn get_job(&self, id: &str) -> Result<Job> {
        let row = sqlx::query_as::<_, JobDbModel>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))?;
        Job::try_from(row)
    }

    async fn compare_and_set_status(
        &self,
        id: &str,
        expected: JobStatus,
        next: JobStatus,
        fields: TransitionFields,
    ) -> Result<Job> {
        expected.transition_to(next)?;

        let artifacts = fields
            .artifacts
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let error = fields.error.as_ref().map(serde_json::to_string).transpose()?;
        let progress = fields.progress.map(i64::from);
        let attempt_increment: i64 = if fields.increment_attempt { 1 } else { 0 };
        let expected_attempt = fields.expected_attempt.map(i64::from);
        let expires_at = fields.expires_at.map(datetime_to_ms);
        let completed_at = fields.completed_at.map(datetime_to_ms);

        let row = retry_on_sqlite_busy("compare_and_set_status", || async {
            let row = sqlx::query_as::<_, JobDbModel>(
                r#"
                UPDATE jobs SET
                    status = ?,
                    progress = MAX(progress, COALESCE(?, progress)),
                    attempt_count = attempt_count + ?,
                    artifacts = COALESCE(?, artifacts),
                    error = COALESCE(?, error),
                    expires_at = COALESCE(?, expires_at),
                    completed_at = COALESCE(?, completed_at),
                    updated_at = ?
                WHERE id = ? AND status = ? AND (? IS NULL OR attempt_count = ?)
                RETURNING *
                "#,
            )
            .bind(next.as_str())
            .bind(progress)
            .bind(attempt_increment)
            .bind(artifacts.as_deref())
            .bind(error.as_deref())
            .bind(expires_at)
            .bind(completed_at)
            .bind(now_ms())
            .bind(id)
            .bind(expected.as_str())
            .bind(expected_attempt)
            .bind(expected_attempt)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await?;

        match row {
            Some(row) => Job::try_from(row),
            None => {
                // Distinguish a missing job from a stale writer.
                let current = self.get_job(id).await?;
                let expected_desc = match fields.expected_attempt {
                    Some(attempt) => format!("{expected}@{attempt}"),
                    None => expected.to_string(),
                };
                tracing::debug!(
                    job_id = %id,
                    expected = %expected_desc,
                    actual = %format!("{}@{}", current.status, current.attempt_count),
                    "Compare-and-set lost"
                );
                Err(Error::conflict(id, expected_desc))
            }
        }
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM jobs WHERE 1 = 1");
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(owner) = &filter.owner_client {
            builder.push(" AND owner_client = ").push_bind(owner.clone());
        }
        builder
            .push(" ORDER BY created_at DESC, id LIMIT ")
            .push_bind(filter.limit.clamp(1, MAX_LIST_LIMIT))
            .push(" OFFSET ")
            .push_bind(filter.offset.max(0));

        let rows = builder
            .build_query_as::<JobDbModel>()
            .fetch_all(&self.pool)
            .await?;
        into_jobs(rows)
    }

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(status, count)| JobStatus::parse(&status).map(|s| (s, count)))
            .collect())
    }

    async fn active_counts_by_owner(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query_as(
            r#"
            SELECT owner_client, COUNT(*) FROM jobs
            WHERE status IN ('pending', 'fetching', 'transforming')
            GROUP BY owner_client
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_dedup_candidates(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobDbModel>(
            r#"
            SELECT * FROM jobs
            WHERE status IN ('pending', 'fetching', 'transforming')
               OR (status = 'completed' AND expires_at > ?)
            ORDER BY created_at
            "#,
        )
        .bind(datetime_to_ms(now))
        .fetch_all(&self.pool)
        .await?;
        into_jobs(rows)
    }

    async fn list_due_for_expiry(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobDbModel>(
            r#"
            SELECT * FROM jobs
            WHERE status IN ('completed', 'failed')
              AND expires_at IS NOT NULL
              AND expires_at <= ?
            ORDER BY expires_at
            LIMIT ?
            "#,
        )
        .bind(datetime_to_ms(now))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        into_jobs(rows)
    }

    async fn delete_expired_before(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64> {
        let cutoff_ms = datetime_to_ms(cutoff);
        retry_on_sqlite_busy("delete_expired_before", || async {
            let result = sqlx::query(
                r#"
                DELETE FROM jobs WHERE id IN (
                    SELECT id FROM jobs
                    WHERE status = 'expired' AND expires_at <= ?
                    LIMIT ?
                )
                "#,
            )
            .bind(cutoff_ms)
            .bind(limit)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}
