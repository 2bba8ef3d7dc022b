//! Job submission, status lookup and startup recovery.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::admission::AdmissionController;
use crate::artifacts::parse_job_id;
use crate::database::repositories::{JobFilter, JobRepository, TransitionFields};
use crate::dedup::{DedupCache, InputPolicy};
use crate::domain::{FailureReason, Job, JobFailure, JobStatus, NewJob};
use crate::metrics::{MetricsCollector, outcome};
use crate::pipeline::WorkQueue;
use crate::{Error, Result};

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub job_id: String,
    pub status: JobStatus,
    /// `false` when the submission joined an existing job.
    pub is_new: bool,
}

/// What startup recovery rebuilt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub quota_clients: usize,
    pub cache_entries: usize,
    pub requeued: usize,
}

/// Entry point for everything a client can ask of the job store.
pub struct JobService {
    admission: Arc<AdmissionController>,
    policy: InputPolicy,
    cache: Arc<DedupCache>,
    jobs: Arc<dyn JobRepository>,
    queue: Arc<WorkQueue>,
    metrics: Arc<MetricsCollector>,
}

impl JobService {
    pub fn new(
        admission: Arc<AdmissionController>,
        policy: InputPolicy,
        cache: Arc<DedupCache>,
        jobs: Arc<dyn JobRepository>,
        queue: Arc<WorkQueue>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            admission,
            policy,
            cache,
            jobs,
            queue,
            metrics,
        }
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Admit, deduplicate and enqueue a submission of `raw_url` by `client`.
    pub async fn submit(
        &self,
        client: &str,
        credential: Option<&str>,
        raw_url: &str,
    ) -> Result<Submission> {
        let result = self.try_submit(client, credential, raw_url).await;
        let label = match &result {
            Ok(submission) if submission.is_new => outcome::ACCEPTED,
            Ok(_) => outcome::JOINED,
            Err(e) => outcome_for(e),
        };
        self.metrics.record_admission(label);
        result
    }

    async fn try_submit(
        &self,
        client: &str,
        credential: Option<&str>,
        raw_url: &str,
    ) -> Result<Submission> {
        let reservation = self.admission.admit(client, credential)?;
        let input = self.policy.canonicalize(raw_url)?;

        let slot = self.cache.reserve_or_join(&input.key);
        if !slot.is_new {
            // Joining costs no quota.
            drop(reservation);
            self.metrics.record_dedup_join();
            let status = match self.jobs.get_job(&slot.job_id).await {
                Ok(job) => job.status,
                // The owner is still between reserving and creating.
                Err(Error::NotFound { .. }) => JobStatus::Pending,
                Err(e) => return Err(e),
            };
            info!(client, job_id = %slot.job_id, %status, "Submission joined existing job");
            return Ok(Submission {
                job_id: slot.job_id,
                status,
                is_new: false,
            });
        }

        let new_job = NewJob {
            id: slot.job_id,
            input_key: input.key,
            source_url: input.source_url,
            owner_client: client.to_string(),
        };

        if let Err(e) = self.jobs.create_job(&new_job).await {
            error!(client, job_id = %new_job.id, error = %e, "Failed to create job");
            self.cache.invalidate(&new_job.input_key, &new_job.id);
            return Err(e);
        }

        if let Err(e) = self.queue.enqueue(&new_job.id).await {
            error!(client, job_id = %new_job.id, error = %e, "Failed to enqueue job");
            self.abandon(&new_job, &e).await;
            return Err(e);
        }

        reservation.commit();
        info!(client, job_id = %new_job.id, source_url = %new_job.source_url, "Job accepted");
        Ok(Submission {
            job_id: new_job.id,
            status: JobStatus::Pending,
            is_new: true,
        })
    }

    /// Fail a created job that never made it into the queue.
    async fn abandon(&self, job: &NewJob, cause: &Error) {
        let fields = TransitionFields::new()
            .error(JobFailure::new(FailureReason::EnqueueFailed, cause.to_string()))
            .expires_at(Utc::now());
        if let Err(e) = self
            .jobs
            .compare_and_set_status(&job.id, JobStatus::Pending, JobStatus::Failed, fields)
            .await
        {
            warn!(job_id = %job.id, error = %e, "Failed to mark unqueued job as failed");
        }
        self.cache.invalidate(&job.input_key, &job.id);
    }

    /// Look up a job by a client-supplied id.
    pub async fn status(&self, raw_id: &str) -> Result<Job> {
        let id = parse_job_id(raw_id)?;
        self.jobs.get_job(&id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.jobs.list_jobs(filter).await
    }

    /// Rebuild in-memory state from the store after a restart.
    ///
    /// Active jobs are also re-enqueued; enqueueing a job that still has a
    /// queue row is a no-op.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let counts = self.jobs.active_counts_by_owner().await?;
        let quota_clients = counts.len();
        self.admission.quota().restore(counts);

        let candidates = self.jobs.list_dedup_candidates(Utc::now()).await?;
        let cache_entries = self.cache.rebuild(candidates.iter());

        let mut requeued = 0;
        for job in candidates.iter().filter(|job| job.status.is_active()) {
            self.queue.enqueue(&job.id).await?;
            requeued += 1;
        }

        let report = RecoveryReport {
            quota_clients,
            cache_entries,
            requeued,
        };
        info!(
            quota_clients,
            cache_entries,
            requeued,
            "Recovered job state from store"
        );
        Ok(report)
    }
}

/// Admission metric label for a rejected submission.
fn outcome_for(error: &Error) -> &'static str {
    match error {
        Error::Unauthorized(_) => outcome::UNAUTHORIZED,
        Error::RateLimited { .. } => outcome::RATE_LIMITED,
        Error::QuotaExceeded { .. } => outcome::QUOTA_EXCEEDED,
        Error::InvalidInput(_) => outcome::INVALID_INPUT,
        _ => outcome::ERROR,
    }
}
