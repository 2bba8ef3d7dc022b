//! Drives one leased job through fetch and transform.
//!
//! Every store write names the status it expects and the attempt number
//! recorded at pickup. A worker whose lease lapsed and was handed to another
//! worker therefore conflicts on its next write and backs off without
//! touching quota, cache or the queue entry.
//!
//! The lease is renewed while stages run, so a slow attempt is never handed
//! to a second worker. Losing the lease abandons the attempt.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::collaborator::{
    CollaboratorError, Downloader, FailureCause, FailureClass, Separator,
};
use super::progress::{
    PROGRESS_DONE, PROGRESS_FETCH_START, PROGRESS_FETCHED, PROGRESS_TRANSFORMED, ProgressReporter,
    scale_into,
};
use super::work_queue::{Lease, WorkQueue};
use crate::admission::QuotaLedger;
use crate::artifacts::ArtifactStore;
use crate::config::AppConfig;
use crate::database::repositories::{JobRepository, TransitionFields};
use crate::dedup::DedupCache;
use crate::domain::{Artifact, FailureReason, Job, JobFailure, JobStatus, RetryPolicy};
use crate::metrics::MetricsCollector;
use crate::{Error, Result};

/// Execution limits.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Budget for both stages of one attempt.
    pub job_timeout: Duration,
    /// How long results stay available after a terminal write.
    pub retention: Duration,
    pub retry: RetryPolicy,
    /// Delay before re-offering a job whose pickup lost a race.
    pub conflict_backoff: Duration,
}

impl ExecutorConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            job_timeout: config.job_timeout,
            retention: config.retention,
            retry: RetryPolicy::new(
                config.max_attempts,
                config.retry_base_delay,
                config.retry_max_delay,
            ),
            conflict_backoff: Duration::from_secs(1),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

/// The two external tools a job runs through.
#[derive(Clone)]
pub struct Collaborators {
    pub downloader: Arc<dyn Downloader>,
    pub separator: Arc<dyn Separator>,
}

/// State outside the job record that terminal writes must update.
#[derive(Clone)]
pub struct Bookkeeping {
    pub quota: Arc<QuotaLedger>,
    pub cache: Arc<DedupCache>,
    pub metrics: Arc<MetricsCollector>,
}

/// What happened to a leased job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    /// A transient failure; the job is back in the queue.
    Requeued { attempt: u32, delay: Duration },
    Failed(FailureReason),
    /// The job was missing or already terminal; the queue entry was dropped.
    Skipped,
    /// Another actor advanced the job first; nothing was written.
    Superseded,
}

enum StageError {
    Collaborator {
        stage: JobStatus,
        error: CollaboratorError,
    },
    Store(Error),
}

impl From<Error> for StageError {
    fn from(e: Error) -> Self {
        Self::Store(e)
    }
}

/// Executes leased jobs.
pub struct JobExecutor {
    jobs: Arc<dyn JobRepository>,
    queue: Arc<WorkQueue>,
    artifacts: Arc<ArtifactStore>,
    collaborators: Collaborators,
    bookkeeping: Bookkeeping,
    config: ExecutorConfig,
}

impl JobExecutor {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        queue: Arc<WorkQueue>,
        artifacts: Arc<ArtifactStore>,
        collaborators: Collaborators,
        bookkeeping: Bookkeeping,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            jobs,
            queue,
            artifacts,
            collaborators,
            bookkeeping,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Lease one job and run it. `None` when nothing was leasable.
    pub async fn run_once(&self) -> Result<Option<ExecutionOutcome>> {
        let Some(lease) = self.queue.lease().await? else {
            return Ok(None);
        };
        self.execute(&lease).await.map(Some)
    }

    /// Run the job behind `lease` until it completes, fails, or is requeued.
    pub async fn execute(&self, lease: &Lease) -> Result<ExecutionOutcome> {
        let job = match self.jobs.get_job(&lease.job_id).await {
            Ok(job) => job,
            Err(Error::NotFound { .. }) => {
                warn!(job_id = %lease.job_id, "Queued job no longer exists");
                self.queue.ack(lease).await?;
                return Ok(ExecutionOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        if job.status.is_terminal() {
            debug!(job_id = %job.id, status = %job.status, "Dropping queue entry of finished job");
            self.queue.ack(lease).await?;
            return Ok(ExecutionOutcome::Skipped);
        }

        if !self.config.retry.should_retry(job.attempt_count) {
            // The previous holder died during the last allowed attempt.
            let failure = JobFailure::new(
                FailureReason::AttemptsExhausted,
                format!("gave up after {} attempts", job.attempt_count),
            )
            .in_stage(job.status);
            self.bookkeeping.metrics.record_job_failure("permanent");
            return self
                .fail(&job, job.status, job.attempt_count, failure, lease)
                .await;
        }

        let stage = match job.status {
            JobStatus::Pending => JobStatus::Fetching,
            other => other,
        };
        let mut fields = TransitionFields::new().pickup().at_attempt(job.attempt_count);
        if stage == JobStatus::Fetching {
            fields = fields.progress(PROGRESS_FETCH_START);
        }
        let job = match self
            .jobs
            .compare_and_set_status(&job.id, job.status, stage, fields)
            .await
        {
            Ok(job) => job,
            Err(e) if e.is_conflict() => {
                self.queue
                    .nack(lease, Some(self.config.conflict_backoff))
                    .await?;
                return Ok(ExecutionOutcome::Superseded);
            }
            Err(e) => return Err(e),
        };
        let attempt = job.attempt_count;
        info!(job_id = %job.id, attempt, stage = %stage, "Picked up job");

        let attempt_run = tokio::time::timeout(self.config.job_timeout, self.run_stages(&job, attempt));
        let result = tokio::select! {
            result = attempt_run => result,
            () = self.hold_lease(lease) => {
                warn!(job_id = %job.id, attempt, "Lease lost mid-attempt, abandoning");
                return Ok(ExecutionOutcome::Superseded);
            }
        };

        match result {
            Ok(Ok(artifacts)) => self.complete(&job, attempt, artifacts, lease).await,
            Ok(Err(StageError::Collaborator { stage, error })) => {
                self.handle_failure(&job, stage, attempt, error, lease).await
            }
            Ok(Err(StageError::Store(e))) if e.is_conflict() => {
                warn!(job_id = %job.id, attempt, "Job advanced by another worker, abandoning attempt");
                Ok(ExecutionOutcome::Superseded)
            }
            Ok(Err(StageError::Store(e))) => {
                let delay = self.config.retry.delay_after(attempt);
                error!(job_id = %job.id, attempt, error = %e, "Store error during job, requeueing");
                self.queue.nack(lease, Some(delay)).await?;
                Ok(ExecutionOutcome::Requeued { attempt, delay })
            }
            Err(_) => self.time_out(&job, attempt, lease).await,
        }
    }

    /// Keep renewing `lease`; returns only once it has been lost.
    async fn hold_lease(&self, lease: &Lease) {
        let period = (self.queue.lease_timeout() / 3).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.queue.renew(lease).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => warn!(job_id = %lease.job_id, error = %e, "Failed to renew lease"),
            }
        }
    }

    async fn run_stages(&self, job: &Job, attempt: u32) -> std::result::Result<Vec<Artifact>, StageError> {
        let audio = self.artifacts.fetched_audio(&job.id);

        match job.status {
            JobStatus::Fetching => {
                self.fetch(job, attempt, &audio).await?;
                self.jobs
                    .compare_and_set_status(
                        &job.id,
                        JobStatus::Fetching,
                        JobStatus::Transforming,
                        TransitionFields::new()
                            .at_attempt(attempt)
                            .progress(PROGRESS_FETCHED),
                    )
                    .await?;
            }
            JobStatus::Transforming => {
                debug!(job_id = %job.id, "Resuming at transform stage");
            }
            other => {
                return Err(StageError::Store(Error::InvalidStateTransition {
                    from: other.to_string(),
                    to: JobStatus::Transforming.to_string(),
                }));
            }
        }

        let stage = JobStatus::Transforming;
        if !tokio::fs::try_exists(&audio).await.unwrap_or(false) {
            return Err(StageError::Collaborator {
                stage,
                error: CollaboratorError::new(
                    FailureCause::NoOutput,
                    "fetched audio is missing; cannot resume separation",
                ),
            });
        }

        let outputs = self
            .collaborators
            .separator
            .transform(&audio, &self.artifacts.stems_dir(&job.id))
            .await
            .map_err(|error| StageError::Collaborator { stage, error })?;

        let mut artifacts = Vec::with_capacity(outputs.len());
        for output in outputs {
            let file = self
                .artifacts
                .relative_to_job(&job.id, &output.path)
                .map_err(|e| StageError::Collaborator {
                    stage,
                    error: CollaboratorError::new(FailureCause::NoOutput, e.to_string()),
                })?;
            artifacts.push(Artifact::new(output.name, file));
        }

        self.jobs
            .compare_and_set_status(
                &job.id,
                stage,
                stage,
                TransitionFields::new()
                    .at_attempt(attempt)
                    .progress(PROGRESS_TRANSFORMED),
            )
            .await?;

        Ok(artifacts)
    }

    /// Run the downloader while persisting its progress.
    async fn fetch(&self, job: &Job, attempt: u32, dest: &Path) -> std::result::Result<(), StageError> {
        let (reporter, mut progress) = ProgressReporter::channel(&job.id);

        let download = async move {
            let result = self
                .collaborators
                .downloader
                .fetch(&job.source_url, dest, &reporter)
                .await;
            drop(reporter);
            result
        };

        let persist = async {
            let mut written = PROGRESS_FETCH_START;
            while progress.changed().await.is_ok() {
                let percent = *progress.borrow_and_update();
                let mapped = scale_into(percent, PROGRESS_FETCH_START, PROGRESS_FETCHED);
                if mapped <= written {
                    continue;
                }
                let fields = TransitionFields::new().at_attempt(attempt).progress(mapped);
                match self
                    .jobs
                    .compare_and_set_status(&job.id, JobStatus::Fetching, JobStatus::Fetching, fields)
                    .await
                {
                    Ok(_) => written = mapped,
                    Err(e) if e.is_conflict() => break,
                    Err(e) => debug!(job_id = %job.id, error = %e, "Failed to persist progress"),
                }
            }
        };

        let (result, ()) = tokio::join!(download, persist);
        result.map_err(|error| StageError::Collaborator {
            stage: JobStatus::Fetching,
            error,
        })
    }

    async fn handle_failure(
        &self,
        job: &Job,
        stage: JobStatus,
        attempt: u32,
        error: CollaboratorError,
        lease: &Lease,
    ) -> Result<ExecutionOutcome> {
        let class = error.class();
        self.bookkeeping.metrics.record_job_failure(class.into());

        match class {
            FailureClass::Transient if self.config.retry.should_retry(attempt) => {
                let delay = self.config.retry.delay_after(attempt);
                warn!(
                    job_id = %job.id,
                    attempt,
                    stage = %stage,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, requeueing"
                );
                self.bookkeeping.metrics.record_job_retry();
                self.queue.nack(lease, Some(delay)).await?;
                Ok(ExecutionOutcome::Requeued { attempt, delay })
            }
            FailureClass::Transient => {
                let failure = JobFailure::new(
                    FailureReason::AttemptsExhausted,
                    format!("{error} (after {attempt} attempts)"),
                )
                .in_stage(stage);
                self.fail(job, stage, attempt, failure, lease).await
            }
            FailureClass::Permanent => {
                let failure =
                    JobFailure::new(FailureReason::Permanent, error.to_string()).in_stage(stage);
                self.fail(job, stage, attempt, failure, lease).await
            }
        }
    }

    async fn time_out(&self, job: &Job, attempt: u32, lease: &Lease) -> Result<ExecutionOutcome> {
        // The stage future was dropped mid-flight; the store knows where it stopped.
        let current = self.jobs.get_job(&job.id).await?;
        if current.attempt_count != attempt || current.status.is_terminal() {
            return Ok(ExecutionOutcome::Superseded);
        }
        self.bookkeeping.metrics.record_job_failure("timeout");
        let failure = JobFailure::new(
            FailureReason::Timeout,
            format!(
                "exceeded job timeout of {}s",
                self.config.job_timeout.as_secs()
            ),
        )
        .in_stage(current.status);
        self.fail(&current, current.status, attempt, failure, lease).await
    }

    async fn complete(
        &self,
        job: &Job,
        attempt: u32,
        artifacts: Vec<Artifact>,
        lease: &Lease,
    ) -> Result<ExecutionOutcome> {
        let now = Utc::now();
        let expires_at = expiry_from(now, self.config.retention);
        let stems = artifacts.len();
        let fields = TransitionFields::new()
            .at_attempt(attempt)
            .progress(PROGRESS_DONE)
            .artifacts(artifacts)
            .completed_at(now)
            .expires_at(expires_at);

        let done = match self
            .jobs
            .compare_and_set_status(&job.id, JobStatus::Transforming, JobStatus::Completed, fields)
            .await
        {
            Ok(done) => done,
            Err(e) if e.is_conflict() => return Ok(ExecutionOutcome::Superseded),
            Err(e) => return Err(e),
        };

        self.bookkeeping.quota.release(&done.owner_client);
        // The stored value has millisecond precision; the cache must agree with it.
        self.bookkeeping.cache.mark_completed(
            &done.input_key,
            &done.id,
            done.expires_at.unwrap_or(expires_at),
        );
        if let Some(elapsed) = done.processing_time().and_then(|d| d.to_std().ok()) {
            self.bookkeeping.metrics.record_job_completed(elapsed);
        }

        if let Err(e) = self
            .artifacts
            .remove_file(&self.artifacts.fetched_audio(&done.id))
            .await
        {
            warn!(job_id = %done.id, error = %e, "Failed to remove fetched audio");
        }

        self.queue.ack(lease).await?;
        info!(job_id = %done.id, attempt, stems, "Job completed");
        Ok(ExecutionOutcome::Completed)
    }

    async fn fail(
        &self,
        job: &Job,
        expected: JobStatus,
        attempt: u32,
        failure: JobFailure,
        lease: &Lease,
    ) -> Result<ExecutionOutcome> {
        let reason = failure.reason;
        let message = failure.message.clone();
        let fields = TransitionFields::new()
            .at_attempt(attempt)
            .error(failure)
            .expires_at(expiry_from(Utc::now(), self.config.retention));

        match self
            .jobs
            .compare_and_set_status(&job.id, expected, JobStatus::Failed, fields)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_conflict() => return Ok(ExecutionOutcome::Superseded),
            Err(e) => return Err(e),
        }

        error!(job_id = %job.id, attempt, reason = reason.as_str(), %message, "Job failed");
        self.bookkeeping.quota.release(&job.owner_client);
        self.bookkeeping.cache.invalidate(&job.input_key, &job.id);
        if let Err(e) = self.artifacts.remove_job_dir(&job.id).await {
            warn!(job_id = %job.id, error = %e, "Failed to remove job directory");
        }

        self.queue.ack(lease).await?;
        Ok(ExecutionOutcome::Failed(reason))
    }
}

/// `now + retention`, saturating at the latest representable instant.
pub(crate) fn expiry_from(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_from_saturates() {
        let now = Utc::now();
        assert_eq!(expiry_from(now, Duration::from_secs(60)), now + chrono::Duration::seconds(60));
        assert_eq!(expiry_from(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_config_from_app_config() {
        let config = ExecutorConfig::from_app_config(&AppConfig {
            max_attempts: 5,
            job_timeout: Duration::from_secs(30),
            ..AppConfig::default()
        });
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.job_timeout, Duration::from_secs(30));
        assert!(config.retry.should_retry(4));
        assert!(!config.retry.should_retry(5));
    }
}
