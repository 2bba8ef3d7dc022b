//! Retention sweep for finished jobs.
//!
//! Completed and failed jobs past `expires_at` become `expired` and lose
//! their job directory and cache entry. Expired records are deleted once
//! they are older than the configured grace period.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::admission::AdmissionController;
use crate::artifacts::ArtifactStore;
use crate::config::AppConfig;
use crate::database::repositories::{JobRepository, TransitionFields};
use crate::dedup::DedupCache;
use crate::domain::JobStatus;

/// Configuration for the retention sweep.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Interval between sweeps.
    pub interval: Duration,
    /// How long an expired record is kept before deletion.
    pub record_grace: Duration,
    /// Rows handled per store round trip.
    pub batch_size: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            record_grace: Duration::from_secs(7 * 24 * 60 * 60),
            batch_size: 100,
        }
    }
}

impl RetentionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            interval: config.sweep_interval,
            record_grace: config.record_grace,
            ..Self::default()
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: u64,
    pub records_deleted: u64,
    pub cache_pruned: usize,
    pub rate_limit_pruned: usize,
}

/// Expires finished jobs and reclaims their storage.
pub struct RetentionSweeper {
    config: RetentionConfig,
    jobs: Arc<dyn JobRepository>,
    cache: Arc<DedupCache>,
    artifacts: Arc<ArtifactStore>,
    admission: Option<Arc<AdmissionController>>,
}

impl RetentionSweeper {
    pub fn new(
        config: RetentionConfig,
        jobs: Arc<dyn JobRepository>,
        cache: Arc<DedupCache>,
        artifacts: Arc<ArtifactStore>,
    ) -> Self {
        Self {
            config,
            jobs,
            cache,
            artifacts,
            admission: None,
        }
    }

    /// Also drop idle rate limiter windows on every sweep.
    pub fn with_admission(mut self, admission: Arc<AdmissionController>) -> Self {
        self.admission = Some(admission);
        self
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// Run one sweep as of `now`.
    pub async fn run_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        loop {
            let due = self
                .jobs
                .list_due_for_expiry(now, self.config.batch_size)
                .await?;
            let batch_len = due.len() as i64;
            let expired_before = report.expired;

            for job in due {
                match self
                    .jobs
                    .compare_and_set_status(
                        &job.id,
                        job.status,
                        JobStatus::Expired,
                        TransitionFields::new(),
                    )
                    .await
                {
                    Ok(_) => {}
                    Err(e) if e.is_conflict() => continue,
                    Err(e) => {
                        warn!(job_id = %job.id, error = %e, "Failed to expire job");
                        continue;
                    }
                }

                report.expired += 1;
                self.cache.invalidate(&job.input_key, &job.id);
                if let Err(e) = self.artifacts.remove_job_dir(&job.id).await {
                    warn!(job_id = %job.id, error = %e, "Failed to remove expired job directory");
                }
                debug!(job_id = %job.id, "Job expired");
            }

            // A full batch that expired nothing would come back unchanged.
            if batch_len < self.config.batch_size || report.expired == expired_before {
                break;
            }
        }

        report.cache_pruned = self.cache.prune_expired(now);

        let cutoff = chrono::Duration::from_std(self.config.record_grace)
            .ok()
            .and_then(|grace| now.checked_sub_signed(grace))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        loop {
            let deleted = self
                .jobs
                .delete_expired_before(cutoff, self.config.batch_size)
                .await?;
            report.records_deleted += deleted;
            if (deleted as i64) < self.config.batch_size {
                break;
            }
        }

        if let Some(admission) = &self.admission {
            report.rate_limit_pruned = admission.rate_limiter().prune();
        }

        if report.expired > 0 || report.records_deleted > 0 {
            info!(
                expired = report.expired,
                records_deleted = report.records_deleted,
                cache_pruned = report.cache_pruned,
                "Retention sweep finished"
            );
        } else {
            debug!("Retention sweep found nothing to do");
        }

        Ok(report)
    }

    /// Sweep every `interval` until cancelled.
    pub fn start_background_task(self: Arc<Self>, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval);
            info!(
                interval_secs = self.config.interval.as_secs(),
                grace_secs = self.config.record_grace.as_secs(),
                "Retention sweeper started"
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Retention sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_sweep(Utc::now()).await {
                            error!(error = %e, "Retention sweep failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxJobRepository;
    use crate::database::{self, DbPool};
    use crate::domain::{Artifact, Job, NewJob};

    async fn setup() -> (tempfile::TempDir, DbPool) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("sweep.db").display());
        let pool = database::init_pool_with_size(&url, 4).await.unwrap();
        database::run_migrations(&pool).await.unwrap();
        (dir, pool)
    }

    async fn completed_job(
        jobs: &SqlxJobRepository,
        id: &str,
        expires_at: DateTime<Utc>,
    ) -> Job {
        jobs.create_job(&NewJob {
            id: id.to_string(),
            input_key: format!("key-{id}"),
            source_url: format!("https://youtu.be/{id}"),
            owner_client: "client".to_string(),
        })
        .await
        .unwrap();
        for (from, to) in [
            (JobStatus::Pending, JobStatus::Fetching),
            (JobStatus::Fetching, JobStatus::Transforming),
        ] {
            jobs.compare_and_set_status(id, from, to, TransitionFields::new())
                .await
                .unwrap();
        }
        jobs.compare_and_set_status(
            id,
            JobStatus::Transforming,
            JobStatus::Completed,
            TransitionFields::new()
                .artifacts(vec![Artifact::new("vocals", "stems/vocals.wav")])
                .completed_at(Utc::now())
                .expires_at(expires_at),
        )
        .await
        .unwrap()
    }

    fn sweeper(
        pool: &DbPool,
        cache: Arc<DedupCache>,
        artifacts: Arc<ArtifactStore>,
        record_grace: Duration,
    ) -> RetentionSweeper {
        RetentionSweeper::new(
            RetentionConfig {
                interval: Duration::from_secs(60),
                record_grace,
                batch_size: 2,
            },
            Arc::new(SqlxJobRepository::new(pool.clone())),
            cache,
            artifacts,
        )
    }

    #[tokio::test]
    async fn test_sweep_expires_past_due_jobs_only() {
        let (dir, pool) = setup().await;
        let jobs = SqlxJobRepository::new(pool.clone());
        let artifacts = Arc::new(ArtifactStore::new(dir.path().join("jobs")));
        let cache = Arc::new(DedupCache::new());
        let now = Utc::now();

        let stale = completed_job(&jobs, "stale", now - chrono::Duration::minutes(1)).await;
        let fresh = completed_job(&jobs, "fresh", now + chrono::Duration::hours(1)).await;
        for job in [&stale, &fresh] {
            std::fs::create_dir_all(artifacts.stems_dir(&job.id)).unwrap();
        }
        assert_eq!(cache.rebuild([&stale, &fresh]), 2);
        assert!(cache.get(&fresh.input_key).is_some());

        let report = sweeper(&pool, cache.clone(), artifacts.clone(), Duration::from_secs(3600))
            .run_sweep(now)
            .await
            .unwrap();

        assert_eq!(report.expired, 1);
        assert_eq!(report.records_deleted, 0);
        assert_eq!(jobs.get_job("stale").await.unwrap().status, JobStatus::Expired);
        assert_eq!(jobs.get_job("fresh").await.unwrap().status, JobStatus::Completed);
        assert!(!artifacts.job_dir("stale").exists());
        assert!(artifacts.job_dir("fresh").exists());
        assert!(cache.get(&stale.input_key).is_none());
        let live = cache.get(&fresh.input_key).unwrap();
        assert_eq!(live.job_id, fresh.id);
        assert_eq!(live.expires_at, fresh.expires_at);
    }

    #[tokio::test]
    async fn test_sweep_deletes_records_past_grace_in_batches() {
        let (dir, pool) = setup().await;
        let jobs = SqlxJobRepository::new(pool.clone());
        let artifacts = Arc::new(ArtifactStore::new(dir.path().join("jobs")));
        let now = Utc::now();

        for id in ["a", "b", "c", "d", "e"] {
            completed_job(&jobs, id, now - chrono::Duration::hours(2)).await;
        }

        let report = sweeper(&pool, Arc::new(DedupCache::new()), artifacts, Duration::from_secs(3600))
            .run_sweep(now)
            .await
            .unwrap();

        assert_eq!(report.expired, 5);
        assert_eq!(report.records_deleted, 5);
        assert!(jobs.get_job("a").await.is_err());
    }
}
