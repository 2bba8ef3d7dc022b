//! Service container for dependency injection.
//!
//! The ServiceContainer builds every service from an [`AppConfig`] and a
//! database pool, and owns the background tasks' lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::submission::{JobService, RecoveryReport};
use crate::Result;
use crate::admission::{AdmissionController, QuotaLedger};
use crate::artifacts::ArtifactStore;
use crate::config::AppConfig;
use crate::database::DbPool;
use crate::database::repositories::{JobRepository, SqlxJobRepository, SqlxQueueRepository};
use crate::dedup::{DedupCache, InputPolicy};
use crate::metrics::{HealthChecker, MetricsCollector, probes};
use crate::pipeline::{
    Bookkeeping, Collaborators, DemucsSeparator, ExecutorConfig, JobExecutor, RetentionConfig,
    RetentionSweeper, WorkQueue, WorkerPool, WorkerPoolConfig, YtDlpDownloader,
};

/// Default shutdown timeout.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Service container holding all application services.
pub struct ServiceContainer {
    pub config: AppConfig,
    pub pool: DbPool,
    pub jobs: Arc<dyn JobRepository>,
    pub queue: Arc<WorkQueue>,
    pub cache: Arc<DedupCache>,
    pub artifacts: Arc<ArtifactStore>,
    pub admission: Arc<AdmissionController>,
    pub metrics: Arc<MetricsCollector>,
    pub health: Arc<HealthChecker>,
    pub job_service: Arc<JobService>,
    executor: Arc<JobExecutor>,
    worker_pool: WorkerPool,
    sweeper: Arc<RetentionSweeper>,
    sweeper_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    /// Cancellation token for graceful shutdown.
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Build the services with the external tools named in `config`.
    pub async fn new(config: AppConfig, pool: DbPool) -> Self {
        let collaborators = Collaborators {
            downloader: Arc::new(YtDlpDownloader::new(config.ytdlp_path.clone())),
            separator: Arc::new(DemucsSeparator::new(
                config.demucs_path.clone(),
                config.demucs_model.clone(),
            )),
        };
        Self::with_collaborators(config, pool, collaborators).await
    }

    /// Build the services around the given downloader and separator.
    pub async fn with_collaborators(
        config: AppConfig,
        pool: DbPool,
        collaborators: Collaborators,
    ) -> Self {
        info!("Initializing service container");

        let jobs: Arc<dyn JobRepository> = Arc::new(SqlxJobRepository::new(pool.clone()));
        let queue = Arc::new(WorkQueue::new(
            Arc::new(SqlxQueueRepository::new(pool.clone())),
            config.lease_timeout,
        ));
        let cache = Arc::new(DedupCache::new());
        let artifacts = Arc::new(ArtifactStore::new(config.storage_root.clone()));
        let quota = Arc::new(QuotaLedger::new(config.max_concurrent_jobs));
        let admission = Arc::new(AdmissionController::from_config(&config, quota.clone()));
        let metrics = Arc::new(MetricsCollector::new());

        let job_service = Arc::new(JobService::new(
            admission.clone(),
            InputPolicy::new(config.allowed_hosts.iter().cloned(), config.max_input_bytes),
            cache.clone(),
            jobs.clone(),
            queue.clone(),
            metrics.clone(),
        ));

        let executor = Arc::new(JobExecutor::new(
            jobs.clone(),
            queue.clone(),
            artifacts.clone(),
            collaborators,
            Bookkeeping {
                quota,
                cache: cache.clone(),
                metrics: metrics.clone(),
            },
            ExecutorConfig::from_app_config(&config),
        ));

        let worker_pool = WorkerPool::new(WorkerPoolConfig {
            workers: config.worker_count,
            ..WorkerPoolConfig::default()
        });

        let sweeper = Arc::new(
            RetentionSweeper::new(
                RetentionConfig::from_app_config(&config),
                jobs.clone(),
                cache.clone(),
                artifacts.clone(),
            )
            .with_admission(admission.clone()),
        );

        let health = Arc::new(HealthChecker::new());
        health
            .register_critical("database", probes::database_check(pool.clone()))
            .await;
        health
            .register_critical("storage", probes::storage_check(config.storage_root.clone()))
            .await;
        health
            .register("queue", probes::queue_check(queue.repository().clone()))
            .await;
        health
            .register("yt-dlp", probes::tool_check("yt-dlp", config.ytdlp_path.clone()))
            .await;
        health
            .register("demucs", probes::tool_check("demucs", config.demucs_path.clone()))
            .await;

        Self {
            config,
            pool,
            jobs,
            queue,
            cache,
            artifacts,
            admission,
            metrics,
            health,
            job_service,
            executor,
            worker_pool,
            sweeper,
            sweeper_task: parking_lot::Mutex::new(None),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Recover state from the store and start the workers and the sweep.
    pub async fn initialize(&self) -> Result<RecoveryReport> {
        info!("Initializing services");

        self.artifacts.ensure_root().await?;
        let report = self.job_service.recover().await?;

        self.worker_pool.start(self.executor.clone());
        let handle = self
            .sweeper
            .clone()
            .start_background_task(self.cancellation_token.child_token());
        *self.sweeper_task.lock() = Some(handle);

        info!("Services initialized");
        Ok(report)
    }

    pub fn executor(&self) -> &Arc<JobExecutor> {
        &self.executor
    }

    pub fn sweeper(&self) -> &Arc<RetentionSweeper> {
        &self.sweeper
    }

    /// Shutdown all services gracefully.
    pub async fn shutdown(&self) {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Stop the background tasks, waiting at most `timeout` for in-flight jobs.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) {
        info!(timeout_secs = timeout.as_secs(), "Shutting down services");
        self.cancellation_token.cancel();

        if tokio::time::timeout(timeout, self.worker_pool.stop())
            .await
            .is_err()
        {
            warn!("Shutdown timeout reached; unfinished jobs will be re-delivered after their lease lapses");
        }

        let handle = self.sweeper_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Retention sweeper task ended abnormally");
            }
        }

        info!("Closing database pool");
        self.pool.close().await;
        info!("Services shut down");
    }

    /// Get the cancellation token for external use.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
