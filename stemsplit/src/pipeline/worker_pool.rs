//! Worker pool driving the job executor.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::executor::JobExecutor;

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// How long an idle worker sleeps before polling the queue again.
    ///
    /// Enqueues wake one worker immediately; polling picks up delayed
    /// retries and leases that lapsed.
    pub poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// A pool of workers leasing jobs from the queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    /// Workers currently executing a job.
    active_workers: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            active_workers: Arc::new(AtomicUsize::new(0)),
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn the workers.
    pub fn start(&self, executor: Arc<JobExecutor>) {
        let poll_interval = self.config.poll_interval;
        info!(workers = self.config.workers, "Starting worker pool");

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            return;
        };

        for i in 0..self.config.workers.max(1) {
            let executor = executor.clone();
            let cancellation_token = self.cancellation_token.clone();
            let active_workers = self.active_workers.clone();
            let notifier = executor.queue().notifier();

            join_set.spawn(async move {
                debug!(worker = i, "Worker started");

                loop {
                    if cancellation_token.is_cancelled() {
                        break;
                    }

                    // A leased job runs to completion even if cancellation
                    // arrives meanwhile.
                    active_workers.fetch_add(1, Ordering::SeqCst);
                    let result = executor.run_once().await;
                    active_workers.fetch_sub(1, Ordering::SeqCst);

                    match result {
                        // Drain the queue before waiting again.
                        Ok(Some(outcome)) => {
                            debug!(worker = i, ?outcome, "Worker finished a job");
                            continue;
                        }
                        Ok(None) => {}
                        Err(e) => error!(worker = i, error = %e, "Worker iteration failed"),
                    }

                    tokio::select! {
                        _ = cancellation_token.cancelled() => break,
                        _ = notifier.notified() => {}
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }

                debug!(worker = i, "Worker shutting down");
            });
        }
    }

    /// Stop taking leases and wait for in-flight jobs to finish.
    ///
    /// Callers that cannot wait should bound this with a timeout; a job
    /// abandoned that way keeps its lease and is re-delivered once it lapses.
    pub async fn stop(&self) {
        info!("Stopping worker pool");
        self.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("Worker pool stopped");
    }

    pub fn active_count(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}
