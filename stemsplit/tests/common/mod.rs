#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use stemsplit::config::AppConfig;
use stemsplit::database::{DbPool, init_pool_with_size, run_migrations};
use stemsplit::domain::{Job, JobStatus};
use stemsplit::pipeline::{
    CollaboratorError, Collaborators, Downloader, ExecutionOutcome, JobExecutor,
    ProgressReporter, Separator, StemOutput,
};
use stemsplit::services::ServiceContainer;

pub const API_KEY: &str = "test-secret";
pub const STEMS: [&str; 4] = ["vocals", "drums", "bass", "other"];

/// A YouTube watch URL with a valid, distinct video id per `n`.
pub fn video_url(n: u32) -> String {
    format!("https://www.youtube.com/watch?v=vid{n:08}")
}

pub fn test_config(dir: &Path) -> AppConfig {
    AppConfig {
        api_key: API_KEY.to_string(),
        database_url: format!("sqlite://{}?mode=rwc", dir.join("stemsplit.db").display()),
        storage_root: dir.join("jobs"),
        log_dir: dir.join("logs"),
        rate_limit_per_minute: 1000,
        job_timeout: Duration::from_secs(10),
        lease_timeout: Duration::from_secs(30),
        retry_base_delay: Duration::from_millis(5),
        retry_max_delay: Duration::from_millis(20),
        worker_count: 1,
        ..AppConfig::default()
    }
}

pub async fn open_pool(config: &AppConfig) -> DbPool {
    let pool = init_pool_with_size(&config.database_url, 4).await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

/// Downloader that plays back a script of results, then succeeds.
#[derive(Default)]
pub struct ScriptedDownloader {
    script: Mutex<VecDeque<Result<(), CollaboratorError>>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(results: impl IntoIterator<Item = Result<(), CollaboratorError>>) -> Self {
        Self {
            script: Mutex::new(results.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Downloader for ScriptedDownloader {
    async fn fetch(
        &self,
        _url: &str,
        dest: &Path,
        progress: &ProgressReporter,
    ) -> Result<(), CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().pop_front();
        if let Some(Err(e)) = next {
            return Err(e);
        }
        progress.report(50.0);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(dest, b"RIFF....WAVE").await.unwrap();
        progress.report(100.0);
        Ok(())
    }
}

/// Separator writing one small file per stem, laid out like demucs does.
#[derive(Default)]
pub struct FakeSeparator {
    calls: AtomicUsize,
}

impl FakeSeparator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Separator for FakeSeparator {
    async fn transform(
        &self,
        input: &Path,
        out_dir: &Path,
    ) -> Result<Vec<StemOutput>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(input.exists(), "separator ran before the audio was fetched");

        let track_dir = out_dir.join("htdemucs").join("audio");
        tokio::fs::create_dir_all(&track_dir).await.unwrap();
        let mut outputs = Vec::new();
        for stem in STEMS {
            let path = track_dir.join(format!("{stem}.wav"));
            tokio::fs::write(&path, format!("{stem} data")).await.unwrap();
            outputs.push(StemOutput {
                name: stem.to_string(),
                path,
            });
        }
        Ok(outputs)
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub container: ServiceContainer,
    pub downloader: Arc<ScriptedDownloader>,
    pub separator: Arc<FakeSeparator>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(|_| {}, ScriptedDownloader::new()).await
    }

    pub async fn build(
        tweak: impl FnOnce(&mut AppConfig),
        downloader: ScriptedDownloader,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        tweak(&mut config);
        let pool = open_pool(&config).await;

        let downloader = Arc::new(downloader);
        let separator = Arc::new(FakeSeparator::new());
        let collaborators = Collaborators {
            downloader: downloader.clone(),
            separator: separator.clone(),
        };
        let container = ServiceContainer::with_collaborators(config, pool, collaborators).await;
        container.artifacts.ensure_root().await.unwrap();

        Self {
            dir,
            container,
            downloader,
            separator,
        }
    }

    pub fn executor(&self) -> &Arc<JobExecutor> {
        self.container.executor()
    }

    pub fn storage_root(&self) -> PathBuf {
        self.container.config.storage_root.clone()
    }

    pub async fn job(&self, id: &str) -> Job {
        self.container.jobs.get_job(id).await.unwrap()
    }

    /// Run the executor until `job_id` reaches a terminal status, collecting outcomes.
    pub async fn drive_to_terminal(&self, job_id: &str) -> Vec<ExecutionOutcome> {
        let mut outcomes = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let job = self.job(job_id).await;
            if job.status.is_terminal() {
                return outcomes;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {job_id} stuck in {}",
                job.status
            );
            match self.executor().run_once().await.unwrap() {
                Some(outcome) => outcomes.push(outcome),
                None => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    }
}

pub fn is_active(status: JobStatus) -> bool {
    matches!(
        status,
        JobStatus::Pending | JobStatus::Fetching | JobStatus::Transforming
    )
}
