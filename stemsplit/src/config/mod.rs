//! Service configuration loaded from the environment.
//!
//! All knobs are plain environment variables (optionally provided through a
//! `.env` file). Unparseable values fall back to their defaults with a warning;
//! only a missing credential secret is fatal.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::dedup::DEFAULT_ALLOWED_HOSTS;
use crate::{Error, Result};

/// Default header carrying the client credential.
pub const DEFAULT_API_KEY_HEADER: &str = "access_token";

/// Service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Shared credential secret clients must present.
    pub api_key: String,
    /// Header name the credential is read from.
    pub api_key_header: String,
    /// SQLite URL of the job store.
    pub database_url: String,
    /// Root directory holding one subdirectory per job.
    pub storage_root: PathBuf,
    /// Directory for rolling log files.
    pub log_dir: PathBuf,
    /// Fallback log level when `RUST_LOG` is unset.
    pub log_level: String,
    pub bind_address: String,
    pub port: u16,
    /// Per-client cap on jobs in pending/fetching/transforming.
    pub max_concurrent_jobs: u32,
    /// Per-client admissions allowed per window.
    pub rate_limit_per_minute: u32,
    /// Length of the rate limiting window.
    pub rate_limit_window: Duration,
    /// Wall-clock budget for one attempt at both stages.
    pub job_timeout: Duration,
    /// Pickups before a job is failed for good.
    pub max_attempts: u32,
    /// How long a lease stays valid without an ack or a renewal. Running jobs
    /// renew theirs, so this bounds how long a crashed worker holds a job.
    pub lease_timeout: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// How long artifacts stay downloadable after completion.
    pub retention: Duration,
    /// How long an expired record is kept before deletion.
    pub record_grace: Duration,
    /// Interval between retention sweeps.
    pub sweep_interval: Duration,
    /// Largest accepted input (URL length and request body).
    pub max_input_bytes: usize,
    /// Hosts a submitted URL may point at.
    pub allowed_hosts: Vec<String>,
    pub worker_count: usize,
    pub ytdlp_path: String,
    pub demucs_path: String,
    pub demucs_model: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_key_header: DEFAULT_API_KEY_HEADER.to_string(),
            database_url: "sqlite:stemsplit.db?mode=rwc".to_string(),
            storage_root: PathBuf::from("jobs"),
            log_dir: PathBuf::from("logs"),
            log_level: "info".to_string(),
            bind_address: "0.0.0.0".to_string(),
            port: 8000,
            max_concurrent_jobs: 2,
            rate_limit_per_minute: 5,
            rate_limit_window: Duration::from_secs(60),
            job_timeout: Duration::from_secs(600),
            max_attempts: 3,
            lease_timeout: Duration::from_secs(720),
            retry_base_delay: Duration::from_secs(10),
            retry_max_delay: Duration::from_secs(60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            record_grace: Duration::from_secs(7 * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(15 * 60),
            max_input_bytes: 2048,
            allowed_hosts: DEFAULT_ALLOWED_HOSTS.iter().map(|h| h.to_string()).collect(),
            worker_count: 2,
            ytdlp_path: "yt-dlp".to_string(),
            demucs_path: "demucs".to_string(),
            demucs_model: "htdemucs".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the process environment.
    ///
    /// Reads `.env` first if present. Fails when `API_KEY` is missing or the
    /// resulting values are inconsistent.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let api_key = std::env::var("API_KEY")
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::config("API_KEY must be set"))?;

        let config = Self {
            api_key,
            api_key_header: env_string("API_KEY_HEADER", &defaults.api_key_header),
            database_url: env_string("DATABASE_URL", &defaults.database_url),
            storage_root: PathBuf::from(env_string(
                "STORAGE_ROOT",
                &defaults.storage_root.to_string_lossy(),
            )),
            log_dir: PathBuf::from(env_string("LOG_DIR", &defaults.log_dir.to_string_lossy())),
            log_level: env_string("LOG_LEVEL", &defaults.log_level).to_ascii_lowercase(),
            bind_address: env_string("API_BIND_ADDRESS", &defaults.bind_address),
            port: env_parse("API_PORT", defaults.port),
            max_concurrent_jobs: env_parse("MAX_CONCURRENT_JOBS", defaults.max_concurrent_jobs),
            rate_limit_per_minute: env_parse(
                "RATE_LIMIT_PER_MINUTE",
                defaults.rate_limit_per_minute,
            ),
            rate_limit_window: defaults.rate_limit_window,
            job_timeout: env_secs("JOB_TIMEOUT_SECS", defaults.job_timeout),
            max_attempts: env_parse("MAX_ATTEMPTS", defaults.max_attempts),
            lease_timeout: env_secs("LEASE_TIMEOUT_SECS", defaults.lease_timeout),
            retry_base_delay: env_secs("RETRY_BASE_DELAY_SECS", defaults.retry_base_delay),
            retry_max_delay: env_secs("RETRY_MAX_DELAY_SECS", defaults.retry_max_delay),
            retention: env_secs("RETENTION_SECS", defaults.retention),
            record_grace: env_secs("RECORD_GRACE_SECS", defaults.record_grace),
            sweep_interval: env_secs("SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            max_input_bytes: env_parse("MAX_INPUT_BYTES", defaults.max_input_bytes),
            allowed_hosts: env_list("ALLOWED_HOSTS", &defaults.allowed_hosts),
            worker_count: env_parse("WORKER_COUNT", defaults.worker_count),
            ytdlp_path: env_string("YTDLP_PATH", &defaults.ytdlp_path),
            demucs_path: env_string("DEMUCS_PATH", &defaults.demucs_path),
            demucs_model: env_string("DEMUCS_MODEL", &defaults.demucs_model),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(Error::config("API_KEY must not be empty"));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(Error::config("MAX_CONCURRENT_JOBS must be at least 1"));
        }
        if self.rate_limit_per_minute == 0 {
            return Err(Error::config("RATE_LIMIT_PER_MINUTE must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(Error::config("MAX_ATTEMPTS must be at least 1"));
        }
        if self.allowed_hosts.is_empty() {
            return Err(Error::config("ALLOWED_HOSTS must name at least one host"));
        }
        if self.worker_count == 0 {
            return Err(Error::config("WORKER_COUNT must be at least 1"));
        }
        for (name, value) in [
            ("JOB_TIMEOUT_SECS", self.job_timeout),
            ("LEASE_TIMEOUT_SECS", self.lease_timeout),
            ("RETENTION_SECS", self.retention),
            ("SWEEP_INTERVAL_SECS", self.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(Error::config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }
}

fn env_string(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

fn env_list(key: &str, default: &[String]) -> Vec<String> {
    let hosts: Vec<String> = env_string(key, "")
        .split(',')
        .map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .collect();
    if hosts.is_empty() {
        default.to_vec()
    } else {
        hosts
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, default = ?default, "Invalid value, using default");
                default
            }
        },
        _ => default,
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(key, default.as_secs()))
}
