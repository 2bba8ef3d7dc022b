//! Metrics collector implementation.
//!
//! Counters are bumped from the request and worker paths; gauges that mirror
//! store state are refreshed right before an export.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Admission outcome labels.
pub mod outcome {
    pub const ACCEPTED: &str = "accepted";
    pub const JOINED: &str = "joined";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const QUOTA_EXCEEDED: &str = "quota_exceeded";
    pub const INVALID_INPUT: &str = "invalid_input";
    pub const ERROR: &str = "error";
}

/// Metrics collector for the job service.
#[derive(Debug)]
pub struct MetricsCollector {
    // Admission metrics
    admissions: DashMap<String, AtomicU64>,
    dedup_joins: AtomicU64,

    // Queue and job metrics
    queue_depth: AtomicU64,
    jobs_by_status: DashMap<String, AtomicU64>,
    job_failures: DashMap<String, AtomicU64>,
    job_retries: AtomicU64,
    jobs_completed: AtomicU64,
    job_duration_total_ms: AtomicU64,
    job_duration_count: AtomicU64,

    // HTTP metrics
    http_requests: AtomicU64,

    start_time: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            admissions: DashMap::new(),
            dedup_joins: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            jobs_by_status: DashMap::new(),
            job_failures: DashMap::new(),
            job_retries: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            job_duration_total_ms: AtomicU64::new(0),
            job_duration_count: AtomicU64::new(0),
            http_requests: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    // ========== Admission Metrics ==========

    /// Count one submission by outcome (see [`outcome`]).
    pub fn record_admission(&self, outcome: &str) {
        increment(&self.admissions, outcome);
    }

    pub fn record_dedup_join(&self) {
        self.dedup_joins.fetch_add(1, Ordering::Relaxed);
    }

    // ========== Job Metrics ==========

    pub fn set_queue_depth(&self, depth: u64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    /// Set the number of stored jobs in `status`.
    pub fn set_jobs_by_status(&self, status: impl Into<String>, count: u64) {
        self.jobs_by_status
            .entry(status.into())
            .or_insert_with(|| AtomicU64::new(0))
            .store(count, Ordering::Relaxed);
    }

    /// Count a worker failure by classification (`transient`, `permanent`, `timeout`).
    pub fn record_job_failure(&self, class: &str) {
        increment(&self.job_failures, class);
    }

    pub fn record_job_retry(&self) {
        self.job_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed job and the wall time from creation to completion.
    pub fn record_job_completed(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.job_duration_total_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        self.job_duration_count.fetch_add(1, Ordering::Relaxed);
    }

    // ========== HTTP Metrics ==========

    pub fn record_http_request(&self) {
        self.http_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    // ========== Snapshot ==========

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            admissions: collect(&self.admissions),
            dedup_joins: self.dedup_joins.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            jobs_by_status: collect(&self.jobs_by_status),
            job_failures: collect(&self.job_failures),
            job_retries: self.job_retries.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            job_duration_seconds_sum: self.job_duration_total_ms.load(Ordering::Relaxed) as f64
                / 1000.0,
            job_duration_count: self.job_duration_count.load(Ordering::Relaxed),
            http_requests: self.http_requests.load(Ordering::Relaxed),
            uptime_secs: self.uptime().as_secs(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn increment(map: &DashMap<String, AtomicU64>, key: &str) {
    // Fast path avoids allocating the key once the label exists.
    if let Some(counter) = map.get(key) {
        counter.fetch_add(1, Ordering::Relaxed);
        return;
    }
    map.entry(key.to_string())
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(1, Ordering::Relaxed);
}

fn collect(map: &DashMap<String, AtomicU64>) -> HashMap<String, u64> {
    map.iter()
        .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
        .collect()
}

/// A snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub admissions: HashMap<String, u64>,
    pub dedup_joins: u64,
    pub queue_depth: u64,
    pub jobs_by_status: HashMap<String, u64>,
    pub job_failures: HashMap<String, u64>,
    pub job_retries: u64,
    pub jobs_completed: u64,
    pub job_duration_seconds_sum: f64,
    pub job_duration_count: u64,
    pub http_requests: u64,
    pub uptime_secs: u64,
}
