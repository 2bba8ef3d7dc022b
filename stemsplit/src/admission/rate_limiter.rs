//! Per-client fixed-window request limiting.
//!
//! Each client owns one counter in a sharded map, so checks for different
//! clients never wait on each other.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::trace;

/// Configuration for the admission rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Requests allowed per window.
    pub max_requests: u32,
    /// Window length.
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 5,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimiterConfig {
    pub fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window counter keyed by client identity.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Count one request for `client`.
    ///
    /// Returns `Err(retry_after)` when the client already used its budget for
    /// the current window; rejected requests are not counted.
    pub fn try_acquire(&self, client: &str) -> Result<(), Duration> {
        self.try_acquire_at(client, Instant::now())
    }

    fn try_acquire_at(&self, client: &str, now: Instant) -> Result<(), Duration> {
        let mut entry = self.windows.entry(client.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        let elapsed = now.saturating_duration_since(entry.started);
        if elapsed >= self.config.window {
            entry.started = now;
            entry.count = 0;
        }

        if entry.count >= self.config.max_requests {
            let retry_after = self
                .config
                .window
                .saturating_sub(now.saturating_duration_since(entry.started));
            trace!(client, ?retry_after, "Rate limited");
            return Err(retry_after);
        }

        entry.count += 1;
        Ok(())
    }

    /// Drop windows that ended; returns how many were removed.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) < self.config.window);
        before - self.windows.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}
