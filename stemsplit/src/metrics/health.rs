//! Health check implementation.
//!
//! Checks are async closures registered by name. Checks registered as
//! critical decide readiness; every check contributes to the overall status.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

/// Health status of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Functional, but something needs attention.
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Health information for a single component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    /// Last check time (RFC 3339).
    pub last_check: Option<String>,
    pub check_duration_ms: Option<u64>,
}

impl ComponentHealth {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Healthy, None)
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Unhealthy, Some(message.into()))
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Degraded, Some(message.into()))
    }

    fn with_status(name: impl Into<String>, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message,
            last_check: Some(chrono::Utc::now().to_rfc3339()),
            check_duration_ms: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.check_duration_ms = Some(duration.as_millis() as u64);
        self
    }
}

/// Overall system health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub components: HashMap<String, ComponentHealth>,
    pub version: String,
    pub uptime_secs: u64,
    pub timestamp: String,
    /// CPU usage percentage (0-100).
    pub cpu_usage: f32,
    /// Memory usage percentage (0-100).
    pub memory_usage: f32,
}

impl SystemHealth {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Async health check.
pub type HealthCheckFn = Arc<dyn Fn() -> BoxFuture<'static, ComponentHealth> + Send + Sync>;

struct RegisteredCheck {
    check: HealthCheckFn,
    critical: bool,
}

/// Health checker for the service.
pub struct HealthChecker {
    checks: RwLock<HashMap<String, RegisteredCheck>>,
    start_time: Instant,
    version: String,
    /// CPU or memory usage (percent) at which the host counts as degraded.
    resource_threshold: f32,
    system: Mutex<System>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::with_threshold(90.0)
    }

    pub fn with_threshold(resource_threshold: f32) -> Self {
        Self {
            checks: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            resource_threshold,
            system: Mutex::new(System::new_with_specifics(
                RefreshKind::nothing()
                    .with_cpu(CpuRefreshKind::everything())
                    .with_memory(MemoryRefreshKind::everything()),
            )),
        }
    }

    /// Register a check that only affects the overall status.
    pub async fn register(&self, name: impl Into<String>, check: HealthCheckFn) {
        self.insert(name.into(), check, false).await;
    }

    /// Register a check that must be healthy for the service to be ready.
    pub async fn register_critical(&self, name: impl Into<String>, check: HealthCheckFn) {
        self.insert(name.into(), check, true).await;
    }

    async fn insert(&self, name: String, check: HealthCheckFn, critical: bool) {
        self.checks
            .write()
            .await
            .insert(name, RegisteredCheck { check, critical });
    }

    pub async fn unregister(&self, name: &str) -> bool {
        self.checks.write().await.remove(name).is_some()
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Run all health checks.
    pub async fn check_all(&self) -> SystemHealth {
        let (cpu_usage, memory_usage) = self.sample_resources().await;

        let mut components = HashMap::new();
        let mut overall_status = HealthStatus::Healthy;

        let checks: Vec<(String, HealthCheckFn)> = {
            let guard = self.checks.read().await;
            guard
                .iter()
                .map(|(name, reg)| (name.clone(), reg.check.clone()))
                .collect()
        };

        for (name, check) in checks {
            let start = Instant::now();
            let health = check().await.with_duration(start.elapsed());
            overall_status = combine(overall_status, health.status);
            components.insert(name, health);
        }

        let system = self.resource_health(cpu_usage, memory_usage);
        overall_status = combine(overall_status, system.status);
        components.insert(system.name.clone(), system);

        SystemHealth {
            status: overall_status,
            components,
            version: self.version.clone(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            cpu_usage,
            memory_usage,
        }
    }

    /// Whether every critical check reports healthy.
    pub async fn check_ready(&self) -> bool {
        let critical: Vec<(String, HealthCheckFn)> = {
            let guard = self.checks.read().await;
            guard
                .iter()
                .filter(|(_, reg)| reg.critical)
                .map(|(name, reg)| (name.clone(), reg.check.clone()))
                .collect()
        };

        for (name, check) in critical {
            let health = check().await;
            if health.status != HealthStatus::Healthy {
                warn!(component = %name, status = %health.status, message = ?health.message, "Not ready");
                return false;
            }
        }
        true
    }

    async fn sample_resources(&self) -> (f32, f32) {
        let mut system = self.system.lock().await;
        system.refresh_cpu_all();
        system.refresh_memory();

        let cpu = system.global_cpu_usage();
        let total_mem = system.total_memory();
        let used_mem = system.used_memory();
        let mem_usage = if total_mem > 0 {
            (used_mem as f64 / total_mem as f64 * 100.0) as f32
        } else {
            0.0
        };
        (cpu, mem_usage)
    }

    /// Classify host resource usage against the threshold.
    pub fn resource_health(&self, cpu_usage: f32, memory_usage: f32) -> ComponentHealth {
        let mut problems = Vec::new();
        if cpu_usage >= self.resource_threshold {
            problems.push(format!("CPU usage {cpu_usage:.1}%"));
        }
        if memory_usage >= self.resource_threshold {
            problems.push(format!("memory usage {memory_usage:.1}%"));
        }
        if problems.is_empty() {
            ComponentHealth::healthy("system")
        } else {
            ComponentHealth::degraded("system", problems.join(", "))
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

fn combine(current: HealthStatus, next: HealthStatus) -> HealthStatus {
    match (current, next) {
        (_, HealthStatus::Unhealthy) | (HealthStatus::Unhealthy, _) => HealthStatus::Unhealthy,
        (HealthStatus::Healthy, HealthStatus::Healthy) => HealthStatus::Healthy,
        _ => HealthStatus::Degraded,
    }
}
