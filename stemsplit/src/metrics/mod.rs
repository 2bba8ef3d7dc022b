//! Metrics and health reporting.
//!
//! - Counters and gauges for admission, queue, and job outcomes
//! - Prometheus text export (`/metrics`)
//! - Component health checks (`/health`, `/health/ready`)

mod collector;
mod health;
mod prometheus;
pub mod probes;

pub use collector::{MetricsCollector, MetricsSnapshot, outcome};
pub use health::{ComponentHealth, HealthCheckFn, HealthChecker, HealthStatus, SystemHealth};
pub use prometheus::PrometheusExporter;
