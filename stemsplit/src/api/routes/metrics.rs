//! Prometheus metrics route.

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use tracing::warn;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::domain::JobStatus;
use crate::metrics::PrometheusExporter;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub fn router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics))
}

/// Refresh store-backed gauges, then render every metric.
async fn metrics(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let Some(collector) = state.metrics.clone() else {
        return Err(ApiError::service_unavailable("Metrics not available"));
    };

    if let Some(queue) = &state.work_queue {
        match queue.depth().await {
            Ok(depth) => collector.set_queue_depth(depth),
            Err(e) => warn!(error = %e, "Failed to read queue depth for metrics"),
        }
    }

    if let Some(jobs) = &state.job_repository {
        match jobs.count_by_status().await {
            Ok(counts) => {
                // Statuses with no rows still export an explicit zero.
                for status in JobStatus::ALL {
                    let count = counts
                        .iter()
                        .find(|(s, _)| *s == status)
                        .map(|(_, c)| (*c).max(0) as u64)
                        .unwrap_or(0);
                    collector.set_jobs_by_status(status.as_str(), count);
                }
            }
            Err(e) => warn!(error = %e, "Failed to count jobs for metrics"),
        }
    }

    let body = PrometheusExporter::new(collector).export();
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, CONTENT_TYPE)], body))
}
