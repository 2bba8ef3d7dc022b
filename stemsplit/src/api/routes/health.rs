//! Health check routes.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};

use crate::api::error::ApiResult;
use crate::api::models::{ComponentHealth, HealthResponse};
use crate::api::server::AppState;
use crate::metrics::HealthStatus;

/// Create the health router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/live", get(liveness_check))
}

/// Detailed health of every registered component.
/// Returns HTTP 503 when any component is unhealthy.
async fn health_check(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let uptime = state.start_time.elapsed().as_secs();

    let Some(health_checker) = &state.health_checker else {
        // Fallback for testing without full service setup
        return Ok((
            StatusCode::OK,
            Json(HealthResponse {
                status: HealthStatus::Healthy.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_secs: uptime,
                cpu_usage: 0.0,
                memory_usage: 0.0,
                components: vec![],
            }),
        ));
    };

    let system_health = health_checker.check_all().await;

    let mut components: Vec<ComponentHealth> = system_health
        .components
        .into_iter()
        .map(|(name, health)| ComponentHealth {
            name,
            status: health.status.to_string(),
            message: health.message,
        })
        .collect();
    components.sort_by(|a, b| a.name.cmp(&b.name));

    let code = if system_health.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    Ok((
        code,
        Json(HealthResponse {
            status: system_health.status.to_string(),
            version: system_health.version,
            uptime_secs: uptime,
            cpu_usage: system_health.cpu_usage,
            memory_usage: system_health.memory_usage,
            components,
        }),
    ))
}

/// Readiness check - can the service accept submissions?
/// Returns HTTP 200 when the job store and storage are healthy, HTTP 503 otherwise.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if let Some(health_checker) = &state.health_checker {
        if health_checker.check_ready().await {
            (StatusCode::OK, "ready")
        } else {
            (StatusCode::SERVICE_UNAVAILABLE, "not ready")
        }
    } else {
        (StatusCode::OK, "ready")
    }
}

/// Liveness check - is the process responsive?
async fn liveness_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "alive",
            "uptime_secs": uptime
        })),
    )
}
