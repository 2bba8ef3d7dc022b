//! API route modules.

pub mod download;
pub mod health;
pub mod jobs;
pub mod metrics;

use axum::Router;

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(jobs::router())
        .merge(download::router())
        .merge(metrics::router())
        .nest("/health", health::router())
        .with_state(state)
}
