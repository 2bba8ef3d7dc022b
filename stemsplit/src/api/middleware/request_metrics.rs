//! Request counting middleware.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::api::server::AppState;

/// Count every request that reaches the router.
pub async fn count_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(metrics) = &state.metrics {
        metrics.record_http_request();
    }
    next.run(request).await
}
