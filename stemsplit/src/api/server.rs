//! API server setup and configuration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{DefaultBodyLimit, Request};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::api::{middleware, routes};
use crate::artifacts::ArtifactStore;
use crate::config::{AppConfig, DEFAULT_API_KEY_HEADER};
use crate::database::repositories::JobRepository;
use crate::error::{Error, Result};
use crate::metrics::{HealthChecker, MetricsCollector};
use crate::pipeline::WorkQueue;
use crate::services::{JobService, ServiceContainer};

/// Headroom over the URL size for the JSON envelope of a submission.
const BODY_ENVELOPE_BYTES: usize = 512;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub enable_cors: bool,
    /// Request body size limit in bytes
    pub body_limit: usize,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8000,
            enable_cors: true,
            body_limit: 2048 + BODY_ENVELOPE_BYTES,
        }
    }
}

impl ApiServerConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            bind_address: config.bind_address.clone(),
            port: config.port,
            body_limit: config.max_input_bytes + BODY_ENVELOPE_BYTES,
            ..Self::default()
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server start time for uptime calculation
    pub start_time: Instant,
    /// Header the client credential is read from
    pub credential_header: String,
    pub job_service: Option<Arc<JobService>>,
    pub job_repository: Option<Arc<dyn JobRepository>>,
    pub work_queue: Option<Arc<WorkQueue>>,
    pub artifacts: Option<Arc<ArtifactStore>>,
    pub metrics: Option<Arc<MetricsCollector>>,
    pub health_checker: Option<Arc<HealthChecker>>,
}

impl AppState {
    /// Create a new application state without services (for testing).
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            credential_header: DEFAULT_API_KEY_HEADER.to_string(),
            job_service: None,
            job_repository: None,
            work_queue: None,
            artifacts: None,
            metrics: None,
            health_checker: None,
        }
    }

    /// Create application state backed by every service in `container`.
    pub fn from_container(container: &ServiceContainer) -> Self {
        Self {
            credential_header: container.config.api_key_header.to_ascii_lowercase(),
            ..Self::new()
        }
        .with_job_service(container.job_service.clone())
        .with_job_repository(container.jobs.clone())
        .with_work_queue(container.queue.clone())
        .with_artifacts(container.artifacts.clone())
        .with_metrics(container.metrics.clone())
        .with_health_checker(container.health.clone())
    }

    pub fn with_job_service(mut self, job_service: Arc<JobService>) -> Self {
        self.job_service = Some(job_service);
        self
    }

    pub fn with_job_repository(mut self, repository: Arc<dyn JobRepository>) -> Self {
        self.job_repository = Some(repository);
        self
    }

    pub fn with_work_queue(mut self, queue: Arc<WorkQueue>) -> Self {
        self.work_queue = Some(queue);
        self
    }

    pub fn with_artifacts(mut self, artifacts: Arc<ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Set the health checker.
    pub fn with_health_checker(mut self, health_checker: Arc<HealthChecker>) -> Self {
        self.health_checker = Some(health_checker);
        self
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

fn is_quiet_path(path: &str) -> bool {
    path.starts_with("/health") || path == "/metrics"
}

/// Build the router with all middleware and routes.
pub fn build_router(state: AppState, config: &ApiServerConfig) -> Router {
    let mut router = routes::create_router(state.clone())
        .layer(axum::middleware::from_fn_with_state(
            state,
            middleware::count_requests,
        ))
        .layer(DefaultBodyLimit::max(config.body_limit));

    if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        router = router.layer(cors);
    }

    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(|req: &Request| {
                if is_quiet_path(req.uri().path()) {
                    Span::none()
                } else {
                    let mut make_span =
                        tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO);
                    use tower_http::trace::MakeSpan;
                    make_span.make_span(req)
                }
            })
            .on_request(|req: &Request, span: &Span| {
                if span.is_disabled() || is_quiet_path(req.uri().path()) {
                    return;
                }
                let mut on_request =
                    tower_http::trace::DefaultOnRequest::new().level(tracing::Level::INFO);
                use tower_http::trace::OnRequest;
                on_request.on_request(req, span);
            })
            .on_response(
                |res: &axum::http::Response<_>, latency: Duration, span: &Span| {
                    if span.is_disabled() {
                        return;
                    }
                    let on_response =
                        tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO);
                    use tower_http::trace::OnResponse;
                    on_response.on_response(res, latency, span);
                },
            )
            .on_failure(
                |class: tower_http::classify::ServerErrorsFailureClass,
                 latency: Duration,
                 span: &Span| {
                    if span.is_disabled() {
                        return;
                    }
                    let mut on_failure =
                        tower_http::trace::DefaultOnFailure::new().level(tracing::Level::ERROR);
                    use tower_http::trace::OnFailure;
                    on_failure.on_failure(class, latency, span);
                },
            ),
    )
}

/// API server.
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig) -> Self {
        Self::with_state(config, AppState::new())
    }

    pub fn with_state(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Stop serving once `token` is cancelled.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    /// Get the cancellation token for graceful shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone(), &self.config)
    }

    /// Start the server.
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| Error::config(format!("Invalid address: {}", e)))?;

        let router = self.router();
        let listener = TcpListener::bind(addr).await?;

        tracing::info!("API server listening on http://{}", addr);

        let cancel_token = self.cancel_token.clone();

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            cancel_token.cancelled().await;
            tracing::info!("API server shutting down...");
        })
        .await
        .map_err(|e| Error::Other(format!("Server error: {}", e)))?;

        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_app_config() {
        let config = ApiServerConfig::from_app_config(&AppConfig {
            port: 9000,
            max_input_bytes: 1000,
            ..AppConfig::default()
        });
        assert_eq!(config.port, 9000);
        assert_eq!(config.body_limit, 1000 + BODY_ENVELOPE_BYTES);
        assert!(config.enable_cors);
    }

    #[test]
    fn test_quiet_paths() {
        assert!(is_quiet_path("/health/live"));
        assert!(is_quiet_path("/metrics"));
        assert!(!is_quiet_path("/separate"));
    }

    #[test]
    fn test_server_creation() {
        let server = ApiServer::new(ApiServerConfig::default());
        assert!(!server.cancel_token().is_cancelled());
    }
}
