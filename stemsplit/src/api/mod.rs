//! REST API server module.
//!
//! Submission, status, download, health and metrics endpoints.

pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;

pub use server::{ApiServer, ApiServerConfig, AppState, build_router};
