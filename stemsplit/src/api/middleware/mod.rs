//! API middleware and request extractors.

mod client;
mod request_metrics;

pub use client::{ClientIdentity, Credential, UNKNOWN_CLIENT, resolve_client};
pub use request_metrics::count_requests;
