//! stemsplit library crate.
//!
//! Admission, deduplication and lifecycle orchestration for jobs that fetch
//! a video's audio and separate it into stems.

pub mod admission;
pub mod api;
pub mod artifacts;
pub mod config;
pub mod database;
pub mod dedup;
pub mod domain;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod services;

pub use error::{Error, Result};
