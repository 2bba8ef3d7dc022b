//! Domain layer.
//!
//! Entities and value objects shared by the store, the pipeline and the API.

pub mod job;
pub mod value_objects;

pub use job::{Artifact, FailureReason, Job, JobFailure, JobStatus, NewJob};
pub use value_objects::RetryPolicy;
