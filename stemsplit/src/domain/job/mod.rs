//! Job entity and state machine.

mod entity;
mod state;

pub use entity::{Artifact, FailureReason, Job, JobFailure, NewJob};
pub use state::JobStatus;
