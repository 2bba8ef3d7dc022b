//! Service layer: job submission and the container wiring every service.

pub mod container;
mod submission;

pub use container::ServiceContainer;
pub use submission::{JobService, RecoveryReport, Submission};
