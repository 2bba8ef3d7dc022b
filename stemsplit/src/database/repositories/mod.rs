//! Repository layer for database access.
//!
//! Traits describe what the rest of the service needs from storage; the
//! `Sqlx*` types implement them over a SQLite pool.

pub mod job;
pub mod queue;

pub use job::*;
pub use queue::*;
