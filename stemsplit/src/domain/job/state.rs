//! Job state machine.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Lifecycle states of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created and queued, not yet picked up.
    Pending,
    /// A worker is fetching the source media.
    Fetching,
    /// A worker is running the separation stage.
    Transforming,
    /// Artifacts are available until `expires_at`.
    Completed,
    /// Terminal failure; the error field carries the cause.
    Failed,
    /// Reclaimed by the retention sweep.
    Expired,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        Self::Pending,
        Self::Fetching,
        Self::Transforming,
        Self::Completed,
        Self::Failed,
        Self::Expired,
    ];

    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Transforming => "transforming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "fetching" => Some(Self::Fetching),
            "transforming" => Some(Self::Transforming),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Jobs in these states hold a quota slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Fetching | Self::Transforming)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Whether the store accepts a write moving a job from `self` to `target`.
    ///
    /// Self-transitions on the two working stages are how the lease holder
    /// records a re-pickup or a progress update without changing stage.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Fetching)
                | (Pending, Failed)
                | (Fetching, Fetching)
                | (Fetching, Transforming)
                | (Fetching, Failed)
                | (Transforming, Transforming)
                | (Transforming, Completed)
                | (Transforming, Failed)
                | (Completed, Expired)
                | (Failed, Expired)
        )
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: JobStatus) -> Result<JobStatus, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(&s.to_ascii_lowercase())
            .ok_or_else(|| Error::invalid_input(format!("unknown job status '{s}'")))
    }
}
