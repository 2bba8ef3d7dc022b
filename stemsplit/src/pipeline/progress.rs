//! Progress reporting from collaborators back to the executor.
//!
//! A collaborator reports the percentage of its own stage; the executor
//! maps it into the job's overall range and decides when to persist it.

use tokio::sync::watch;

/// Fetch stage started.
pub const PROGRESS_FETCH_START: u8 = 10;
/// Fetched input is on disk.
pub const PROGRESS_FETCHED: u8 = 50;
/// Separation finished; artifacts are being recorded.
pub const PROGRESS_TRANSFORMED: u8 = 90;
pub const PROGRESS_DONE: u8 = 100;

/// Sends stage-local percentages (0-100). Only increases are published.
pub struct ProgressReporter {
    job_id: String,
    tx: watch::Sender<f32>,
}

impl ProgressReporter {
    /// Reporter plus the receiving end the executor watches.
    pub fn channel(job_id: impl Into<String>) -> (Self, watch::Receiver<f32>) {
        let (tx, rx) = watch::channel(0.0);
        (
            Self {
                job_id: job_id.into(),
                tx,
            },
            rx,
        )
    }

    /// Reporter whose updates go nowhere.
    pub fn noop(job_id: impl Into<String>) -> Self {
        Self::channel(job_id).0
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn report(&self, percent: f32) {
        if !percent.is_finite() {
            return;
        }
        let percent = percent.clamp(0.0, 100.0);
        self.tx.send_if_modified(|current| {
            if percent > *current {
                *current = percent;
                true
            } else {
                false
            }
        });
    }
}

/// Map a stage-local percentage into `start..=end`.
pub fn scale_into(percent: f32, start: u8, end: u8) -> u8 {
    let percent = if percent.is_finite() {
        percent.clamp(0.0, 100.0)
    } else {
        0.0
    };
    let span = f32::from(end.saturating_sub(start));
    start + (span * percent / 100.0).floor() as u8
}
