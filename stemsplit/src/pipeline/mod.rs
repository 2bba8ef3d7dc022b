//! Job execution: the durable work queue, the workers leasing from it, the
//! two collaborator stages, and the retention sweep.

pub mod collaborator;
mod executor;
mod progress;
mod retention;
mod work_queue;
mod worker_pool;

pub use collaborator::{
    CollaboratorError, DemucsSeparator, Downloader, FailureCause, FailureClass, Separator,
    StemOutput, YtDlpDownloader, classify,
};
pub use executor::{Bookkeeping, Collaborators, ExecutionOutcome, ExecutorConfig, JobExecutor};
pub use progress::{
    PROGRESS_DONE, PROGRESS_FETCH_START, PROGRESS_FETCHED, PROGRESS_TRANSFORMED, ProgressReporter,
    scale_into,
};
pub use retention::{RetentionConfig, RetentionSweeper, SweepReport};
pub use work_queue::{Lease, WorkQueue};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};
