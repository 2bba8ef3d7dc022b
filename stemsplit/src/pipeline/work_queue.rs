//! Durable work queue with lease/ack semantics.
//!
//! Rows live in the `work_queue` table, so queued work survives restarts. A
//! lease is valid until `lease_timeout` elapses unless its holder renews it;
//! after that the row can be leased again by any worker, which gives
//! at-least-once delivery. Writes to the job itself are guarded separately
//! by the job store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::Result;
use crate::database::repositories::QueueRepository;
use crate::database::time::{duration_ms, ms_to_datetime, now_ms};

/// Time-bounded ownership of one queued job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: String,
    pub token: String,
    /// How many times this row has been leased, this lease included.
    pub deliveries: u32,
    pub expires_at: DateTime<Utc>,
}

/// The work queue service.
pub struct WorkQueue {
    repository: Arc<dyn QueueRepository>,
    /// Wakes idle workers when new work is enqueued.
    notify: Arc<Notify>,
    lease_timeout: Duration,
}

impl WorkQueue {
    pub fn new(repository: Arc<dyn QueueRepository>, lease_timeout: Duration) -> Self {
        Self {
            repository,
            notify: Arc::new(Notify::new()),
            lease_timeout,
        }
    }

    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    pub fn repository(&self) -> &Arc<dyn QueueRepository> {
        &self.repository
    }

    /// Make `job_id` available to workers now.
    pub async fn enqueue(&self, job_id: &str) -> Result<()> {
        self.repository.enqueue(job_id, now_ms()).await?;
        info!(job_id, "Enqueued job");
        self.notify.notify_one();
        Ok(())
    }

    /// Lease the oldest available job, if any.
    pub async fn lease(&self) -> Result<Option<Lease>> {
        let now = now_ms();
        let expires_at = now + duration_ms(self.lease_timeout);
        let token = uuid::Uuid::new_v4().to_string();

        let Some(entry) = self.repository.lease(now, expires_at, &token).await? else {
            return Ok(None);
        };

        let deliveries = u32::try_from(entry.deliveries).unwrap_or(u32::MAX);
        if deliveries > 1 {
            // Either a requeue or a lease that lapsed under a crashed worker.
            debug!(job_id = %entry.job_id, deliveries, "Re-delivering job");
        }

        Ok(Some(Lease {
            job_id: entry.job_id,
            token,
            deliveries,
            expires_at: ms_to_datetime(expires_at),
        }))
    }

    /// Push the lease expiry a full `lease_timeout` past now.
    ///
    /// Returns `false` if the lease was lost; the holder must stop working on
    /// the job.
    pub async fn renew(&self, lease: &Lease) -> Result<bool> {
        let expires_at = now_ms() + duration_ms(self.lease_timeout);
        let renewed = self
            .repository
            .renew(&lease.job_id, &lease.token, expires_at)
            .await?;
        if !renewed {
            warn!(job_id = %lease.job_id, "Renew refused: lease no longer held");
        }
        Ok(renewed)
    }

    /// Remove the job from the queue. Returns `false` if the lease was lost.
    pub async fn ack(&self, lease: &Lease) -> Result<bool> {
        let acked = self.repository.ack(&lease.job_id, &lease.token).await?;
        if !acked {
            warn!(job_id = %lease.job_id, "Ack ignored: lease no longer held");
        }
        Ok(acked)
    }

    /// Give the job back.
    ///
    /// With `requeue_after` set, the job becomes leasable again after that
    /// delay; with `None` it is dropped from the queue. Returns `false` if the
    /// lease was lost.
    pub async fn nack(&self, lease: &Lease, requeue_after: Option<Duration>) -> Result<bool> {
        let Some(delay) = requeue_after else {
            return self.ack(lease).await;
        };

        let available_at = now_ms() + duration_ms(delay);
        let released = self
            .repository
            .release(&lease.job_id, &lease.token, available_at)
            .await?;
        if released {
            debug!(job_id = %lease.job_id, delay_ms = delay.as_millis() as u64, "Job requeued");
        } else {
            warn!(job_id = %lease.job_id, "Nack ignored: lease no longer held");
        }
        Ok(released)
    }

    /// Entries in the queue, leased or not.
    pub async fn depth(&self) -> Result<u64> {
        Ok(self.repository.depth().await?.max(0) as u64)
    }

    /// Entries a worker could lease right now.
    pub async fn ready_depth(&self) -> Result<u64> {
        Ok(self.repository.ready_depth(now_ms()).await?.max(0) as u64)
    }
}
