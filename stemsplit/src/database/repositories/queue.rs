//! Work queue repository.
//!
//! A queue row exists from enqueue until the job is acked (or nacked without
//! requeue). Leasing stamps a random token and an expiry onto the row; ack
//! and nack must present the same token, so a worker whose lease lapsed and
//! was handed to someone else cannot touch the row any more.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::QueueEntryDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::Result;

/// Work queue persistence trait. All times are epoch milliseconds.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Add `job_id` to the queue, leasable from `available_at`. Re-enqueueing is a no-op.
    async fn enqueue(&self, job_id: &str, available_at: i64) -> Result<()>;
    /// Atomically lease the oldest available entry, if any.
    async fn lease(
        &self,
        now: i64,
        lease_expires_at: i64,
        token: &str,
    ) -> Result<Option<QueueEntryDbModel>>;
    /// Move the lease expiry of the entry `token` holds to `lease_expires_at`.
    async fn renew(&self, job_id: &str, token: &str, lease_expires_at: i64) -> Result<bool>;
    /// Remove the entry if `token` still holds it.
    async fn ack(&self, job_id: &str, token: &str) -> Result<bool>;
    /// Clear the lease and make the entry available again at `available_at`.
    async fn release(&self, job_id: &str, token: &str, available_at: i64) -> Result<bool>;
    /// Entries currently in the queue, leased or not.
    async fn depth(&self) -> Result<i64>;
    /// Entries that could be leased at `now`.
    async fn ready_depth(&self, now: i64) -> Result<i64>;
    async fn get_entry(&self, job_id: &str) -> Result<Option<QueueEntryDbModel>>;
}

/// SQLx implementation of [`QueueRepository`].
pub struct SqlxQueueRepository {
    pool: SqlitePool,
}

impl SqlxQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueueRepository for SqlxQueueRepository {
    async fn enqueue(&self, job_id: &str, available_at: i64) -> Result<()> {
        retry_on_sqlite_busy("enqueue", || async {
            sqlx::query(
                r#"
                INSERT INTO work_queue (job_id, available_at, enqueued_at, deliveries)
                VALUES (?, ?, ?, 0)
                ON CONFLICT(job_id) DO NOTHING
                "#,
            )
            .bind(job_id)
            .bind(available_at)
            .bind(crate::database::time::now_ms())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn lease(
        &self,
        now: i64,
        lease_expires_at: i64,
        token: &str,
    ) -> Result<Option<QueueEntryDbModel>> {
        retry_on_sqlite_busy("lease", || async {
            // Single statement: SQLite serializes writers, so two workers can
            // never stamp the same row.
            let entry = sqlx::query_as::<_, QueueEntryDbModel>(
                r#"
                UPDATE work_queue
                SET lease_token = ?, lease_expires_at = ?, deliveries = deliveries + 1
                WHERE job_id = (
                    SELECT job_id FROM work_queue
                    WHERE available_at <= ?
                      AND (lease_token IS NULL OR lease_expires_at <= ?)
                    ORDER BY available_at, enqueued_at
                    LIMIT 1
                )
                RETURNING *
                "#,
            )
            .bind(token)
            .bind(lease_expires_at)
            .bind(now)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
            Ok(entry)
        })
        .await
    }

    async fn renew(&self, job_id: &str, token: &str, lease_expires_at: i64) -> Result<bool> {
        retry_on_sqlite_busy("renew", || async {
            let result = sqlx::query(
                "UPDATE work_queue SET lease_expires_at = ? WHERE job_id = ? AND lease_token = ?",
            )
            .bind(lease_expires_at)
            .bind(job_id)
            .bind(token)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn ack(&self, job_id: &str, token: &str) -> Result<bool> {
        retry_on_sqlite_busy("ack", || async {
            let result = sqlx::query("DELETE FROM work_queue WHERE job_id = ? AND lease_token = ?")
                .bind(job_id)
                .bind(token)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn release(&self, job_id: &str, token: &str, available_at: i64) -> Result<bool> {
        retry_on_sqlite_busy("release", || async {
            let result = sqlx::query(
                r#"
                UPDATE work_queue
                SET lease_token = NULL, lease_expires_at = NULL, available_at = ?
                WHERE job_id = ? AND lease_token = ?
                "#,
            )
            .bind(available_at)
            .bind(job_id)
            .bind(token)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn depth(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM work_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn ready_depth(&self, now: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM work_queue
            WHERE available_at <= ? AND (lease_token IS NULL OR lease_expires_at <= ?)
            "#,
        )
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn get_entry(&self, job_id: &str) -> Result<Option<QueueEntryDbModel>> {
        let entry = sqlx::query_as::<_, QueueEntryDbModel>(
            "SELECT * FROM work_queue WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }
}
