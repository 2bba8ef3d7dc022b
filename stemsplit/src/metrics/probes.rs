//! Concrete health probes for the job store, queue, storage and tools.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use super::health::{ComponentHealth, HealthCheckFn};
use crate::database::repositories::QueueRepository;
use crate::database::{self, DbPool};

const TOOL_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Round-trip a trivial query.
pub fn database_check(pool: DbPool) -> HealthCheckFn {
    Arc::new(move || {
        let pool = pool.clone();
        async move {
            match database::ping(&pool).await {
                Ok(()) => ComponentHealth::healthy("database"),
                Err(e) => ComponentHealth::unhealthy("database", e.to_string()),
            }
        }
        .boxed()
    })
}

/// Read the queue depth; reports the depth in the message.
pub fn queue_check(queue: Arc<dyn QueueRepository>) -> HealthCheckFn {
    Arc::new(move || {
        let queue = queue.clone();
        async move {
            match queue.depth().await {
                Ok(depth) => ComponentHealth::healthy("queue").with_message(format!("depth {depth}")),
                Err(e) => ComponentHealth::unhealthy("queue", e.to_string()),
            }
        }
        .boxed()
    })
}

/// Create, write and remove a probe file under the storage root.
pub fn storage_check(root: PathBuf) -> HealthCheckFn {
    Arc::new(move || {
        let root = root.clone();
        async move {
            let probe = root.join(format!(".health-{}", uuid::Uuid::new_v4()));
            let result = async {
                tokio::fs::create_dir_all(&root).await?;
                tokio::fs::write(&probe, b"ok").await?;
                tokio::fs::remove_file(&probe).await
            }
            .await;
            match result {
                Ok(()) => ComponentHealth::healthy("storage"),
                Err(e) => ComponentHealth::unhealthy(
                    "storage",
                    format!("{} is not writable: {e}", root.display()),
                ),
            }
        }
        .boxed()
    })
}

/// Run `<program> --version`. A missing or broken tool degrades the service
/// since queued jobs cannot make progress without it.
pub fn tool_check(name: &'static str, program: String) -> HealthCheckFn {
    Arc::new(move || {
        let program = program.clone();
        async move {
            let mut cmd = process_utils::tool_command(&program, ["--version"]);
            match tokio::time::timeout(TOOL_PROBE_TIMEOUT, cmd.output()).await {
                Ok(Ok(output)) if output.status.success() => {
                    let version = String::from_utf8_lossy(&output.stdout)
                        .lines()
                        .next()
                        .unwrap_or_default()
                        .trim()
                        .to_string();
                    let health = ComponentHealth::healthy(name);
                    if version.is_empty() {
                        health
                    } else {
                        health.with_message(version)
                    }
                }
                Ok(Ok(output)) => {
                    ComponentHealth::degraded(name, format!("{program} exited with {}", output.status))
                }
                Ok(Err(e)) => ComponentHealth::degraded(name, format!("{program}: {e}")),
                Err(_) => ComponentHealth::degraded(name, format!("{program} did not respond")),
            }
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::HealthStatus;

    #[tokio::test]
    async fn test_storage_check_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("jobs");
        let health = storage_check(root.clone())().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(root.is_dir());
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_tool_check_missing_binary_is_degraded() {
        let health = tool_check("demucs", "definitely-not-a-real-binary-xyz".to_string())().await;
        assert_eq!(health.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_database_check() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("h.db").display());
        let pool = database::init_pool(&url).await.unwrap();
        let health = database_check(pool)().await;
        assert_eq!(health.status, HealthStatus::Healthy);
    }
}
