use anyhow::Context;
use tracing::{error, info};

use stemsplit::api::{ApiServer, ApiServerConfig, AppState};
use stemsplit::config::AppConfig;
use stemsplit::services::ServiceContainer;
use stemsplit::{database, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("Failed to load configuration")?;

    let (logging_config, _log_guard) = logging::init_logging(&config.log_dir, &config.log_level)
        .context("Failed to initialize logging")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        storage_root = %config.storage_root.display(),
        workers = config.worker_count,
        "Starting stemsplit"
    );

    let pool = database::init_pool(&config.database_url)
        .await
        .context("Failed to open job store")?;
    database::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let container = ServiceContainer::new(config.clone(), pool).await;
    container
        .initialize()
        .await
        .context("Failed to initialize services")?;
    logging_config.start_retention_cleanup(container.cancellation_token().child_token());

    let server = ApiServer::with_state(
        ApiServerConfig::from_app_config(&config),
        AppState::from_container(&container),
    );
    let server_token = server.cancel_token();
    let mut server_task = tokio::spawn(async move { server.run().await });

    let server_exited = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            None
        }
        result = &mut server_task => {
            error!("API server stopped unexpectedly");
            Some(result)
        }
    };

    // Stop accepting requests before the store goes away.
    server_token.cancel();
    let server_result = match server_exited {
        Some(result) => result,
        None => server_task.await,
    };

    container.shutdown().await;
    server_result??;

    info!("stemsplit stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
