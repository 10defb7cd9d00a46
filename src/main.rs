use std::net::SocketAddr;
use std::time::Duration;

use dispatch_engine::bootstrap;

/// How long a graceful shutdown waits for the job-queue workers and
/// supervisor ticks to notice cancellation before the process exits anyway
/// (spec §5 "Cancellation & timeouts").
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app = bootstrap::setup().await?;

    tracing::info!(address = %app.bind_address, "binding TCP listener");
    let listener = tokio::net::TcpListener::bind(app.socket_addr).await?;

    let job_workers = app.job_worker_pool.clone().spawn();
    let supervisor_handles = app.supervisor_task.clone().spawn();

    tracing::info!("signal dispatch & execution engine is running");

    axum::serve(listener, app.router.into_make_service_with_connect_info::<SocketAddr>()).with_graceful_shutdown(shutdown_signal()).await?;

    tracing::info!(drain_secs = SHUTDOWN_DRAIN.as_secs(), "shutting down, draining background tasks");
    tokio::time::sleep(SHUTDOWN_DRAIN).await;

    for handle in job_workers.into_iter().chain(supervisor_handles) {
        handle.abort();
    }

    app.db.pool.close().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).expect("failed to install SIGTERM handler").recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
