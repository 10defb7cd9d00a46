use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;

use crate::adapters::outbound::persistence::Database;
use crate::application::{JobQueueWorkerPool, SupervisorTask};

pub mod logging;
pub mod server;
pub mod services;

/// Everything `main` needs to run the server and its background tasks, and
/// to tear them down on shutdown.
pub struct Application {
    pub router: Router,
    pub bind_address: String,
    pub socket_addr: SocketAddr,
    pub db: Arc<Database>,
    pub job_worker_pool: Arc<JobQueueWorkerPool>,
    pub supervisor_task: Arc<SupervisorTask>,
}

pub async fn setup() -> Result<Application> {
    let config = load_config()?;
    logging::setup(&config);
    let service_registry = services::setup(&config).await?;
    server::setup(config, service_registry).await
}

fn load_config() -> Result<crate::config::Config> {
    use crate::config::Config;

    let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| {
        std::env::current_exe().ok().and_then(|p| p.parent().map(|p| p.to_string_lossy().into_owned())).unwrap_or_else(|| ".".to_string())
    });
    let config_base = format!("{}/config", config_dir);

    Config::from_file(&config_base).with_context(|| format!("failed to load configuration from {}", config_base))
}
