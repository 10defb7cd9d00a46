use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::adapters::inbound::http::{create_router, AppState, IpRateLimiter};
use crate::bootstrap::{services::ServiceRegistry, Application};

pub async fn setup(config: crate::config::Config, registry: ServiceRegistry) -> Result<Application> {
    let server_address = config.server_address();
    tracing::info!(address = %server_address, "server will listen");

    let allowed_origins = config.allowed_origins();
    let cors_disabled = config.cors.disable;
    let webhook_rate_limiter = Arc::new(IpRateLimiter::new(config.webhook.burst_limit_per_minute));

    let app_state = AppState { signal_intake: registry.signal_intake, allowed_origins: allowed_origins.clone(), cors_disabled, webhook_rate_limiter };

    if cors_disabled {
        tracing::warn!("CORS is disabled - all origins will be allowed");
    } else {
        tracing::info!(origins = ?allowed_origins, "API state created with CORS origins");
    }

    tracing::info!("building API router");
    let router = create_router(app_state);

    let socket_addr: SocketAddr =
        server_address.parse().map_err(|e| anyhow::anyhow!("invalid bind address '{}': {}", server_address, e))?;

    Ok(Application {
        router,
        bind_address: server_address,
        socket_addr,
        db: registry.db,
        job_worker_pool: registry.job_worker_pool,
        supervisor_task: registry.supervisor_task,
    })
}
