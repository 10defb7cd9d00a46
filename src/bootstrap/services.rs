use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::adapters::outbound::credential_store::AesGcmCredentialStore;
use crate::adapters::outbound::exchange::BinanceAdapter;
use crate::adapters::outbound::notification::WebhookNotificationSink;
use crate::adapters::outbound::persistence::Database;
use crate::adapters::outbound::rate_limiter::TokenBucketRateLimiter;
use crate::application::{
    BalanceSnapshotRecorder, ExecutionEngine, JobQueueWorkerPool, PositionLockRegistry, PositionSupervisor,
    SignalIntakeService, SupervisorTask,
};
use crate::config::Config;
use crate::ports::{AuditLog, CredentialRepository, CredentialStore, ExchangeAdapter, NotificationSink, RateLimiter};

/// Everything the HTTP layer and the background tasks need, wired once at
/// startup. Every port field downstream is an `Arc<dyn Trait>`, so neither
/// the application layer nor the router ever names a concrete adapter.
pub struct ServiceRegistry {
    pub db: Arc<Database>,
    pub signal_intake: Arc<SignalIntakeService>,
    pub job_worker_pool: Arc<JobQueueWorkerPool>,
    pub supervisor_task: Arc<SupervisorTask>,
}

pub async fn setup(config: &Config) -> Result<ServiceRegistry> {
    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| config.database.url.clone());
    let db = Arc::new(Database::new(&database_url).await?);
    tracing::info!(url = %database_url, "database initialized");

    let exchanges: HashMap<String, Arc<dyn ExchangeAdapter>> = config
        .exchanges
        .iter()
        .map(|(exchange_id, exchange_config)| {
            let adapter = BinanceAdapter::new(
                exchange_id.clone(),
                exchange_config.base_url.clone(),
                Duration::from_millis(exchange_config.request_timeout_ms),
            );
            (exchange_id.clone(), Arc::new(adapter) as Arc<dyn ExchangeAdapter>)
        })
        .collect();
    tracing::info!(count = exchanges.len(), "exchange adapters initialized");

    let rate_limiter: Arc<dyn RateLimiter> = Arc::new(TokenBucketRateLimiter::new(config.exchanges.clone()));

    let credential_store: Arc<dyn CredentialStore> =
        Arc::new(AesGcmCredentialStore::new(db.clone(), &config.master_key.key_base64)?);

    let notifications: Vec<Arc<dyn NotificationSink>> = config
        .notifications
        .sinks
        .iter()
        .map(|sink| Arc::new(WebhookNotificationSink::new(sink.name.clone(), sink.url.clone())) as Arc<dyn NotificationSink>)
        .collect();
    tracing::info!(count = notifications.len(), "notification sinks configured");

    let credentials: Arc<dyn CredentialRepository> = db.clone();
    let audit_log: Arc<dyn AuditLog> = db.clone();
    let position_locks = Arc::new(PositionLockRegistry::new());

    let signal_intake = Arc::new(SignalIntakeService::new(config.webhook.passphrase.clone(), db.clone(), db.clone()));

    let execution_engine = Arc::new(ExecutionEngine {
        signals: db.clone(),
        subscribers: db.clone(),
        credentials: credentials.clone(),
        credential_store: credential_store.clone(),
        attempts: db.clone(),
        positions: db.clone(),
        audit_log: audit_log.clone(),
        notifications: notifications.clone(),
        exchanges: exchanges.clone(),
        rate_limiter: rate_limiter.clone(),
        position_locks: position_locks.clone(),
        fan_out_concurrency: config.worker.fan_out_concurrency,
        global_defaults: config.global_defaults,
    });

    let position_supervisor = Arc::new(PositionSupervisor {
        positions: db.clone(),
        subscribers: db.clone(),
        credentials: credentials.clone(),
        credential_store: credential_store.clone(),
        balance_snapshots: db.clone(),
        audit_log,
        notifications,
        exchanges: exchanges.clone(),
        rate_limiter,
        position_locks,
    });

    let balance_snapshot_recorder = Arc::new(BalanceSnapshotRecorder {
        subscribers: db.clone(),
        credentials,
        credential_store,
        balance_snapshots: db.clone(),
        exchanges,
    });

    let job_worker_pool =
        Arc::new(JobQueueWorkerPool { jobs: db.clone(), execution_engine, worker_count: config.worker.worker_count });

    let supervisor_task = Arc::new(SupervisorTask {
        position_supervisor,
        balance_snapshot_recorder,
        tick_interval: Duration::from_secs(config.supervisor.tick_interval_secs),
        balance_snapshot_interval: Duration::from_secs(config.supervisor.balance_snapshot_interval_secs),
    });

    Ok(ServiceRegistry { db, signal_intake, job_worker_pool, supervisor_task })
}
