use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::models::{
    AuditEvent, BalanceSnapshot, Credential, ExecutionAttempt, PlaintextCredential, Position, PositionKey, Signal,
    Subscriber, SymbolRules,
};
use crate::error::ExchangeError;

/// Direction of an outbound order, independent of the position's own side
/// (a CLOSE submits the opposing side with `reduce_only`). See spec §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOrderKind {
    TakeProfit,
    StopLoss,
}

#[derive(Debug, Clone, Copy)]
pub struct AccountBalance {
    pub equity: f64,
    pub available: f64,
}

#[derive(Debug, Clone)]
pub struct MarketFillResult {
    pub order_id: String,
    pub fill_price: f64,
    pub filled_qty: f64,
}

#[derive(Debug, Clone)]
pub struct ReduceOrderResult {
    pub order_id: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ExchangePositionSnapshot {
    pub side: crate::domain::models::PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
}

/// The uniform capability set over heterogeneous exchanges (spec §4.5). One
/// implementation per venue; the Execution Engine and Position Supervisor
/// depend only on this trait, never on a concrete exchange client.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn exchange_id(&self) -> &str;

    async fn fetch_balance(&self, credential: &PlaintextCredential) -> Result<AccountBalance, ExchangeError>;

    async fn fetch_symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError>;

    /// Current mark/last price, used both to size a position before
    /// submission (spec §4.4 step 3) and by the Position Supervisor to
    /// evaluate trailing stops and unrealized PnL (spec §4.7).
    async fn fetch_mark_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    async fn set_leverage(&self, credential: &PlaintextCredential, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;

    async fn submit_market(
        &self,
        credential: &PlaintextCredential,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<MarketFillResult, ExchangeError>;

    async fn submit_reduce_order(
        &self,
        credential: &PlaintextCredential,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        trigger_price: f64,
        kind: ReduceOrderKind,
    ) -> Result<ReduceOrderResult, ExchangeError>;

    async fn cancel_order(&self, credential: &PlaintextCredential, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;

    async fn fetch_position(&self, credential: &PlaintextCredential, symbol: &str) -> Result<Option<ExchangePositionSnapshot>, ExchangeError>;
}

/// Keyed by `(exchange_id, credential_id)`, per spec §4.6. Every Exchange
/// Adapter call is preceded by an `acquire`.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn acquire(&self, exchange_id: &str, credential_id: &str, weight: u32);
}

/// Symmetric encryption of credential secrets at rest, spec §4.9. Plaintext
/// is visible only inside the single call that retrieves it.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn put(&self, subscriber_id: &str, exchange_id: &str, plaintext: PlaintextCredential) -> anyhow::Result<Credential>;
    async fn get_plaintext(&self, credential_id: &str) -> anyhow::Result<PlaintextCredential>;
    async fn disable(&self, credential_id: &str) -> anyhow::Result<()>;
    async fn status(&self, credential_id: &str) -> anyhow::Result<Credential>;
}

#[async_trait]
pub trait SubscriberRepository: Send + Sync {
    async fn find(&self, subscriber_id: &str) -> anyhow::Result<Option<Subscriber>>;
    async fn list_active(&self) -> anyhow::Result<Vec<Subscriber>>;
    async fn save(&self, subscriber: &Subscriber) -> anyhow::Result<()>;
    async fn set_guardrail_paused_until(&self, subscriber_id: &str, until: Option<DateTime<Utc>>) -> anyhow::Result<()>;
}

#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn find_usable_for_exchange(&self, subscriber_id: &str, exchange_id: &str) -> anyhow::Result<Option<Credential>>;
    async fn list_for_subscriber(&self, subscriber_id: &str) -> anyhow::Result<Vec<Credential>>;
}

#[async_trait]
pub trait SignalRepository: Send + Sync {
    /// Inserts the signal row `ON CONFLICT DO NOTHING` on `signal_id`.
    /// Returns `true` if this call created the row (new signal), `false` if
    /// it already existed. See spec §4.1.
    async fn insert_if_new(&self, signal: &Signal) -> anyhow::Result<bool>;
    async fn find(&self, signal_id: &str) -> anyhow::Result<Option<Signal>>;
    async fn mark_dispatched(&self, signal_id: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ExecutionAttemptRepository: Send + Sync {
    /// Inserts a PENDING attempt keyed on `(signal_id, subscriber_id)`.
    /// Returns `true` if this call created the row. See spec §4.4 step 1.
    async fn insert_pending_if_new(&self, signal_id: &str, subscriber_id: &str) -> anyhow::Result<bool>;
    async fn record_outcome(&self, attempt: &ExecutionAttempt) -> anyhow::Result<()>;
    async fn find(&self, signal_id: &str, subscriber_id: &str) -> anyhow::Result<Option<ExecutionAttempt>>;
}

#[async_trait]
pub trait PositionRepository: Send + Sync {
    async fn find_open(&self, key: &PositionKey) -> anyhow::Result<Option<Position>>;
    async fn count_open_for_subscriber(&self, subscriber_id: &str) -> anyhow::Result<u32>;
    async fn list_open_batch(&self, after_id: Option<&str>, limit: u32) -> anyhow::Result<Vec<Position>>;
    async fn list_open_for_subscriber(&self, subscriber_id: &str) -> anyhow::Result<Vec<Position>>;
    async fn upsert(&self, position: &Position) -> anyhow::Result<()>;
    async fn close(&self, id: &str, closed_at: DateTime<Utc>) -> anyhow::Result<()>;
}

#[async_trait]
pub trait BalanceSnapshotRepository: Send + Sync {
    async fn record(&self, snapshot: &BalanceSnapshot) -> anyhow::Result<()>;
    async fn day_start_equity(&self, subscriber_id: &str, exchange_id: &str) -> anyhow::Result<Option<f64>>;
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, event: AuditEvent) -> anyhow::Result<()>;
}

/// Fire-and-forget notification fan-out, spec §4.8. A sink's failure is
/// contained to that sink and never propagates.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, subject: &str, body: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: String,
    pub job_name: String,
    pub payload: serde_json::Value,
    pub attempt: u32,
}

/// Durable job queue, spec §4.2. `enqueue` must be idempotent on `job_key`
/// so a best-effort queue still yields at-most-once dispatch per signal.
/// Delivery is at-least-once: `claim_next` hides a job behind a visibility
/// timeout until `complete` or `fail` resolves it.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job_name: &str, job_key: &str, payload: serde_json::Value, run_at: Option<DateTime<Utc>>) -> anyhow::Result<()>;

    async fn claim_next(&self, visibility_timeout: std::time::Duration) -> anyhow::Result<Option<ClaimedJob>>;

    async fn complete(&self, job_id: &str) -> anyhow::Result<()>;

    /// Reschedules for `retry_at` if under the retry cap, otherwise marks the
    /// job permanently failed. See spec §4.2 "Failure handling".
    async fn fail(&self, job_id: &str, retry_at: Option<DateTime<Utc>>) -> anyhow::Result<()>;
}
