//! End-to-end coverage against a real (in-memory) SQLite-backed engine with
//! a fake exchange, the scenarios named in spec §8 plus the properties that
//! depend on more than one module. No HTTP layer involved here; that's
//! covered separately the way the teacher covers its own API surface, with
//! `tower::ServiceExt::oneshot` against the router.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use dispatch_engine::adapters::outbound::credential_store::AesGcmCredentialStore;
use dispatch_engine::adapters::outbound::persistence::Database;
use dispatch_engine::application::execution_engine::ExecutionEngine;
use dispatch_engine::application::position_lock::PositionLockRegistry;
use dispatch_engine::application::position_supervisor::PositionSupervisor;
use dispatch_engine::domain::models::{
    AttemptOutcome, DcaConfig, PartialTradingParams, PlaintextCredential, PositionKey, PositionSide, Signal,
    SignalAction, SignalStatus, Subscriber, SubscriberRole, SymbolRules, TradingParams, TrailingStopConfig,
};
use dispatch_engine::error::ExchangeError;
use dispatch_engine::ports::{
    AccountBalance, CredentialStore, ExchangeAdapter, ExchangePositionSnapshot, ExecutionAttemptRepository,
    MarketFillResult, NotificationSink, PositionRepository, RateLimiter, ReduceOrderKind, ReduceOrderResult,
    SignalRepository, SubscriberRepository,
};

const EXCHANGE: &str = "binance";

/// A controllable stand-in for a venue connection. Mutex-guarded state
/// covers balance, mark price, whether the exchange still reports the
/// position open, and a one-shot failure switch for the bracket-partial-
/// failure scenario, following the hand-written fake style already used in
/// `signal_intake_service.rs`'s test module.
struct FakeExchange {
    balance: Mutex<AccountBalance>,
    rules: SymbolRules,
    mark_price: Mutex<f64>,
    position_on_exchange: Mutex<Option<ExchangePositionSnapshot>>,
    order_seq: AtomicU64,
    fail_next_stop_loss: Mutex<bool>,
    calls: Mutex<Vec<&'static str>>,
}

impl FakeExchange {
    fn new(balance: f64, mark_price: f64) -> Self {
        FakeExchange {
            balance: Mutex::new(AccountBalance { equity: balance, available: balance }),
            rules: SymbolRules { min_notional: 5.0, min_quantity: 0.001, quantity_step: 0.001, price_tick: 0.01, max_leverage: 50 },
            mark_price: Mutex::new(mark_price),
            position_on_exchange: Mutex::new(None),
            order_seq: AtomicU64::new(0),
            fail_next_stop_loss: Mutex::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn next_order_id(&self) -> String {
        format!("ord-{}", self.order_seq.fetch_add(1, Ordering::SeqCst))
    }

    fn set_mark_price(&self, price: f64) {
        *self.mark_price.lock().unwrap() = price;
    }

    fn set_equity(&self, equity: f64) {
        let mut b = self.balance.lock().unwrap();
        b.equity = equity;
        b.available = equity;
    }

    fn set_exchange_position(&self, snapshot: Option<ExchangePositionSnapshot>) {
        *self.position_on_exchange.lock().unwrap() = snapshot;
    }

    fn arm_stop_loss_rejection(&self) {
        *self.fail_next_stop_loss.lock().unwrap() = true;
    }

    fn call_count(&self, name: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == name).count()
    }
}

#[async_trait]
impl ExchangeAdapter for FakeExchange {
    fn exchange_id(&self) -> &str {
        EXCHANGE
    }

    async fn fetch_balance(&self, _credential: &PlaintextCredential) -> Result<AccountBalance, ExchangeError> {
        self.calls.lock().unwrap().push("fetch_balance");
        Ok(*self.balance.lock().unwrap())
    }

    async fn fetch_symbol_rules(&self, _symbol: &str) -> Result<SymbolRules, ExchangeError> {
        self.calls.lock().unwrap().push("fetch_symbol_rules");
        Ok(self.rules)
    }

    async fn fetch_mark_price(&self, _symbol: &str) -> Result<f64, ExchangeError> {
        self.calls.lock().unwrap().push("fetch_mark_price");
        Ok(*self.mark_price.lock().unwrap())
    }

    async fn set_leverage(&self, _credential: &PlaintextCredential, _symbol: &str, _leverage: u32) -> Result<(), ExchangeError> {
        self.calls.lock().unwrap().push("set_leverage");
        Ok(())
    }

    async fn submit_market(
        &self,
        _credential: &PlaintextCredential,
        _symbol: &str,
        _side: dispatch_engine::ports::OrderSide,
        quantity: f64,
        _reduce_only: bool,
    ) -> Result<MarketFillResult, ExchangeError> {
        self.calls.lock().unwrap().push("submit_market");
        let price = *self.mark_price.lock().unwrap();
        Ok(MarketFillResult { order_id: self.next_order_id(), fill_price: price, filled_qty: quantity })
    }

    async fn submit_reduce_order(
        &self,
        _credential: &PlaintextCredential,
        _symbol: &str,
        _side: dispatch_engine::ports::OrderSide,
        _quantity: f64,
        _trigger_price: f64,
        kind: ReduceOrderKind,
    ) -> Result<ReduceOrderResult, ExchangeError> {
        if kind == ReduceOrderKind::StopLoss {
            let mut flag = self.fail_next_stop_loss.lock().unwrap();
            if *flag {
                *flag = false;
                self.calls.lock().unwrap().push("submit_reduce_order_rejected");
                return Err(ExchangeError::ExchangeReject { code: "rejected".into(), message: "stop-loss rejected".into() });
            }
        }
        self.calls.lock().unwrap().push("submit_reduce_order");
        Ok(ReduceOrderResult { order_id: self.next_order_id() })
    }

    async fn cancel_order(&self, _credential: &PlaintextCredential, _symbol: &str, _order_id: &str) -> Result<(), ExchangeError> {
        self.calls.lock().unwrap().push("cancel_order");
        Ok(())
    }

    async fn fetch_position(&self, _credential: &PlaintextCredential, _symbol: &str) -> Result<Option<ExchangePositionSnapshot>, ExchangeError> {
        self.calls.lock().unwrap().push("fetch_position");
        Ok(*self.position_on_exchange.lock().unwrap())
    }
}

struct FakeRateLimiter;

#[async_trait]
impl RateLimiter for FakeRateLimiter {
    async fn acquire(&self, _exchange_id: &str, _credential_id: &str, _weight: u32) {}
}

#[derive(Default)]
struct FakeNotificationSink {
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl NotificationSink for FakeNotificationSink {
    fn name(&self) -> &str {
        "fake"
    }

    async fn send(&self, subject: &str, body: &str) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push((subject.to_string(), body.to_string()));
        Ok(())
    }
}

/// Everything a scenario needs: a real in-memory database behind every
/// persistence port, a fake exchange, and the two services under test.
struct Env {
    db: Arc<Database>,
    credential_store: Arc<AesGcmCredentialStore>,
    exchange: Arc<FakeExchange>,
    notifications: Arc<FakeNotificationSink>,
    engine: ExecutionEngine,
    supervisor: PositionSupervisor,
}

async fn master_key() -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode([9u8; 32])
}

async fn new_env(balance: f64, mark_price: f64) -> Env {
    new_env_with_extra_sinks(balance, mark_price, vec![]).await
}

/// Like `new_env`, but lets a scenario add extra notification sinks (e.g. a
/// sink that fails on every call) alongside the always-present
/// `FakeNotificationSink`.
async fn new_env_with_extra_sinks(balance: f64, mark_price: f64, extra_sinks: Vec<Arc<dyn NotificationSink>>) -> Env {
    let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
    let credential_store = Arc::new(AesGcmCredentialStore::new(db.clone(), &master_key().await).unwrap());
    let exchange = Arc::new(FakeExchange::new(balance, mark_price));
    let notifications = Arc::new(FakeNotificationSink::default());
    let locks = Arc::new(PositionLockRegistry::new());

    let mut exchanges: HashMap<String, Arc<dyn ExchangeAdapter>> = HashMap::new();
    exchanges.insert(EXCHANGE.to_string(), exchange.clone());

    let mut all_sinks: Vec<Arc<dyn NotificationSink>> = vec![notifications.clone()];
    all_sinks.extend(extra_sinks);

    let engine = ExecutionEngine {
        signals: db.clone(),
        subscribers: db.clone(),
        credentials: db.clone(),
        credential_store: credential_store.clone(),
        attempts: db.clone(),
        positions: db.clone(),
        audit_log: db.clone(),
        notifications: all_sinks.clone(),
        exchanges: exchanges.clone(),
        rate_limiter: Arc::new(FakeRateLimiter),
        position_locks: locks.clone(),
        fan_out_concurrency: 4,
        global_defaults: PartialTradingParams::default(),
    };

    let supervisor = PositionSupervisor {
        positions: db.clone(),
        subscribers: db.clone(),
        credentials: db.clone(),
        credential_store: credential_store.clone(),
        balance_snapshots: db.clone(),
        audit_log: db.clone(),
        notifications: vec![notifications.clone()],
        exchanges,
        rate_limiter: Arc::new(FakeRateLimiter),
        position_locks: locks,
    };

    Env { db, credential_store, exchange, notifications, engine, supervisor }
}

fn default_params() -> TradingParams {
    TradingParams {
        risk_fraction: 0.02,
        leverage: 10,
        tp_percent: 5.0,
        sl_percent: 2.0,
        max_concurrent_positions: 3,
        dca: None,
        trailing_stop: None,
        daily_loss_cutoff_percent: None,
    }
}

async fn insert_subscriber(db: &Database, id: &str, params: TradingParams) {
    let subscriber = Subscriber {
        id: id.to_string(),
        role: SubscriberRole::ReceivesSignals,
        active: true,
        subscription_expires_at: Utc::now() + chrono::Duration::days(30),
        params,
        guardrail_paused_until: None,
        strategy_subscriptions: vec![],
    };
    SubscriberRepository::save(db, &subscriber).await.unwrap();
}

/// Stores an approved, active credential for `subscriber_id` on `EXCHANGE`
/// and returns its id.
async fn insert_approved_credential(env: &Env, subscriber_id: &str) -> String {
    let credential = env
        .credential_store
        .put(subscriber_id, EXCHANGE, PlaintextCredential { api_key: "k".into(), api_secret: "s".into(), passphrase: None })
        .await
        .unwrap();
    sqlx::query("UPDATE credentials SET status = 'approved' WHERE id = ?").bind(&credential.id).execute(&env.db.pool).await.unwrap();
    credential.id
}

fn long_signal(symbol: &str) -> Signal {
    Signal {
        signal_id: uuid::Uuid::new_v4().to_string(),
        strategy_id: None,
        symbol: symbol.to_string(),
        action: SignalAction::Long,
        overrides: PartialTradingParams::default(),
        received_at: Utc::now(),
        status: SignalStatus::Received,
    }
}

fn close_signal(symbol: &str) -> Signal {
    Signal { action: SignalAction::Close, ..long_signal(symbol) }
}

#[tokio::test]
async fn happy_path_two_subscribers_fan_out() {
    let env = new_env(1000.0, 60000.0).await;
    insert_subscriber(&env.db, "sub-a", default_params()).await;
    insert_subscriber(&env.db, "sub-b", default_params()).await;
    insert_approved_credential(&env, "sub-a").await;
    insert_approved_credential(&env, "sub-b").await;

    let signal = long_signal("BTCUSDT");
    SignalRepository::insert_if_new(env.db.as_ref(), &signal).await.unwrap();
    env.engine.execute_signal(&signal.signal_id).await.unwrap();

    for sub in ["sub-a", "sub-b"] {
        let key = PositionKey { subscriber_id: sub.to_string(), exchange_id: EXCHANGE.to_string(), symbol: "BTCUSDT".to_string() };
        let position = PositionRepository::find_open(env.db.as_ref(), &key).await.unwrap().expect("position should be open");
        assert_eq!(position.side, PositionSide::Long);
        assert!(position.quantity > 0.0);
        assert_eq!(position.entry_price, 60000.0);

        let attempt = env.engine.attempts.find(&signal.signal_id, sub).await.unwrap().unwrap();
        assert_eq!(attempt.outcome, AttemptOutcome::Filled);
    }
}

#[tokio::test]
async fn a_failing_notification_sink_does_not_block_execution() {
    struct FlakySink;

    #[async_trait]
    impl NotificationSink for FlakySink {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn send(&self, _subject: &str, _body: &str) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("webhook endpoint unreachable"))
        }
    }

    let env = new_env_with_extra_sinks(1000.0, 60000.0, vec![Arc::new(FlakySink)]).await;
    insert_subscriber(&env.db, "sub-a", default_params()).await;
    insert_approved_credential(&env, "sub-a").await;

    let signal = long_signal("BTCUSDT");
    SignalRepository::insert_if_new(env.db.as_ref(), &signal).await.unwrap();
    env.engine.execute_signal(&signal.signal_id).await.unwrap();

    let key = PositionKey { subscriber_id: "sub-a".to_string(), exchange_id: EXCHANGE.to_string(), symbol: "BTCUSDT".to_string() };
    assert!(PositionRepository::find_open(env.db.as_ref(), &key).await.unwrap().is_some(), "one sink failing must not prevent the position from opening");
}

#[tokio::test]
async fn duplicate_signal_execution_is_not_redispatched() {
    let env = new_env(1000.0, 60000.0).await;
    insert_subscriber(&env.db, "sub-a", default_params()).await;
    insert_approved_credential(&env, "sub-a").await;

    let signal = long_signal("ETHUSDT");
    SignalRepository::insert_if_new(env.db.as_ref(), &signal).await.unwrap();

    env.engine.execute_signal(&signal.signal_id).await.unwrap();
    env.engine.execute_signal(&signal.signal_id).await.unwrap();

    assert_eq!(env.exchange.call_count("submit_market"), 1, "re-running execute_signal on an already-fenced attempt must not re-submit");
    assert_eq!(env.db.count_open_for_subscriber("sub-a").await.unwrap(), 1);
}

#[tokio::test]
async fn close_signal_with_no_open_position_is_skipped_before_any_exchange_call() {
    let env = new_env(1000.0, 60000.0).await;
    insert_subscriber(&env.db, "sub-a", default_params()).await;
    insert_approved_credential(&env, "sub-a").await;

    let signal = close_signal("BTCUSDT");
    SignalRepository::insert_if_new(env.db.as_ref(), &signal).await.unwrap();
    env.engine.execute_signal(&signal.signal_id).await.unwrap();

    // resolve_eligible filters out subscribers with no open position for a
    // close signal, so no attempt row is ever created for them.
    assert!(env.engine.attempts.find(&signal.signal_id, "sub-a").await.unwrap().is_none());
    assert_eq!(env.exchange.call_count("submit_market"), 0);
}

#[tokio::test]
async fn bracket_partial_failure_unwinds_the_position() {
    let env = new_env(1000.0, 60000.0).await;
    insert_subscriber(&env.db, "sub-a", default_params()).await;
    insert_approved_credential(&env, "sub-a").await;
    env.exchange.arm_stop_loss_rejection();

    let signal = long_signal("BTCUSDT");
    SignalRepository::insert_if_new(env.db.as_ref(), &signal).await.unwrap();
    env.engine.execute_signal(&signal.signal_id).await.unwrap();

    let key = PositionKey { subscriber_id: "sub-a".to_string(), exchange_id: EXCHANGE.to_string(), symbol: "BTCUSDT".to_string() };
    assert!(PositionRepository::find_open(env.db.as_ref(), &key).await.unwrap().is_none(), "position must be unwound, not left open");

    let attempt = env.engine.attempts.find(&signal.signal_id, "sub-a").await.unwrap().unwrap();
    assert_eq!(attempt.outcome, AttemptOutcome::Failed);
    assert_eq!(env.exchange.call_count("cancel_order"), 1, "the take-profit order that did succeed must be cancelled");
    assert!(env.notifications.sent.lock().unwrap().iter().any(|(subject, _)| subject.contains("bracket attach failed")));
}

#[tokio::test]
async fn trailing_stop_closes_position_once_crossed() {
    let env = new_env(1000.0, 60000.0).await;
    let params = TradingParams { trailing_stop: Some(TrailingStopConfig { activation_percent: 5.0, trailing_distance_percent: 2.0 }), ..default_params() };
    insert_subscriber(&env.db, "sub-a", params).await;
    insert_approved_credential(&env, "sub-a").await;

    let signal = long_signal("BTCUSDT");
    SignalRepository::insert_if_new(env.db.as_ref(), &signal).await.unwrap();
    env.engine.execute_signal(&signal.signal_id).await.unwrap();
    env.exchange.set_exchange_position(Some(ExchangePositionSnapshot { side: PositionSide::Long, quantity: 1.0, entry_price: 60000.0 }));

    // Rallies past activation (+5%), arming the stop at a 63000 high water.
    env.exchange.set_mark_price(63000.0);
    env.supervisor.tick().await.unwrap();
    let key = PositionKey { subscriber_id: "sub-a".to_string(), exchange_id: EXCHANGE.to_string(), symbol: "BTCUSDT".to_string() };
    let armed = PositionRepository::find_open(env.db.as_ref(), &key).await.unwrap().unwrap();
    assert!(armed.trailing_stop_armed);

    // Pulls back below the 2%-trailing virtual stop (63000 * 0.98 = 61740).
    env.exchange.set_mark_price(61000.0);
    env.supervisor.tick().await.unwrap();

    assert!(PositionRepository::find_open(env.db.as_ref(), &key).await.unwrap().is_none(), "position should be closed once the trailing stop is crossed");
    assert!(env.notifications.sent.lock().unwrap().iter().any(|(subject, _)| subject.contains("trailing stop hit")));
}

#[tokio::test]
async fn daily_loss_cutoff_trips_guardrail_and_closes_every_open_position() {
    let env = new_env(1000.0, 60000.0).await;
    let params = TradingParams { daily_loss_cutoff_percent: Some(10.0), ..default_params() };
    insert_subscriber(&env.db, "sub-a", params).await;
    insert_approved_credential(&env, "sub-a").await;

    let signal = long_signal("BTCUSDT");
    SignalRepository::insert_if_new(env.db.as_ref(), &signal).await.unwrap();
    env.engine.execute_signal(&signal.signal_id).await.unwrap();
    env.exchange.set_exchange_position(Some(ExchangePositionSnapshot { side: PositionSide::Long, quantity: 1.0, entry_price: 60000.0 }));

    let snapshot = dispatch_engine::domain::models::BalanceSnapshot {
        subscriber_id: "sub-a".to_string(),
        exchange_id: EXCHANGE.to_string(),
        taken_at: Utc::now(),
        equity: 1000.0,
        day_start_equity: 1000.0,
    };
    dispatch_engine::ports::BalanceSnapshotRepository::record(env.db.as_ref(), &snapshot).await.unwrap();

    // Equity has dropped 12%, past the 10% cutoff.
    env.exchange.set_equity(880.0);
    env.supervisor.tick().await.unwrap();

    let key = PositionKey { subscriber_id: "sub-a".to_string(), exchange_id: EXCHANGE.to_string(), symbol: "BTCUSDT".to_string() };
    assert!(PositionRepository::find_open(env.db.as_ref(), &key).await.unwrap().is_none(), "guardrail trip must close the position");

    let subscriber = SubscriberRepository::find(env.db.as_ref(), "sub-a").await.unwrap().unwrap();
    assert!(subscriber.guardrail_paused_until.is_some());
    assert!(env.notifications.sent.lock().unwrap().iter().any(|(subject, _)| subject.contains("guardrail tripped")));
}

#[tokio::test]
async fn dca_addition_blends_entry_and_reattaches_brackets() {
    let env = new_env(1000.0, 60000.0).await;
    let params = TradingParams { dca: Some(DcaConfig { threshold_percent: 2.0, multiplier: 1.0, max_additions: 2 }), ..default_params() };
    insert_subscriber(&env.db, "sub-a", params).await;
    insert_approved_credential(&env, "sub-a").await;

    let signal = long_signal("BTCUSDT");
    SignalRepository::insert_if_new(env.db.as_ref(), &signal).await.unwrap();
    env.engine.execute_signal(&signal.signal_id).await.unwrap();
    env.exchange.set_exchange_position(Some(ExchangePositionSnapshot { side: PositionSide::Long, quantity: 1.0, entry_price: 60000.0 }));

    let key = PositionKey { subscriber_id: "sub-a".to_string(), exchange_id: EXCHANGE.to_string(), symbol: "BTCUSDT".to_string() };
    let before = PositionRepository::find_open(env.db.as_ref(), &key).await.unwrap().unwrap();
    let original_qty = before.quantity;

    // Drops 3%, past the 2% DCA threshold measured from the last fill.
    env.exchange.set_mark_price(58200.0);
    env.supervisor.tick().await.unwrap();

    let after = PositionRepository::find_open(env.db.as_ref(), &key).await.unwrap().unwrap();
    assert_eq!(after.dca_additions, 1);
    assert!(after.quantity > original_qty);
    assert!(after.entry_price < before.entry_price && after.entry_price > 58200.0, "blended entry should land between the old entry and the addition fill price");
    assert!(after.tp_order_id.is_some() && after.sl_order_id.is_some(), "brackets must be re-attached after the addition");
    assert_eq!(env.exchange.call_count("submit_reduce_order"), 4, "two brackets at open plus two re-attached after the DCA fill");
}
