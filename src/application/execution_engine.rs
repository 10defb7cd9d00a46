use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::domain::models::{
    AttemptOutcome, AuditCategory, AuditEvent, ExecutionAttempt, PartialTradingParams, Position, PositionKey,
    PositionSide, PositionStatus, Signal, SignalAction,
};
use crate::domain::services::sizing::{size_position, SizingOutcome};
use crate::domain::services::subscriber_resolver::{close_requires_open_position, effective_params, subscriber_admissible, EligibleSubscriber};
use crate::error::{AttemptFailure, ExchangeError, SkipReason};
use crate::ports::{
    AuditLog, CredentialRepository, CredentialStore, ExchangeAdapter, ExecutionAttemptRepository, MarketFillResult,
    NotificationSink, OrderSide, PositionRepository, RateLimiter, ReduceOrderKind, SignalRepository,
    SubscriberRepository,
};

use super::position_lock::PositionLockRegistry;

/// Retry budget for a single transient exchange error before falling back to
/// `fetch_position` reconciliation. See spec §4.4, §7.
const MAX_EXCHANGE_RETRIES: u32 = 3;

async fn retry_backoff(attempt: u32) {
    let backoff_ms = 200u64.saturating_mul(1u64 << attempt.min(4));
    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
}

/// Retries `f` while it returns a retryable `ExchangeError` (spec §7), with
/// exponential backoff mirroring the job queue's `backoff_seconds` but
/// scaled to milliseconds since this loop runs inline within one job rather
/// than across scheduler ticks. Gives up and returns the last error once
/// `MAX_EXCHANGE_RETRIES` is exhausted.
async fn with_retry<T, F, Fut>(mut f: F) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ExchangeError>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < MAX_EXCHANGE_RETRIES => {
                warn!(attempt, error = %e, "transient exchange error, retrying");
                retry_backoff(attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Orchestrates spec §4.4: per-signal fan-out to every eligible subscriber,
/// then the seven-step per-subscriber execution sequence. Holds only port
/// handles; it has no knowledge of HTTP, SQL, or any concrete exchange.
pub struct ExecutionEngine {
    pub signals: Arc<dyn SignalRepository>,
    pub subscribers: Arc<dyn SubscriberRepository>,
    pub credentials: Arc<dyn CredentialRepository>,
    pub credential_store: Arc<dyn CredentialStore>,
    pub attempts: Arc<dyn ExecutionAttemptRepository>,
    pub positions: Arc<dyn PositionRepository>,
    pub audit_log: Arc<dyn AuditLog>,
    pub notifications: Vec<Arc<dyn NotificationSink>>,
    pub exchanges: HashMap<String, Arc<dyn ExchangeAdapter>>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub position_locks: Arc<PositionLockRegistry>,
    pub fan_out_concurrency: usize,
    /// Operator-configured floor of the §4.3 overlay chain: "global defaults
    /// ← subscriber defaults ← strategy-subscription overrides ← signal's
    /// explicit overrides". Loaded once from `[global_defaults]` in config.
    pub global_defaults: PartialTradingParams,
}

impl ExecutionEngine {
    /// Entry point for the `execute_signal(signal_id)` job. Fans out to
    /// every eligible subscriber concurrently, bounded by
    /// `fan_out_concurrency` (spec §5 "Scheduling model").
    #[instrument(skip(self), fields(signal_id = %signal_id))]
    pub async fn execute_signal(&self, signal_id: &str) -> anyhow::Result<()> {
        let signal = match self.signals.find(signal_id).await? {
            Some(s) => s,
            None => {
                warn!("execute_signal invoked for unknown signal_id");
                return Ok(());
            }
        };

        let eligible = self.resolve_eligible(&signal).await?;
        info!(eligible_count = eligible.len(), "fanning out signal to subscribers");

        stream::iter(eligible)
            .for_each_concurrent(self.fan_out_concurrency, |e| {
                let signal = signal.clone();
                async move {
                    if let Err(err) = self.execute_for_subscriber(&signal, &e).await {
                        warn!(subscriber_id = %e.subscriber.id, error = %err, "per-subscriber execution task errored");
                    }
                }
            })
            .await;

        self.signals.mark_dispatched(signal_id).await?;
        Ok(())
    }

    async fn resolve_eligible(&self, signal: &Signal) -> anyhow::Result<Vec<EligibleSubscriber>> {
        let now = Utc::now();
        let candidates = self.subscribers.list_active().await?;
        let mut eligible = Vec::new();

        for subscriber in candidates {
            if !subscriber_admissible(&subscriber, signal, now) {
                continue;
            }

            // A subscriber may hold approved credentials on more than one
            // exchange; the signal itself carries no exchange hint, so the
            // first exchange (among the ones this deployment is configured
            // with) for which the subscriber has a usable credential wins.
            // See DESIGN.md, "credential-to-exchange resolution".
            let credential = {
                let mut found = None;
                for exchange_id in self.exchanges.keys() {
                    if let Some(c) = self.credentials.find_usable_for_exchange(&subscriber.id, exchange_id).await? {
                        found = Some(c);
                        break;
                    }
                }
                match found {
                    Some(c) => c,
                    None => continue,
                }
            };

            if signal.action == SignalAction::Close {
                let key = PositionKey { subscriber_id: subscriber.id.clone(), exchange_id: credential.exchange_id.clone(), symbol: signal.symbol.clone() };
                let existing = self.positions.find_open(&key).await?;
                if !close_requires_open_position(signal.action, existing.as_ref()) {
                    continue;
                }
            }

            let strategy_override = subscriber.strategy_override(signal.strategy_id);
            let params = effective_params(&self.global_defaults, &subscriber, strategy_override, &signal.overrides);
            eligible.push(EligibleSubscriber { subscriber, credential, effective_params: params });
        }

        Ok(eligible)
    }

    /// The seven-step sequence from spec §4.4, run for exactly one
    /// `(signal, subscriber)` pair.
    #[instrument(skip(self, signal, eligible), fields(signal_id = %signal.signal_id, subscriber_id = %eligible.subscriber.id))]
    async fn execute_for_subscriber(&self, signal: &Signal, eligible: &EligibleSubscriber) -> anyhow::Result<()> {
        let subscriber_id = &eligible.subscriber.id;

        // Step 1: idempotency fence.
        let created = self.attempts.insert_pending_if_new(&signal.signal_id, subscriber_id).await?;
        if !created {
            return Ok(());
        }

        let key = PositionKey {
            subscriber_id: subscriber_id.clone(),
            exchange_id: eligible.credential.exchange_id.clone(),
            symbol: signal.symbol.clone(),
        };
        let _position_guard = self.position_locks.lock(&key).await;

        // Step 2: pre-checks.
        if let Err(skip) = self.precheck(signal, eligible, &key).await? {
            let attempt = ExecutionAttempt::skipped(&signal.signal_id, subscriber_id, skip);
            self.attempts.record_outcome(&attempt).await?;
            self.audit_skip(signal, subscriber_id, &attempt).await;
            return Ok(());
        }

        let exchange = match self.exchanges.get(&eligible.credential.exchange_id) {
            Some(e) => e.clone(),
            None => {
                let failure = AttemptFailure::CredentialUnavailable;
                self.record_failure(signal, subscriber_id, &failure).await?;
                return Ok(());
            }
        };
        let plaintext = match self.credential_store.get_plaintext(&eligible.credential.id).await {
            Ok(p) => p,
            Err(_) => {
                self.record_failure(signal, subscriber_id, &AttemptFailure::CredentialUnavailable).await?;
                return Ok(());
            }
        };

        if signal.action == SignalAction::Close {
            self.execute_close(signal, eligible, &key, exchange.as_ref(), &plaintext).await?;
            return Ok(());
        }

        self.execute_open(signal, eligible, &key, exchange.as_ref(), &plaintext).await
    }

    async fn precheck(&self, signal: &Signal, eligible: &EligibleSubscriber, key: &PositionKey) -> anyhow::Result<Result<(), SkipReason>> {
        if !eligible.subscriber.active {
            return Ok(Err(SkipReason::SubscriberIneligible));
        }

        match signal.action {
            SignalAction::Close => {
                let existing = self.positions.find_open(key).await?;
                if !close_requires_open_position(signal.action, existing.as_ref()) {
                    return Ok(Err(SkipReason::NoPosition));
                }
            }
            SignalAction::Long | SignalAction::Short => {
                let open_count = self.positions.count_open_for_subscriber(&eligible.subscriber.id).await?;
                if open_count >= eligible.effective_params.max_concurrent_positions {
                    return Ok(Err(SkipReason::MaxPositionsReached));
                }
                if let Some(existing) = self.positions.find_open(key).await? {
                    let wants_long = signal.action == SignalAction::Long;
                    let is_long = existing.side == PositionSide::Long;
                    if wants_long == is_long {
                        return Ok(Err(SkipReason::DuplicatePosition));
                    }
                }
            }
        }
        Ok(Ok(()))
    }

    async fn execute_open(
        &self,
        signal: &Signal,
        eligible: &EligibleSubscriber,
        key: &PositionKey,
        exchange: &dyn ExchangeAdapter,
        plaintext: &crate::domain::models::PlaintextCredential,
    ) -> anyhow::Result<()> {
        let exchange_id = &eligible.credential.exchange_id;
        let credential_id = &eligible.credential.id;

        self.rate_limiter.acquire(exchange_id, credential_id, 1).await;
        let balance = match with_retry(|| exchange.fetch_balance(plaintext)).await {
            Ok(b) => b,
            Err(e) => return self.record_exchange_failure(signal, &eligible.subscriber.id, e).await,
        };

        self.rate_limiter.acquire(exchange_id, credential_id, 1).await;
        let rules = match with_retry(|| exchange.fetch_symbol_rules(&signal.symbol)).await {
            Ok(r) => r,
            Err(e) => return self.record_exchange_failure(signal, &eligible.subscriber.id, e).await,
        };

        self.rate_limiter.acquire(exchange_id, credential_id, 1).await;
        let mark_price = match with_retry(|| exchange.fetch_mark_price(&signal.symbol)).await {
            Ok(p) => p,
            Err(e) => return self.record_exchange_failure(signal, &eligible.subscriber.id, e).await,
        };

        let quantity = match size_position(balance.available, eligible.effective_params.risk_fraction, eligible.effective_params.leverage, mark_price, &rules) {
            SizingOutcome::Quantity(q) => q,
            SizingOutcome::BelowMinNotional => {
                let attempt = ExecutionAttempt::skipped(&signal.signal_id, &eligible.subscriber.id, SkipReason::BelowNotional);
                self.attempts.record_outcome(&attempt).await?;
                return Ok(());
            }
        };

        self.rate_limiter.acquire(exchange_id, credential_id, 1).await;
        if let Err(e) = with_retry(|| exchange.set_leverage(plaintext, &signal.symbol, eligible.effective_params.leverage)).await {
            return self.record_exchange_failure(signal, &eligible.subscriber.id, e).await;
        }

        let side = if signal.action == SignalAction::Long { OrderSide::Buy } else { OrderSide::Sell };
        self.rate_limiter.acquire(exchange_id, credential_id, 1).await;
        let fill = match submit_open_with_reconciliation(exchange, plaintext, &signal.symbol, side, quantity).await {
            Ok(f) => f,
            Err(failure) => {
                self.record_failure(signal, &eligible.subscriber.id, &failure).await?;
                return Ok(());
            }
        };

        let position_side = if signal.action == SignalAction::Long { PositionSide::Long } else { PositionSide::Short };
        let (tp_price, sl_price) = bracket_prices(position_side, fill.fill_price, eligible.effective_params.tp_percent, eligible.effective_params.sl_percent, &rules);

        let tp_side = if position_side == PositionSide::Long { OrderSide::Sell } else { OrderSide::Buy };
        self.rate_limiter.acquire(exchange_id, credential_id, 1).await;
        let tp_result = with_retry(|| exchange.submit_reduce_order(plaintext, &signal.symbol, tp_side, quantity, tp_price, ReduceOrderKind::TakeProfit)).await;

        self.rate_limiter.acquire(exchange_id, credential_id, 1).await;
        let sl_result = with_retry(|| exchange.submit_reduce_order(plaintext, &signal.symbol, tp_side, quantity, sl_price, ReduceOrderKind::StopLoss)).await;

        let (tp_order_id, sl_order_id) = match (tp_result, sl_result) {
            (Ok(tp), Ok(sl)) => (Some(tp.order_id), Some(sl.order_id)),
            (tp, sl) => {
                // Bracket atomicity, spec §4.4 step 5: unwind whichever side
                // succeeded and close the now-unprotected position.
                if let Ok(ref r) = tp {
                    let _ = exchange.cancel_order(plaintext, &signal.symbol, &r.order_id).await;
                }
                if let Ok(ref r) = sl {
                    let _ = exchange.cancel_order(plaintext, &signal.symbol, &r.order_id).await;
                }
                let _ = exchange.submit_market(plaintext, &signal.symbol, tp_side, quantity, true).await;
                self.record_failure(signal, &eligible.subscriber.id, &AttemptFailure::BracketAttach).await?;
                self.notify(&format!("bracket attach failed for {}", eligible.subscriber.id), "position opened then unwound after a take-profit or stop-loss order was rejected").await;
                return Ok(());
            }
        };

        let position = Position {
            id: uuid::Uuid::new_v4().to_string(),
            subscriber_id: eligible.subscriber.id.clone(),
            exchange_id: exchange_id.clone(),
            credential_id: credential_id.clone(),
            symbol: signal.symbol.clone(),
            side: position_side,
            status: PositionStatus::Open,
            entry_price: fill.fill_price,
            quantity: fill.filled_qty,
            tp_percent: eligible.effective_params.tp_percent,
            sl_percent: eligible.effective_params.sl_percent,
            tp_order_id,
            sl_order_id,
            dca_additions: 0,
            last_addition_price: fill.fill_price,
            last_addition_qty: fill.filled_qty,
            trailing_stop_armed: false,
            trailing_stop_high_water: None,
            opened_at: Utc::now(),
            closed_at: None,
        };
        self.positions.upsert(&position).await?;

        let attempt = ExecutionAttempt::filled(&signal.signal_id, &eligible.subscriber.id, fill.order_id, fill.filled_qty, fill.fill_price);
        self.attempts.record_outcome(&attempt).await?;

        self.audit_log
            .record(AuditEvent::new(
                AuditCategory::ExecutionFilled,
                Some(eligible.subscriber.id.clone()),
                Some(signal.signal_id.clone()),
                json!({ "symbol": signal.symbol, "quantity": fill.filled_qty, "price": fill.fill_price }),
            ))
            .await
            .ok();
        self.notify(&format!("{} opened for {}", signal.symbol, eligible.subscriber.id), &format!("filled {} @ {}", fill.filled_qty, fill.fill_price)).await;

        Ok(())
    }

    async fn execute_close(
        &self,
        signal: &Signal,
        eligible: &EligibleSubscriber,
        key: &PositionKey,
        exchange: &dyn ExchangeAdapter,
        plaintext: &crate::domain::models::PlaintextCredential,
    ) -> anyhow::Result<()> {
        let existing = match self.positions.find_open(key).await? {
            Some(p) => p,
            None => {
                let attempt = ExecutionAttempt::skipped(&signal.signal_id, &eligible.subscriber.id, SkipReason::NoPosition);
                self.attempts.record_outcome(&attempt).await?;
                return Ok(());
            }
        };

        let closing_side = if existing.side == PositionSide::Long { OrderSide::Sell } else { OrderSide::Buy };
        self.rate_limiter.acquire(&eligible.credential.exchange_id, &eligible.credential.id, 1).await;
        let fill = match submit_close_with_reconciliation(exchange, plaintext, &signal.symbol, closing_side, existing.quantity).await {
            Ok(f) => f,
            Err(failure) => {
                self.record_failure(signal, &eligible.subscriber.id, &failure).await?;
                return Ok(());
            }
        };

        self.positions.close(&existing.id, Utc::now()).await?;
        let attempt = ExecutionAttempt::filled(&signal.signal_id, &eligible.subscriber.id, fill.order_id, fill.filled_qty, fill.fill_price);
        self.attempts.record_outcome(&attempt).await?;
        self.audit_log
            .record(AuditEvent::new(AuditCategory::PositionClosed, Some(eligible.subscriber.id.clone()), Some(signal.signal_id.clone()), json!({ "symbol": signal.symbol })))
            .await
            .ok();
        self.notify(&format!("{} closed for {}", signal.symbol, eligible.subscriber.id), "position closed on signal").await;
        Ok(())
    }

    async fn record_exchange_failure(&self, signal: &Signal, subscriber_id: &str, error: ExchangeError) -> anyhow::Result<()> {
        let failure = classify(&error);
        self.record_failure(signal, subscriber_id, &failure).await?;
        if matches!(error, ExchangeError::Auth(_)) {
            warn!(subscriber_id, "credential rejected by exchange, flagging for disable");
        }
        Ok(())
    }

    async fn record_failure(&self, signal: &Signal, subscriber_id: &str, failure: &AttemptFailure) -> anyhow::Result<()> {
        let attempt = ExecutionAttempt::failed(&signal.signal_id, subscriber_id, failure);
        self.attempts.record_outcome(&attempt).await?;
        self.audit_log
            .record(AuditEvent::new(
                AuditCategory::ExecutionFailed,
                Some(subscriber_id.to_string()),
                Some(signal.signal_id.clone()),
                json!({ "reason": failure.to_string() }),
            ))
            .await
            .ok();
        Ok(())
    }

    async fn audit_skip(&self, signal: &Signal, subscriber_id: &str, attempt: &ExecutionAttempt) {
        debug_assert_eq!(attempt.outcome, AttemptOutcome::Skipped);
        let _ = self
            .audit_log
            .record(AuditEvent::new(
                AuditCategory::ExecutionSkipped,
                Some(subscriber_id.to_string()),
                Some(signal.signal_id.clone()),
                json!({ "reason": attempt.reason }),
            ))
            .await;
    }

    async fn notify(&self, subject: &str, body: &str) {
        for sink in &self.notifications {
            if let Err(e) = sink.send(subject, body).await {
                warn!(sink = sink.name(), error = %e, "notification sink failed, continuing");
            }
        }
    }
}

/// Rounds both TP and SL to the tick that is worse for the trader, per spec
/// §4.4 "Edge policies": toward entry (less profit) for TP, away from entry
/// (bigger loss) for SL. `SymbolRules::round_bracket_price` encodes the
/// floor/ceil choice per side.
pub(crate) fn bracket_prices(side: PositionSide, entry: f64, tp_percent: f64, sl_percent: f64, rules: &crate::domain::models::SymbolRules) -> (f64, f64) {
    match side {
        PositionSide::Long => {
            let tp = entry * (1.0 + tp_percent / 100.0);
            let sl = entry * (1.0 - sl_percent / 100.0);
            (rules.round_bracket_price(side, tp), rules.round_bracket_price(side, sl))
        }
        PositionSide::Short => {
            let tp = entry * (1.0 - tp_percent / 100.0);
            let sl = entry * (1.0 + sl_percent / 100.0);
            (rules.round_bracket_price(side, tp), rules.round_bracket_price(side, sl))
        }
    }
}

fn classify(error: &ExchangeError) -> AttemptFailure {
    match error {
        ExchangeError::Auth(_) => AttemptFailure::CredentialUnavailable,
        ExchangeError::RateLimit { .. } | ExchangeError::Transport(_) => AttemptFailure::Transport,
        ExchangeError::Symbol(_) => AttemptFailure::ExchangeRejected("unknown symbol".into()),
        ExchangeError::InsufficientBalance { .. } => AttemptFailure::BelowNotional,
        ExchangeError::ExchangeReject { code, message } => AttemptFailure::ExchangeRejected(format!("{code}: {message}")),
    }
}

/// Submits the opening market order, retrying transient errors up to
/// `MAX_EXCHANGE_RETRIES`. If the budget is exhausted on an error that was
/// still retryable, the order may in fact have filled on the exchange
/// despite the transport failure reaching us, so this reconciles against
/// `fetch_position` instead of assuming failure (spec §4.4 step 4, §7).
async fn submit_open_with_reconciliation(
    exchange: &dyn ExchangeAdapter,
    plaintext: &crate::domain::models::PlaintextCredential,
    symbol: &str,
    side: OrderSide,
    quantity: f64,
) -> Result<MarketFillResult, AttemptFailure> {
    let mut attempt = 0;
    loop {
        match exchange.submit_market(plaintext, symbol, side, quantity, false).await {
            Ok(fill) => return Ok(fill),
            Err(e) if e.is_retryable() && attempt < MAX_EXCHANGE_RETRIES => {
                warn!(attempt, error = %e, "transient error opening position, retrying");
                retry_backoff(attempt).await;
                attempt += 1;
            }
            Err(e) if e.is_retryable() => {
                warn!(symbol, "retry budget exhausted, reconciling open against exchange position");
                return match exchange.fetch_position(plaintext, symbol).await {
                    Ok(Some(snapshot)) => {
                        Ok(MarketFillResult { order_id: format!("reconciled:{symbol}"), fill_price: snapshot.entry_price, filled_qty: snapshot.quantity })
                    }
                    Ok(None) => Err(AttemptFailure::Transport),
                    Err(_) => Err(AttemptFailure::Ambiguous),
                };
            }
            Err(e) => return Err(classify(&e)),
        }
    }
}

/// Mirror of `submit_open_with_reconciliation` for a reduce-only close: on
/// retry exhaustion, the absence of a remaining exchange position confirms
/// the close went through.
async fn submit_close_with_reconciliation(
    exchange: &dyn ExchangeAdapter,
    plaintext: &crate::domain::models::PlaintextCredential,
    symbol: &str,
    side: OrderSide,
    quantity: f64,
) -> Result<MarketFillResult, AttemptFailure> {
    let mut attempt = 0;
    loop {
        match exchange.submit_market(plaintext, symbol, side, quantity, true).await {
            Ok(fill) => return Ok(fill),
            Err(e) if e.is_retryable() && attempt < MAX_EXCHANGE_RETRIES => {
                warn!(attempt, error = %e, "transient error closing position, retrying");
                retry_backoff(attempt).await;
                attempt += 1;
            }
            Err(e) if e.is_retryable() => {
                warn!(symbol, "retry budget exhausted, reconciling close against exchange position");
                return match exchange.fetch_position(plaintext, symbol).await {
                    Ok(None) => Ok(MarketFillResult { order_id: format!("reconciled:{symbol}"), fill_price: 0.0, filled_qty: quantity }),
                    Ok(Some(_)) => Err(AttemptFailure::Transport),
                    Err(_) => Err(AttemptFailure::Ambiguous),
                };
            }
            Err(e) => return Err(classify(&e)),
        }
    }
}
