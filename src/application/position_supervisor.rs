use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::domain::models::{AuditCategory, AuditEvent, Position, PositionSide, PositionStatus};
use crate::ports::{
    AuditLog, BalanceSnapshotRepository, CredentialRepository, CredentialStore, ExchangeAdapter, NotificationSink,
    OrderSide, PositionRepository, RateLimiter, SubscriberRepository,
};

use super::position_lock::PositionLockRegistry;

const BATCH_SIZE: u32 = 200;

/// Runs on a periodic tick (spec §4.7). Scans open positions in bounded
/// batches and applies trailing-stop, DCA, guardrail, and close-detection
/// logic to each. Ticks run to completion sequentially within a batch so
/// that a subscriber's guardrail trip (which closes every open position for
/// that subscriber) is never raced by a concurrent pass over the same
/// subscriber's other positions.
pub struct PositionSupervisor {
    pub positions: Arc<dyn PositionRepository>,
    pub subscribers: Arc<dyn SubscriberRepository>,
    pub credentials: Arc<dyn CredentialRepository>,
    pub credential_store: Arc<dyn CredentialStore>,
    pub balance_snapshots: Arc<dyn BalanceSnapshotRepository>,
    pub audit_log: Arc<dyn AuditLog>,
    pub notifications: Vec<Arc<dyn NotificationSink>>,
    pub exchanges: HashMap<String, Arc<dyn ExchangeAdapter>>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub position_locks: Arc<PositionLockRegistry>,
}

impl PositionSupervisor {
    #[instrument(skip(self))]
    pub async fn tick(&self) -> anyhow::Result<()> {
        let mut guardrail_handled: HashSet<String> = HashSet::new();
        let mut after_id: Option<String> = None;

        loop {
            let batch = self.positions.list_open_batch(after_id.as_deref(), BATCH_SIZE).await?;
            if batch.is_empty() {
                break;
            }
            let batch_len = batch.len();
            let last_id = batch.last().map(|p| p.id.clone());

            for position in batch {
                if guardrail_handled.contains(&position.subscriber_id) {
                    continue;
                }
                if let Err(e) = self.process_position(&position, &mut guardrail_handled).await {
                    warn!(position_id = %position.id, error = %e, "supervisor failed to process position, continuing with others");
                }
            }

            if (batch_len as u32) < BATCH_SIZE {
                break;
            }
            after_id = last_id;
        }
        Ok(())
    }

    async fn process_position(&self, position: &Position, guardrail_handled: &mut HashSet<String>) -> anyhow::Result<()> {
        let key = position.key();
        let _guard = self.position_locks.lock(&key).await;

        // Re-read: the position may have closed between the batch scan and
        // acquiring the lock (e.g. a concurrent close signal).
        let current = match self.positions.find_open(&key).await? {
            Some(p) => p,
            None => return Ok(()),
        };

        let exchange = match self.exchanges.get(&current.exchange_id) {
            Some(e) => e.clone(),
            None => return Ok(()),
        };
        let plaintext = self.credential_store.get_plaintext(&current.credential_id).await?;

        let snapshot = exchange.fetch_position(&plaintext, &current.symbol).await?;
        if snapshot.is_none() {
            self.close_detected(&current, exchange.as_ref(), &plaintext).await?;
            return Ok(());
        }

        if current.status == PositionStatus::Closing {
            // A previous close attempt did not settle; retry it rather
            // than leaving the position stuck unprotected.
            self.close_position(&current, exchange.as_ref(), &plaintext).await?;
            return Ok(());
        }

        let subscriber = match self.subscribers.find(&current.subscriber_id).await? {
            Some(s) => s,
            None => return Ok(()),
        };

        if let Some(cutoff) = subscriber.params.daily_loss_cutoff_percent {
            if self.check_guardrail(&subscriber.id, &current.exchange_id, &current.credential_id, exchange.as_ref(), &plaintext, cutoff).await? {
                guardrail_handled.insert(subscriber.id.clone());
                return Ok(());
            }
        }

        let mark_price = exchange.fetch_mark_price(&current.symbol).await.unwrap_or(current.entry_price);

        if let Some(dca) = subscriber.params.dca {
            self.maybe_dca(&current, exchange.as_ref(), &plaintext, mark_price, dca).await?;
        }

        if let Some(trailing) = subscriber.params.trailing_stop {
            self.maybe_trail(&current, exchange.as_ref(), &plaintext, mark_price, trailing).await?;
        }

        Ok(())
    }

    /// Spec §4.7: transitions a position through `Closing` before it
    /// reaches `Closed`, for every server-initiated close (guardrail trip,
    /// trailing stop, and the retry of either on a later tick). Returns
    /// `true` once the exchange confirms the reduce order, `false` if the
    /// position is left in `Closing` for the next tick to retry.
    async fn close_position(&self, position: &Position, exchange: &dyn ExchangeAdapter, plaintext: &crate::domain::models::PlaintextCredential) -> anyhow::Result<bool> {
        if position.status != PositionStatus::Closing {
            let mut closing = position.clone();
            closing.status = PositionStatus::Closing;
            self.positions.upsert(&closing).await?;
        }

        let closing_side = if position.side == PositionSide::Long { OrderSide::Sell } else { OrderSide::Buy };
        self.rate_limiter.acquire(&position.exchange_id, &position.credential_id, 1).await;
        if let Err(e) = exchange.submit_market(plaintext, &position.symbol, closing_side, position.quantity, true).await {
            warn!(position_id = %position.id, error = %e, "server-initiated close failed, position left in closing state for the next tick to retry");
            return Ok(false);
        }

        if let Some(sl) = &position.sl_order_id {
            let _ = exchange.cancel_order(plaintext, &position.symbol, sl).await;
        }
        if let Some(tp) = &position.tp_order_id {
            let _ = exchange.cancel_order(plaintext, &position.symbol, tp).await;
        }
        self.positions.close(&position.id, Utc::now()).await?;
        Ok(true)
    }

    /// Spec §4.7 "Close detection": the exchange reports the position
    /// absent while the server still holds it open. Reconcile: cancel any
    /// still-live brackets, flip to closed.
    async fn close_detected(&self, position: &Position, exchange: &dyn ExchangeAdapter, plaintext: &crate::domain::models::PlaintextCredential) -> anyhow::Result<()> {
        if let Some(tp) = &position.tp_order_id {
            let _ = exchange.cancel_order(plaintext, &position.symbol, tp).await;
        }
        if let Some(sl) = &position.sl_order_id {
            let _ = exchange.cancel_order(plaintext, &position.symbol, sl).await;
        }
        self.positions.close(&position.id, Utc::now()).await?;
        self.audit_log
            .record(AuditEvent::new(AuditCategory::PositionClosed, Some(position.subscriber_id.clone()), None, json!({ "symbol": position.symbol, "reason": "closed_externally" })))
            .await
            .ok();
        info!(position_id = %position.id, "position closed externally between ticks, reconciled");
        Ok(())
    }

    /// Spec §4.7 "Guardrails". Returns `true` if the guardrail tripped and
    /// every open position for this subscriber was closed.
    async fn check_guardrail(
        &self,
        subscriber_id: &str,
        exchange_id: &str,
        credential_id: &str,
        exchange: &dyn ExchangeAdapter,
        plaintext: &crate::domain::models::PlaintextCredential,
        cutoff_percent: f64,
    ) -> anyhow::Result<bool> {
        let day_start = match self.balance_snapshots.day_start_equity(subscriber_id, exchange_id).await? {
            Some(v) => v,
            None => return Ok(false),
        };
        self.rate_limiter.acquire(exchange_id, credential_id, 1).await;
        let balance = exchange.fetch_balance(plaintext).await?;
        if day_start <= 0.0 {
            return Ok(false);
        }
        let pnl_percent = ((balance.equity - day_start) / day_start) * 100.0;
        if pnl_percent > -cutoff_percent {
            return Ok(false);
        }

        let tomorrow = Utc::now().date_naive().succ_opt().unwrap_or(Utc::now().date_naive());
        let boundary = Utc.from_utc_datetime(&tomorrow.and_hms_opt(0, 0, 0).expect("midnight is always valid"));
        self.subscribers.set_guardrail_paused_until(subscriber_id, Some(boundary)).await?;

        let open_positions = self.positions.list_open_for_subscriber(subscriber_id).await?;
        for position in &open_positions {
            self.close_position(position, exchange, plaintext).await?;
        }

        self.audit_log
            .record(AuditEvent::new(AuditCategory::GuardrailTripped, Some(subscriber_id.to_string()), None, json!({ "pnl_percent": pnl_percent, "cutoff_percent": cutoff_percent })))
            .await
            .ok();
        for sink in &self.notifications {
            let _ = sink.send(&format!("guardrail tripped for {subscriber_id}"), &format!("daily PnL {pnl_percent:.2}% breached cutoff of -{cutoff_percent:.2}%, all positions closed")).await;
        }
        warn!(subscriber_id, pnl_percent, "guardrail tripped, subscriber paused until next UTC day");
        Ok(true)
    }

    /// Spec §4.7 "DCA additions".
    async fn maybe_dca(
        &self,
        position: &Position,
        exchange: &dyn ExchangeAdapter,
        plaintext: &crate::domain::models::PlaintextCredential,
        mark_price: f64,
        dca: crate::domain::models::DcaConfig,
    ) -> anyhow::Result<()> {
        if position.dca_additions >= dca.max_additions {
            return Ok(());
        }
        let loss_since_last_fill = match position.side {
            PositionSide::Long => ((position.last_addition_price - mark_price) / position.last_addition_price) * 100.0,
            PositionSide::Short => ((mark_price - position.last_addition_price) / position.last_addition_price) * 100.0,
        };
        if loss_since_last_fill < dca.threshold_percent {
            return Ok(());
        }

        let side = if position.side == PositionSide::Long { OrderSide::Buy } else { OrderSide::Sell };
        let add_quantity = position.last_addition_qty * dca.multiplier;
        self.rate_limiter.acquire(&position.exchange_id, &position.credential_id, 1).await;
        let fill = exchange.submit_market(plaintext, &position.symbol, side, add_quantity, false).await?;

        if let Some(tp) = &position.tp_order_id {
            let _ = exchange.cancel_order(plaintext, &position.symbol, tp).await;
        }
        if let Some(sl) = &position.sl_order_id {
            let _ = exchange.cancel_order(plaintext, &position.symbol, sl).await;
        }

        let total_qty = position.quantity + fill.filled_qty;
        let new_entry = ((position.entry_price * position.quantity) + (fill.fill_price * fill.filled_qty)) / total_qty;

        let mut updated = position.clone();
        updated.entry_price = new_entry;
        updated.quantity = total_qty;
        updated.dca_additions += 1;
        updated.last_addition_price = fill.fill_price;
        updated.last_addition_qty = fill.filled_qty;
        updated.tp_order_id = None;
        updated.sl_order_id = None;

        let rules = exchange.fetch_symbol_rules(&position.symbol).await?;
        let (tp_price, sl_price) = super::execution_engine::bracket_prices(position.side, new_entry, position.tp_percent, position.sl_percent, &rules);
        let tp_side = if position.side == PositionSide::Long { OrderSide::Sell } else { OrderSide::Buy };

        self.rate_limiter.acquire(&position.exchange_id, &position.credential_id, 1).await;
        let tp_result = exchange.submit_reduce_order(plaintext, &position.symbol, tp_side, total_qty, tp_price, crate::ports::ReduceOrderKind::TakeProfit).await;
        self.rate_limiter.acquire(&position.exchange_id, &position.credential_id, 1).await;
        let sl_result = exchange.submit_reduce_order(plaintext, &position.symbol, tp_side, total_qty, sl_price, crate::ports::ReduceOrderKind::StopLoss).await;

        match (tp_result, sl_result) {
            (Ok(tp), Ok(sl)) => {
                updated.tp_order_id = Some(tp.order_id);
                updated.sl_order_id = Some(sl.order_id);
            }
            (tp, sl) => {
                if let Ok(r) = tp {
                    let _ = exchange.cancel_order(plaintext, &position.symbol, &r.order_id).await;
                }
                if let Ok(r) = sl {
                    let _ = exchange.cancel_order(plaintext, &position.symbol, &r.order_id).await;
                }
                warn!(position_id = %position.id, "DCA bracket re-attachment failed, position left without protective orders until next tick");
            }
        }

        self.positions.upsert(&updated).await?;
        info!(position_id = %position.id, new_entry, total_qty, "DCA addition filled and brackets re-attached");
        Ok(())
    }

    /// Spec §4.7 "Trailing stop". The virtual stop lives only in server
    /// state; intermediate adjustments issue no exchange calls.
    async fn maybe_trail(
        &self,
        position: &Position,
        exchange: &dyn ExchangeAdapter,
        plaintext: &crate::domain::models::PlaintextCredential,
        mark_price: f64,
        trailing: crate::domain::models::TrailingStopConfig,
    ) -> anyhow::Result<()> {
        let profit_percent = position.unrealized_pnl_percent(mark_price);

        let mut armed = position.trailing_stop_armed;
        let mut high_water = position.trailing_stop_high_water;

        if !armed && profit_percent >= trailing.activation_percent {
            armed = true;
            high_water = Some(mark_price);
        }

        if !armed {
            return Ok(());
        }

        let new_high_water = match position.side {
            PositionSide::Long => high_water.map(|h| h.max(mark_price)).unwrap_or(mark_price),
            PositionSide::Short => high_water.map(|h| h.min(mark_price)).unwrap_or(mark_price),
        };

        let virtual_stop = match position.side {
            PositionSide::Long => new_high_water * (1.0 - trailing.trailing_distance_percent / 100.0),
            PositionSide::Short => new_high_water * (1.0 + trailing.trailing_distance_percent / 100.0),
        };

        let crossed = match position.side {
            PositionSide::Long => mark_price <= virtual_stop,
            PositionSide::Short => mark_price >= virtual_stop,
        };

        if !crossed {
            if new_high_water != position.trailing_stop_high_water.unwrap_or(new_high_water) || !position.trailing_stop_armed {
                let mut updated = position.clone();
                updated.trailing_stop_armed = armed;
                updated.trailing_stop_high_water = Some(new_high_water);
                self.positions.upsert(&updated).await?;
            }
            return Ok(());
        }

        if !self.close_position(position, exchange, plaintext).await? {
            return Ok(());
        }
        self.audit_log
            .record(AuditEvent::new(AuditCategory::PositionClosed, Some(position.subscriber_id.clone()), None, json!({ "symbol": position.symbol, "reason": "trailing_stop" })))
            .await
            .ok();
        for sink in &self.notifications {
            let _ = sink.send(&format!("trailing stop hit for {}", position.subscriber_id), &format!("{} closed at {mark_price}", position.symbol)).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_position(side: PositionSide, entry: f64) -> Position {
        Position {
            id: "p1".into(),
            subscriber_id: "s1".into(),
            exchange_id: "binance".into(),
            credential_id: "c1".into(),
            symbol: "BTCUSDT".into(),
            side,
            status: PositionStatus::Open,
            entry_price: entry,
            quantity: 1.0,
            tp_percent: 5.0,
            sl_percent: 2.0,
            tp_order_id: Some("tp1".into()),
            sl_order_id: Some("sl1".into()),
            dca_additions: 0,
            last_addition_price: entry,
            last_addition_qty: 1.0,
            trailing_stop_armed: false,
            trailing_stop_high_water: None,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    #[test]
    fn unrealized_pnl_matches_side() {
        let long = sample_position(PositionSide::Long, 100.0);
        assert!((long.unrealized_pnl_percent(110.0) - 10.0).abs() < 1e-9);
        let short = sample_position(PositionSide::Short, 100.0);
        assert!((short.unrealized_pnl_percent(90.0) - 10.0).abs() < 1e-9);
    }
}
