use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A platform user who receives mirrored signals on their own exchange
/// account(s). See spec §3 "Subscriber".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    pub role: SubscriberRole,
    pub active: bool,
    pub subscription_expires_at: DateTime<Utc>,
    pub params: TradingParams,
    pub guardrail_paused_until: Option<DateTime<Utc>>,
    pub strategy_subscriptions: Vec<StrategySubscription>,
}

/// One strategy a subscriber is subscribed to, carrying the per-strategy
/// override layer of spec §4.3's overlay chain. An empty `overrides`
/// behaves exactly as the old plain-id subscription did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySubscription {
    pub strategy_id: i64,
    #[serde(default)]
    pub overrides: PartialTradingParams,
}

impl Subscriber {
    pub fn is_guardrail_paused(&self, now: DateTime<Utc>) -> bool {
        matches!(self.guardrail_paused_until, Some(until) if until > now)
    }

    pub fn subscription_expired(&self, now: DateTime<Utc>) -> bool {
        self.subscription_expires_at <= now
    }

    /// §4.3: subscribed to `strategy_id` if either the signal carries no
    /// strategy restriction or the subscriber's subscription list contains it.
    pub fn subscribed_to(&self, strategy_id: Option<i64>) -> bool {
        match strategy_id {
            None => true,
            Some(id) => self.strategy_subscriptions.is_empty() || self.strategy_subscriptions.iter().any(|s| s.strategy_id == id),
        }
    }

    /// The strategy-subscription override layer for `strategy_id`, if the
    /// signal names one and this subscriber has a matching subscription
    /// record. See spec §4.3's overlay chain.
    pub fn strategy_override(&self, strategy_id: Option<i64>) -> Option<&PartialTradingParams> {
        let id = strategy_id?;
        self.strategy_subscriptions.iter().find(|s| s.strategy_id == id).map(|s| &s.overrides)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberRole {
    ReceivesSignals,
    ReceivesAndEmitsSignals,
}

/// Subscriber-declared risk parameters, overlaid by the Subscriber Resolver
/// with global defaults and signal overrides (§4.3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TradingParams {
    pub risk_fraction: f64,
    pub leverage: u32,
    pub tp_percent: f64,
    pub sl_percent: f64,
    pub max_concurrent_positions: u32,
    pub dca: Option<DcaConfig>,
    pub trailing_stop: Option<TrailingStopConfig>,
    pub daily_loss_cutoff_percent: Option<f64>,
}

impl TradingParams {
    /// This subscriber's own values, expressed as a fully-populated
    /// override layer. Used to splice subscriber defaults into the
    /// `PartialTradingParams` overlay chain between global defaults (below)
    /// and strategy/signal overrides (above). See spec §4.3.
    pub fn as_partial(&self) -> PartialTradingParams {
        PartialTradingParams {
            risk_fraction: Some(self.risk_fraction),
            leverage: Some(self.leverage),
            tp_percent: Some(self.tp_percent),
            sl_percent: Some(self.sl_percent),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.risk_fraction > 0.0 && self.risk_fraction <= 1.0) {
            return Err("risk_fraction must be in (0, 1]".into());
        }
        if self.leverage < 1 {
            return Err("leverage must be >= 1".into());
        }
        Ok(())
    }

    /// Overlay `override_params` (signal/strategy-level) on top of `self`
    /// (subscriber defaults). Present fields in the override win; missing
    /// fields are inherited from `self`. See spec §4.3.
    pub fn overlay(&self, over: &PartialTradingParams) -> TradingParams {
        TradingParams {
            risk_fraction: over.risk_fraction.unwrap_or(self.risk_fraction),
            leverage: over.leverage.unwrap_or(self.leverage),
            tp_percent: over.tp_percent.unwrap_or(self.tp_percent),
            sl_percent: over.sl_percent.unwrap_or(self.sl_percent),
            max_concurrent_positions: self.max_concurrent_positions,
            dca: self.dca,
            trailing_stop: self.trailing_stop,
            daily_loss_cutoff_percent: self.daily_loss_cutoff_percent,
        }
    }
}

/// Sparse overrides, as carried by a signal's optional fields or a
/// strategy-subscription record.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PartialTradingParams {
    pub risk_fraction: Option<f64>,
    pub leverage: Option<u32>,
    pub tp_percent: Option<f64>,
    pub sl_percent: Option<f64>,
}

impl PartialTradingParams {
    /// Overlay `other` on top of `self`, `other` winning on conflicts.
    /// Used to chain global defaults -> subscriber -> strategy -> signal.
    pub fn merge(&self, other: &PartialTradingParams) -> PartialTradingParams {
        PartialTradingParams {
            risk_fraction: other.risk_fraction.or(self.risk_fraction),
            leverage: other.leverage.or(self.leverage),
            tp_percent: other.tp_percent.or(self.tp_percent),
            sl_percent: other.sl_percent.or(self.sl_percent),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DcaConfig {
    pub threshold_percent: f64,
    pub multiplier: f64,
    pub max_additions: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrailingStopConfig {
    pub activation_percent: f64,
    pub trailing_distance_percent: f64,
}
