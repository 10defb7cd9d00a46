use chrono::{DateTime, Utc};

use crate::domain::models::{
    Credential, PartialTradingParams, Position, Signal, SignalAction, Subscriber, TradingParams,
};

/// A subscriber resolved as eligible to receive a signal, carrying the
/// fully-overlaid parameters it should be executed with. See spec §4.3.
#[derive(Debug, Clone)]
pub struct EligibleSubscriber {
    pub subscriber: Subscriber,
    pub credential: Credential,
    pub effective_params: TradingParams,
}

/// Overlays global defaults, subscriber defaults, the strategy-subscription
/// override (if any), and the signal's own override, in that order — later
/// entries win on a per-field basis, missing fields fall through. Spec §4.3:
/// "global defaults ← subscriber defaults ← strategy-subscription overrides
/// ← signal's explicit overrides." The subscriber's own `TradingParams` are
/// spliced into the chain via `as_partial` so a genuine global default only
/// surfaces where neither the subscriber nor anything above it cares.
pub fn effective_params(
    global_defaults: &PartialTradingParams,
    subscriber: &Subscriber,
    strategy_override: Option<&PartialTradingParams>,
    signal_override: &PartialTradingParams,
) -> TradingParams {
    let mut chain = global_defaults.merge(&subscriber.params.as_partial());
    if let Some(strategy) = strategy_override {
        chain = chain.merge(strategy);
    }
    chain = chain.merge(signal_override);
    subscriber.params.overlay(&chain)
}

/// Evaluates the subset of §4.3 eligibility that depends only on subscriber
/// state and the signal, independent of credential/position lookups (which
/// require repository access and are checked by the caller before or after
/// this, per spec §4.3's full eligibility conjunction).
pub fn subscriber_admissible(subscriber: &Subscriber, signal: &Signal, now: DateTime<Utc>) -> bool {
    subscriber.active
        && !subscriber.subscription_expired(now)
        && !subscriber.is_guardrail_paused(now)
        && subscriber.subscribed_to(signal.strategy_id)
}

/// For `action=close`, eligibility additionally requires an existing open
/// position on the signal's `(exchange, symbol)` for this subscriber.
pub fn close_requires_open_position(action: SignalAction, existing_position: Option<&Position>) -> bool {
    match action {
        SignalAction::Close => existing_position.is_some_and(|p| p.is_open()),
        SignalAction::Long | SignalAction::Short => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{DcaConfig, SubscriberRole, TrailingStopConfig};

    fn base_subscriber() -> Subscriber {
        Subscriber {
            id: "sub-1".into(),
            role: SubscriberRole::ReceivesSignals,
            active: true,
            subscription_expires_at: Utc::now() + chrono::Duration::days(30),
            params: TradingParams {
                risk_fraction: 0.02,
                leverage: 10,
                tp_percent: 5.0,
                sl_percent: 2.0,
                max_concurrent_positions: 3,
                dca: None::<DcaConfig>,
                trailing_stop: None::<TrailingStopConfig>,
                daily_loss_cutoff_percent: Some(10.0),
            },
            guardrail_paused_until: None,
            strategy_subscriptions: vec![],
        }
    }

    #[test]
    fn signal_override_wins_over_subscriber_default() {
        let subscriber = base_subscriber();
        let signal_override = PartialTradingParams { risk_fraction: Some(0.05), leverage: None, tp_percent: None, sl_percent: None };
        let effective = effective_params(&PartialTradingParams::default(), &subscriber, None, &signal_override);
        assert_eq!(effective.risk_fraction, 0.05);
        assert_eq!(effective.leverage, 10);
    }

    #[test]
    fn global_default_only_applies_where_nothing_else_sets_the_field() {
        let subscriber = base_subscriber();
        let global_defaults = PartialTradingParams { risk_fraction: Some(0.09), leverage: Some(20), tp_percent: None, sl_percent: None };
        let effective = effective_params(&global_defaults, &subscriber, None, &PartialTradingParams::default());
        // subscriber's own risk_fraction/leverage win over the global default.
        assert_eq!(effective.risk_fraction, subscriber.params.risk_fraction);
        assert_eq!(effective.leverage, subscriber.params.leverage);
    }

    #[test]
    fn strategy_override_wins_over_subscriber_but_loses_to_signal() {
        let subscriber = base_subscriber();
        let strategy_override = PartialTradingParams { risk_fraction: Some(0.03), leverage: Some(15), tp_percent: None, sl_percent: None };
        let signal_override = PartialTradingParams { risk_fraction: Some(0.05), leverage: None, tp_percent: None, sl_percent: None };
        let effective =
            effective_params(&PartialTradingParams::default(), &subscriber, Some(&strategy_override), &signal_override);
        assert_eq!(effective.risk_fraction, 0.05); // signal beats strategy
        assert_eq!(effective.leverage, 15); // strategy beats subscriber default
    }

    #[test]
    fn guardrail_paused_subscriber_is_inadmissible() {
        let mut subscriber = base_subscriber();
        subscriber.guardrail_paused_until = Some(Utc::now() + chrono::Duration::hours(1));
        let signal = Signal {
            signal_id: "s1".into(),
            strategy_id: None,
            symbol: "BTCUSDT".into(),
            action: SignalAction::Long,
            overrides: PartialTradingParams::default(),
            received_at: Utc::now(),
            status: crate::domain::models::SignalStatus::Received,
        };
        assert!(!subscriber_admissible(&subscriber, &signal, Utc::now()));
    }
}
