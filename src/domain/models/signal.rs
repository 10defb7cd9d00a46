use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::subscriber::PartialTradingParams;

/// An external directive mirrored onto subscribers. See spec §3 "Signal".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    pub strategy_id: Option<i64>,
    pub symbol: String,
    pub action: SignalAction,
    pub overrides: PartialTradingParams,
    pub received_at: DateTime<Utc>,
    pub status: SignalStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    Long,
    Short,
    Close,
}

impl SignalAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "long" => Some(SignalAction::Long),
            "short" => Some(SignalAction::Short),
            "close" => Some(SignalAction::Close),
            _ => None,
        }
    }
}

/// Forward-only status. Never transitions backward. See spec §3 invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Received,
    Dispatched,
    Terminal,
}

/// Uppercased, separator-stripped symbol form used internally (spec §4.1,
/// §4.5). `BTC-USDT`, `btc/usdt`, and `BTCUSDT` all canonicalize to the same
/// string, so the idempotency fence and per-venue translation agree.
pub fn canonicalize_symbol(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// The fields that participate in the content hash, in a fixed order. Two
/// webhook deliveries with byte-identical significant fields produce the
/// same `signal_id` regardless of incidental JSON key ordering.
pub struct SignalContent<'a> {
    pub symbol: &'a str,
    pub action: &'a str,
    pub risk_perc: Option<f64>,
    pub leverage: Option<i64>,
    pub tp_perc: Option<f64>,
    pub sl_perc: Option<f64>,
    pub strategy_id: Option<i64>,
}

/// `signal_id = hash(canonical_json(body))`. Deterministic across retries so
/// re-delivery of the same webhook body always resolves to the same row.
pub fn compute_signal_id(content: &SignalContent) -> String {
    let canonical = format!(
        "symbol={}&action={}&risk={}&leverage={}&tp={}&sl={}&strategy={}",
        content.symbol,
        content.action,
        content.risk_perc.map(|v| v.to_string()).unwrap_or_default(),
        content.leverage.map(|v| v.to_string()).unwrap_or_default(),
        content.tp_perc.map(|v| v.to_string()).unwrap_or_default(),
        content.sl_perc.map(|v| v.to_string()).unwrap_or_default(),
        content.strategy_id.map(|v| v.to_string()).unwrap_or_default(),
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_strips_separators_and_uppercases() {
        assert_eq!(canonicalize_symbol("btc-usdt"), "BTCUSDT");
        assert_eq!(canonicalize_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(canonicalize_symbol("BTCUSDT"), "BTCUSDT");
    }

    #[test]
    fn identical_content_yields_identical_signal_id() {
        let a = SignalContent {
            symbol: "BTCUSDT",
            action: "long",
            risk_perc: Some(3.0),
            leverage: Some(20),
            tp_perc: Some(5.0),
            sl_perc: Some(2.0),
            strategy_id: None,
        };
        let b = SignalContent { ..a };
        assert_eq!(compute_signal_id(&a), compute_signal_id(&b));
    }

    #[test]
    fn differing_content_yields_differing_signal_id() {
        let a = SignalContent {
            symbol: "BTCUSDT",
            action: "long",
            risk_perc: Some(3.0),
            leverage: Some(20),
            tp_perc: Some(5.0),
            sl_perc: Some(2.0),
            strategy_id: None,
        };
        let b = SignalContent { risk_perc: Some(4.0), ..a };
        assert_ne!(compute_signal_id(&a), compute_signal_id(&b));
    }
}
