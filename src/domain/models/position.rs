use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The natural key a venue enforces one open position per. Used both as the
/// partial-unique-index shape in storage (spec §6) and as the key into the
/// in-process per-position mutex registry (spec §4.6).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub subscriber_id: String,
    pub exchange_id: String,
    pub symbol: String,
}

impl std::fmt::Display for PositionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.subscriber_id, self.exchange_id, self.symbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

/// Spec §4.7: positions move `Open -> Closing -> Closed`. `Closing` marks a
/// server-initiated close (guardrail trip, trailing stop) whose exchange
/// order has been submitted but not yet confirmed settled; the position
/// still occupies its symbol/side slot until the supervisor reconciles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

/// A subscriber's open (or most-recently-closed) position on one venue/symbol.
/// See spec §3 "Position", §4.7.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub subscriber_id: String,
    pub exchange_id: String,
    pub credential_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub status: PositionStatus,
    pub entry_price: f64,
    pub quantity: f64,
    /// The subscriber's effective TP/SL percentages at open time, kept on
    /// the position so a DCA addition can recompute bracket prices off the
    /// new blended entry without re-reading subscriber params that may have
    /// since changed.
    pub tp_percent: f64,
    pub sl_percent: f64,
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub dca_additions: u32,
    pub last_addition_price: f64,
    pub last_addition_qty: f64,
    pub trailing_stop_armed: bool,
    pub trailing_stop_high_water: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn key(&self) -> PositionKey {
        PositionKey {
            subscriber_id: self.subscriber_id.clone(),
            exchange_id: self.exchange_id.clone(),
            symbol: self.symbol.clone(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Unrealized PnL as a fraction of notional, positive favorable.
    /// See spec §4.7 for trailing-stop and daily-loss-cutoff consumers.
    pub fn unrealized_pnl_percent(&self, mark_price: f64) -> f64 {
        let change = (mark_price - self.entry_price) / self.entry_price;
        match self.side {
            PositionSide::Long => change * 100.0,
            PositionSide::Short => -change * 100.0,
        }
    }
}
