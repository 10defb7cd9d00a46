use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Periodic snapshot of a subscriber's account balance on one exchange,
/// used to derive position sizing and the daily-loss-cutoff guardrail
/// (spec §4.4 step 3, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub subscriber_id: String,
    pub exchange_id: String,
    pub taken_at: DateTime<Utc>,
    pub equity: f64,
    pub day_start_equity: f64,
}

impl BalanceSnapshot {
    /// Realized + unrealized drawdown since the start of the current UTC day,
    /// as a positive percentage when equity is down.
    pub fn day_drawdown_percent(&self) -> f64 {
        if self.day_start_equity <= 0.0 {
            return 0.0;
        }
        ((self.day_start_equity - self.equity) / self.day_start_equity) * 100.0
    }
}
