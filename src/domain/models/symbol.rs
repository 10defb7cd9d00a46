use serde::{Deserialize, Serialize};

use super::PositionSide;

/// Per-venue trading rules for one symbol, fetched and cached at startup and
/// refreshed periodically (spec §4.4 step 3, §4.5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolRules {
    pub min_notional: f64,
    pub min_quantity: f64,
    pub quantity_step: f64,
    pub price_tick: f64,
    pub max_leverage: u32,
}

impl SymbolRules {
    /// Rounds a raw quantity down to the nearest tradable step, never
    /// rounding up past the caller's intended size. See spec §4.4 step 3,
    /// §8 "Sizing correctness".
    pub fn round_quantity(&self, raw: f64) -> f64 {
        if self.quantity_step <= 0.0 {
            return raw;
        }
        (raw / self.quantity_step).floor() * self.quantity_step
    }

    fn round_price_floor(&self, raw: f64) -> f64 {
        if self.price_tick <= 0.0 {
            return raw;
        }
        (raw / self.price_tick).floor() * self.price_tick
    }

    fn round_price_ceil(&self, raw: f64) -> f64 {
        if self.price_tick <= 0.0 {
            return raw;
        }
        (raw / self.price_tick).ceil() * self.price_tick
    }

    /// Rounds a bracket (TP or SL) price to the tick that is worse for the
    /// trader, per spec §4.4 "Edge policies". For a long position both TP
    /// (above entry) and SL (below entry) move worse by rounding toward
    /// entry, i.e. down; for a short position both move worse by rounding
    /// away from zero, i.e. up. Never rounds to the side that would pay the
    /// trader more or protect them further than the configured percentage.
    pub fn round_bracket_price(&self, side: PositionSide, raw: f64) -> f64 {
        match side {
            PositionSide::Long => self.round_price_floor(raw),
            PositionSide::Short => self.round_price_ceil(raw),
        }
    }

    pub fn meets_min_notional(&self, quantity: f64, price: f64) -> bool {
        quantity >= self.min_quantity && quantity * price >= self.min_notional
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_quantity_floors_to_step() {
        let rules = SymbolRules { min_notional: 5.0, min_quantity: 0.001, quantity_step: 0.001, price_tick: 0.01, max_leverage: 50 };
        assert_eq!(rules.round_quantity(0.12349), 0.123);
    }

    #[test]
    fn meets_min_notional_rejects_dust() {
        let rules = SymbolRules { min_notional: 5.0, min_quantity: 0.001, quantity_step: 0.001, price_tick: 0.01, max_leverage: 50 };
        assert!(!rules.meets_min_notional(0.0001, 60000.0));
        assert!(rules.meets_min_notional(0.001, 60000.0));
    }

    #[test]
    fn long_bracket_price_rounds_down_toward_entry() {
        let rules = SymbolRules { min_notional: 5.0, min_quantity: 0.001, quantity_step: 0.001, price_tick: 0.1, max_leverage: 50 };
        // 100.37 should never round up to 100.4, which would be more
        // favorable to a long position's TP and less punishing for its SL.
        assert_eq!(rules.round_bracket_price(PositionSide::Long, 100.37), 100.3);
    }

    #[test]
    fn short_bracket_price_rounds_up_away_from_entry() {
        let rules = SymbolRules { min_notional: 5.0, min_quantity: 0.001, quantity_step: 0.001, price_tick: 0.1, max_leverage: 50 };
        assert_eq!(rules.round_bracket_price(PositionSide::Short, 100.31), 100.4);
    }

    #[test]
    fn bracket_price_is_a_no_op_without_a_tick_size() {
        let rules = SymbolRules { min_notional: 5.0, min_quantity: 0.001, quantity_step: 0.001, price_tick: 0.0, max_leverage: 50 };
        assert_eq!(rules.round_bracket_price(PositionSide::Long, 100.37), 100.37);
    }
}
