use crate::domain::models::SymbolRules;

/// Raw target quantity before exchange rounding: `q = balance * risk_fraction
/// * leverage / entry_price`. See spec §4.4 step 3.
pub fn raw_quantity(balance: f64, risk_fraction: f64, leverage: u32, entry_price: f64) -> f64 {
    (balance * risk_fraction * leverage as f64) / entry_price
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizingOutcome {
    Quantity(f64),
    BelowMinNotional,
}

/// Rounds the raw quantity down to the exchange's step and rejects it if the
/// resulting notional falls below the exchange's minimum. The caller marks
/// the attempt SKIPPED(below_notional) on `BelowMinNotional` (spec §4.4 step 3).
///
/// Invariant (spec §8 "Sizing correctness"): the returned quantity, if any, is
/// an integer multiple of `quantity_step` and its notional never exceeds
/// `balance * risk_fraction * leverage`.
pub fn size_position(balance: f64, risk_fraction: f64, leverage: u32, entry_price: f64, rules: &SymbolRules) -> SizingOutcome {
    let raw = raw_quantity(balance, risk_fraction, leverage, entry_price);
    let rounded = rules.round_quantity(raw);
    if rounded <= 0.0 || !rules.meets_min_notional(rounded, entry_price) {
        return SizingOutcome::BelowMinNotional;
    }
    SizingOutcome::Quantity(rounded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> SymbolRules {
        SymbolRules { min_notional: 5.0, min_quantity: 0.001, quantity_step: 0.001, price_tick: 0.01, max_leverage: 50 }
    }

    #[test]
    fn rounds_down_and_respects_budget() {
        let outcome = size_position(1000.0, 0.02, 10, 60000.0, &rules());
        match outcome {
            SizingOutcome::Quantity(q) => {
                assert!((q / 0.001).round() * 0.001 - q < 1e-9);
                assert!(q * 60000.0 <= 1000.0 * 0.02 * 10.0 + 1e-9);
            }
            SizingOutcome::BelowMinNotional => panic!("expected a sizeable quantity"),
        }
    }

    #[test]
    fn tiny_balance_is_below_min_notional() {
        let outcome = size_position(1.0, 0.02, 1, 60000.0, &rules());
        assert_eq!(outcome, SizingOutcome::BelowMinNotional);
    }

    #[test]
    fn zero_balance_is_below_min_notional() {
        let outcome = size_position(0.0, 0.02, 10, 60000.0, &rules());
        assert_eq!(outcome, SizingOutcome::BelowMinNotional);
    }
}
