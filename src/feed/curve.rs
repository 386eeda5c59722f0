//! Pricing-curve arithmetic. Pure functions only.

use crate::model::{AssetState, QUOTE_UNIT};

/// Push updates report the quote reserve either in whole units or in raw
/// base units; anything above this is taken to be raw.
const RAW_RESERVE_CUTOFF: f64 = 1000.0;

/// Quote reserve levels between which progress runs from 0 to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurveParams {
    pub initial_reserve: f64,
    pub target_reserve: f64,
}

impl Default for CurveParams {
    fn default() -> Self {
        Self {
            initial_reserve: 30.0,
            target_reserve: 85.0,
        }
    }
}

impl CurveParams {
    /// `(reserve - initial) / (target - initial)`, clamped to `[0, 1]`.
    pub fn progress(&self, virtual_quote: f64) -> f64 {
        let fraction = (virtual_quote - self.initial_reserve)
            / (self.target_reserve - self.initial_reserve);
        if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

pub fn normalize_reserve(reported: f64) -> f64 {
    if reported > RAW_RESERVE_CUTOFF {
        reported / QUOTE_UNIT
    } else {
        reported
    }
}

/// Spot price times supply, in USD. Zero once the curve is complete or
/// whenever the inputs do not give a finite answer.
pub fn valuation(state: &AssetState, quote_usd: f64) -> f64 {
    if state.complete || state.virtual_base == 0.0 || state.virtual_quote == 0.0 {
        return 0.0;
    }
    let value = state.virtual_quote / state.virtual_base * state.total_supply * quote_usd;
    if value.is_finite() { value } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(virtual_base: f64, virtual_quote: f64, complete: bool) -> AssetState {
        AssetState {
            virtual_base,
            virtual_quote,
            real_base: 0.0,
            real_quote: 0.0,
            total_supply: 1_000_000_000.0,
            complete,
        }
    }

    #[test]
    fn progress_is_linear_and_clamped() {
        let p = CurveParams::default();
        assert_eq!(p.progress(30.0), 0.0);
        assert_eq!(p.progress(85.0), 1.0);
        assert!((p.progress(57.5) - 0.5).abs() < 1e-12);
        assert_eq!(p.progress(10.0), 0.0);
        assert_eq!(p.progress(200.0), 1.0);
    }

    #[test]
    fn degenerate_params_give_zero() {
        let p = CurveParams {
            initial_reserve: 5.0,
            target_reserve: 5.0,
        };
        assert_eq!(p.progress(5.0), 0.0);
    }

    #[test]
    fn raw_reserves_are_scaled() {
        assert_eq!(normalize_reserve(42.0), 42.0);
        assert_eq!(normalize_reserve(42_000_000_000.0), 42.0);
    }

    #[test]
    fn valuation_uses_spot_price_times_supply() {
        let s = state(1_000_000_000.0, 50.0, false);
        // 50 / 1e9 * 1e9 * 2 = 100
        assert!((valuation(&s, 2.0) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn valuation_is_zero_when_complete_or_empty() {
        assert_eq!(valuation(&state(1.0, 1.0, true), 100.0), 0.0);
        assert_eq!(valuation(&state(0.0, 1.0, false), 100.0), 0.0);
        assert_eq!(valuation(&state(1.0, 0.0, false), 100.0), 0.0);
    }
}
