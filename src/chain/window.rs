//! ATM window math
//!
//! Pure helpers for at-the-money strike selection, window membership and
//! rebalance hysteresis. State transitions live on [`ChainState`](super::ChainState).

use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::BTreeSet;

use super::SubscriptionDiff;

/// Nearest multiple of `strike_step` to `spot`, ties rounding up
pub fn compute_atm(spot: Decimal, strike_step: Decimal) -> Decimal {
    let steps = (spot / strike_step)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    steps * strike_step
}

/// All known strikes within `half_width * strike_step` of `atm`, inclusive
pub fn window(
    atm: Decimal,
    strikes: &[Decimal],
    half_width: u32,
    strike_step: Decimal,
) -> Vec<Decimal> {
    let radius = strike_step * Decimal::from(half_width);
    strikes
        .iter()
        .copied()
        .filter(|strike| (*strike - atm).abs() <= radius)
        .collect()
}

/// Whether an ATM shift is large enough to justify resubscribing
///
/// The hysteresis band prevents subscribe/unsubscribe churn when spot
/// oscillates near a window boundary.
pub fn should_rebalance(
    old_atm: Decimal,
    new_atm: Decimal,
    strike_step: Decimal,
    hysteresis: u32,
) -> bool {
    (new_atm - old_atm).abs() >= strike_step * Decimal::from(hysteresis)
}

/// Diff two active-key sets into subscription intents
///
/// Unsubscribes (old − new) come before subscribes (new − old) so the
/// total concurrent subscription count never exceeds the larger set.
pub fn diff_keys(old: &BTreeSet<String>, new: &BTreeSet<String>) -> SubscriptionDiff {
    SubscriptionDiff {
        to_unsubscribe: old.difference(new).cloned().collect(),
        to_subscribe: new.difference(old).cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_compute_atm_nearest_multiple() {
        assert_eq!(compute_atm(dec!(23510), dec!(50)), dec!(23500));
        assert_eq!(compute_atm(dec!(23540), dec!(50)), dec!(23550));
        assert_eq!(compute_atm(dec!(23500), dec!(50)), dec!(23500));
        assert_eq!(compute_atm(dec!(48123), dec!(100)), dec!(48100));
    }

    #[test]
    fn test_compute_atm_tie_rounds_up() {
        // Exactly between 23500 and 23550
        assert_eq!(compute_atm(dec!(23525), dec!(50)), dec!(23550));
        assert_eq!(compute_atm(dec!(48150), dec!(100)), dec!(48200));
    }

    #[test]
    fn test_window_inclusive_bounds() {
        let strikes: Vec<Decimal> = (460..=480).map(|i| Decimal::from(i * 50)).collect();
        let win = window(dec!(23500), &strikes, 2, dec!(50));
        assert_eq!(
            win,
            vec![dec!(23400), dec!(23450), dec!(23500), dec!(23550), dec!(23600)]
        );
    }

    #[test]
    fn test_window_handles_sparse_strikes() {
        let strikes = vec![dec!(23300), dec!(23500), dec!(23700)];
        let win = window(dec!(23500), &strikes, 3, dec!(50));
        assert_eq!(win, vec![dec!(23500)]);
    }

    #[test]
    fn test_should_rebalance_boundary() {
        let step = dec!(50);
        // Strictly below 2 * step: no rebalance
        assert!(!should_rebalance(dec!(23500), dec!(23540), step, 2));
        assert!(!should_rebalance(dec!(23500), dec!(23450), step, 2));
        assert!(!should_rebalance(dec!(23500), dec!(23599), step, 2));
        // At exactly 2 * step and beyond: rebalance
        assert!(should_rebalance(dec!(23500), dec!(23600), step, 2));
        assert!(should_rebalance(dec!(23500), dec!(23400), step, 2));
        assert!(should_rebalance(dec!(23500), dec!(23650), step, 2));
    }

    #[test]
    fn test_diff_keys_orders_unsubscribe_and_subscribe() {
        let old: BTreeSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let new: BTreeSet<String> = ["b", "c", "d"].iter().map(|s| s.to_string()).collect();

        let diff = diff_keys(&old, &new);
        assert_eq!(diff.to_unsubscribe, vec!["a".to_string()]);
        assert_eq!(diff.to_subscribe, vec!["d".to_string()]);
    }

    #[test]
    fn test_diff_keys_identical_sets_empty() {
        let keys: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        assert!(diff_keys(&keys, &keys).is_empty());
    }
}
