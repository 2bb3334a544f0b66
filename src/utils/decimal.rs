//! Decimal arithmetic utilities for sizing calculations.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Relative change from `from` to `to` (0.05 = +5%). Zero base yields zero.
pub fn percent_change(from: Decimal, to: Decimal) -> Decimal {
    safe_div(to - from, from)
}

/// Whole shares purchasable with `amount` at a combined `unit_cost`.
///
/// Returns `None` when the cost is not positive, leaving the caller to decide
/// what a missing price means. Negative results clamp to zero.
pub fn whole_shares(amount: Decimal, unit_cost: Decimal) -> Option<u64> {
    if unit_cost <= Decimal::ZERO {
        return None;
    }
    let shares = (amount / unit_cost).floor();
    if shares <= Decimal::ZERO {
        return Some(0);
    }
    Some(shares.to_u64().unwrap_or(u64::MAX))
}

/// Signed difference `to - from` between two share counts.
pub fn signed_delta(from: u64, to: u64) -> i64 {
    to as i64 - from as i64
}
