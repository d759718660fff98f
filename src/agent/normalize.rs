//! Basis-point normalization of recommended allocations.

use alloy::primitives::Address;
use std::collections::BTreeMap;

pub const TOTAL_BP: u64 = 10_000;

/// Scales `allocations` so they sum to 10,000 bp, rounding each value to the
/// nearest basis point.
///
/// An all-zero map, or one already summing to 10,000, is returned as is.
/// Rounding is per value, so the result can miss 10,000 by at most half a
/// basis point per strategy.
pub fn normalize(allocations: BTreeMap<Address, u64>) -> BTreeMap<Address, u64> {
    let sum: u128 = allocations.values().map(|&bp| u128::from(bp)).sum();

    if sum == 0 || sum == u128::from(TOTAL_BP) {
        return allocations;
    }

    allocations
        .into_iter()
        .map(|(strategy, bp)| {
            let scaled = (u128::from(bp) * u128::from(TOTAL_BP) * 2 + sum) / (2 * sum);
            (strategy, u64::try_from(scaled).unwrap_or(TOTAL_BP))
        })
        .collect()
}
