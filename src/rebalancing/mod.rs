//! Rebalancing State Machine.
//!
//! A call moves `Idle -> Evaluating`, then either ends in a no-action
//! outcome (`NoRecommendation`, `StaleRecommendation`, `NoRebalanceNeeded`,
//! `InsufficientConfidence`, `NoSigner`) or goes on to `Executing`, which
//! ends `Executed` or fails with a [`RebalanceError`]. No-action outcomes
//! are successes carrying a reason, not errors.
//!
//! The only state kept between calls is the per-vault in-progress set.

mod guard;
mod rebalancer;

pub use rebalancer::{
    RebalanceConfig, RebalanceError, RebalanceOutcome, RebalanceReason, Rebalancer,
    needs_rebalance,
};
