//! Per-strategy risk sub-scores, each in `[0, 1]`.

use alloy::primitives::U256;
use serde::Serialize;

use crate::onchain::vault::PositionState;

/// Health factors are 1e18-scaled.
const HEALTH_FACTOR_1_1: U256 = U256::from_limbs([1_100_000_000_000_000_000, 0, 0, 0]);
const HEALTH_FACTOR_1_3: U256 = U256::from_limbs([1_300_000_000_000_000_000, 0, 0, 0]);
const HEALTH_FACTOR_1_5: U256 = U256::from_limbs([1_500_000_000_000_000_000, 0, 0, 0]);

const LIQUIDATION_WEIGHT: f64 = 0.3;
const PROTOCOL_WEIGHT: f64 = 0.2;
const SMART_CONTRACT_WEIGHT: f64 = 0.25;
const IMPERMANENT_LOSS_WEIGHT: f64 = 0.1;
const LEVERAGE_WEIGHT: f64 = 0.15;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RiskBreakdown {
    pub liquidation: f64,
    pub protocol: f64,
    pub smart_contract: f64,
    pub impermanent_loss: f64,
    pub leverage: f64,
    /// Weighted sum of the five sub-scores.
    pub overall: f64,
}

pub fn assess(positions: &[PositionState]) -> RiskBreakdown {
    let liquidation = liquidation_risk(positions);
    let protocol = protocol_risk(positions);
    let smart_contract = max_lookup(positions, smart_contract_risk);
    let impermanent_loss = max_lookup(positions, impermanent_loss_risk);
    let leverage = leverage_risk(positions);

    RiskBreakdown {
        liquidation,
        protocol,
        smart_contract,
        impermanent_loss,
        leverage,
        overall: liquidation * LIQUIDATION_WEIGHT
            + protocol * PROTOCOL_WEIGHT
            + smart_contract * SMART_CONTRACT_WEIGHT
            + impermanent_loss * IMPERMANENT_LOSS_WEIGHT
            + leverage * LEVERAGE_WEIGHT,
    }
}

/// A zero health factor means the position carries no debt.
fn has_debt(position: &PositionState) -> bool {
    !position.health_factor.is_zero()
}

fn liquidation_risk(positions: &[PositionState]) -> f64 {
    let total: f64 = positions
        .iter()
        .filter(|position| has_debt(position))
        .map(|position| match position.health_factor {
            hf if hf < HEALTH_FACTOR_1_1 => 0.8,
            hf if hf < HEALTH_FACTOR_1_3 => 0.4,
            hf if hf < HEALTH_FACTOR_1_5 => 0.1,
            _ => 0.0,
        })
        .sum();

    total.clamp(0.0, 1.0)
}

#[allow(clippy::cast_precision_loss)]
fn protocol_risk(positions: &[PositionState]) -> f64 {
    let total: f64 = positions
        .iter()
        .filter(|position| has_debt(position))
        .map(|position| {
            position
                .borrow_rate_bp
                .saturating_sub(position.supply_rate_bp) as f64
                / 1_000.0
        })
        .sum();

    total.clamp(0.0, 1.0)
}

#[allow(clippy::cast_precision_loss)]
fn leverage_risk(positions: &[PositionState]) -> f64 {
    let total: f64 = positions
        .iter()
        .filter(|position| has_debt(position))
        .map(|position| {
            position.borrow_rate_bp as f64 / position.supply_rate_bp.max(1) as f64 * 0.5
        })
        .sum();

    total.clamp(0.0, 1.0)
}

fn max_lookup(positions: &[PositionState], lookup: fn(&str) -> f64) -> f64 {
    positions
        .iter()
        .map(|position| lookup(&position.protocol.to_lowercase()))
        .fold(0.0, f64::max)
}

fn smart_contract_risk(protocol: &str) -> f64 {
    if protocol.contains("aave") {
        0.1
    } else if protocol.contains("silo") || protocol.contains("euler") {
        0.3
    } else if protocol.contains("rings") {
        0.4
    } else if protocol.contains("pendle") {
        0.35
    } else {
        0.5
    }
}

fn impermanent_loss_risk(protocol: &str) -> f64 {
    const AMM_PROTOCOLS: [&str; 4] = ["shadow", "beets", "curve", "swapx"];
    const LENDING_PROTOCOLS: [&str; 4] = ["aave", "silo", "euler", "lending"];

    if protocol.contains("pendle") {
        0.3
    } else if AMM_PROTOCOLS.iter().any(|amm| protocol.contains(amm)) {
        0.5
    } else if LENDING_PROTOCOLS.iter().any(|lending| protocol.contains(lending)) {
        0.0
    } else if protocol.contains("rings") {
        0.1
    } else {
        0.2
    }
}
