//! Strategy-type classification from the protocols a strategy touches.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    /// Borrows against a lending position to re-stake (lending + rings).
    LoopedLending,
    /// Fixed-rate yield tokens (pendle).
    FixedYield,
    Lending,
    Staking,
    /// No rule matched. Kept as a variant so that one unclassified strategy
    /// does not abort analysis of the whole vault.
    Unknown,
}

impl StrategyType {
    const fn base_complexity(self) -> f64 {
        match self {
            Self::LoopedLending => 0.6,
            Self::FixedYield => 0.5,
            Self::Lending => 0.2,
            Self::Staking => 0.3,
            Self::Unknown => 0.8,
        }
    }
}

/// First matching rule wins. Protocol names are compared lowercased by
/// substring.
pub fn classify<S: AsRef<str>>(protocols: &[S]) -> StrategyType {
    let touches = |needle: &str| {
        protocols
            .iter()
            .any(|protocol| protocol.as_ref().to_lowercase().contains(needle))
    };

    let lending = touches("lending");
    let rings = touches("rings");

    if lending && rings {
        StrategyType::LoopedLending
    } else if touches("pendle") {
        StrategyType::FixedYield
    } else if lending {
        StrategyType::Lending
    } else if rings {
        StrategyType::Staking
    } else {
        StrategyType::Unknown
    }
}

/// Base complexity of the type plus 0.1 per underlying protocol, capped at 1.
pub fn complexity_score(strategy_type: StrategyType, protocol_count: usize) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let per_protocol = 0.1 * protocol_count as f64;
    (strategy_type.base_complexity() + per_protocol).min(1.0)
}
