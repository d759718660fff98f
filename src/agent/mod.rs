//! Investment agent: strategy analysis and allocation decisions.

mod classify;
mod engine;
#[cfg(test)]
pub(crate) mod mock;
mod normalize;
mod reasoning;
mod risk;

pub use classify::StrategyType;
pub use engine::{DecisionEngine, DecisionError, PositionSummary, StrategyAnalysis, VaultAnalysis};
pub use normalize::TOTAL_BP;
pub use reasoning::{OpenAiReasoningClient, ReasonedAllocation, ReasoningError, ReasoningService};
pub use risk::RiskBreakdown;
