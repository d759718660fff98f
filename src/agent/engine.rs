//! Decision Engine: analyses a vault's strategies, asks the reasoning
//! service for an allocation, and records the normalized result.

use alloy::primitives::{Address, U256};
use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::classify::{StrategyType, classify, complexity_score};
use super::normalize::normalize;
use super::reasoning::{ReasoningError, ReasoningService};
use super::risk::{RiskBreakdown, assess};
use crate::onchain::ChainError;
use crate::onchain::vault::{StrategyState, VaultReader};
use crate::store::decisions::{self, AgentDecision, NewAgentDecision};
use crate::store::metrics::{self, VaultMetrics};
use crate::store::{StoreError, as_address_key, as_decimal};

#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("vault {0} has no strategies")]
    NoStrategies(Address),
    #[error("failed to render analysis prompt: {0}")]
    Prompt(#[from] serde_json::Error),
    #[error("decision unavailable: {0}")]
    DecisionUnavailable(#[source] ReasoningError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PositionSummary {
    pub protocol: String,
    #[serde(serialize_with = "as_decimal")]
    pub balance: U256,
    #[serde(serialize_with = "as_decimal")]
    pub health_factor: U256,
    pub supply_rate_bp: u64,
    pub borrow_rate_bp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyAnalysis {
    #[serde(serialize_with = "as_address_key")]
    pub address: Address,
    pub name: String,
    pub strategy_type: StrategyType,
    pub complexity: f64,
    pub risk: RiskBreakdown,
    pub current_allocation_bp: u64,
    pub positions: Vec<PositionSummary>,
}

impl StrategyAnalysis {
    fn new(state: StrategyState, current_allocation_bp: u64) -> Self {
        let strategy_type = classify(
            &state
                .positions
                .iter()
                .map(|position| position.protocol.as_str())
                .collect::<Vec<_>>(),
        );

        Self {
            address: state.address,
            name: state.name,
            strategy_type,
            complexity: complexity_score(strategy_type, state.positions.len()),
            risk: assess(&state.positions),
            current_allocation_bp,
            positions: state
                .positions
                .into_iter()
                .map(|position| PositionSummary {
                    protocol: position.protocol,
                    balance: position.balance,
                    health_factor: position.health_factor,
                    supply_rate_bp: position.supply_rate_bp,
                    borrow_rate_bp: position.borrow_rate_bp,
                })
                .collect(),
        }
    }
}

/// Read-only view of a vault: strategies in index order with their scores,
/// plus the last indexed metrics snapshot if there is one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VaultAnalysis {
    #[serde(serialize_with = "as_address_key")]
    pub vault: Address,
    pub strategies: Vec<StrategyAnalysis>,
    pub metrics: Option<VaultMetrics>,
}

/// Sole writer of the Recommendation Store.
#[derive(Clone)]
pub struct DecisionEngine {
    pool: SqlitePool,
    vaults: VaultReader,
    reasoning: Arc<dyn ReasoningService>,
    chain_id: u64,
    retry: ExponentialBuilder,
}

impl DecisionEngine {
    pub fn new(
        pool: SqlitePool,
        vaults: VaultReader,
        reasoning: Arc<dyn ReasoningService>,
        chain_id: u64,
        max_retries: usize,
    ) -> Self {
        const REASONING_MIN_DELAY: Duration = Duration::from_millis(500);
        const REASONING_MAX_DELAY: Duration = Duration::from_secs(5);

        Self {
            pool,
            vaults,
            reasoning,
            chain_id,
            retry: ExponentialBuilder::default()
                .with_max_times(max_retries)
                .with_min_delay(REASONING_MIN_DELAY)
                .with_max_delay(REASONING_MAX_DELAY),
        }
    }

    #[cfg(test)]
    fn with_retry_strat(mut self, retry: ExponentialBuilder) -> Self {
        self.retry = retry;
        self
    }

    /// Strategy composition, classification and risk scores. Does not call
    /// the reasoning service.
    #[tracing::instrument(skip(self), fields(%vault), level = tracing::Level::DEBUG)]
    pub async fn analyze(&self, vault: Address) -> Result<VaultAnalysis, DecisionError> {
        let strategies = self.vaults.strategies(vault).await?;
        let current = self.vaults.allocations(vault, &strategies).await?;

        let mut analyses = Vec::with_capacity(strategies.len());
        for strategy in strategies {
            let state = self.vaults.strategy_state(strategy).await?;
            let current_bp = current.get(&strategy).copied().unwrap_or(0);
            analyses.push(StrategyAnalysis::new(state, current_bp));
        }

        Ok(VaultAnalysis {
            vault,
            strategies: analyses,
            metrics: metrics::get(&self.pool, &vault).await?,
        })
    }

    /// Produces and records a new allocation decision for `vault`.
    ///
    /// Nothing is written unless the reasoning service returns a valid
    /// answer within its retry budget.
    #[tracing::instrument(skip(self), fields(%vault), level = tracing::Level::INFO)]
    pub async fn decide(&self, vault: Address) -> Result<AgentDecision, DecisionError> {
        let analysis = self.analyze(vault).await?;
        if analysis.strategies.is_empty() {
            return Err(DecisionError::NoStrategies(vault));
        }

        let prompt = render_prompt(&analysis)?;

        let reasoned = (|| self.reasoning.generate(&prompt))
            .retry(self.retry)
            .notify(|err, dur| {
                warn!(%vault, "Reasoning call failed, retrying in {dur:?}: {err}");
            })
            .await
            .map_err(DecisionError::DecisionUnavailable)?;

        let known: HashSet<Address> = analysis
            .strategies
            .iter()
            .map(|strategy| strategy.address)
            .collect();
        let allocations = normalize(retain_vault_strategies(
            vault,
            reasoned.allocations,
            &known,
        ));

        let decision = decisions::insert(
            &self.pool,
            &NewAgentDecision {
                vault,
                chain_id: self.chain_id,
                allocations,
                expected_apy_bp: reasoned.expected_apy,
                risk_score: reasoned.risk_score,
                confidence: reasoned.confidence,
                reasoning: reasoned.reasoning,
                market_context: reasoned.market_context,
            },
            Utc::now(),
        )
        .await?;

        info!(
            %vault,
            decision_id = decision.id,
            confidence = decision.confidence,
            expected_apy_bp = decision.expected_apy_bp,
            "Recorded allocation decision"
        );

        Ok(decision)
    }
}

fn render_prompt(analysis: &VaultAnalysis) -> Result<String, serde_json::Error> {
    Ok(format!(
        "Recommend a target allocation for vault {vault} across its {count} strategies. \
         Use the strategy addresses below as allocation keys.\n\n{body}",
        vault = crate::event::address_key(&analysis.vault),
        count = analysis.strategies.len(),
        body = serde_json::to_string_pretty(analysis)?,
    ))
}

/// Keeps allocation keys that parse as one of the vault's strategies. Keys
/// that differ only in case are summed.
fn retain_vault_strategies(
    vault: Address,
    raw: BTreeMap<String, u64>,
    known: &HashSet<Address>,
) -> BTreeMap<Address, u64> {
    let mut allocations = BTreeMap::new();

    for (key, bp) in raw {
        match key.parse::<Address>() {
            Ok(strategy) if known.contains(&strategy) => {
                allocations
                    .entry(strategy)
                    .and_modify(|total: &mut u64| *total = total.saturating_add(bp))
                    .or_insert(bp);
            }
            _ => warn!(%vault, key, bp, "Dropping allocation for unknown strategy"),
        }
    }

    allocations
}
