//! Typed reads and calldata for the vault and its strategies.

use alloy::primitives::{Address, Bytes, U256};
use alloy::sol_types::SolCall;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{BlockContext, ChainError, ChainReader, RpcRetryPolicy, with_rpc_retry};
use crate::bindings::{IStrategy, IYieldVault};

/// Upper bound on `strategies(i)` probing. Vaults with more slots than this
/// are truncated with a warning.
pub(crate) const MAX_STRATEGY_SLOTS: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaultTotals {
    pub total_assets: U256,
    pub total_supply: U256,
}

/// One underlying protocol position held by a strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionState {
    pub protocol: String,
    pub balance: U256,
    /// 1e18-scaled; zero means the position carries no debt.
    pub health_factor: U256,
    pub supply_rate_bp: u64,
    pub borrow_rate_bp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyState {
    pub address: Address,
    pub name: String,
    pub positions: Vec<PositionState>,
}

/// Vault- and strategy-level reads over a [`ChainReader`], each one bounded
/// by the shared retry policy.
#[derive(Clone)]
pub struct VaultReader {
    reader: Arc<dyn ChainReader>,
    retry: RpcRetryPolicy,
}

impl VaultReader {
    pub fn new(reader: Arc<dyn ChainReader>, retry: RpcRetryPolicy) -> Self {
        Self { reader, retry }
    }

    pub(crate) fn chain(&self) -> &Arc<dyn ChainReader> {
        &self.reader
    }

    pub(crate) async fn latest_block(&self) -> Result<BlockContext, ChainError> {
        with_rpc_retry("latest_block", &self.retry, || self.reader.latest_block()).await
    }

    async fn read<C: SolCall>(
        &self,
        operation: &'static str,
        contract: Address,
        call: &C,
    ) -> Result<C::Return, ChainError> {
        let calldata: Bytes = call.abi_encode().into();

        let output = with_rpc_retry(operation, &self.retry, || {
            self.reader.call(contract, calldata.clone())
        })
        .await?;

        Ok(C::abi_decode_returns(&output)?)
    }

    /// Reads `totalAssets()` then `totalSupply()` at the current chain head.
    #[tracing::instrument(skip(self), fields(%vault), level = tracing::Level::DEBUG)]
    pub async fn totals(&self, vault: Address) -> Result<VaultTotals, ChainError> {
        let total_assets = self
            .read("totalAssets", vault, &IYieldVault::totalAssetsCall {})
            .await?;
        let total_supply = self
            .read("totalSupply", vault, &IYieldVault::totalSupplyCall {})
            .await?;

        Ok(VaultTotals {
            total_assets,
            total_supply,
        })
    }

    /// Enumerates the vault's strategy array in index order.
    ///
    /// The interface exposes no length, so slots are probed one at a time
    /// until a call reverts, returns undecodable data, or returns the zero
    /// address. Transport failures that exhaust the retry budget still
    /// surface as errors rather than being mistaken for the end of the array.
    #[tracing::instrument(skip(self), fields(%vault), level = tracing::Level::DEBUG)]
    pub async fn strategies(&self, vault: Address) -> Result<Vec<Address>, ChainError> {
        let mut strategies = Vec::new();

        for index in 0..MAX_STRATEGY_SLOTS {
            let call = IYieldVault::strategiesCall {
                index: U256::from(index),
            };

            match self.read("strategies", vault, &call).await {
                Ok(strategy) if strategy == Address::ZERO => break,
                Ok(strategy) => strategies.push(strategy),
                Err(ChainError::Reverted { .. } | ChainError::SolType(_)) => break,
                Err(error) => return Err(error),
            }

            if index + 1 == MAX_STRATEGY_SLOTS {
                warn!(%vault, "Strategy probe hit the slot limit of {MAX_STRATEGY_SLOTS}");
            }
        }

        debug!(%vault, count = strategies.len(), "Enumerated strategies");

        Ok(strategies)
    }

    /// Current on-chain allocation in basis points per strategy, read in one
    /// Multicall3 batch. A strategy whose read fails or does not decode is
    /// reported as 0.
    #[tracing::instrument(skip(self, strategies), fields(%vault, count = strategies.len()), level = tracing::Level::DEBUG)]
    pub async fn allocations(
        &self,
        vault: Address,
        strategies: &[Address],
    ) -> Result<HashMap<Address, u64>, ChainError> {
        if strategies.is_empty() {
            return Ok(HashMap::new());
        }

        let calls: Vec<(Address, Bytes)> = strategies
            .iter()
            .map(|&strategy| {
                let calldata = IYieldVault::strategyAllocationsCall { strategy }.abi_encode();
                (vault, Bytes::from(calldata))
            })
            .collect();

        let outcomes = with_rpc_retry("strategyAllocations", &self.retry, || {
            self.reader.try_aggregate(calls.clone())
        })
        .await?;

        Ok(strategies
            .iter()
            .zip(outcomes)
            .map(|(&strategy, outcome)| {
                let allocation = if outcome.success {
                    IYieldVault::strategyAllocationsCall::abi_decode_returns(&outcome.return_data)
                        .map_or(0, saturating_u64)
                } else {
                    warn!(%vault, %strategy, "strategyAllocations read failed, treating as 0");
                    0
                };
                (strategy, allocation)
            })
            .collect())
    }

    /// Reads a strategy's name and its underlying protocol positions.
    #[tracing::instrument(skip(self), fields(%strategy), level = tracing::Level::DEBUG)]
    pub async fn strategy_state(&self, strategy: Address) -> Result<StrategyState, ChainError> {
        let name = self.read("name", strategy, &IStrategy::nameCall {}).await?;
        let positions = self
            .read(
                "getProtocolPositions",
                strategy,
                &IStrategy::getProtocolPositionsCall {},
            )
            .await?
            .into_iter()
            .map(|position| PositionState {
                protocol: position.protocol,
                balance: position.balance,
                health_factor: position.healthFactor,
                supply_rate_bp: saturating_u64(position.supplyRateBp),
                borrow_rate_bp: saturating_u64(position.borrowRateBp),
            })
            .collect();

        Ok(StrategyState {
            address: strategy,
            name,
            positions,
        })
    }
}

/// Calldata for `rebalance(address[], uint256[])`. The two vectors must be
/// in the vault's strategy index order.
pub(crate) fn rebalance_calldata(strategies: Vec<Address>, allocations: &[u64]) -> Bytes {
    IYieldVault::rebalanceCall {
        strategies,
        allocations: allocations.iter().map(|&bp| U256::from(bp)).collect(),
    }
    .abi_encode()
    .into()
}

fn saturating_u64(value: U256) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}
