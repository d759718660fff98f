//! Typed vault events: the closed set of log shapes the indexer folds into
//! aggregate state.

use alloy::primitives::{Address, TxHash, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reorg-stable identity of an emitted log. Primary key of every
/// append-only table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId {
    pub tx_hash: TxHash,
    pub log_index: u64,
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:{}", self.tx_hash, self.log_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultEvent {
    pub id: EventId,
    pub vault: Address,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub kind: VaultEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultEventKind {
    Deposit {
        sender: Address,
        owner: Address,
        assets: U256,
        shares: U256,
    },
    Withdraw {
        sender: Address,
        receiver: Address,
        owner: Address,
        assets: U256,
        shares: U256,
    },
    StrategyDeposit {
        strategy: Address,
        assets: U256,
    },
    StrategyWithdrawal {
        strategy: Address,
        assets: U256,
    },
    StrategyAllocationUpdated {
        strategy: Address,
        allocation_bp: U256,
    },
    /// Parallel arrays; the decoder guarantees equal length.
    RebalanceExecuted {
        strategies: Vec<Address>,
        allocations: Vec<U256>,
    },
    YieldHarvested {
        total_yield: U256,
    },
}

impl VaultEventKind {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Deposit { .. } => "Deposit",
            Self::Withdraw { .. } => "Withdraw",
            Self::StrategyDeposit { .. } => "StrategyDeposit",
            Self::StrategyWithdrawal { .. } => "StrategyWithdrawal",
            Self::StrategyAllocationUpdated { .. } => "StrategyAllocationUpdated",
            Self::RebalanceExecuted { .. } => "RebalanceExecuted",
            Self::YieldHarvested { .. } => "YieldHarvested",
        }
    }

    /// Strategy-internal movements settle without changing vault-level
    /// totals, so only these variants re-read `totalAssets`/`totalSupply`.
    pub const fn triggers_metrics_refresh(&self) -> bool {
        matches!(
            self,
            Self::Deposit { .. }
                | Self::Withdraw { .. }
                | Self::RebalanceExecuted { .. }
                | Self::YieldHarvested { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyEventType {
    Deposit,
    Withdrawal,
    AllocationUpdated,
}

impl StrategyEventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
            Self::AllocationUpdated => "allocation_updated",
        }
    }
}

impl fmt::Display for StrategyEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown strategy event type: {0}")]
pub struct UnknownStrategyEventType(String);

impl FromStr for StrategyEventType {
    type Err = UnknownStrategyEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(Self::Deposit),
            "withdrawal" => Ok(Self::Withdrawal),
            "allocation_updated" => Ok(Self::AllocationUpdated),
            other => Err(UnknownStrategyEventType(other.to_string())),
        }
    }
}

/// Canonical storage form of an address: lowercase, `0x`-prefixed.
///
/// `Display` on [`Address`] produces the EIP-55 checksum form, so every
/// address that crosses into storage or JSON goes through here instead.
pub fn address_key(address: &Address) -> String {
    format!("{address:#x}")
}
