//! Shared test fixtures: database setup, log and event builders, a fast
//! RPC retry policy, and a chain with a vault's strategies wired in.

use alloy::primitives::{Address, B256, LogData, U256, address};
use alloy::rpc::types::Log;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::ReasonedAllocation;
use crate::bindings::IStrategy::ProtocolPosition;
use crate::event::{EventId, VaultEvent, VaultEventKind};
use crate::onchain::RpcRetryPolicy;
use crate::onchain::mock::MockChainReader;

pub(crate) const TEST_VAULT: Address = address!("0xfefefefefefefefefefefefefefefefefefefefe");
pub(crate) const ALICE: Address = address!("0xa11ce00000000000000000000000000000000001");

/// Timestamp of block 0 in every fixture; blocks are 12 s apart.
const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

pub(crate) async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

/// Three quick retries so exhaustion tests finish in milliseconds.
pub(crate) fn fast_retry_policy() -> RpcRetryPolicy {
    RpcRetryPolicy {
        max_retries: 3,
        min_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        attempt_timeout: Duration::from_millis(500),
    }
}

/// Deterministic transaction hash: one transaction per block.
pub(crate) fn tx_hash_for_block(block_number: u64) -> B256 {
    B256::left_padding_from(&block_number.to_be_bytes())
}

/// A mined log emitted by [`TEST_VAULT`] carrying `data`.
pub(crate) fn log_with_data(data: LogData, block_number: u64, log_index: u64) -> Log {
    Log {
        inner: alloy::primitives::Log {
            address: TEST_VAULT,
            data,
        },
        block_hash: Some(B256::repeat_byte(0xbb)),
        block_number: Some(block_number),
        block_timestamp: Some(GENESIS_TIMESTAMP + block_number * 12),
        transaction_hash: Some(tx_hash_for_block(block_number)),
        transaction_index: Some(0),
        log_index: Some(log_index),
        removed: false,
    }
}

/// A decoded [`TEST_VAULT`] event at the same position [`log_with_data`]
/// would give it.
pub(crate) fn event_at(kind: VaultEventKind, block_number: u64, log_index: u64) -> VaultEvent {
    VaultEvent {
        id: EventId {
            tx_hash: tx_hash_for_block(block_number),
            log_index,
        },
        vault: TEST_VAULT,
        block_number,
        block_timestamp: GENESIS_TIMESTAMP + block_number * 12,
        kind,
    }
}

/// Self-deposit of `shares` shares for `shares` assets.
pub(crate) fn deposit_event(
    owner: Address,
    shares: u64,
    block_number: u64,
    log_index: u64,
) -> VaultEvent {
    event_at(
        VaultEventKind::Deposit {
            sender: owner,
            owner,
            assets: U256::from(shares),
            shares: U256::from(shares),
        },
        block_number,
        log_index,
    )
}

/// Self-withdrawal of `shares` shares for `shares` assets.
pub(crate) fn withdraw_event(
    owner: Address,
    shares: u64,
    block_number: u64,
    log_index: u64,
) -> VaultEvent {
    event_at(
        VaultEventKind::Withdraw {
            sender: owner,
            receiver: owner,
            owner,
            assets: U256::from(shares),
            shares: U256::from(shares),
        },
        block_number,
        log_index,
    )
}

/// Mock chain where `vault` holds `strategies` at the given allocations,
/// each strategy with a single unleveraged lending position.
pub(crate) fn chain_with_strategies(
    vault: Address,
    strategies: &[(Address, u64)],
) -> Arc<MockChainReader> {
    let chain = Arc::new(MockChainReader::new());
    let addresses: Vec<Address> = strategies.iter().map(|(strategy, _)| *strategy).collect();
    chain.set_strategies(vault, &addresses);
    chain.set_totals(vault, U256::from(10_000), U256::from(10_000));

    for (strategy, allocation_bp) in strategies {
        chain.set_allocation(vault, *strategy, *allocation_bp);
        chain.set_strategy_state(
            *strategy,
            "Lending",
            vec![ProtocolPosition {
                protocol: "aave-lending".to_string(),
                balance: U256::from(*allocation_bp),
                healthFactor: U256::ZERO,
                supplyRateBp: U256::from(500),
                borrowRateBp: U256::ZERO,
            }],
        );
    }

    chain
}

/// Reasoning output recommending `allocations` keyed by lowercase address.
pub(crate) fn reasoned_allocation(
    allocations: &[(Address, u64)],
    confidence: f64,
) -> ReasonedAllocation {
    ReasonedAllocation {
        allocations: allocations
            .iter()
            .map(|(strategy, bp)| (crate::event::address_key(strategy), *bp))
            .collect(),
        reasoning: "rotate towards the higher supply rate".to_string(),
        confidence,
        expected_apy: 650,
        risk_score: 0.25,
        market_context: "stable rates".to_string(),
    }
}
