//! Maps raw vault logs onto [`VaultEvent`]s. Pure: no I/O, no state.

use alloy::primitives::B256;
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;

use crate::bindings::IYieldVault::{
    Deposit, RebalanceExecuted, StrategyAllocationUpdated, StrategyDeposit, StrategyWithdrawal,
    Withdraw, YieldHarvested,
};
use crate::event::{EventId, VaultEvent, VaultEventKind};

#[derive(Debug, thiserror::Error)]
pub(crate) enum DecodeError {
    #[error("Unrecognized event signature {0}")]
    UnrecognizedEvent(B256),
    #[error("Malformed event: log has no topics")]
    MissingTopic,
    #[error("Malformed event: missing log field {0}")]
    MissingLogField(&'static str),
    #[error("Malformed RebalanceExecuted: {strategies} strategies but {allocations} allocations")]
    RebalanceArrayMismatch {
        strategies: usize,
        allocations: usize,
    },
    #[error("Malformed event: {0}")]
    Abi(#[from] alloy::sol_types::Error),
}

/// Decodes one vault log.
///
/// Addresses come out as [`alloy::primitives::Address`] values, which
/// compare byte-wise, so case differences in the RPC's JSON never reach
/// callers. Storage renders them lowercase via [`crate::event::address_key`].
pub(crate) fn decode_log(log: &Log) -> Result<VaultEvent, DecodeError> {
    let topic0 = *log.topic0().ok_or(DecodeError::MissingTopic)?;

    let tx_hash = log
        .transaction_hash
        .ok_or(DecodeError::MissingLogField("transaction_hash"))?;
    let log_index = log
        .log_index
        .ok_or(DecodeError::MissingLogField("log_index"))?;
    let block_number = log
        .block_number
        .ok_or(DecodeError::MissingLogField("block_number"))?;
    let block_timestamp = log
        .block_timestamp
        .ok_or(DecodeError::MissingLogField("block_timestamp"))?;

    let kind = decode_kind(topic0, log)?;

    Ok(VaultEvent {
        id: EventId { tx_hash, log_index },
        vault: log.address(),
        block_number,
        block_timestamp,
        kind,
    })
}

fn decode_kind(topic0: B256, log: &Log) -> Result<VaultEventKind, DecodeError> {
    let kind = match topic0 {
        t if t == Deposit::SIGNATURE_HASH => {
            let event = log.log_decode::<Deposit>()?.inner.data;
            VaultEventKind::Deposit {
                sender: event.sender,
                owner: event.owner,
                assets: event.assets,
                shares: event.shares,
            }
        }
        t if t == Withdraw::SIGNATURE_HASH => {
            let event = log.log_decode::<Withdraw>()?.inner.data;
            VaultEventKind::Withdraw {
                sender: event.sender,
                receiver: event.receiver,
                owner: event.owner,
                assets: event.assets,
                shares: event.shares,
            }
        }
        t if t == StrategyDeposit::SIGNATURE_HASH => {
            let event = log.log_decode::<StrategyDeposit>()?.inner.data;
            VaultEventKind::StrategyDeposit {
                strategy: event.strategy,
                assets: event.assets,
            }
        }
        t if t == StrategyWithdrawal::SIGNATURE_HASH => {
            let event = log.log_decode::<StrategyWithdrawal>()?.inner.data;
            VaultEventKind::StrategyWithdrawal {
                strategy: event.strategy,
                assets: event.assets,
            }
        }
        t if t == StrategyAllocationUpdated::SIGNATURE_HASH => {
            let event = log.log_decode::<StrategyAllocationUpdated>()?.inner.data;
            VaultEventKind::StrategyAllocationUpdated {
                strategy: event.strategy,
                allocation_bp: event.allocation,
            }
        }
        t if t == RebalanceExecuted::SIGNATURE_HASH => {
            let event = log.log_decode::<RebalanceExecuted>()?.inner.data;

            if event.strategies.len() != event.allocations.len() {
                return Err(DecodeError::RebalanceArrayMismatch {
                    strategies: event.strategies.len(),
                    allocations: event.allocations.len(),
                });
            }

            VaultEventKind::RebalanceExecuted {
                strategies: event.strategies,
                allocations: event.allocations,
            }
        }
        t if t == YieldHarvested::SIGNATURE_HASH => {
            let event = log.log_decode::<YieldHarvested>()?.inner.data;
            VaultEventKind::YieldHarvested {
                total_yield: event.totalYield,
            }
        }
        unknown => return Err(DecodeError::UnrecognizedEvent(unknown)),
    };

    Ok(kind)
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, LogData, U256, address, b256};

    use super::*;
    use crate::test_utils::{TEST_VAULT, log_with_data};

    const ALICE: Address = address!("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    const STRATEGY: Address = address!("0x5555555555555555555555555555555555555555");

    #[test]
    fn decodes_deposit_with_vault_and_block_context() {
        let data = Deposit {
            sender: ALICE,
            owner: ALICE,
            assets: U256::from(1_000_u64),
            shares: U256::from(990_u64),
        }
        .encode_log_data();

        let event = decode_log(&log_with_data(data, 10, 3)).unwrap();

        assert_eq!(event.vault, TEST_VAULT);
        assert_eq!(event.block_number, 10);
        assert_eq!(event.id.log_index, 3);
        assert_eq!(
            event.kind,
            VaultEventKind::Deposit {
                sender: ALICE,
                owner: ALICE,
                assets: U256::from(1_000_u64),
                shares: U256::from(990_u64),
            }
        );
    }

    #[test]
    fn decodes_withdraw_indexed_fields_in_order() {
        let receiver = address!("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
        let owner = address!("0xcccccccccccccccccccccccccccccccccccccccc");
        let data = Withdraw {
            sender: ALICE,
            receiver,
            owner,
            assets: U256::from(30_u64),
            shares: U256::from(30_u64),
        }
        .encode_log_data();

        let event = decode_log(&log_with_data(data, 11, 0)).unwrap();

        let VaultEventKind::Withdraw {
            sender,
            receiver: decoded_receiver,
            owner: decoded_owner,
            ..
        } = event.kind
        else {
            panic!("expected Withdraw, got {:?}", event.kind);
        };
        assert_eq!(sender, ALICE);
        assert_eq!(decoded_receiver, receiver);
        assert_eq!(decoded_owner, owner);
    }

    #[test]
    fn decodes_strategy_variants() {
        let deposit = StrategyDeposit {
            strategy: STRATEGY,
            assets: U256::from(5_u64),
        }
        .encode_log_data();
        let withdrawal = StrategyWithdrawal {
            strategy: STRATEGY,
            assets: U256::from(6_u64),
        }
        .encode_log_data();
        let allocation = StrategyAllocationUpdated {
            strategy: STRATEGY,
            allocation: U256::from(2_500_u64),
        }
        .encode_log_data();

        assert_eq!(
            decode_log(&log_with_data(deposit, 1, 0)).unwrap().kind,
            VaultEventKind::StrategyDeposit {
                strategy: STRATEGY,
                assets: U256::from(5_u64)
            }
        );
        assert_eq!(
            decode_log(&log_with_data(withdrawal, 1, 1)).unwrap().kind,
            VaultEventKind::StrategyWithdrawal {
                strategy: STRATEGY,
                assets: U256::from(6_u64)
            }
        );
        assert_eq!(
            decode_log(&log_with_data(allocation, 1, 2)).unwrap().kind,
            VaultEventKind::StrategyAllocationUpdated {
                strategy: STRATEGY,
                allocation_bp: U256::from(2_500_u64)
            }
        );
    }

    #[test]
    fn decodes_rebalance_and_harvest() {
        let rebalance = RebalanceExecuted {
            strategies: vec![STRATEGY, ALICE],
            allocations: vec![U256::from(7_000_u64), U256::from(3_000_u64)],
        }
        .encode_log_data();
        let harvest = YieldHarvested {
            totalYield: U256::from(123_u64),
        }
        .encode_log_data();

        assert_eq!(
            decode_log(&log_with_data(rebalance, 2, 0)).unwrap().kind,
            VaultEventKind::RebalanceExecuted {
                strategies: vec![STRATEGY, ALICE],
                allocations: vec![U256::from(7_000_u64), U256::from(3_000_u64)],
            }
        );
        assert_eq!(
            decode_log(&log_with_data(harvest, 2, 1)).unwrap().kind,
            VaultEventKind::YieldHarvested {
                total_yield: U256::from(123_u64)
            }
        );
    }

    #[test]
    fn rebalance_with_mismatched_arrays_fails_closed() {
        let data = RebalanceExecuted {
            strategies: vec![STRATEGY, ALICE],
            allocations: vec![U256::from(10_000_u64)],
        }
        .encode_log_data();

        let error = decode_log(&log_with_data(data, 2, 0)).unwrap_err();

        assert!(matches!(
            error,
            DecodeError::RebalanceArrayMismatch {
                strategies: 2,
                allocations: 1
            }
        ));
    }

    #[test]
    fn unknown_signature_is_unrecognized() {
        let topic = b256!("0x0101010101010101010101010101010101010101010101010101010101010101");
        let data = LogData::new_unchecked(vec![topic], Default::default());

        let error = decode_log(&log_with_data(data, 1, 0)).unwrap_err();

        assert!(matches!(error, DecodeError::UnrecognizedEvent(t) if t == topic));
    }

    #[test]
    fn log_without_topics_is_malformed() {
        let error = decode_log(&log_with_data(LogData::empty(), 1, 0)).unwrap_err();
        assert!(matches!(error, DecodeError::MissingTopic));
    }

    #[test]
    fn missing_block_timestamp_is_malformed() {
        let data = YieldHarvested {
            totalYield: U256::from(1_u64),
        }
        .encode_log_data();
        let mut log = log_with_data(data, 1, 0);
        log.block_timestamp = None;

        let error = decode_log(&log).unwrap_err();

        assert!(matches!(
            error,
            DecodeError::MissingLogField("block_timestamp")
        ));
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let mut data = Deposit {
            sender: ALICE,
            owner: ALICE,
            assets: U256::from(1_u64),
            shares: U256::from(1_u64),
        }
        .encode_log_data();
        data = LogData::new_unchecked(data.topics().to_vec(), Default::default());

        let error = decode_log(&log_with_data(data, 1, 0)).unwrap_err();

        assert!(matches!(error, DecodeError::Abi(_)));
    }
}
