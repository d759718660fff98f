//! In-memory chain and wallet doubles for tests.

use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use super::{BlockContext, CallOutcome, ChainError, ChainReader, Wallet, WalletError};
use crate::bindings::{IStrategy, IYieldVault};

/// Contract-call table keyed by `(contract, calldata)`. Calls with no entry
/// revert, which is also how the end of a strategy array is modelled.
pub(crate) struct MockChainReader {
    responses: Mutex<HashMap<(Address, Bytes), Bytes>>,
    calls: Mutex<Vec<(Address, Bytes)>>,
    latest: Mutex<BlockContext>,
    chain_id: u64,
    fail_transiently: AtomicBool,
}

impl MockChainReader {
    pub(crate) fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            latest: Mutex::new(BlockContext {
                number: 1_000,
                timestamp: 1_700_000_000,
            }),
            chain_id: 146,
            fail_transiently: AtomicBool::new(false),
        }
    }

    fn respond<C: SolCall>(&self, contract: Address, call: &C, output: Vec<u8>) {
        self.responses
            .lock()
            .unwrap()
            .insert((contract, call.abi_encode().into()), output.into());
    }

    fn forget<C: SolCall>(&self, contract: Address, call: &C) {
        self.responses
            .lock()
            .unwrap()
            .remove(&(contract, call.abi_encode().into()));
    }

    pub(crate) fn set_totals(&self, vault: Address, total_assets: U256, total_supply: U256) {
        self.respond(
            vault,
            &IYieldVault::totalAssetsCall {},
            IYieldVault::totalAssetsCall::abi_encode_returns(&total_assets),
        );
        self.respond(
            vault,
            &IYieldVault::totalSupplyCall {},
            IYieldVault::totalSupplyCall::abi_encode_returns(&total_supply),
        );
    }

    /// Answers `strategies(i)` for each listed slot. The slot after the last
    /// one reverts.
    pub(crate) fn set_strategies(&self, vault: Address, strategies: &[Address]) {
        for (index, strategy) in strategies.iter().enumerate() {
            self.respond(
                vault,
                &IYieldVault::strategiesCall {
                    index: U256::from(index),
                },
                IYieldVault::strategiesCall::abi_encode_returns(strategy),
            );
        }

        self.forget(
            vault,
            &IYieldVault::strategiesCall {
                index: U256::from(strategies.len()),
            },
        );
    }

    pub(crate) fn set_allocation(&self, vault: Address, strategy: Address, allocation_bp: u64) {
        self.respond(
            vault,
            &IYieldVault::strategyAllocationsCall { strategy },
            IYieldVault::strategyAllocationsCall::abi_encode_returns(&U256::from(allocation_bp)),
        );
    }

    pub(crate) fn set_strategy_state(
        &self,
        strategy: Address,
        name: &str,
        positions: Vec<IStrategy::ProtocolPosition>,
    ) {
        self.respond(
            strategy,
            &IStrategy::nameCall {},
            IStrategy::nameCall::abi_encode_returns(&name.to_string()),
        );
        self.respond(
            strategy,
            &IStrategy::getProtocolPositionsCall {},
            IStrategy::getProtocolPositionsCall::abi_encode_returns(&positions),
        );
    }

    pub(crate) fn set_latest_block(&self, number: u64, timestamp: u64) {
        *self.latest.lock().unwrap() = BlockContext { number, timestamp };
    }

    /// When set, every call fails with a retryable timeout.
    pub(crate) fn fail_transiently(&self, fail: bool) {
        self.fail_transiently.store(fail, Ordering::SeqCst);
    }

    /// Number of calls made to `contract` with `C`'s selector.
    pub(crate) fn calls_to<C: SolCall>(&self, contract: Address) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(target, calldata)| {
                *target == contract && calldata.starts_with(&C::SELECTOR)
            })
            .count()
    }

    fn lookup(&self, contract: Address, calldata: &Bytes) -> Option<Bytes> {
        self.responses
            .lock()
            .unwrap()
            .get(&(contract, calldata.clone()))
            .cloned()
    }
}

#[async_trait]
impl ChainReader for MockChainReader {
    async fn call(&self, contract: Address, calldata: Bytes) -> Result<Bytes, ChainError> {
        self.calls.lock().unwrap().push((contract, calldata.clone()));

        if self.fail_transiently.load(Ordering::SeqCst) {
            return Err(ChainError::Timeout(Duration::ZERO));
        }

        self.lookup(contract, &calldata)
            .ok_or_else(|| ChainError::Reverted {
                contract,
                message: "execution reverted".to_string(),
            })
    }

    async fn latest_block(&self) -> Result<BlockContext, ChainError> {
        if self.fail_transiently.load(Ordering::SeqCst) {
            return Err(ChainError::Timeout(Duration::ZERO));
        }

        Ok(*self.latest.lock().unwrap())
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        Ok(self.chain_id)
    }

    async fn try_aggregate(
        &self,
        calls: Vec<(Address, Bytes)>,
    ) -> Result<Vec<CallOutcome>, ChainError> {
        if self.fail_transiently.load(Ordering::SeqCst) {
            return Err(ChainError::Timeout(Duration::ZERO));
        }

        Ok(calls
            .into_iter()
            .map(|(contract, calldata)| {
                self.calls.lock().unwrap().push((contract, calldata.clone()));

                match self.lookup(contract, &calldata) {
                    Some(return_data) => CallOutcome {
                        success: true,
                        return_data,
                    },
                    None => CallOutcome {
                        success: false,
                        return_data: Bytes::new(),
                    },
                }
            })
            .collect())
    }
}

/// A wallet send captured by [`MockWallet`].
#[derive(Debug, Clone)]
pub(crate) struct SentTransaction {
    pub(crate) contract: Address,
    pub(crate) calldata: Bytes,
    pub(crate) gas_limit: u64,
}

pub(crate) struct MockWallet {
    address: Address,
    send_count: AtomicUsize,
    fail: AtomicBool,
    delay: Duration,
    sent: Mutex<Vec<SentTransaction>>,
}

impl MockWallet {
    pub(crate) fn new() -> Self {
        Self {
            address: Address::repeat_byte(0xee),
            send_count: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            delay: Duration::ZERO,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// A wallet whose sends take `delay` before confirming.
    pub(crate) fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    /// A wallet whose sends are mined but revert.
    pub(crate) fn failing() -> Self {
        let wallet = Self::new();
        wallet.fail.store(true, Ordering::SeqCst);
        wallet
    }

    pub(crate) fn send_count(&self) -> usize {
        self.send_count.load(Ordering::SeqCst)
    }

    pub(crate) fn sent(&self) -> Vec<SentTransaction> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Wallet for MockWallet {
    fn address(&self) -> Address {
        self.address
    }

    async fn send(
        &self,
        contract: Address,
        calldata: Bytes,
        gas_limit: u64,
        _note: &str,
    ) -> Result<TxHash, WalletError> {
        let count = self.send_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.sent.lock().unwrap().push(SentTransaction {
            contract,
            calldata,
            gas_limit,
        });

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let tx_hash = TxHash::with_last_byte(u8::try_from(count).unwrap_or(u8::MAX));

        if self.fail.load(Ordering::SeqCst) {
            return Err(WalletError::Reverted { tx_hash });
        }

        Ok(tx_hash)
    }
}
