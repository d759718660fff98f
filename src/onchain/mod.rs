//! Chain access: the read client used by metrics refresh, strategy
//! enumeration and the agent, the signing client used for rebalances, the
//! log decoder, and the log source feeding the indexer.

use alloy::primitives::{Address, Bytes};
use alloy::providers::Provider;
use alloy::rpc::client::RpcClient;
use alloy::rpc::json_rpc::ErrorPayload;
use alloy::rpc::types::{BlockNumberOrTag, TransactionRequest};
use alloy::sol_types::SolCall;
use alloy::transports::layers::RetryBackoffLayer;
use alloy::transports::{RpcError, TransportErrorKind};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use url::Url;

use crate::bindings::{IMulticall3, MULTICALL3};

pub(crate) mod decoder;
#[cfg(test)]
pub(crate) mod mock;
pub(crate) mod source;
pub(crate) mod vault;
pub(crate) mod wallet;

pub(crate) use decoder::decode_log;
pub(crate) use wallet::{Wallet, WalletError};

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct EvmConfig {
    pub(crate) chain_id: u64,
    pub(crate) vaults: Vec<Address>,
    pub(crate) start_block: u64,
    pub(crate) backfill_batch_size: Option<u64>,
    pub(crate) poll_interval_secs: Option<u64>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct EvmSecrets {
    pub(crate) rpc_url: Url,
    pub(crate) private_key: Option<alloy::primitives::B256>,
}

#[derive(Clone)]
pub(crate) struct EvmCtx {
    pub(crate) rpc_url: Url,
    pub(crate) private_key: Option<alloy::primitives::B256>,
    pub(crate) chain_id: u64,
    pub(crate) vaults: Vec<Address>,
    pub(crate) start_block: u64,
    pub(crate) backfill_batch_size: u64,
    pub(crate) poll_interval: Duration,
}

impl std::fmt::Debug for EvmCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmCtx")
            .field("rpc_url", &"[REDACTED]")
            .field(
                "private_key",
                &self.private_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("chain_id", &self.chain_id)
            .field("vaults", &self.vaults)
            .field("start_block", &self.start_block)
            .field("backfill_batch_size", &self.backfill_batch_size)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl EvmCtx {
    pub(crate) fn new(config: EvmConfig, secrets: EvmSecrets) -> Self {
        const DEFAULT_BACKFILL_BATCH_SIZE: u64 = 1_000;
        const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;

        Self {
            rpc_url: secrets.rpc_url,
            private_key: secrets.private_key,
            chain_id: config.chain_id,
            vaults: config.vaults,
            start_block: config.start_block,
            backfill_batch_size: config
                .backfill_batch_size
                .unwrap_or(DEFAULT_BACKFILL_BATCH_SIZE)
                .max(1),
            poll_interval: Duration::from_secs(
                config
                    .poll_interval_secs
                    .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            ),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("RPC unavailable for {operation} after {attempts} attempts: {last_error}")]
    RpcUnavailable {
        operation: &'static str,
        attempts: usize,
        last_error: String,
    },
    #[error("RPC transport error: {0}")]
    Transport(#[from] RpcError<TransportErrorKind>),
    #[error("call to {contract} reverted: {message}")]
    Reverted { contract: Address, message: String },
    #[error("Sol type error: {0}")]
    SolType(#[from] alloy::sol_types::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("latest block unavailable")]
    NoLatestBlock,
    #[error("block {0} not found")]
    MissingBlock(u64),
    #[error("multicall returned {returned} results for {requested} calls")]
    MulticallLength { requested: usize, returned: usize },
}

impl ChainError {
    /// Transport failures and timeouts are worth retrying; reverts and ABI
    /// mismatches will fail identically on every attempt.
    pub(crate) const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::NoLatestBlock
        )
    }
}

/// Head of the canonical chain as observed by the read client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockContext {
    pub number: u64,
    pub timestamp: u64,
}

/// Result of one call inside a `tryAggregate` batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub success: bool,
    pub return_data: Bytes,
}

/// Read-only chain access.
///
/// `try_aggregate` has a default implementation that batches through
/// Multicall3 via [`call`](ChainReader::call), so one failing read (e.g. a
/// strategy slot past the end of the array) does not abort the batch.
#[async_trait]
pub trait ChainReader: Send + Sync + 'static {
    async fn call(&self, contract: Address, calldata: Bytes) -> Result<Bytes, ChainError>;

    async fn latest_block(&self) -> Result<BlockContext, ChainError>;

    async fn chain_id(&self) -> Result<u64, ChainError>;

    async fn try_aggregate(
        &self,
        calls: Vec<(Address, Bytes)>,
    ) -> Result<Vec<CallOutcome>, ChainError> {
        let requested = calls.len();

        let calldata = IMulticall3::tryAggregateCall {
            requireSuccess: false,
            calls: calls
                .into_iter()
                .map(|(target, call_data)| IMulticall3::Call {
                    target,
                    callData: call_data,
                })
                .collect(),
        }
        .abi_encode();

        let output = self.call(MULTICALL3, calldata.into()).await?;
        let results = IMulticall3::tryAggregateCall::abi_decode_returns(&output)?;

        if results.len() != requested {
            return Err(ChainError::MulticallLength {
                requested,
                returned: results.len(),
            });
        }

        Ok(results
            .into_iter()
            .map(|result| CallOutcome {
                success: result.success,
                return_data: result.returnData,
            })
            .collect())
    }
}

#[async_trait]
impl<T: ChainReader> ChainReader for Arc<T> {
    async fn call(&self, contract: Address, calldata: Bytes) -> Result<Bytes, ChainError> {
        (**self).call(contract, calldata).await
    }

    async fn latest_block(&self) -> Result<BlockContext, ChainError> {
        (**self).latest_block().await
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        (**self).chain_id().await
    }

    async fn try_aggregate(
        &self,
        calls: Vec<(Address, Bytes)>,
    ) -> Result<Vec<CallOutcome>, ChainError> {
        (**self).try_aggregate(calls).await
    }
}

/// [`ChainReader`] backed by an alloy provider.
#[derive(Clone)]
pub struct AlloyChainReader<P> {
    provider: P,
}

impl<P> AlloyChainReader<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<P> ChainReader for AlloyChainReader<P>
where
    P: Provider + Clone + Send + Sync + 'static,
{
    async fn call(&self, contract: Address, calldata: Bytes) -> Result<Bytes, ChainError> {
        let tx = TransactionRequest::default()
            .to(contract)
            .input(calldata.into());

        match self.provider.call(tx).await {
            Ok(output) => Ok(output),
            Err(RpcError::ErrorResp(payload)) if is_execution_revert(&payload) => {
                Err(ChainError::Reverted {
                    contract,
                    message: payload.message.to_string(),
                })
            }
            Err(error) => Err(ChainError::Transport(error)),
        }
    }

    async fn latest_block(&self) -> Result<BlockContext, ChainError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Latest)
            .await?
            .ok_or(ChainError::NoLatestBlock)?;

        Ok(BlockContext {
            number: block.header.number,
            timestamp: block.header.timestamp,
        })
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        Ok(self.provider.get_chain_id().await?)
    }
}

/// Error code 3 is the standard revert response. Some nodes answer a revert
/// with a generic server error code, so the message is checked too. Any
/// other JSON-RPC error, e.g. rate limiting, is a transport failure.
fn is_execution_revert(payload: &ErrorPayload) -> bool {
    const EXECUTION_REVERTED: i64 = 3;

    payload.code == EXECUTION_REVERTED
        || payload.message.to_ascii_lowercase().contains("revert")
}

/// Bounded retry with per-attempt timeout for chain reads.
#[derive(Debug, Clone)]
pub struct RpcRetryPolicy {
    pub max_retries: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RpcRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RpcRetryPolicy {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_max_times(self.max_retries)
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_jitter()
    }
}

/// Runs `op` with the policy's timeout and retry budget. Transient failures
/// that survive every attempt surface as [`ChainError::RpcUnavailable`];
/// non-transient failures return immediately, unchanged.
pub(crate) async fn with_rpc_retry<T, F, Fut>(
    operation: &'static str,
    policy: &RpcRetryPolicy,
    mut op: F,
) -> Result<T, ChainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChainError>>,
{
    let attempt_timeout = policy.attempt_timeout;

    let attempt = || {
        let fut = op();
        async move {
            tokio::time::timeout(attempt_timeout, fut)
                .await
                .map_err(|_| ChainError::Timeout(attempt_timeout))?
        }
    };

    attempt
        .retry(policy.backoff())
        .when(ChainError::is_transient)
        .notify(|err, dur| {
            warn!(operation, "Retrying chain read after error: {err} (waiting {dur:?})");
        })
        .await
        .map_err(|err| {
            if err.is_transient() {
                ChainError::RpcUnavailable {
                    operation,
                    attempts: policy.max_retries + 1,
                    last_error: err.to_string(),
                }
            } else {
                err
            }
        })
}

/// Maximum retries for transient RPC errors (rate limits, null responses, etc.)
const RPC_MAX_RETRIES: u32 = 10;

/// Initial backoff duration in milliseconds before retrying
const RPC_INITIAL_BACKOFF_MS: u64 = 1000;

/// Compute units per second budget for rate limiting
const RPC_COMPUTE_UNITS_PER_SECOND: u64 = 100;

/// Creates an HTTP RPC client with a transport-level retry layer for rate
/// limiting.
///
/// Use with `ProviderBuilder::new().connect_client(client)` for read-only calls,
/// or `ProviderBuilder::new().wallet(w).connect_client(client)` for signing.
pub(crate) fn http_client_with_retry(url: Url) -> RpcClient {
    let retry_layer = RetryBackoffLayer::new(
        RPC_MAX_RETRIES,
        RPC_INITIAL_BACKOFF_MS,
        RPC_COMPUTE_UNITS_PER_SECOND,
    );
    RpcClient::builder().layer(retry_layer).http(url)
}
