//! Signing and submission of vault transactions.

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, Bytes, TxHash};
use alloy::providers::{PendingTransactionError, Provider, ProviderBuilder, WalletProvider};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::{RpcError, TransportErrorKind};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use url::Url;

use super::http_client_with_retry;

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("transport error: {0}")]
    Transport(#[from] RpcError<TransportErrorKind>),
    #[error("transaction error: {0}")]
    Transaction(#[from] PendingTransactionError),
    #[error("transaction reverted: {tx_hash}")]
    Reverted { tx_hash: TxHash },
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(#[from] alloy::signers::k256::ecdsa::Error),
}

/// Signing identity able to submit contract calls.
#[async_trait]
pub trait Wallet: Send + Sync + 'static {
    /// Address transactions are sent from.
    fn address(&self) -> Address;

    /// Submits a contract call and waits for its receipt.
    ///
    /// - `contract`: target contract address
    /// - `calldata`: ABI-encoded function call
    /// - `gas_limit`: explicit limit, estimation is skipped
    /// - `note`: human-readable description used in logs
    async fn send(
        &self,
        contract: Address,
        calldata: Bytes,
        gas_limit: u64,
        note: &str,
    ) -> Result<TxHash, WalletError>;
}

#[async_trait]
impl<T: Wallet> Wallet for Arc<T> {
    fn address(&self) -> Address {
        (**self).address()
    }

    async fn send(
        &self,
        contract: Address,
        calldata: Bytes,
        gas_limit: u64,
        note: &str,
    ) -> Result<TxHash, WalletError> {
        (**self).send(contract, calldata, gas_limit, note).await
    }
}

/// Wallet that signs locally with a raw private key.
///
/// Wraps a provider that includes a wallet filler (e.g., built with
/// `ProviderBuilder::new().wallet(wallet).connect_client(...)`). The sending
/// address is the provider's default signer.
pub struct LocalWallet<P> {
    provider: P,
}

impl<P> LocalWallet<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

/// Builds a [`LocalWallet`] over an HTTP client with the shared transport
/// retry layer.
pub(crate) fn connect_local_wallet(
    rpc_url: Url,
    private_key: &B256,
) -> Result<LocalWallet<impl Provider + WalletProvider + Clone + 'static>, WalletError> {
    let signer = PrivateKeySigner::from_bytes(private_key)?;
    let provider = ProviderBuilder::new()
        .wallet(EthereumWallet::from(signer))
        .connect_client(http_client_with_retry(rpc_url));

    Ok(LocalWallet::new(provider))
}

#[async_trait]
impl<P> Wallet for LocalWallet<P>
where
    P: Provider + WalletProvider + Clone + Send + Sync + 'static,
{
    fn address(&self) -> Address {
        self.provider.default_signer_address()
    }

    async fn send(
        &self,
        contract: Address,
        calldata: Bytes,
        gas_limit: u64,
        note: &str,
    ) -> Result<TxHash, WalletError> {
        info!(%contract, gas_limit, note, "Submitting contract call");

        let tx = TransactionRequest::default()
            .to(contract)
            .input(calldata.into())
            .gas_limit(gas_limit);

        let pending = self.provider.send_transaction(tx).await?;

        info!(tx_hash = %pending.tx_hash(), note, "Transaction submitted");

        let receipt = pending.get_receipt().await?;

        if !receipt.status() {
            return Err(WalletError::Reverted {
                tx_hash: receipt.transaction_hash,
            });
        }

        info!(tx_hash = %receipt.transaction_hash, note, "Transaction confirmed");

        Ok(receipt.transaction_hash)
    }
}
