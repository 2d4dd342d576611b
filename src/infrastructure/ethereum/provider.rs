//! Ethereum provider abstraction and Alloy implementations
//!
//! Everything the sweeper needs from a node goes through [`EthereumProvider`],
//! so the endpoint pool can hold HTTP, WebSocket and IPC connections side by
//! side and tests can substitute a scripted provider.

use std::path::PathBuf;
use std::sync::Arc;

use alloy::network::Ethereum;
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{
    fillers::{BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller},
    Identity, Provider, ProviderBuilder, RootProvider,
};
use alloy::rpc::types::{Filter, TransactionRequest};
use alloy_sol_types::{SolCall, SolEvent};
use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::infrastructure::ethereum::types::{
    decode_transfer_log, ReceiptStatus, TransferLog, IERC20,
};

/// Provider configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderConfig {
    /// HTTP JSON-RPC endpoint
    Http(String),
    /// WebSocket endpoint
    WebSocket(String),
    /// IPC socket path (Unix only)
    #[cfg(unix)]
    Ipc(PathBuf),
}

impl ProviderConfig {
    /// Get display name for this endpoint
    pub fn display(&self) -> String {
        match self {
            ProviderConfig::Http(url) => url.clone(),
            ProviderConfig::WebSocket(url) => url.clone(),
            #[cfg(unix)]
            ProviderConfig::Ipc(path) => path.display().to_string(),
        }
    }

    /// Check if this endpoint can carry log subscriptions
    pub fn is_streaming(&self) -> bool {
        match self {
            ProviderConfig::Http(_) => false,
            ProviderConfig::WebSocket(_) => true,
            #[cfg(unix)]
            ProviderConfig::Ipc(_) => true,
        }
    }
}

/// Abstract Ethereum provider trait
///
/// The subset of JSON-RPC the sweeper relies on. Implementations must be
/// cheap to share behind an `Arc`.
#[async_trait::async_trait]
pub trait EthereumProvider: Send + Sync + 'static {
    /// Get the current block number (used as the liveness probe)
    async fn block_number(&self) -> Result<u64>;

    /// Get the chain id
    async fn chain_id(&self) -> Result<u64>;

    /// ERC-20 `balanceOf(owner)` on `token`
    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256>;

    /// Current legacy gas price in wei
    async fn gas_price(&self) -> Result<u128>;

    /// Gas limit estimate for a request
    async fn estimate_gas(&self, request: TransactionRequest) -> Result<u64>;

    /// Next nonce for `address`, counting pending transactions
    async fn pending_nonce(&self, address: Address) -> Result<u64>;

    /// Broadcast an already signed, 2718-encoded transaction
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256>;

    /// Receipt status for a transaction, `None` while it is not mined
    async fn receipt_status(&self, hash: B256) -> Result<Option<ReceiptStatus>>;

    /// Subscribe to ERC-20 `Transfer` logs on `token` addressed to `recipient`
    ///
    /// The returned channel closes when the underlying subscription ends,
    /// which callers treat as a lost connection.
    async fn subscribe_transfers(
        &self,
        token: Address,
        recipient: Address,
    ) -> Result<mpsc::Receiver<TransferLog>>;

    /// Check if subscriptions are supported
    fn supports_subscriptions(&self) -> bool;

    /// Get endpoint display name
    fn endpoint_name(&self) -> String;
}

/// Opens provider connections for the endpoint pool
///
/// Reconnection creates a brand new connection object, so the pool goes
/// through this seam rather than cloning an existing handle.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, config: &ProviderConfig) -> Result<Arc<dyn EthereumProvider>>;
}

/// Connector backed by [`create_provider`]
#[derive(Debug, Default, Clone, Copy)]
pub struct AlloyConnector;

#[async_trait::async_trait]
impl Connector for AlloyConnector {
    async fn connect(&self, config: &ProviderConfig) -> Result<Arc<dyn EthereumProvider>> {
        create_provider(config.clone()).await
    }
}

// All transports share the recommended filler stack
type FilledProvider = FillProvider<
    JoinFill<
        Identity,
        JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
    >,
    RootProvider,
    Ethereum,
>;

/// Enum-based provider that remembers which transport it was built on
pub enum AlloyProvider {
    Http {
        provider: FilledProvider,
        endpoint: String,
    },
    WebSocket {
        provider: FilledProvider,
        endpoint: String,
    },
    #[cfg(unix)]
    Ipc {
        provider: FilledProvider,
        endpoint: String,
    },
}

/// Create a provider from configuration
pub async fn create_provider(config: ProviderConfig) -> Result<Arc<dyn EthereumProvider>> {
    match config {
        ProviderConfig::Http(url) => {
            let rpc_url = url.parse().context("Invalid HTTP URL")?;
            let provider = ProviderBuilder::new().connect_http(rpc_url);
            Ok(Arc::new(AlloyProvider::Http {
                provider,
                endpoint: url,
            }))
        }
        ProviderConfig::WebSocket(url) => {
            let provider = ProviderBuilder::new()
                .connect(&url)
                .await
                .context("Failed to create WebSocket provider")?;
            Ok(Arc::new(AlloyProvider::WebSocket {
                provider,
                endpoint: url,
            }))
        }
        #[cfg(unix)]
        ProviderConfig::Ipc(path) => {
            use alloy::providers::IpcConnect;
            let ipc_path = path.to_string_lossy().to_string();
            let ipc = IpcConnect::new(ipc_path);
            let provider = ProviderBuilder::new()
                .connect_ipc(ipc)
                .await
                .context("Failed to create IPC provider")?;
            Ok(Arc::new(AlloyProvider::Ipc {
                provider,
                endpoint: path.display().to_string(),
            }))
        }
    }
}

impl AlloyProvider {
    fn inner(&self) -> &FilledProvider {
        match self {
            AlloyProvider::Http { provider, .. } => provider,
            AlloyProvider::WebSocket { provider, .. } => provider,
            #[cfg(unix)]
            AlloyProvider::Ipc { provider, .. } => provider,
        }
    }
}

#[async_trait::async_trait]
impl EthereumProvider for AlloyProvider {
    async fn block_number(&self) -> Result<u64> {
        Ok(self.inner().get_block_number().await?)
    }

    async fn chain_id(&self) -> Result<u64> {
        Ok(self.inner().get_chain_id().await?)
    }

    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256> {
        let calldata = IERC20::balanceOfCall { owner }.abi_encode();
        let request = TransactionRequest::default()
            .to(token)
            .input(calldata.into());

        let data = self.inner().call(request).await?;
        if data.len() < 32 {
            anyhow::bail!("balanceOf returned {} bytes", data.len());
        }
        Ok(U256::from_be_slice(&data[..32]))
    }

    async fn gas_price(&self) -> Result<u128> {
        Ok(self.inner().get_gas_price().await?)
    }

    async fn estimate_gas(&self, request: TransactionRequest) -> Result<u64> {
        Ok(self.inner().estimate_gas(request).await?)
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64> {
        Ok(self
            .inner()
            .get_transaction_count(address)
            .pending()
            .await?)
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256> {
        let pending = self.inner().send_raw_transaction(&raw).await?;
        Ok(*pending.tx_hash())
    }

    async fn receipt_status(&self, hash: B256) -> Result<Option<ReceiptStatus>> {
        let receipt = self.inner().get_transaction_receipt(hash).await?;
        Ok(receipt.map(|r| ReceiptStatus {
            success: r.status(),
            block_number: r.block_number,
        }))
    }

    async fn subscribe_transfers(
        &self,
        token: Address,
        recipient: Address,
    ) -> Result<mpsc::Receiver<TransferLog>> {
        if !self.supports_subscriptions() {
            // HTTP doesn't support subscriptions, return immediately closed channel
            let (_, rx) = mpsc::channel(1);
            return Ok(rx);
        }

        let filter = Filter::new()
            .address(token)
            .event_signature(IERC20::Transfer::SIGNATURE_HASH)
            .topic2(recipient.into_word());
        let sub = self
            .inner()
            .subscribe_logs(&filter)
            .await
            .context("Failed to subscribe to transfer logs")?;
        let (tx, rx) = mpsc::channel(100);

        tokio::spawn(async move {
            let mut stream = sub.into_stream();
            while let Some(log) = stream.next().await {
                let Some(transfer) = decode_transfer_log(&log) else {
                    continue;
                };
                if tx.send(transfer).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    fn supports_subscriptions(&self) -> bool {
        match self {
            AlloyProvider::Http { .. } => false,
            AlloyProvider::WebSocket { .. } => true,
            #[cfg(unix)]
            AlloyProvider::Ipc { .. } => true,
        }
    }

    fn endpoint_name(&self) -> String {
        match self {
            AlloyProvider::Http { endpoint, .. } => endpoint.clone(),
            AlloyProvider::WebSocket { endpoint, .. } => endpoint.clone(),
            #[cfg(unix)]
            AlloyProvider::Ipc { endpoint, .. } => endpoint.clone(),
        }
    }
}
