//! Ethereum infrastructure - Alloy provider implementations

#[cfg(test)]
pub(crate) mod mock;
mod provider;
mod signer;
pub(crate) mod types;

pub use provider::{
    create_provider, AlloyConnector, Connector, EthereumProvider, ProviderConfig,
};
pub use signer::{SignedTransaction, TxSigner};
pub use types::{ReceiptStatus, TransferLog};
