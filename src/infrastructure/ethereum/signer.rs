//! Local key signing for sweep transactions

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, B256};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use anyhow::{Context, Result};

/// A signed transaction ready for `eth_sendRawTransaction`
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub hash: B256,
    pub raw: Bytes,
}

/// Wallet for the monitored account
#[derive(Clone)]
pub struct TxSigner {
    wallet: EthereumWallet,
    address: Address,
}

impl TxSigner {
    pub fn from_private_key(key: &str) -> Result<Self> {
        let signer: PrivateKeySigner = key
            .trim()
            .parse()
            .context("Invalid private key")?;
        Ok(Self::from_signer(signer))
    }

    pub fn from_signer(signer: PrivateKeySigner) -> Self {
        let address = signer.address();
        Self {
            wallet: EthereumWallet::from(signer),
            address,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Sign a fully populated request
    pub async fn sign(&self, request: TransactionRequest) -> Result<SignedTransaction> {
        let envelope = request
            .with_from(self.address)
            .build(&self.wallet)
            .await
            .context("Failed to sign transaction")?;

        Ok(SignedTransaction {
            hash: *envelope.tx_hash(),
            raw: envelope.encoded_2718().into(),
        })
    }
}

impl std::fmt::Debug for TxSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{keccak256, U256};

    #[tokio::test]
    async fn test_sign_legacy_transfer() {
        let signer = TxSigner::from_signer(PrivateKeySigner::random());
        let request = TransactionRequest::default()
            .with_to(Address::repeat_byte(0x11))
            .with_input(vec![0xa9, 0x05, 0x9c, 0xbb])
            .with_value(U256::ZERO)
            .with_nonce(3)
            .with_gas_price(1_000_000_000)
            .with_gas_limit(60_000)
            .with_chain_id(1);

        let signed = signer.sign(request).await.unwrap();
        assert!(!signed.raw.is_empty());
        assert_eq!(keccak256(&signed.raw), signed.hash);
    }

    #[test]
    fn test_rejects_bad_key() {
        assert!(TxSigner::from_private_key("0xnothex").is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let signer = TxSigner::from_signer(PrivateKeySigner::random());
        let rendered = format!("{signer:?}");
        assert!(rendered.contains("address"));
        assert!(!rendered.contains("wallet"));
    }
}
