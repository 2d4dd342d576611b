//! Asset registry - the tokens being watched and their cached payloads

use std::collections::BTreeMap;
use std::sync::Arc;

use alloy::primitives::{Address, Bytes, U256};
use alloy_sol_types::SolCall;
use anyhow::{bail, Result};

use crate::infrastructure::ethereum::types::{format_token_amount, normalize_address, IERC20};

/// Byte range of the `amount` word in `transfer(address,uint256)` calldata
const AMOUNT_WORD: std::ops::Range<usize> = 36..68;

/// A watched ERC-20 token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    /// Lower-case `0x` address, used as the lock key
    pub key: String,
    pub address: Address,
    pub symbol: String,
    pub decimals: u8,
    /// `transfer(destination, 0)` calldata, encoded once
    transfer_template: Bytes,
}

impl Asset {
    pub fn new(address: Address, symbol: impl Into<String>, decimals: u8, destination: Address) -> Self {
        let template = IERC20::transferCall {
            to: destination,
            amount: U256::ZERO,
        }
        .abi_encode();

        Self {
            key: normalize_address(&address),
            address,
            symbol: symbol.into(),
            decimals,
            transfer_template: template.into(),
        }
    }

    /// Calldata moving `amount` to the destination
    pub fn transfer_payload(&self, amount: U256) -> Bytes {
        let mut payload = self.transfer_template.to_vec();
        payload[AMOUNT_WORD].copy_from_slice(&amount.to_be_bytes::<32>());
        payload.into()
    }

    pub fn format_amount(&self, amount: U256) -> String {
        format!("{} {}", format_token_amount(amount, self.decimals), self.symbol)
    }
}

/// Immutable set of assets built at startup
#[derive(Debug, Default)]
pub struct AssetRegistry {
    assets: Vec<Arc<Asset>>,
    by_address: BTreeMap<Address, usize>,
}

impl AssetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an asset; each address may only be registered once
    pub fn insert(&mut self, asset: Asset) -> Result<()> {
        if self.by_address.contains_key(&asset.address) {
            bail!("Duplicate token {}", asset.key);
        }
        self.by_address.insert(asset.address, self.assets.len());
        self.assets.push(Arc::new(asset));
        Ok(())
    }

    pub fn get(&self, address: &Address) -> Option<&Arc<Asset>> {
        self.by_address.get(address).map(|&i| &self.assets[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Asset>> {
        self.assets.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.assets.iter().map(|a| a.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    const USDC: Address = address!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
    const SAFE: Address = address!("00000000000000000000000000000000000000aa");

    #[test]
    fn test_payload_patches_amount() {
        let asset = Asset::new(USDC, "USDC", 6, SAFE);
        let amount = U256::from(1_000u64);
        let payload = asset.transfer_payload(amount);

        let expected = IERC20::transferCall { to: SAFE, amount }.abi_encode();
        assert_eq!(payload.as_ref(), expected.as_slice());
        // the cached template stays zeroed
        assert!(asset.transfer_payload(U256::ZERO)[36..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_key_is_lowercase() {
        let asset = Asset::new(USDC, "USDC", 6, SAFE);
        assert_eq!(asset.key, "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
        assert_eq!(asset.format_amount(U256::from(1_500_000u64)), "1.5 USDC");
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = AssetRegistry::new();
        registry.insert(Asset::new(USDC, "USDC", 6, SAFE)).unwrap();
        assert!(registry.insert(Asset::new(USDC, "USDC2", 6, SAFE)).is_err());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&USDC).unwrap().symbol, "USDC");
    }
}
