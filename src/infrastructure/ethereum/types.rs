//! ERC-20 bindings and conversions between Alloy types and sweeper types

use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::Log;
use alloy_sol_types::{sol, SolEvent};

sol! {
    interface IERC20 {
        function balanceOf(address owner) external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);
        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}

/// Decoded inbound `Transfer` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLog {
    pub token: Address,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub block_number: Option<u64>,
    pub tx_hash: Option<B256>,
}

/// Mined transaction outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptStatus {
    pub success: bool,
    pub block_number: Option<u64>,
}

/// Decode an RPC log into a [`TransferLog`], ignoring anything that is not
/// a well-formed ERC-20 `Transfer`
pub fn decode_transfer_log(log: &Log) -> Option<TransferLog> {
    let topics = log.inner.data.topics();
    if topics.len() != 3 || topics[0] != IERC20::Transfer::SIGNATURE_HASH {
        return None;
    }
    let data = &log.inner.data.data;
    if data.len() < 32 {
        return None;
    }

    Some(TransferLog {
        token: log.inner.address,
        from: Address::from_word(topics[1]),
        to: Address::from_word(topics[2]),
        value: U256::from_be_slice(&data[..32]),
        block_number: log.block_number,
        tx_hash: log.transaction_hash,
    })
}

/// Format token amount with decimals
pub fn format_token_amount(value: U256, decimals: u8) -> String {
    if decimals == 0 {
        return value.to_string();
    }

    let divisor = U256::from(10u64).pow(U256::from(decimals));
    let whole = value / divisor;
    let frac = value % divisor;

    if frac.is_zero() {
        whole.to_string()
    } else {
        let frac_str = format!("{:0>width$}", frac, width = decimals as usize);
        let trimmed = frac_str.trim_end_matches('0');
        format!("{}.{}", whole, trimmed)
    }
}

/// Gas price in gwei for log lines
pub fn format_gwei(wei: u128) -> String {
    format!("{:.3}", wei as f64 / 1e9)
}

/// Parse a hex address string to Address
pub fn parse_address(s: &str) -> Option<Address> {
    let trimmed = s.trim();
    let normalized = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if normalized.len() != 40 {
        return None;
    }
    let bytes = hex::decode(normalized).ok()?;
    Some(Address::from_slice(&bytes))
}

/// Lower-case `0x`-prefixed form used as the asset key
pub fn normalize_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_slice()))
}
