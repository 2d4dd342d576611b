//! Infrastructure layer - External service integrations
//!
//! This layer contains:
//! - Alloy-based Ethereum provider implementations and local signing
//! - The multi-endpoint connection pool
//! - The Tokio tasks that watch balances and submit sweeps

pub mod ethereum;
pub mod pool;
pub mod runtime;
