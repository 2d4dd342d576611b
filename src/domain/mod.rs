//! Domain models
//!
//! Plain data the sweeper core works on, independent of how it is fetched
//! from the chain.

mod asset;

pub use asset::{Asset, AssetRegistry};
