//! Application modules
//!
//! - ops: metrics, alerting, notifications and status reporting

pub mod ops;
