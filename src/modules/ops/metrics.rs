//! Metrics tracking
//!
//! Counters are plain atomics so every component can record without taking
//! a lock; readers get a consistent-enough [`MetricsSnapshot`].

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// What a [`SweepMetrics::record`] call is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A transfer job reached a terminal outcome
    Transfer,
    /// An endpoint reconnection finished
    Reconnect,
    /// The stale-lock sweep force-cleared a lock
    LockReset,
}

/// Counter collector shared by the whole process
#[derive(Debug, Default)]
pub struct SweepMetrics {
    total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU64,
    reconnections: AtomicU64,
    lock_resets: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u64,
    pub reconnections: u64,
    pub lock_resets: u64,
    pub success_rate: f64,
}

impl SweepMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one state transition
    pub fn record(&self, kind: MetricKind, ok: bool) {
        match kind {
            MetricKind::Transfer => {
                self.total.fetch_add(1, Ordering::Relaxed);
                if ok {
                    self.successes.fetch_add(1, Ordering::Relaxed);
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                } else {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
            MetricKind::Reconnect => {
                if ok {
                    self.reconnections.fetch_add(1, Ordering::Relaxed);
                }
            }
            MetricKind::LockReset => {
                self.lock_resets.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let successes = self.successes.load(Ordering::Relaxed);
        let success_rate = if total > 0 {
            (successes as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        MetricsSnapshot {
            total,
            successes,
            failures: self.failures.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures(),
            reconnections: self.reconnections.load(Ordering::Relaxed),
            lock_resets: self.lock_resets.load(Ordering::Relaxed),
            success_rate,
        }
    }
}

impl MetricsSnapshot {
    /// Raw metrics document, one `name value` pair per line
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let rows: [(&str, String); 7] = [
            ("sweeper_transfers_total", self.total.to_string()),
            ("sweeper_transfers_success", self.successes.to_string()),
            ("sweeper_transfers_failed", self.failures.to_string()),
            (
                "sweeper_consecutive_failures",
                self.consecutive_failures.to_string(),
            ),
            ("sweeper_reconnections", self.reconnections.to_string()),
            ("sweeper_lock_resets", self.lock_resets.to_string()),
            ("sweeper_success_rate", format!("{:.2}", self.success_rate)),
        ];
        for (name, value) in rows {
            let _ = writeln!(out, "{name} {value}");
        }
        out
    }
}
