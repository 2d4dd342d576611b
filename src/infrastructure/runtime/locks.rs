//! Per-asset processing locks
//!
//! A lock is taken by whichever trigger path sees a balance first and is
//! held until the job it belongs to is dropped. The periodic sweep force
//! clears anything idle past the budget; holders refresh their stamp while
//! the queue makes progress, so only a stuck job goes stale. Generations
//! keep a swept guard from releasing a newer holder's lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::modules::ops::metrics::{MetricKind, SweepMetrics};

#[derive(Debug, Clone, Copy)]
struct Held {
    generation: u64,
    since: Instant,
}

/// Lock held for the status document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeldLock {
    pub asset: String,
    pub held_ms: u64,
}

pub struct LockTable {
    held: Mutex<HashMap<String, Held>>,
    next_generation: AtomicU64,
    hold_budget: Duration,
    metrics: Arc<SweepMetrics>,
}

/// Releases its asset lock when dropped
#[must_use = "dropping the guard releases the lock"]
pub struct LockGuard {
    table: Arc<LockTable>,
    asset: String,
    generation: u64,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("asset", &self.asset)
            .field("generation", &self.generation)
            .finish()
    }
}

impl LockGuard {
    /// Restart the stale clock for this lock
    pub fn refresh(&self) {
        self.table.refresh_generation(&self.asset, self.generation);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.table.release_generation(&self.asset, self.generation);
    }
}

impl LockTable {
    pub fn new(hold_budget: Duration, metrics: Arc<SweepMetrics>) -> Arc<Self> {
        Arc::new(Self {
            held: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            hold_budget,
            metrics,
        })
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Held>> {
        // entries are plain data, a panic elsewhere cannot leave them torn
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the lock for `asset`, or `None` if someone already holds it
    pub fn try_acquire(self: &Arc<Self>, asset: &str) -> Option<LockGuard> {
        let mut held = self.table();
        if held.contains_key(asset) {
            return None;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        held.insert(
            asset.to_string(),
            Held {
                generation,
                since: Instant::now(),
            },
        );
        Some(LockGuard {
            table: Arc::clone(self),
            asset: asset.to_string(),
            generation,
        })
    }

    fn refresh_generation(&self, asset: &str, generation: u64) {
        if let Some(held) = self.table().get_mut(asset) {
            if held.generation == generation {
                held.since = Instant::now();
            }
        }
    }

    fn release_generation(&self, asset: &str, generation: u64) {
        let mut held = self.table();
        if held.get(asset).is_some_and(|h| h.generation == generation) {
            held.remove(asset);
        }
    }

    pub fn is_held(&self, asset: &str) -> bool {
        self.table().contains_key(asset)
    }

    /// Force-clear locks held longer than the budget
    pub fn sweep_stale(&self) -> Vec<String> {
        let now = Instant::now();
        let mut cleared = Vec::new();
        {
            let mut held = self.table();
            held.retain(|asset, h| {
                let age = now.saturating_duration_since(h.since);
                if age > self.hold_budget {
                    cleared.push((asset.clone(), age));
                    false
                } else {
                    true
                }
            });
        }

        for (asset, age) in &cleared {
            warn!(asset = %asset, held_ms = age.as_millis() as u64, "force-cleared stale processing lock");
            self.metrics.record(MetricKind::LockReset, true);
        }
        cleared.into_iter().map(|(asset, _)| asset).collect()
    }

    /// Admin force-clear; returns how many locks were dropped
    pub fn clear_all(&self) -> usize {
        let mut held = self.table();
        let count = held.len();
        held.clear();
        count
    }

    pub fn snapshot(&self) -> Vec<HeldLock> {
        let now = Instant::now();
        let mut locks: Vec<HeldLock> = self
            .table()
            .iter()
            .map(|(asset, h)| HeldLock {
                asset: asset.clone(),
                held_ms: now.saturating_duration_since(h.since).as_millis() as u64,
            })
            .collect();
        locks.sort_by(|a, b| a.asset.cmp(&b.asset));
        locks
    }

    /// Sweep stale locks every `every` until shutdown
    pub async fn run_sweep_loop(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_stale();
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("lock sweep stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> (Arc<LockTable>, Arc<SweepMetrics>) {
        let metrics = Arc::new(SweepMetrics::new());
        (LockTable::new(Duration::from_secs(60), metrics.clone()), metrics)
    }

    #[test]
    fn test_second_acquire_is_refused() {
        let (locks, _) = table();
        let guard = locks.try_acquire("0xaa").unwrap();
        assert!(locks.try_acquire("0xaa").is_none());
        assert!(locks.try_acquire("0xbb").is_some());

        drop(guard);
        assert!(!locks.is_held("0xaa"));
        assert!(locks.try_acquire("0xaa").is_some());
    }

    #[test]
    fn test_released_on_panic() {
        let (locks, _) = table();
        let inner = locks.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = inner.try_acquire("0xaa").unwrap();
            panic!("job blew up");
        }));
        assert!(result.is_err());
        assert!(!locks.is_held("0xaa"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_clears_only_stale_locks() {
        let (locks, metrics) = table();
        let _old = locks.try_acquire("0xaa").unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;
        let _young = locks.try_acquire("0xbb").unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(locks.sweep_stale(), vec!["0xaa".to_string()]);
        assert!(locks.is_held("0xbb"));
        assert_eq!(metrics.snapshot().lock_resets, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_swept_guard_does_not_release_new_holder() {
        let (locks, _) = table();
        let stale = locks.try_acquire("0xaa").unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        locks.sweep_stale();

        let fresh = locks.try_acquire("0xaa").unwrap();
        drop(stale);
        assert!(locks.is_held("0xaa"));
        drop(fresh);
        assert!(!locks.is_held("0xaa"));
    }

    #[test]
    fn test_clear_all_and_snapshot() {
        let (locks, _) = table();
        let _a = locks.try_acquire("0xbb").unwrap();
        let _b = locks.try_acquire("0xaa").unwrap();

        let held: Vec<String> = locks.snapshot().into_iter().map(|l| l.asset).collect();
        assert_eq!(held, vec!["0xaa", "0xbb"]);
        assert_eq!(locks.clear_all(), 2);
        assert!(locks.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_restarts_stale_clock() {
        let (locks, metrics) = table();
        let guard = locks.try_acquire("0xaa").unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;
        guard.refresh();
        tokio::time::advance(Duration::from_secs(50)).await;

        assert!(locks.sweep_stale().is_empty());
        assert!(locks.is_held("0xaa"));
        assert_eq!(metrics.snapshot().lock_resets, 0);
    }
}
