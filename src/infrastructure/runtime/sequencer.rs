//! Per-account transaction sequencer
//!
//! Owns the authoritative next nonce and a FIFO of sweep jobs. A single
//! drain task runs jobs one at a time in arrival order, so at most one
//! nonce-bearing submission is ever in flight.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use super::locks::LockGuard;
use crate::domain::Asset;

/// What noticed the balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Event,
    Poll,
}

/// One queued sweep; owns the asset's processing lock until dropped
#[derive(Debug)]
pub struct Job {
    pub asset: Arc<Asset>,
    pub trigger: Trigger,
    lock: LockGuard,
}

impl Job {
    pub fn new(asset: Arc<Asset>, trigger: Trigger, lock: LockGuard) -> Self {
        Self {
            asset,
            trigger,
            lock,
        }
    }

    fn refresh_lock(&self) {
        self.lock.refresh();
    }
}

/// How a finished job moves the nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceHandoff {
    /// A transaction with this nonce was confirmed
    Used(u64),
    /// Nothing was submitted
    Unchanged,
    /// The chain view is unknown; re-read before the next job
    Resync,
    /// No endpoint answered; the job goes back to the head of the queue
    /// and waits behind a fresh nonce read
    Deferred,
}

/// Executes jobs for the sequencer
#[async_trait::async_trait]
pub trait JobRunner: Send + Sync + 'static {
    /// Pending transaction count of the account
    async fn pending_nonce(&self) -> Result<u64>;

    async fn run(&self, job: &Job, nonce: u64) -> NonceHandoff;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequencerSnapshot {
    pub nonce: Option<u64>,
    pub queue_depth: usize,
    pub draining: bool,
    pub stopping: bool,
}

#[derive(Default)]
struct SequencerState {
    nonce: Option<u64>,
    queue: VecDeque<Job>,
    draining: bool,
    stopping: bool,
}

pub struct Sequencer {
    state: Mutex<SequencerState>,
    runner: Arc<dyn JobRunner>,
    idle: Notify,
    nonce_retry_delay: Duration,
}

impl Sequencer {
    pub fn new(runner: Arc<dyn JobRunner>, nonce_retry_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SequencerState::default()),
            runner,
            idle: Notify::new(),
            nonce_retry_delay,
        })
    }

    /// Read the pending count from the chain and make it the next nonce
    pub async fn init_nonce(&self) -> Result<u64> {
        let nonce = self.runner.pending_nonce().await?;
        self.state.lock().await.nonce = Some(nonce);
        info!(nonce, "nonce synchronised from chain");
        Ok(nonce)
    }

    /// Queue a job and start draining if idle
    ///
    /// Returns `false` (and drops the job, releasing its lock) once shutdown
    /// has begun.
    pub async fn enqueue(self: &Arc<Self>, job: Job) -> bool {
        let start = {
            let mut state = self.state.lock().await;
            if state.stopping {
                return false;
            }
            debug!(asset = %job.asset.symbol, trigger = ?job.trigger, depth = state.queue.len() + 1, "job queued");
            state.queue.push_back(job);
            !std::mem::replace(&mut state.draining, true)
        };

        if start {
            let sequencer = Arc::clone(self);
            tokio::spawn(async move { sequencer.process().await });
        }
        true
    }

    /// Drain the queue in order, one job at a time, until it is empty
    async fn process(self: Arc<Self>) {
        loop {
            let (job, nonce) = {
                let mut state = self.state.lock().await;
                if state.stopping || state.queue.is_empty() {
                    state.draining = false;
                    self.idle.notify_waiters();
                    return;
                }
                // a moving or stalled queue is not a stuck one
                state.queue.iter().for_each(Job::refresh_lock);
                let current = state.nonce;
                match current {
                    Some(nonce) => match state.queue.pop_front() {
                        Some(job) => (job, nonce),
                        None => continue,
                    },
                    None => {
                        drop(state);
                        if let Err(err) = self.init_nonce().await {
                            warn!(
                                error = %format!("{err:#}"),
                                retry_ms = self.nonce_retry_delay.as_millis() as u64,
                                "cannot read account nonce, submissions stalled"
                            );
                            tokio::time::sleep(self.nonce_retry_delay).await;
                        }
                        continue;
                    }
                }
            };

            let handoff = self.runner.run(&job, nonce).await;

            let mut state = self.state.lock().await;
            match handoff {
                NonceHandoff::Used(used) => state.nonce = Some(used + 1),
                NonceHandoff::Unchanged => {}
                NonceHandoff::Resync => state.nonce = None,
                NonceHandoff::Deferred => {
                    state.nonce = None;
                    if !state.stopping {
                        debug!(asset = %job.asset.symbol, "job requeued until an endpoint answers");
                        state.queue.push_front(job);
                        drop(state);
                        tokio::time::sleep(self.nonce_retry_delay).await;
                    }
                }
            }
        }
    }

    /// Stop after the in-flight job; queued jobs are dropped
    pub async fn shutdown(&self) {
        let dropped = {
            let mut state = self.state.lock().await;
            state.stopping = true;
            let dropped = state.queue.len();
            state.queue.clear();
            if !state.draining {
                self.idle.notify_waiters();
            }
            dropped
        };
        if dropped > 0 {
            info!(dropped, "discarded queued jobs on shutdown");
        }
    }

    /// Wait until no drain task is running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if !self.state.lock().await.draining {
                return;
            }
            notified.await;
        }
    }

    pub async fn snapshot(&self) -> SequencerSnapshot {
        let state = self.state.lock().await;
        SequencerSnapshot {
            nonce: state.nonce,
            queue_depth: state.queue.len(),
            draining: state.draining,
            stopping: state.stopping,
        }
    }
}
