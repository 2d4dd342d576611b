//! Balance watcher - transfer-event subscriptions and a periodic poll
//!
//! Both paths take the asset's processing lock before enqueueing, so a
//! balance seen by an event and by the poll at the same time is swept once.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, U256};
use futures::future::join_all;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::locks::LockTable;
use super::sequencer::{Job, Sequencer, Trigger};
use crate::domain::{Asset, AssetRegistry};
use crate::infrastructure::ethereum::TransferLog;
use crate::infrastructure::pool::{EndpointPool, PoolEvent};

pub struct Watcher {
    pool: Arc<EndpointPool>,
    assets: Arc<AssetRegistry>,
    locks: Arc<LockTable>,
    sequencer: Arc<Sequencer>,
    account: Address,
    poll_interval: Duration,
}

/// Live subscriptions on one endpoint, merged into a single channel
struct Binding {
    endpoint: usize,
    logs: mpsc::Receiver<TransferLog>,
    forwarders: Vec<JoinHandle<()>>,
}

impl Drop for Binding {
    fn drop(&mut self) {
        for task in &self.forwarders {
            task.abort();
        }
    }
}

impl Watcher {
    pub fn new(
        pool: Arc<EndpointPool>,
        assets: Arc<AssetRegistry>,
        locks: Arc<LockTable>,
        sequencer: Arc<Sequencer>,
        account: Address,
        poll_interval: Duration,
    ) -> Self {
        Self {
            pool,
            assets,
            locks,
            sequencer,
            account,
            poll_interval,
        }
    }

    /// Lock and enqueue `asset`; `false` when it is already being handled
    pub async fn trigger(&self, asset: &Arc<Asset>, source: Trigger) -> bool {
        let Some(lock) = self.locks.try_acquire(&asset.key) else {
            debug!(asset = %asset.symbol, trigger = ?source, "already processing, skipped");
            return false;
        };
        self.sequencer
            .enqueue(Job::new(Arc::clone(asset), source, lock))
            .await
    }

    /// Read every balance concurrently and enqueue the non-zero ones
    pub async fn poll_once(&self) -> usize {
        let account = self.account;
        let reads = self.assets.iter().map(|asset| {
            let token = asset.address;
            async move {
                let balance = self
                    .pool
                    .call(|p| async move { p.token_balance(token, account).await })
                    .await;
                (asset, balance)
            }
        });

        let mut queued = 0;
        for (asset, balance) in join_all(reads).await {
            match balance {
                Ok(balance) if balance > U256::ZERO => {
                    if self.trigger(asset, Trigger::Poll).await {
                        queued += 1;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(asset = %asset.symbol, error = %format!("{err:#}"), "balance poll failed")
                }
            }
        }
        queued
    }

    pub async fn run_poll_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("poll loop stopped");
    }

    async fn bind(&self) -> Option<Binding> {
        let (endpoint, provider) = self.pool.subscription_provider().await?;

        let (tx, logs) = mpsc::channel(64);
        let mut forwarders = Vec::with_capacity(self.assets.len());
        for asset in self.assets.iter() {
            match provider.subscribe_transfers(asset.address, self.account).await {
                Ok(mut rx) => {
                    let tx = tx.clone();
                    forwarders.push(tokio::spawn(async move {
                        while let Some(log) = rx.recv().await {
                            if tx.send(log).await.is_err() {
                                break;
                            }
                        }
                    }));
                }
                Err(err) => {
                    warn!(endpoint, asset = %asset.symbol, error = %format!("{err:#}"), "transfer subscription failed");
                }
            }
        }

        if forwarders.is_empty() {
            return None;
        }
        info!(endpoint, subscriptions = forwarders.len(), "transfer subscriptions active");
        Some(Binding {
            endpoint,
            logs,
            forwarders,
        })
    }

    /// Keep transfer subscriptions alive across endpoint changes until shutdown
    pub async fn run_event_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.pool.subscribe();
        let mut binding = self.bind().await;
        if binding.is_none() {
            info!("no subscription endpoint available, relying on balance polling");
        }

        loop {
            tokio::select! {
                log = async {
                    match binding.as_mut() {
                        Some(b) => b.logs.recv().await,
                        None => std::future::pending().await,
                    }
                } => match log {
                    Some(log) => self.on_transfer(log).await,
                    None => {
                        // every forwarder ended: the stream died with its connection
                        if let Some(lost) = binding.take() {
                            warn!(endpoint = lost.endpoint, "transfer subscription ended");
                            self.pool.report_connection_lost(lost.endpoint).await;
                        }
                        binding = self.bind().await;
                    }
                },
                event = events.recv() => match event {
                    Ok(PoolEvent::SelectionChanged { .. } | PoolEvent::Reconnected { .. })
                    | Err(RecvError::Lagged(_)) => {
                        drop(binding.take());
                        binding = self.bind().await;
                    }
                    Ok(PoolEvent::NoEndpoints) => {}
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("event loop stopped");
    }

    async fn on_transfer(&self, log: TransferLog) {
        if log.to != self.account {
            return;
        }
        let Some(asset) = self.assets.get(&log.token) else {
            return;
        };
        debug!(asset = %asset.symbol, from = %log.from, value = %log.value, tx = ?log.tx_hash, "inbound transfer");
        self.trigger(asset, Trigger::Event).await;
    }
}
