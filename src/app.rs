//! Sweeper application shell
//!
//! Wires the pool, lock table, sequencer, worker and watcher together,
//! owns the background tasks and answers status requests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use alloy::primitives::Address;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{Config, Tuning};
use crate::domain::{Asset, AssetRegistry};
use crate::infrastructure::ethereum::{AlloyConnector, Connector, ProviderConfig, TxSigner};
use crate::infrastructure::pool::EndpointPool;
use crate::infrastructure::runtime::{LockTable, Sequencer, TransferWorker, Watcher};
use crate::modules::ops::{
    AlertChecker, LogNotifier, Notifier, StatusReport, SweepMetrics, WebhookNotifier,
};

/// Everything needed to start, resolved from the file and the command line
pub struct SweeperSettings {
    pub endpoints: Vec<ProviderConfig>,
    pub destination: Address,
    pub signer: TxSigner,
    pub tokens: Vec<(Address, String, u8)>,
    pub webhook: Option<String>,
    pub tuning: Tuning,
}

impl SweeperSettings {
    pub fn from_config(
        config: &Config,
        cli_rpc: &[String],
        cli_ws: &[String],
        cli_destination: Option<&str>,
    ) -> Result<Self> {
        let destination = match cli_destination {
            Some(raw) => crate::infrastructure::ethereum::types::parse_address(raw)
                .with_context(|| format!("Invalid destination address: {raw}"))?,
            None => config.destination()?,
        };
        let signer = TxSigner::from_private_key(&config.private_key()?)?;

        let tokens = config
            .tokens
            .iter()
            .map(|token| Ok((token.parsed_address()?, token.display_symbol(), token.decimals())))
            .collect::<Result<Vec<_>>>()?;
        if tokens.is_empty() {
            anyhow::bail!("No tokens configured");
        }
        config.tuning.validate()?;

        Ok(Self {
            endpoints: config.resolve_endpoints(cli_rpc, cli_ws),
            destination,
            signer,
            tokens,
            webhook: config.notify.webhook.clone().filter(|url| !url.trim().is_empty()),
            tuning: config.tuning.clone(),
        })
    }
}

pub struct Sweeper {
    started: Instant,
    account: Address,
    destination: Address,
    tuning: Tuning,
    pool: Arc<EndpointPool>,
    assets: Arc<AssetRegistry>,
    locks: Arc<LockTable>,
    sequencer: Arc<Sequencer>,
    watcher: Arc<Watcher>,
    metrics: Arc<SweepMetrics>,
    notifier: Arc<dyn Notifier>,
    alerts: AlertChecker,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Sweeper {
    pub async fn connect(settings: SweeperSettings) -> Result<Arc<Self>> {
        Self::with_connector(settings, Arc::new(AlloyConnector)).await
    }

    pub async fn with_connector(
        settings: SweeperSettings,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Self>> {
        let SweeperSettings {
            endpoints,
            destination,
            signer,
            tokens,
            webhook,
            tuning,
        } = settings;

        let metrics = Arc::new(SweepMetrics::new());
        let pool = EndpointPool::connect(endpoints, connector, tuning.pool_settings(), metrics.clone())
            .await
            .context("Failed to set up endpoint pool")?;
        let chain_id = pool
            .call(|p| async move { p.chain_id().await })
            .await
            .context("Failed to read chain id")?;

        let mut assets = AssetRegistry::new();
        for (address, symbol, decimals) in tokens {
            assets.insert(Asset::new(address, symbol, decimals, destination))?;
        }
        let assets = Arc::new(assets);

        let notifier: Arc<dyn Notifier> = match webhook {
            Some(url) => Arc::new(WebhookNotifier::new(url)?),
            None => Arc::new(LogNotifier),
        };

        let account = signer.address();
        let worker = Arc::new(TransferWorker::new(
            pool.clone(),
            signer,
            destination,
            chain_id,
            tuning.worker_settings(),
            metrics.clone(),
            notifier.clone(),
        ));
        let locks = LockTable::new(tuning.lock_hold_budget(), metrics.clone());
        let sequencer = Sequencer::new(worker, tuning.nonce_retry_delay());
        let watcher = Arc::new(Watcher::new(
            pool.clone(),
            assets.clone(),
            locks.clone(),
            sequencer.clone(),
            account,
            tuning.poll_interval(),
        ));

        info!(
            %account,
            %destination,
            chain_id,
            tokens = assets.len(),
            endpoints = pool.status().await.endpoints.len(),
            "sweeper ready"
        );

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            started: Instant::now(),
            account,
            destination,
            alerts: AlertChecker::new(tuning.failure_alert_threshold, tuning.queue_backlog_alert),
            tuning,
            pool,
            assets,
            locks,
            sequencer,
            watcher,
            metrics,
            notifier,
            last_heartbeat: Mutex::new(None),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Sync the nonce and start every background loop
    pub async fn start(self: &Arc<Self>) {
        if let Err(err) = self.sequencer.init_nonce().await {
            // the drain loop retries before the first submission
            warn!(error = %format!("{err:#}"), "initial nonce read failed");
        }

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            self.pool.clone().run_health_loop(self.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(self.locks.clone().run_sweep_loop(
            self.tuning.lock_sweep_interval(),
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(
            self.watcher.clone().run_event_loop(self.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(
            self.watcher.clone().run_poll_loop(self.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(
            self.clone().run_heartbeat_loop(self.shutdown.subscribe()),
        ));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);

        self.notifier
            .notify(&format!(
                "Sweeper started for {} ({} tokens)",
                self.account,
                self.assets.len()
            ))
            .await;
    }

    async fn run_heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tuning.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.heartbeat().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("heartbeat stopped");
    }

    /// Record a heartbeat, log the status line and any active alerts
    pub async fn heartbeat(&self) -> StatusReport {
        *self
            .last_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        let report = self.status().await;

        info!(target: "sweeper::heartbeat", "{}", report.summary());
        for alert in self.alerts.check_alerts(&report.alert_input()) {
            warn!(target: "sweeper::heartbeat", alert = alert.name, "{}", alert.message);
        }
        report
    }

    pub async fn status(&self) -> StatusReport {
        let held: Vec<String> = self.locks.snapshot().into_iter().map(|l| l.asset).collect();
        let mut locks: BTreeMap<String, bool> = self
            .assets
            .keys()
            .map(|key| (key.to_string(), false))
            .collect();
        for asset in held {
            locks.insert(asset, true);
        }

        let mut report = StatusReport::from_parts(
            self.pool.status().await,
            self.metrics.snapshot(),
            self.sequencer.snapshot().await,
            locks,
        );
        report.account = self.account.to_string();
        report.destination = self.destination.to_string();
        report.uptime_secs = self.started.elapsed().as_secs();
        report.last_heartbeat = *self
            .last_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        report
    }

    pub async fn status_json(&self) -> Result<String> {
        self.status()
            .await
            .to_json()
            .context("Failed to render status")
    }

    pub fn metrics_text(&self) -> String {
        self.metrics.snapshot().render_text()
    }

    /// Admin action: drop every processing lock
    pub fn clear_locks(&self) -> usize {
        let cleared = self.locks.clear_all();
        if cleared > 0 {
            warn!(cleared, "processing locks force-cleared");
        }
        cleared
    }

    /// Stop listeners and loops, let the in-flight job finish, clear locks
    pub async fn shutdown(&self) {
        info!("shutting down");
        let _ = self.shutdown.send(true);

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            let _ = task.await;
        }

        self.sequencer.shutdown().await;
        self.sequencer.wait_idle().await;
        self.clear_locks();
        info!(metrics = %self.metrics_text().replace('\n', " "), "stopped");
    }
}
