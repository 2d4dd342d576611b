//! Multi-endpoint connection pool
//!
//! Keeps one connection per configured RPC endpoint, ranks them by measured
//! latency and fails over between them. Every network call the sweeper makes
//! goes through [`EndpointPool::call`] (fast path on the selected endpoint,
//! then ordered fallback) or [`EndpointPool::call_with_fallback`].

mod endpoint;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::infrastructure::ethereum::{Connector, EthereumProvider, ProviderConfig};
use crate::modules::ops::metrics::{MetricKind, SweepMetrics};

pub use endpoint::{EndpointState, EndpointStatus};
use endpoint::Endpoint;

/// Pool timing knobs
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Upper bound for any single RPC call, including liveness probes
    pub call_timeout: Duration,
    /// Health tick interval
    pub health_interval: Duration,
    /// Reconnect delay is `base × attempt`
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            health_interval: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_secs(2),
            max_reconnect_attempts: 5,
        }
    }
}

/// Notifications for components holding on to a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    SelectionChanged { from: usize, to: usize },
    Reconnected { index: usize },
    NoEndpoints,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no endpoints configured")]
    Empty,
    /// `errors` holds one entry per failed call, fast path included
    #[error("all {attempted} connected endpoints failed: {}", .errors.join("; "))]
    AllEndpointsFailed {
        attempted: usize,
        errors: Vec<String>,
    },
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

/// Read-only view of the pool for the status document
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStatus {
    pub selected: usize,
    pub endpoints: Vec<EndpointStatus>,
}

impl PoolStatus {
    pub fn all_unreachable(&self) -> bool {
        self.endpoints
            .iter()
            .all(|e| e.state != EndpointState::Healthy)
    }
}

struct PoolState {
    endpoints: Vec<Endpoint>,
    selected: usize,
}

pub struct EndpointPool {
    state: RwLock<PoolState>,
    connector: Arc<dyn Connector>,
    settings: PoolSettings,
    events: broadcast::Sender<PoolEvent>,
    metrics: Arc<SweepMetrics>,
}

impl EndpointPool {
    /// Connect to every configured endpoint, measure, and select
    ///
    /// Endpoints that fail to connect start unreachable with a reconnect
    /// task already running; the pool itself only fails when `configs` is
    /// empty.
    pub async fn connect(
        configs: Vec<ProviderConfig>,
        connector: Arc<dyn Connector>,
        settings: PoolSettings,
        metrics: Arc<SweepMetrics>,
    ) -> Result<Arc<Self>> {
        if configs.is_empty() {
            return Err(PoolError::Empty.into());
        }

        let mut endpoints = Vec::with_capacity(configs.len());
        for config in configs {
            let provider = match connector.connect(&config).await {
                Ok(provider) => Some(provider),
                Err(err) => {
                    warn!(endpoint = %config.display(), error = %format!("{err:#}"), "initial connection failed");
                    None
                }
            };
            endpoints.push(Endpoint::new(config, provider));
        }

        let pool = Self::from_endpoints(endpoints, connector, settings, metrics);
        let missing: Vec<usize> = {
            let mut state = pool.state.write().await;
            state
                .endpoints
                .iter_mut()
                .enumerate()
                .filter(|(_, e)| e.provider.is_none())
                .map(|(index, e)| {
                    e.begin_reconnect();
                    index
                })
                .collect()
        };
        for index in missing {
            pool.spawn_reconnect(index);
        }

        pool.measure_all().await;
        pool.select_best().await;
        Ok(pool)
    }

    /// Build a pool around already open connections
    pub fn with_providers(
        providers: Vec<(ProviderConfig, Arc<dyn EthereumProvider>)>,
        connector: Arc<dyn Connector>,
        settings: PoolSettings,
        metrics: Arc<SweepMetrics>,
    ) -> Arc<Self> {
        let endpoints = providers
            .into_iter()
            .map(|(config, provider)| Endpoint::new(config, Some(provider)))
            .collect();
        Self::from_endpoints(endpoints, connector, settings, metrics)
    }

    fn from_endpoints(
        endpoints: Vec<Endpoint>,
        connector: Arc<dyn Connector>,
        settings: PoolSettings,
        metrics: Arc<SweepMetrics>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            state: RwLock::new(PoolState {
                endpoints,
                selected: 0,
            }),
            connector,
            settings,
            events,
            metrics,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Probe every connected endpoint concurrently and record the results
    ///
    /// Never fails: errors and timeouts mark the endpoint unreachable, and a
    /// closed transport additionally hands the endpoint to a reconnect task.
    pub async fn measure_all(self: &Arc<Self>) {
        let targets: Vec<(usize, u64, Arc<dyn EthereumProvider>)> = {
            let state = self.state.read().await;
            state
                .endpoints
                .iter()
                .enumerate()
                .filter_map(|(index, e)| e.provider.clone().map(|p| (index, e.generation, p)))
                .collect()
        };

        let timeout = self.settings.call_timeout;
        let probes = targets.into_iter().map(|(index, generation, provider)| async move {
            let started = Instant::now();
            let measured = match tokio::time::timeout(timeout, provider.block_number()).await {
                Ok(Ok(_)) => Ok(started.elapsed()),
                Ok(Err(err)) => Err(format!("{err:#}")),
                Err(_) => Err(format!("timed out after {timeout:?}")),
            };
            (index, generation, measured)
        });
        let results = join_all(probes).await;

        let mut lost = Vec::new();
        {
            let mut state = self.state.write().await;
            for (index, generation, measured) in results {
                let endpoint = &mut state.endpoints[index];
                if endpoint.generation != generation {
                    continue;
                }
                match measured {
                    Ok(latency) => {
                        debug!(endpoint = %endpoint.config.display(), latency_ms = latency.as_millis() as u64, "endpoint healthy");
                        endpoint.record_latency(latency);
                    }
                    Err(err) => {
                        debug!(endpoint = %endpoint.config.display(), error = %err, "endpoint unreachable");
                        if is_connection_closed(&err) {
                            endpoint.begin_reconnect();
                            lost.push(index);
                        } else {
                            endpoint.mark_unreachable();
                        }
                    }
                }
            }
        }

        for index in lost {
            self.spawn_reconnect(index);
        }
    }

    /// Point the selection at the lowest-latency healthy endpoint
    ///
    /// Returns the selected index, or `None` (selection untouched, a
    /// [`PoolEvent::NoEndpoints`] emitted) when nothing is reachable.
    pub async fn select_best(&self) -> Option<usize> {
        let mut state = self.state.write().await;
        let best = state
            .endpoints
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_selectable())
            .min_by_key(|(_, e)| e.latency)
            .map(|(index, _)| index);

        let Some(index) = best else {
            drop(state);
            warn!("no reachable endpoints");
            let _ = self.events.send(PoolEvent::NoEndpoints);
            return None;
        };

        let previous = state.selected;
        state.selected = index;
        let name = state.endpoints[index].config.display();
        drop(state);

        if previous != index {
            info!(from = previous, to = index, endpoint = %name, "selected endpoint changed");
            let _ = self.events.send(PoolEvent::SelectionChanged {
                from: previous,
                to: index,
            });
        }
        Some(index)
    }

    /// The selected connection, if it is currently healthy
    pub async fn current(&self) -> Option<(usize, Arc<dyn EthereumProvider>)> {
        let state = self.state.read().await;
        let endpoint = state.endpoints.get(state.selected)?;
        if endpoint.state != EndpointState::Healthy {
            return None;
        }
        endpoint.provider.clone().map(|p| (state.selected, p))
    }

    /// A healthy endpoint that can carry log subscriptions, preferring the
    /// selected one and then the lowest latency
    pub async fn subscription_provider(&self) -> Option<(usize, Arc<dyn EthereumProvider>)> {
        let state = self.state.read().await;
        let streaming = |e: &Endpoint| {
            e.is_selectable()
                && e.provider
                    .as_ref()
                    .is_some_and(|p| p.supports_subscriptions())
        };

        if let Some(endpoint) = state.endpoints.get(state.selected) {
            if streaming(endpoint) {
                return endpoint.provider.clone().map(|p| (state.selected, p));
            }
        }
        state
            .endpoints
            .iter()
            .enumerate()
            .filter(|(_, e)| streaming(*e))
            .min_by_key(|(_, e)| e.latency)
            .and_then(|(index, e)| e.provider.clone().map(|p| (index, p)))
    }

    /// Fast path on the selected endpoint, then [`Self::call_with_fallback`]
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn EthereumProvider>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut errors = Vec::new();
        if let Some((index, provider)) = self.current().await {
            match self.timed(op(provider)).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let message = format!("{err:#}");
                    debug!(endpoint = index, error = %message, "fast path failed, falling back");
                    errors.push(message);
                }
            }
        }
        self.fallback(op, errors).await
    }

    /// Run `op` against each endpoint in configuration order until one
    /// succeeds; fails only when every endpoint failed
    pub async fn call_with_fallback<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn EthereumProvider>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.fallback(op, Vec::new()).await
    }

    async fn fallback<T, F, Fut>(&self, op: F, mut errors: Vec<String>) -> Result<T>
    where
        F: Fn(Arc<dyn EthereumProvider>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let providers: Vec<(usize, Arc<dyn EthereumProvider>)> = {
            let state = self.state.read().await;
            state
                .endpoints
                .iter()
                .enumerate()
                .filter_map(|(index, e)| e.provider.clone().map(|p| (index, p)))
                .collect()
        };

        let attempted = providers.len();
        for (index, provider) in providers {
            match self.timed(op(provider)).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let message = format!("{err:#}");
                    debug!(endpoint = index, error = %message, "fallback call failed");
                    errors.push(message);
                }
            }
        }

        Err(PoolError::AllEndpointsFailed { attempted, errors }.into())
    }

    async fn timed<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout = self.settings.call_timeout;
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::Timeout(timeout).into()),
        }
    }

    /// Handle a connection-closed signal for endpoint `index`
    ///
    /// Drops the dead connection, re-ranks the remaining endpoints and
    /// starts a bounded reconnect task. A second signal while the
    /// endpoint is already reconnecting is ignored.
    pub async fn report_connection_lost(self: &Arc<Self>, index: usize) {
        {
            let mut state = self.state.write().await;
            let Some(endpoint) = state.endpoints.get_mut(index) else {
                return;
            };
            if endpoint.state == EndpointState::Reconnecting {
                return;
            }
            warn!(endpoint = %endpoint.config.display(), "connection closed");
            endpoint.begin_reconnect();
        }

        self.measure_all().await;
        self.select_best().await;
        self.spawn_reconnect(index);
    }

    fn spawn_reconnect(self: &Arc<Self>, index: usize) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.reconnect(index).await;
        });
    }

    /// Bounded reconnect loop for endpoint `index`
    ///
    /// Waits `base × attempt` before each attempt. A new connection only
    /// counts once it answers a liveness probe. Returns whether the
    /// endpoint is healthy again.
    pub async fn reconnect(&self, index: usize) -> bool {
        let config = {
            let state = self.state.read().await;
            match state.endpoints.get(index) {
                Some(endpoint) => endpoint.config.clone(),
                None => return false,
            }
        };
        let name = config.display();

        for attempt in 1..=self.settings.max_reconnect_attempts {
            let delay = reconnect_delay(self.settings.reconnect_base_delay, attempt);
            {
                let mut state = self.state.write().await;
                state.endpoints[index].reconnect_attempts = attempt;
            }
            debug!(endpoint = %name, attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            tokio::time::sleep(delay).await;

            let provider = match self.connector.connect(&config).await {
                Ok(provider) => provider,
                Err(err) => {
                    warn!(endpoint = %name, attempt, error = %format!("{err:#}"), "reconnect failed");
                    self.metrics.record(MetricKind::Reconnect, false);
                    continue;
                }
            };

            let started = Instant::now();
            let probe =
                tokio::time::timeout(self.settings.call_timeout, provider.block_number()).await;
            match probe {
                Ok(Ok(_)) => {
                    let latency = started.elapsed();
                    {
                        let mut state = self.state.write().await;
                        let endpoint = &mut state.endpoints[index];
                        endpoint.install(provider);
                        endpoint.record_latency(latency);
                    }
                    info!(endpoint = %name, attempt, "endpoint reconnected");
                    self.metrics.record(MetricKind::Reconnect, true);
                    let _ = self.events.send(PoolEvent::Reconnected { index });
                    self.select_best().await;
                    return true;
                }
                Ok(Err(err)) => {
                    warn!(endpoint = %name, attempt, error = %format!("{err:#}"), "reconnected endpoint failed probe");
                }
                Err(_) => {
                    warn!(endpoint = %name, attempt, "reconnected endpoint probe timed out");
                }
            }
            self.metrics.record(MetricKind::Reconnect, false);
        }

        {
            let mut state = self.state.write().await;
            state.endpoints[index].state = EndpointState::Unreachable;
        }
        error!(
            endpoint = %name,
            attempts = self.settings.max_reconnect_attempts,
            "giving up on endpoint until a later health tick"
        );
        false
    }

    /// One plain connection attempt for endpoints whose reconnect task gave
    /// up; the next probe decides whether they are healthy again
    async fn revive_abandoned(&self) {
        let abandoned: Vec<(usize, ProviderConfig)> = {
            let state = self.state.read().await;
            state
                .endpoints
                .iter()
                .enumerate()
                .filter(|(_, e)| e.provider.is_none() && e.state == EndpointState::Unreachable)
                .map(|(index, e)| (index, e.config.clone()))
                .collect()
        };

        for (index, config) in abandoned {
            if let Ok(provider) = self.connector.connect(&config).await {
                let mut state = self.state.write().await;
                let endpoint = &mut state.endpoints[index];
                if endpoint.provider.is_none() && endpoint.state == EndpointState::Unreachable {
                    endpoint.install(provider);
                }
            }
        }
    }

    /// One health tick: revive abandoned endpoints, measure, select
    pub async fn health_tick(self: &Arc<Self>) {
        self.revive_abandoned().await;
        self.measure_all().await;
        self.select_best().await;
    }

    /// Re-probe every endpoint and report whether none of them answers
    pub async fn confirm_outage(self: &Arc<Self>) -> bool {
        self.measure_all().await;
        self.status().await.all_unreachable()
    }

    /// Run health ticks until shutdown
    pub async fn run_health_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.health_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately and the pool was just measured
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.health_tick().await,
                _ = shutdown.changed() => break,
            }
        }
        debug!("health loop stopped");
    }

    pub async fn status(&self) -> PoolStatus {
        let state = self.state.read().await;
        PoolStatus {
            selected: state.selected,
            endpoints: state
                .endpoints
                .iter()
                .enumerate()
                .map(|(index, e)| e.status(index, state.selected))
                .collect(),
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based)
pub fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt)
}

/// Whether a probe error means the transport itself is gone
///
/// Only a dropped socket or a stopped pubsub backend counts. Refused or
/// failed requests leave the connection in place and mark the endpoint
/// unreachable; HTTP clients are stateless, so a fresh one would fail the
/// same way, and the next health tick probes the endpoint again.
fn is_connection_closed(error: &str) -> bool {
    let lower = error.to_lowercase();
    [
        "connection closed",
        "backend connection task has stopped",
        "connection reset",
        "broken pipe",
        "pubsub service",
    ]
    .iter()
    .any(|marker| lower.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::ethereum::mock::{MockConnector, MockProvider};
    use alloy::primitives::Bytes;
    use std::sync::atomic::Ordering;

    fn settings() -> PoolSettings {
        PoolSettings {
            call_timeout: Duration::from_secs(1),
            health_interval: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 3,
        }
    }

    fn pool_of(
        providers: &[Arc<MockProvider>],
        connector: MockConnector,
    ) -> Arc<EndpointPool> {
        let entries = providers
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let provider: Arc<dyn EthereumProvider> = p.clone();
                (ProviderConfig::Http(format!("http://node-{i}")), provider)
            })
            .collect();
        EndpointPool::with_providers(
            entries,
            Arc::new(connector),
            settings(),
            Arc::new(SweepMetrics::new()),
        )
    }

    fn latencies(ms: &[u64]) -> Vec<Arc<MockProvider>> {
        ms.iter()
            .enumerate()
            .map(|(i, ms)| MockProvider::new(&format!("node-{i}")).with_latency(*ms).shared())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_selects_lowest_latency() {
        let providers = latencies(&[120, 45, 200]);
        let pool = pool_of(&providers, MockConnector::new());

        pool.measure_all().await;
        assert_eq!(pool.select_best().await, Some(1));

        let status = pool.status().await;
        assert_eq!(status.endpoints[0].latency_ms, Some(120));
        assert_eq!(status.endpoints[1].latency_ms, Some(45));
        assert!(status.endpoints[1].selected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_selects_unreachable() {
        let providers = latencies(&[300, 10]);
        providers[1].set_reachable(false);
        let pool = pool_of(&providers, MockConnector::new());

        pool.measure_all().await;
        assert_eq!(pool.select_best().await, Some(0));
        assert_eq!(
            pool.status().await.endpoints[1].state,
            EndpointState::Unreachable
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_marks_unreachable() {
        let providers = latencies(&[5_000, 50]);
        let pool = pool_of(&providers, MockConnector::new());

        pool.measure_all().await;
        assert_eq!(pool.select_best().await, Some(1));
        assert_eq!(pool.status().await.endpoints[0].latency_ms, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_unreachable_keeps_selection() {
        let providers = latencies(&[120, 45]);
        let pool = pool_of(&providers, MockConnector::new());
        pool.measure_all().await;
        pool.select_best().await;

        let mut events = pool.subscribe();
        for p in &providers {
            p.set_reachable(false);
        }
        pool.measure_all().await;
        assert_eq!(pool.select_best().await, None);
        assert_eq!(events.recv().await.unwrap(), PoolEvent::NoEndpoints);

        let status = pool.status().await;
        assert_eq!(status.selected, 1);
        assert!(status.all_unreachable());
        assert!(pool.current().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_lost_falls_back_to_next_lowest() {
        let providers = latencies(&[120, 45, 200]);
        let pool = pool_of(&providers, MockConnector::failing());
        pool.measure_all().await;
        assert_eq!(pool.select_best().await, Some(1));

        let mut events = pool.subscribe();
        pool.report_connection_lost(1).await;

        let (index, _) = pool.current().await.unwrap();
        assert_eq!(index, 0);
        assert_eq!(
            events.recv().await.unwrap(),
            PoolEvent::SelectionChanged { from: 1, to: 0 }
        );
        let status = pool.status().await;
        assert_eq!(status.endpoints[1].state, EndpointState::Reconnecting);
        assert_eq!(status.endpoints[1].latency_ms, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_cap() {
        let providers = latencies(&[50]);
        let connector = Arc::new(MockConnector::failing());
        let pool = EndpointPool::with_providers(
            vec![(
                ProviderConfig::Http("http://node-0".into()),
                providers[0].clone() as Arc<dyn EthereumProvider>,
            )],
            connector.clone(),
            settings(),
            Arc::new(SweepMetrics::new()),
        );

        let started = Instant::now();
        assert!(!pool.reconnect(0).await);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
        // 1s + 2s + 3s of backoff
        assert_eq!(started.elapsed(), Duration::from_secs(6));

        let status = pool.status().await;
        assert_eq!(status.endpoints[0].state, EndpointState::Unreachable);
        assert_eq!(status.endpoints[0].reconnect_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_success_resets_attempts() {
        let providers = latencies(&[50]);
        let metrics = Arc::new(SweepMetrics::new());
        let pool = EndpointPool::with_providers(
            vec![(
                ProviderConfig::Http("http://node-0".into()),
                providers[0].clone() as Arc<dyn EthereumProvider>,
            )],
            Arc::new(MockConnector::new()),
            settings(),
            metrics.clone(),
        );
        let mut events = pool.subscribe();

        assert!(pool.reconnect(0).await);
        assert_eq!(events.recv().await.unwrap(), PoolEvent::Reconnected { index: 0 });

        let status = pool.status().await;
        assert_eq!(status.endpoints[0].state, EndpointState::Healthy);
        assert_eq!(status.endpoints[0].reconnect_attempts, 0);
        assert_eq!(metrics.snapshot().reconnections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_tick_revives_abandoned_endpoint() {
        let providers = latencies(&[50]);
        let pool = pool_of(&providers, MockConnector::new());
        {
            let mut state = pool.state.write().await;
            state.endpoints[0].begin_reconnect();
            state.endpoints[0].state = EndpointState::Unreachable;
        }

        pool.health_tick().await;
        let status = pool.status().await;
        assert_eq!(status.endpoints[0].state, EndpointState::Healthy);
        assert!(pool.current().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_outage_reprobes() {
        let providers = latencies(&[10, 20]);
        let pool = pool_of(&providers, MockConnector::new());
        pool.measure_all().await;
        assert!(!pool.confirm_outage().await);

        providers[0].set_reachable(false);
        assert!(!pool.confirm_outage().await);
        providers[1].set_reachable(false);
        assert!(pool.confirm_outage().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_returns_first_success() {
        let providers = latencies(&[10, 10, 10]);
        providers[0].set_reachable(false);
        let pool = pool_of(&providers, MockConnector::new());

        let name = pool
            .call_with_fallback(|p| async move {
                p.block_number().await?;
                Ok(p.endpoint_name())
            })
            .await
            .unwrap();

        assert_eq!(name, "node-1");
        assert_eq!(providers[2].pings.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_fails_only_when_all_fail() {
        let providers = latencies(&[10, 10, 10]);
        for p in &providers {
            p.set_reachable(false);
        }
        let pool = pool_of(&providers, MockConnector::new());

        let err = pool
            .call_with_fallback(|p| async move { p.block_number().await })
            .await
            .unwrap_err();

        match err.downcast_ref::<PoolError>() {
            Some(PoolError::AllEndpointsFailed { attempted, errors }) => {
                assert_eq!(*attempted, 3);
                assert_eq!(errors.len(), 3);
                assert!(errors[2].contains("node-2"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        for p in &providers {
            assert_eq!(p.pings.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_prefers_selected_endpoint() {
        let providers = latencies(&[100, 10]);
        let pool = pool_of(&providers, MockConnector::new());
        pool.measure_all().await;
        pool.select_best().await;

        pool.call(|p| async move { p.send_raw_transaction(Bytes::from(vec![1u8])).await })
            .await
            .unwrap();

        assert_eq!(providers[1].sends.load(Ordering::SeqCst), 1);
        assert_eq!(providers[0].sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_falls_back_after_fast_path_error() {
        let providers = latencies(&[100, 10]);
        let pool = pool_of(&providers, MockConnector::new());
        pool.measure_all().await;
        pool.select_best().await;
        providers[1].script_sends([Err("connection reset by peer")]);

        pool.call(|p| async move { p.send_raw_transaction(Bytes::from(vec![1u8])).await })
            .await
            .unwrap();

        assert_eq!(providers[0].sent_count(), 1);
        assert_eq!(providers[1].sent_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_skips_disconnected_endpoints() {
        let providers = latencies(&[10, 10]);
        providers[1].set_reachable(false);
        let pool = pool_of(&providers, MockConnector::failing());
        pool.report_connection_lost(0).await;

        let err = pool
            .call_with_fallback(|p| async move { p.block_number().await })
            .await
            .unwrap_err();
        match err.downcast_ref::<PoolError>() {
            Some(PoolError::AllEndpointsFailed { attempted, errors }) => {
                assert_eq!(*attempted, 1);
                assert_eq!(errors.len(), 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_keeps_fast_path_error() {
        let providers = latencies(&[10, 100]);
        let pool = pool_of(&providers, MockConnector::new());
        pool.measure_all().await;
        pool.select_best().await;
        // fast path, then node-0 again in fallback order
        providers[0].script_sends([
            Err("insufficient funds for gas * price + value"),
            Err("nonce too low"),
        ]);
        providers[1].set_reachable(false);

        let err = pool
            .call(|p| async move { p.send_raw_transaction(Bytes::from(vec![1u8])).await })
            .await
            .unwrap_err();
        match err.downcast_ref::<PoolError>() {
            Some(PoolError::AllEndpointsFailed { attempted, errors }) => {
                assert_eq!(*attempted, 2);
                assert!(errors[0].contains("insufficient funds"));
                assert!(errors[1].contains("nonce too low"));
                assert!(errors[2].contains("connection refused"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_reconnect_delay_scales_with_attempt() {
        let base = Duration::from_secs(2);
        assert_eq!(reconnect_delay(base, 1), Duration::from_secs(2));
        assert_eq!(reconnect_delay(base, 3), Duration::from_secs(6));
    }

    #[test]
    fn test_connection_closed_detection() {
        assert!(is_connection_closed("WS connection closed by server"));
        assert!(is_connection_closed("backend connection task has stopped"));
        assert!(!is_connection_closed("connection refused"));
    }

    #[tokio::test]
    async fn test_connect_requires_endpoints() {
        let result = EndpointPool::connect(
            vec![],
            Arc::new(MockConnector::new()),
            settings(),
            Arc::new(SweepMetrics::new()),
        )
        .await;
        assert!(result.is_err());
    }
}
