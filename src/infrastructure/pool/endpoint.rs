//! One pooled RPC endpoint and its lifecycle

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::infrastructure::ethereum::{EthereumProvider, ProviderConfig};

/// Endpoint lifecycle: `Healthy → Unreachable → Reconnecting → Healthy`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointState {
    /// Last liveness probe succeeded
    Healthy,
    /// Last probe failed, timed out, or reconnection gave up
    Unreachable,
    /// Connection was lost and a reconnect task owns this slot
    Reconnecting,
}

pub struct Endpoint {
    pub(super) config: ProviderConfig,
    pub(super) provider: Option<Arc<dyn EthereumProvider>>,
    pub(super) latency: Option<Duration>,
    pub(super) state: EndpointState,
    pub(super) reconnect_attempts: u32,
    /// Bumped whenever `provider` is replaced or dropped, so late probe
    /// results for an old connection are discarded
    pub(super) generation: u64,
}

impl Endpoint {
    pub(super) fn new(config: ProviderConfig, provider: Option<Arc<dyn EthereumProvider>>) -> Self {
        Self {
            config,
            provider,
            latency: None,
            state: EndpointState::Unreachable,
            reconnect_attempts: 0,
            generation: 0,
        }
    }

    pub(super) fn is_selectable(&self) -> bool {
        self.state == EndpointState::Healthy && self.latency.is_some() && self.provider.is_some()
    }

    pub(super) fn record_latency(&mut self, latency: Duration) {
        self.latency = Some(latency);
        self.state = EndpointState::Healthy;
        self.reconnect_attempts = 0;
    }

    pub(super) fn mark_unreachable(&mut self) {
        self.latency = None;
        if self.state != EndpointState::Reconnecting {
            self.state = EndpointState::Unreachable;
        }
    }

    /// Forget a dead connection and hand the slot to a reconnect task
    pub(super) fn begin_reconnect(&mut self) {
        self.provider = None;
        self.latency = None;
        self.state = EndpointState::Reconnecting;
        self.generation += 1;
    }

    pub(super) fn install(&mut self, provider: Arc<dyn EthereumProvider>) {
        self.provider = Some(provider);
        self.generation += 1;
    }

    pub(super) fn status(&self, index: usize, selected: usize) -> EndpointStatus {
        EndpointStatus {
            index,
            name: self.config.display(),
            latency_ms: self.latency.map(|l| l.as_millis() as u64),
            state: self.state,
            selected: index == selected,
            reconnect_attempts: self.reconnect_attempts,
        }
    }
}

/// Read-only view of an endpoint for the status document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStatus {
    pub index: usize,
    pub name: String,
    pub latency_ms: Option<u64>,
    pub state: EndpointState,
    pub selected: bool,
    pub reconnect_attempts: u32,
}
