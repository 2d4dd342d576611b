//! Status document - what an operator sees on each heartbeat

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::alerts::AlertInput;
use super::metrics::MetricsSnapshot;
use super::OpsStatus;
use crate::infrastructure::pool::{EndpointStatus, PoolStatus};
use crate::infrastructure::runtime::SequencerSnapshot;

/// Full status of a running sweeper
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: OpsStatus,
    pub account: String,
    pub destination: String,
    pub uptime_secs: u64,
    pub selected_endpoint: usize,
    pub endpoints: Vec<EndpointStatus>,
    pub metrics: MetricsSnapshot,
    pub sequencer: SequencerSnapshot,
    /// Asset key → whether its processing lock is held
    pub locks: BTreeMap<String, bool>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl StatusReport {
    pub fn from_parts(
        pool: PoolStatus,
        metrics: MetricsSnapshot,
        sequencer: SequencerSnapshot,
        locks: BTreeMap<String, bool>,
    ) -> Self {
        let status = overall_status(&pool);
        Self {
            status,
            account: String::new(),
            destination: String::new(),
            uptime_secs: 0,
            selected_endpoint: pool.selected,
            endpoints: pool.endpoints,
            metrics,
            sequencer,
            locks,
            last_heartbeat: None,
        }
    }

    pub fn selected_latency_ms(&self) -> Option<u64> {
        self.endpoints
            .get(self.selected_endpoint)
            .and_then(|e| e.latency_ms)
    }

    pub fn alert_input(&self) -> AlertInput {
        AlertInput {
            consecutive_failures: self.metrics.consecutive_failures,
            all_endpoints_down: self.status == OpsStatus::Error,
            queue_depth: self.sequencer.queue_depth,
            selected_latency_ms: self.selected_latency_ms(),
        }
    }

    /// One-line summary for the heartbeat log
    pub fn summary(&self) -> String {
        let latency = self
            .selected_latency_ms()
            .map(|ms| format!("{ms}ms"))
            .unwrap_or_else(|| "N/A".to_string());
        let held = self.locks.values().filter(|held| **held).count();
        format!(
            "endpoint #{} ({latency}) | sweeps {}/{} ok | queue {} | locks {held}",
            self.selected_endpoint,
            self.metrics.successes,
            self.metrics.total,
            self.sequencer.queue_depth,
        )
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Error when nothing is reachable, warning when only a slow or partial
/// set of endpoints answers
fn overall_status(pool: &PoolStatus) -> OpsStatus {
    if pool.endpoints.is_empty() || pool.all_unreachable() {
        return OpsStatus::Error;
    }
    let selected_latency = pool
        .endpoints
        .get(pool.selected)
        .and_then(|e| e.latency_ms);
    let degraded = pool
        .endpoints
        .iter()
        .any(|e| e.latency_ms.is_none());
    match selected_latency {
        Some(ms) if ms < 500 && !degraded => OpsStatus::Ok,
        Some(_) => OpsStatus::Warning,
        None => OpsStatus::Warning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::pool::EndpointState;

    fn endpoint(index: usize, latency_ms: Option<u64>, state: EndpointState) -> EndpointStatus {
        EndpointStatus {
            index,
            name: format!("http://node-{index}"),
            latency_ms,
            state,
            selected: index == 0,
            reconnect_attempts: 0,
        }
    }

    fn report(endpoints: Vec<EndpointStatus>) -> StatusReport {
        StatusReport::from_parts(
            PoolStatus {
                selected: 0,
                endpoints,
            },
            MetricsSnapshot::default(),
            SequencerSnapshot {
                nonce: Some(3),
                queue_depth: 1,
                draining: true,
                stopping: false,
            },
            BTreeMap::from([("0xaa".to_string(), true), ("0xbb".to_string(), false)]),
        )
    }

    #[test]
    fn test_overall_status() {
        let ok = report(vec![endpoint(0, Some(40), EndpointState::Healthy)]);
        assert_eq!(ok.status, OpsStatus::Ok);

        let partial = report(vec![
            endpoint(0, Some(40), EndpointState::Healthy),
            endpoint(1, None, EndpointState::Reconnecting),
        ]);
        assert_eq!(partial.status, OpsStatus::Warning);

        let down = report(vec![endpoint(0, None, EndpointState::Unreachable)]);
        assert_eq!(down.status, OpsStatus::Error);
        assert!(down.alert_input().all_endpoints_down);
    }

    #[test]
    fn test_json_document() {
        let doc = report(vec![endpoint(0, Some(40), EndpointState::Healthy)]);
        let json: serde_json::Value = serde_json::from_str(&doc.to_json().unwrap()).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["endpoints"][0]["state"], "healthy");
        assert_eq!(json["sequencer"]["nonce"], 3);
        assert_eq!(json["locks"]["0xaa"], true);
        assert!(doc.summary().contains("queue 1 | locks 1"));
    }
}
