//! Operations: metrics, alerts, notifications and the status document

pub mod alerts;
pub mod metrics;
pub mod notify;
pub mod status;

pub use alerts::AlertChecker;
pub use metrics::{MetricKind, MetricsSnapshot, SweepMetrics};
pub use notify::{LogNotifier, Notifier, WebhookNotifier};
pub use status::StatusReport;

use serde::Serialize;

/// Coarse health of a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpsStatus {
    Ok,
    Warning,
    Error,
}
