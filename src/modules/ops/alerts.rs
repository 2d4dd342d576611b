//! Alert framework for the heartbeat

use std::fmt;

/// Alert rule definition
#[derive(Clone, Debug)]
pub struct AlertRule {
    pub name: &'static str,
    pub condition: AlertCondition,
    pub message: &'static str,
}

/// Alert condition types
#[derive(Clone, Debug)]
pub enum AlertCondition {
    FailureStreakAtLeast(u64),
    AllEndpointsDown,
    QueueDepthAbove(usize),
    SelectedLatencyAbove(u64),
}

/// The readings a check runs against
#[derive(Clone, Debug, Default)]
pub struct AlertInput {
    pub consecutive_failures: u64,
    pub all_endpoints_down: bool,
    pub queue_depth: usize,
    pub selected_latency_ms: Option<u64>,
}

/// A rule that fired
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Alert {
    pub name: &'static str,
    pub message: &'static str,
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Alert checker
pub struct AlertChecker {
    rules: Vec<AlertRule>,
}

impl AlertChecker {
    pub fn new(failure_threshold: u64, backlog_threshold: usize) -> Self {
        Self {
            rules: Self::default_rules(failure_threshold, backlog_threshold),
        }
    }

    fn default_rules(failure_threshold: u64, backlog_threshold: usize) -> Vec<AlertRule> {
        vec![
            AlertRule {
                name: "failure_streak",
                condition: AlertCondition::FailureStreakAtLeast(failure_threshold),
                message: "Consecutive sweep failures",
            },
            AlertRule {
                name: "endpoints_down",
                condition: AlertCondition::AllEndpointsDown,
                message: "No RPC endpoint is reachable",
            },
            AlertRule {
                name: "queue_backlog",
                condition: AlertCondition::QueueDepthAbove(backlog_threshold),
                message: "Sweep queue is backing up",
            },
            AlertRule {
                name: "rpc_latency_high",
                condition: AlertCondition::SelectedLatencyAbove(1_000),
                message: "Selected endpoint latency spike",
            },
        ]
    }

    pub fn check_alerts(&self, input: &AlertInput) -> Vec<Alert> {
        self.rules
            .iter()
            .filter(|rule| match rule.condition {
                AlertCondition::FailureStreakAtLeast(threshold) => {
                    threshold > 0 && input.consecutive_failures >= threshold
                }
                AlertCondition::AllEndpointsDown => input.all_endpoints_down,
                AlertCondition::QueueDepthAbove(threshold) => input.queue_depth > threshold,
                AlertCondition::SelectedLatencyAbove(threshold) => input
                    .selected_latency_ms
                    .is_some_and(|latency| latency > threshold),
            })
            .map(|rule| Alert {
                name: rule.name,
                message: rule.message,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_checker() {
        let checker = AlertChecker::new(3, 10);
        let alerts = checker.check_alerts(&AlertInput {
            consecutive_failures: 4,
            all_endpoints_down: true,
            queue_depth: 2,
            selected_latency_ms: None,
        });
        let names: Vec<_> = alerts.iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["failure_streak", "endpoints_down"]);
        assert_eq!(alerts[1].to_string(), "endpoints_down: No RPC endpoint is reachable");
    }

    #[test]
    fn test_no_alerts() {
        let checker = AlertChecker::new(3, 10);
        let alerts = checker.check_alerts(&AlertInput {
            consecutive_failures: 2,
            queue_depth: 10,
            selected_latency_ms: Some(40),
            ..Default::default()
        });
        assert!(alerts.is_empty());
    }
}
