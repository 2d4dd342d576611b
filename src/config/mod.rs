use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy::primitives::Address;
use serde::Deserialize;

use crate::infrastructure::ethereum::types::parse_address;
use crate::infrastructure::ethereum::ProviderConfig;
use crate::infrastructure::pool::PoolSettings;
use crate::infrastructure::runtime::WorkerSettings;

pub const PRIVATE_KEY_ENV: &str = "SWEEPER_PRIVATE_KEY";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid {field}: {value}")]
    Invalid { field: &'static str, value: String },
    #[error("missing {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenSpec {
    pub address: String,
    pub symbol: Option<String>,
    pub decimals: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointConfig {
    pub name: Option<String>,
    pub rpc: Option<String>,
    pub ws: Option<String>,
    pub ipc: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifyConfig {
    pub webhook: Option<String>,
}

/// Every interval and threshold the sweeper uses
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Tuning {
    pub call_timeout_ms: u64,
    pub health_interval_secs: u64,
    pub reconnect_base_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub poll_interval_secs: u64,
    pub lock_hold_budget_secs: u64,
    pub lock_sweep_interval_secs: u64,
    pub max_attempts: u32,
    pub max_resyncs: u32,
    pub backoff_base_ms: u64,
    pub confirm_timeout_secs: u64,
    pub receipt_poll_interval_ms: u64,
    pub failure_alert_threshold: u64,
    pub nonce_retry_delay_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub queue_backlog_alert: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5_000,
            health_interval_secs: 30,
            reconnect_base_delay_ms: 2_000,
            max_reconnect_attempts: 5,
            poll_interval_secs: 15,
            lock_hold_budget_secs: 600,
            lock_sweep_interval_secs: 60,
            max_attempts: 5,
            max_resyncs: 3,
            backoff_base_ms: 1_000,
            confirm_timeout_secs: 90,
            receipt_poll_interval_ms: 2_000,
            failure_alert_threshold: 3,
            nonce_retry_delay_ms: 5_000,
            heartbeat_interval_secs: 60,
            queue_backlog_alert: 10,
        }
    }
}

impl Tuning {
    /// A lock budget at or under the worker's longest run would force-clear
    /// locks of sweeps that are still retrying
    pub fn validate(&self) -> Result<(), ConfigError> {
        let worst_case = self.worker_settings().worst_case_run();
        if self.lock_hold_budget() <= worst_case {
            return Err(ConfigError::Invalid {
                field: "tuning.lock_hold_budget_secs",
                value: format!(
                    "{} (must exceed the {}s a sweep can take)",
                    self.lock_hold_budget_secs,
                    worst_case.as_secs()
                ),
            });
        }
        Ok(())
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            health_interval: Duration::from_secs(self.health_interval_secs),
            reconnect_base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            max_attempts: self.max_attempts.max(1),
            max_resyncs: self.max_resyncs,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            confirm_timeout: Duration::from_secs(self.confirm_timeout_secs),
            receipt_poll_interval: Duration::from_millis(self.receipt_poll_interval_ms),
            failure_alert_threshold: self.failure_alert_threshold,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn lock_hold_budget(&self) -> Duration {
        Duration::from_secs(self.lock_hold_budget_secs)
    }

    pub fn lock_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lock_sweep_interval_secs.max(1))
    }

    pub fn nonce_retry_delay(&self) -> Duration {
        Duration::from_millis(self.nonce_retry_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub destination: Option<String>,

    pub private_key: Option<String>,

    #[serde(default)]
    pub tokens: Vec<TokenSpec>,

    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub tuning: Tuning,
}

impl TokenSpec {
    pub fn parsed_address(&self) -> Result<Address, ConfigError> {
        parse_address(&self.address).ok_or_else(|| ConfigError::Invalid {
            field: "token address",
            value: self.address.clone(),
        })
    }

    pub fn display_symbol(&self) -> String {
        self.symbol
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| short_addr(&self.address))
    }

    pub fn decimals(&self) -> u8 {
        self.decimals.unwrap_or(18)
    }
}

impl Config {
    pub fn from_toml(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn destination(&self) -> Result<Address, ConfigError> {
        let raw = self
            .destination
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::Missing("destination address"))?;
        parse_address(raw).ok_or_else(|| ConfigError::Invalid {
            field: "destination",
            value: raw.to_string(),
        })
    }

    /// Key from the environment, else from the file
    pub fn private_key(&self) -> Result<String, ConfigError> {
        std::env::var(PRIVATE_KEY_ENV)
            .ok()
            .or_else(|| self.private_key.clone())
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::Missing("private key (set SWEEPER_PRIVATE_KEY)"))
    }

    /// CLI endpoints first, then the file, de-duplicated; local node when
    /// nothing is configured
    pub fn resolve_endpoints(&self, cli_rpc: &[String], cli_ws: &[String]) -> Vec<ProviderConfig> {
        let mut endpoints = Vec::new();
        let mut seen = BTreeSet::<String>::new();
        let mut push = |endpoint: ProviderConfig| {
            if seen.insert(endpoint.display().to_lowercase()) {
                endpoints.push(endpoint);
            }
        };

        for ws in cli_ws.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            push(ProviderConfig::WebSocket(ws.to_string()));
        }
        for rpc in cli_rpc.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            push(url_endpoint(rpc));
        }

        for entry in &self.endpoints {
            if let Some(ws) = non_empty(&entry.ws) {
                push(ProviderConfig::WebSocket(ws.to_string()));
            } else if let Some(rpc) = non_empty(&entry.rpc) {
                push(url_endpoint(rpc));
            } else if let Some(ipc) = non_empty(&entry.ipc) {
                #[cfg(unix)]
                {
                    if let Some(path) = expand_path(ipc) {
                        push(ProviderConfig::Ipc(path));
                    }
                }
                #[cfg(not(unix))]
                {
                    tracing::warn!(path = ipc, "IPC endpoints are not supported on this platform");
                }
            }
        }

        if endpoints.is_empty() {
            endpoints.push(ProviderConfig::Http(normalize_http_endpoint("localhost:8545")));
        }
        endpoints
    }
}

/// Load from an explicit path, or from the default location when present
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(Config::default()),
        },
    };
    let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    Config::from_toml(&content, &path)
}

pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("SWEEPER_CONFIG").map(PathBuf::from) {
        return Some(path);
    }
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").map(PathBuf::from) {
        return Some(xdg.join("sweeper").join("config.toml"));
    }
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        return Some(home.join(".config").join("sweeper").join("config.toml"));
    }

    directories::ProjectDirs::from("io", "sweeper", "sweeper")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn url_endpoint(url: &str) -> ProviderConfig {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        ProviderConfig::WebSocket(url.to_string())
    } else {
        ProviderConfig::Http(normalize_http_endpoint(url))
    }
}

fn normalize_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

#[cfg(unix)]
fn expand_path(path: &str) -> Option<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => std::env::var_os("HOME").map(|home| PathBuf::from(home).join(rest)),
        None => Some(PathBuf::from(path)),
    }
}

fn short_addr(value: &str) -> String {
    let value = value.trim();
    if value.len() <= 10 {
        return value.to_string();
    }
    format!("{}..{}", &value[..6], &value[value.len() - 4..])
}
