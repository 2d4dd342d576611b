//! Outbound notifications

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

/// Single `notify(text)` capability the core reports through
///
/// Delivery is best effort: implementations log their own failures and
/// never propagate them into the transfer path.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, text: &str);
}

/// Writes notifications to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, text: &str) {
        info!(target: "sweeper::notify", "{text}");
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
}

/// POSTs `{"text": ...}` to a chat webhook, and logs
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, text: &str) {
        LogNotifier.notify(text).await;

        let response = self
            .http
            .post(&self.url)
            .json(&WebhookPayload { text })
            .send()
            .await;
        match response {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(status = %resp.status(), "notification webhook rejected message"),
            Err(err) => warn!(error = %err, "notification webhook unreachable"),
        }
    }
}
