//! Transfer worker - the submission state machine for one sweep
//!
//! `CheckBalance → BuildAndSign → Submit → Confirm`, with the last three
//! wrapped in a bounded retry loop that escalates gas and repairs the nonce.

use std::sync::Arc;
use std::time::Duration;

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::TransactionRequest;
use anyhow::{anyhow, Context, Result};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::sequencer::{Job, JobRunner, NonceHandoff};
use crate::domain::Asset;
use crate::infrastructure::ethereum::types::format_gwei;
use crate::infrastructure::ethereum::TxSigner;
use crate::infrastructure::pool::{EndpointPool, PoolError};
use crate::modules::ops::metrics::{MetricKind, SweepMetrics};
use crate::modules::ops::notify::Notifier;

/// Retry and confirmation knobs
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Attempts that may consume the budget (nonce resyncs do not)
    pub max_attempts: u32,
    /// Separate cap for "nonce too low" resyncs
    pub max_resyncs: u32,
    /// Backoff after a generic failure is `base × 2^(attempt-1)`
    pub backoff_base: Duration,
    pub confirm_timeout: Duration,
    pub receipt_poll_interval: Duration,
    /// Consecutive failures that trigger one streak notification
    pub failure_alert_threshold: u64,
}

impl WorkerSettings {
    /// Longest a sweep runs when every attempt waits out its confirmation
    pub fn worst_case_run(&self) -> Duration {
        let backoff: Duration = (1..self.max_attempts)
            .map(|attempt| backoff_delay(self.backoff_base, attempt))
            .sum();
        self.confirm_timeout.saturating_mul(self.max_attempts) + backoff
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_resyncs: 3,
            backoff_base: Duration::from_secs(1),
            confirm_timeout: Duration::from_secs(90),
            receipt_poll_interval: Duration::from_secs(2),
            failure_alert_threshold: 3,
        }
    }
}

/// Node error classes the retry loop reacts to, most specific first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorClass {
    InsufficientFunds,
    NonceTooLow,
    Underpriced,
    AlreadyKnown,
    Other,
}

/// Sort a node error message into an [`ErrorClass`]
pub fn classify(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    if lower.contains("insufficient funds") {
        ErrorClass::InsufficientFunds
    } else if lower.contains("nonce too low") {
        ErrorClass::NonceTooLow
    } else if lower.contains("transaction underpriced") {
        ErrorClass::Underpriced
    } else if lower.contains("already known") {
        ErrorClass::AlreadyKnown
    } else {
        ErrorClass::Other
    }
}

/// Classify a pool failure by the most specific rejection any endpoint gave
///
/// A live node's "insufficient funds" must not be masked by a dead backup
/// answering "connection refused" later in the fallback order.
pub fn classify_error(err: &anyhow::Error) -> (ErrorClass, String) {
    let full = format!("{err:#}");
    let rejection = match err.downcast_ref::<PoolError>() {
        Some(PoolError::AllEndpointsFailed { errors, .. }) => errors
            .iter()
            .map(|message| (classify(message), message))
            .filter(|(class, _)| *class != ErrorClass::Other)
            .min_by_key(|(class, _)| *class)
            .map(|(class, message)| (class, message.clone())),
        _ => None,
    };
    rejection.unwrap_or_else(|| (classify(&full), full))
}

/// Gas price multipliers accumulated over one job, in percent
const FIRST_PASS_BUMP: u128 = 120;
const GENERIC_BUMP: u128 = 110;
const UNDERPRICED_BUMP: u128 = 130;

/// Gas price for the next attempt from a fresh estimate
pub fn escalate_gas_price(estimate: u128, generic_failures: u32, underpriced: u32) -> u128 {
    let mut price = estimate.saturating_mul(FIRST_PASS_BUMP) / 100;
    for _ in 0..generic_failures {
        price = price.saturating_mul(GENERIC_BUMP) / 100;
    }
    for _ in 0..underpriced {
        price = price.saturating_mul(UNDERPRICED_BUMP) / 100;
    }
    price
}

pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
}

/// How a sweep ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Swept {
        amount: U256,
        nonce: u64,
        tx_hash: B256,
        gas_price: u128,
        attempts: u32,
    },
    NothingToSweep,
    /// The balance could not be read from any endpoint
    BalanceUnavailable(String),
    /// Every endpoint is down; the job waits for one to come back
    Deferred(String),
    InsufficientFunds {
        amount: U256,
        nonce: u64,
        error: String,
    },
    Exhausted {
        amount: U256,
        attempts: u32,
        last_error: String,
    },
}

impl TransferOutcome {
    pub fn nonce_handoff(&self) -> NonceHandoff {
        match self {
            TransferOutcome::Swept { nonce, .. } => NonceHandoff::Used(*nonce),
            TransferOutcome::NothingToSweep | TransferOutcome::BalanceUnavailable(_) => {
                NonceHandoff::Unchanged
            }
            TransferOutcome::Deferred(_) => NonceHandoff::Deferred,
            TransferOutcome::InsufficientFunds { .. } | TransferOutcome::Exhausted { .. } => {
                NonceHandoff::Resync
            }
        }
    }
}

#[derive(Debug)]
struct Submitted {
    hash: B256,
    gas_price: u128,
}

#[derive(Debug)]
struct AttemptError {
    class: ErrorClass,
    message: String,
    stage: &'static str,
    /// No endpoint gave a node-level answer
    unanswered: bool,
}

impl AttemptError {
    fn new(stage: &'static str, err: anyhow::Error) -> Self {
        let (class, message) = classify_error(&err);
        Self {
            class,
            message,
            stage,
            unanswered: class == ErrorClass::Other && is_pool_exhausted(&err),
        }
    }
}

fn is_pool_exhausted(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<PoolError>(),
        Some(PoolError::AllEndpointsFailed { .. })
    )
}

pub struct TransferWorker {
    pool: Arc<EndpointPool>,
    signer: TxSigner,
    destination: Address,
    chain_id: u64,
    settings: WorkerSettings,
    metrics: Arc<SweepMetrics>,
    notifier: Arc<dyn Notifier>,
}

impl TransferWorker {
    pub fn new(
        pool: Arc<EndpointPool>,
        signer: TxSigner,
        destination: Address,
        chain_id: u64,
        settings: WorkerSettings,
        metrics: Arc<SweepMetrics>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            pool,
            signer,
            destination,
            chain_id,
            settings,
            metrics,
            notifier,
        }
    }

    pub fn account(&self) -> Address {
        self.signer.address()
    }

    /// Run the state machine for `asset` starting at `nonce`
    pub async fn sweep(&self, asset: &Asset, nonce: u64) -> TransferOutcome {
        let owner = self.account();
        let token = asset.address;
        let balance = match self
            .pool
            .call(|p| async move { p.token_balance(token, owner).await })
            .await
        {
            Ok(balance) => balance,
            Err(err) => {
                let message = format!("{err:#}");
                if is_pool_exhausted(&err) && self.pool.confirm_outage().await {
                    return TransferOutcome::Deferred(message);
                }
                return TransferOutcome::BalanceUnavailable(message);
            }
        };
        if balance.is_zero() {
            return TransferOutcome::NothingToSweep;
        }

        info!(asset = %asset.symbol, amount = %asset.format_amount(balance), nonce, "sweeping balance");

        let mut candidate = nonce;
        let mut attempt: u32 = 1;
        let mut resyncs: u32 = 0;
        let mut generic_failures: u32 = 0;
        let mut underpriced: u32 = 0;

        loop {
            let err = match self
                .attempt(asset, balance, candidate, generic_failures, underpriced)
                .await
            {
                Ok(sent) => {
                    return TransferOutcome::Swept {
                        amount: balance,
                        nonce: candidate,
                        tx_hash: sent.hash,
                        gas_price: sent.gas_price,
                        attempts: attempt,
                    };
                }
                Err(err) => err,
            };

            if err.unanswered && self.pool.confirm_outage().await {
                warn!(asset = %asset.symbol, attempt, stage = err.stage, "no endpoint reachable, deferring sweep");
                return TransferOutcome::Deferred(err.message);
            }

            let class = err.class;
            debug!(asset = %asset.symbol, attempt, nonce = candidate, stage = err.stage, ?class, error = %err.message, "attempt failed");

            match class {
                ErrorClass::InsufficientFunds => {
                    return TransferOutcome::InsufficientFunds {
                        amount: balance,
                        nonce: candidate,
                        error: err.message,
                    };
                }
                ErrorClass::NonceTooLow if resyncs < self.settings.max_resyncs => {
                    resyncs += 1;
                    match self.resync_nonce(candidate).await {
                        Ok(fresh) => {
                            info!(asset = %asset.symbol, rejected = candidate, fresh, "nonce resynced from chain");
                            candidate = fresh;
                            continue;
                        }
                        Err(read_err) => {
                            warn!(error = %format!("{read_err:#}"), "nonce resync failed");
                            generic_failures += 1;
                            candidate += 1;
                        }
                    }
                }
                ErrorClass::Underpriced => {
                    underpriced += 1;
                    candidate += 1;
                }
                _ => {
                    generic_failures += 1;
                    candidate += 1;
                }
            }

            if attempt >= self.settings.max_attempts {
                return TransferOutcome::Exhausted {
                    amount: balance,
                    attempts: attempt,
                    last_error: err.message,
                };
            }
            if class != ErrorClass::Underpriced {
                tokio::time::sleep(backoff_delay(self.settings.backoff_base, attempt)).await;
            }
            attempt += 1;
        }
    }

    /// One `BuildAndSign → Submit → Confirm` pass
    async fn attempt(
        &self,
        asset: &Asset,
        amount: U256,
        nonce: u64,
        generic_failures: u32,
        underpriced: u32,
    ) -> Result<Submitted, AttemptError> {
        let payload = asset.transfer_payload(amount);
        let base_request = TransactionRequest::default()
            .with_from(self.account())
            .with_to(asset.address)
            .with_input(payload);

        let estimate = self
            .pool
            .call(|p| async move { p.gas_price().await })
            .await
            .map_err(|e| AttemptError::new("gas_price", e))?;
        let gas_limit = {
            let request = base_request.clone();
            self.pool
                .call(|p| {
                    let request = request.clone();
                    async move { p.estimate_gas(request).await }
                })
                .await
                .map_err(|e| AttemptError::new("estimate_gas", e))?
        };
        let gas_price = escalate_gas_price(estimate, generic_failures, underpriced);

        let request = base_request
            .with_nonce(nonce)
            .with_chain_id(self.chain_id)
            .with_gas_price(gas_price)
            .with_gas_limit(gas_limit);
        let signed = self
            .signer
            .sign(request)
            .await
            .map_err(|e| AttemptError::new("sign", e))?;

        debug!(
            asset = %asset.symbol,
            nonce,
            gas_price_gwei = %format_gwei(gas_price),
            gas_limit,
            tx = %signed.hash,
            "submitting"
        );

        let raw = signed.raw.clone();
        let hash = match self
            .pool
            .call(|p| {
                let raw = raw.clone();
                async move { p.send_raw_transaction(raw).await }
            })
            .await
        {
            Ok(hash) => hash,
            Err(err) => {
                let err = AttemptError::new("submit", err);
                if err.class != ErrorClass::AlreadyKnown {
                    return Err(err);
                }
                debug!(tx = %signed.hash, "node already has transaction, confirming");
                signed.hash
            }
        };

        self.confirm(hash)
            .await
            .map_err(|e| AttemptError::new("confirm", e))?;
        Ok(Submitted { hash, gas_price })
    }

    /// Poll for the receipt until one confirmation or the timeout
    async fn confirm(&self, hash: B256) -> Result<()> {
        let deadline = Instant::now() + self.settings.confirm_timeout;
        loop {
            match self
                .pool
                .call(|p| async move { p.receipt_status(hash).await })
                .await
            {
                Ok(Some(receipt)) if receipt.success => return Ok(()),
                Ok(Some(_)) => return Err(anyhow!("transaction {hash} reverted")),
                Ok(None) => {}
                Err(err) => debug!(tx = %hash, error = %format!("{err:#}"), "receipt lookup failed"),
            }

            if Instant::now() + self.settings.receipt_poll_interval > deadline {
                return Err(anyhow!(
                    "transaction {hash} not confirmed within {:?}",
                    self.settings.confirm_timeout
                ));
            }
            tokio::time::sleep(self.settings.receipt_poll_interval).await;
        }
    }

    /// Re-read the pending count, never going back to or below `rejected`
    async fn resync_nonce(&self, rejected: u64) -> Result<u64> {
        let account = self.account();
        let fresh = self
            .pool
            .call(|p| async move { p.pending_nonce(account).await })
            .await
            .context("Failed to read pending nonce")?;

        if fresh <= rejected {
            warn!(rejected, fresh, "chain nonce did not move past rejected nonce, using rejected + 1");
            return Ok(rejected + 1);
        }
        Ok(fresh)
    }

    /// Log, count and notify a finished sweep
    pub async fn report(&self, asset: &Asset, outcome: &TransferOutcome) {
        let failed = match outcome {
            TransferOutcome::Swept {
                amount,
                nonce,
                tx_hash,
                gas_price,
                attempts,
            } => {
                info!(
                    asset = %asset.symbol,
                    nonce,
                    tx = %tx_hash,
                    gas_price_gwei = %format_gwei(*gas_price),
                    attempts,
                    "sweep confirmed"
                );
                self.metrics.record(MetricKind::Transfer, true);
                self.notifier
                    .notify(&format!(
                        "Swept {} to {} (tx {tx_hash}, nonce {nonce})",
                        asset.format_amount(*amount),
                        self.destination
                    ))
                    .await;
                false
            }
            TransferOutcome::NothingToSweep => {
                debug!(asset = %asset.symbol, "nothing to sweep");
                return;
            }
            TransferOutcome::BalanceUnavailable(err) => {
                warn!(asset = %asset.symbol, error = %err, "balance unavailable, skipping");
                return;
            }
            TransferOutcome::Deferred(err) => {
                warn!(asset = %asset.symbol, error = %err, "all endpoints down, sweep requeued");
                return;
            }
            TransferOutcome::InsufficientFunds { amount, nonce, error } => {
                error!(asset = %asset.symbol, nonce, error = %error, "insufficient funds for gas");
                self.metrics.record(MetricKind::Transfer, false);
                self.notifier
                    .notify(&format!(
                        "Cannot sweep {}: insufficient funds for gas ({error})",
                        asset.format_amount(*amount)
                    ))
                    .await;
                true
            }
            TransferOutcome::Exhausted {
                amount,
                attempts,
                last_error,
            } => {
                error!(asset = %asset.symbol, attempts, error = %last_error, "sweep failed, retries exhausted");
                self.metrics.record(MetricKind::Transfer, false);
                self.notifier
                    .notify(&format!(
                        "Sweep of {} failed after {attempts} attempts: {last_error}",
                        asset.format_amount(*amount)
                    ))
                    .await;
                true
            }
        };

        let streak = self.metrics.consecutive_failures();
        if failed && streak == self.settings.failure_alert_threshold {
            warn!(streak, "consecutive failure threshold reached");
            self.notifier
                .notify(&format!("{streak} consecutive sweep failures"))
                .await;
        }
    }
}

#[async_trait::async_trait]
impl JobRunner for TransferWorker {
    async fn pending_nonce(&self) -> Result<u64> {
        let account = self.account();
        self.pool
            .call(|p| async move { p.pending_nonce(account).await })
            .await
    }

    async fn run(&self, job: &Job, nonce: u64) -> NonceHandoff {
        let started = Instant::now();
        let outcome = self.sweep(&job.asset, nonce).await;
        self.report(&job.asset, &outcome).await;
        debug!(asset = %job.asset.symbol, elapsed_ms = started.elapsed().as_millis() as u64, "job finished");
        outcome.nonce_handoff()
    }
}
