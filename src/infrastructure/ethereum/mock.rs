//! Scripted in-memory provider for unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::rpc::types::TransactionRequest;
use anyhow::Result;
use tokio::sync::mpsc;

use super::{Connector, EthereumProvider, ProviderConfig, ReceiptStatus, TransferLog};

pub struct MockProvider {
    name: String,
    streaming: bool,
    latency: Mutex<Duration>,
    reachable: AtomicBool,
    balance: Mutex<U256>,
    gas_price: Mutex<u128>,
    gas_limit: u64,
    pending_nonce: Mutex<u64>,
    send_script: Mutex<VecDeque<Result<(), String>>>,
    sent: Mutex<Vec<B256>>,
    subscribers: Mutex<Vec<mpsc::Sender<TransferLog>>>,
    pub sends: AtomicUsize,
    pub pings: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            streaming: false,
            latency: Mutex::new(Duration::from_millis(10)),
            reachable: AtomicBool::new(true),
            balance: Mutex::new(U256::ZERO),
            gas_price: Mutex::new(1_000_000_000),
            gas_limit: 52_000,
            pending_nonce: Mutex::new(0),
            send_script: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            sends: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    pub fn with_latency(self, ms: u64) -> Self {
        self.set_latency(ms);
        self
    }

    pub fn with_balance(self, balance: u64) -> Self {
        self.set_balance(balance);
        self
    }

    pub fn with_nonce(self, nonce: u64) -> Self {
        self.set_pending_nonce(nonce);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn set_latency(&self, ms: u64) {
        *self.latency.lock().unwrap() = Duration::from_millis(ms);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_balance(&self, balance: u64) {
        *self.balance.lock().unwrap() = U256::from(balance);
    }

    pub fn set_pending_nonce(&self, nonce: u64) {
        *self.pending_nonce.lock().unwrap() = nonce;
    }

    /// Queue results for upcoming `send_raw_transaction` calls; once the
    /// script runs dry every send succeeds
    pub fn script_sends<I>(&self, results: I)
    where
        I: IntoIterator<Item = Result<(), &'static str>>,
    {
        let mut script = self.send_script.lock().unwrap();
        script.extend(results.into_iter().map(|r| r.map_err(str::to_string)));
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub async fn emit_transfer(&self, log: TransferLog) {
        let subscribers = self.subscribers.lock().unwrap().clone();
        for tx in subscribers {
            let _ = tx.send(log.clone()).await;
        }
    }

    pub fn close_subscriptions(&self) {
        self.subscribers.lock().unwrap().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    fn check_reachable(&self) -> Result<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused: {}", self.name);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl EthereumProvider for MockProvider {
    async fn block_number(&self) -> Result<u64> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock().unwrap();
        tokio::time::sleep(latency).await;
        self.check_reachable()?;
        Ok(100)
    }

    async fn chain_id(&self) -> Result<u64> {
        self.check_reachable()?;
        Ok(31337)
    }

    async fn token_balance(&self, _token: Address, _owner: Address) -> Result<U256> {
        self.check_reachable()?;
        Ok(*self.balance.lock().unwrap())
    }

    async fn gas_price(&self) -> Result<u128> {
        self.check_reachable()?;
        Ok(*self.gas_price.lock().unwrap())
    }

    async fn estimate_gas(&self, _request: TransactionRequest) -> Result<u64> {
        self.check_reachable()?;
        Ok(self.gas_limit)
    }

    async fn pending_nonce(&self, _address: Address) -> Result<u64> {
        self.check_reachable()?;
        Ok(*self.pending_nonce.lock().unwrap())
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256> {
        self.check_reachable()?;
        self.sends.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let hash = keccak256(&raw);
        let scripted = self.send_script.lock().unwrap().pop_front();
        if let Some(Err(message)) = scripted {
            // the node keeps a transaction it reports as already known
            if message.contains("already known") {
                self.sent.lock().unwrap().push(hash);
            }
            anyhow::bail!("{message}");
        }

        self.sent.lock().unwrap().push(hash);
        Ok(hash)
    }

    async fn receipt_status(&self, hash: B256) -> Result<Option<ReceiptStatus>> {
        self.check_reachable()?;
        let mined = self.sent.lock().unwrap().contains(&hash);
        Ok(mined.then_some(ReceiptStatus {
            success: true,
            block_number: Some(101),
        }))
    }

    async fn subscribe_transfers(
        &self,
        _token: Address,
        _recipient: Address,
    ) -> Result<mpsc::Receiver<TransferLog>> {
        self.check_reachable()?;
        let (tx, rx) = mpsc::channel(16);
        if self.streaming {
            self.subscribers.lock().unwrap().push(tx);
        }
        Ok(rx)
    }

    fn supports_subscriptions(&self) -> bool {
        self.streaming
    }

    fn endpoint_name(&self) -> String {
        self.name.clone()
    }
}

/// Connector that hands out fresh mock providers, or fails on demand
pub struct MockConnector {
    fail: AtomicBool,
    pub attempts: AtomicUsize,
    pub latency_ms: u64,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            latency_ms: 10,
        }
    }

    pub fn failing() -> Self {
        let connector = Self::new();
        connector.fail.store(true, Ordering::SeqCst);
        connector
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn connect(&self, config: &ProviderConfig) -> Result<Arc<dyn EthereumProvider>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused: {}", config.display());
        }
        let mut provider = MockProvider::new(&config.display()).with_latency(self.latency_ms);
        provider.streaming = config.is_streaming();
        Ok(Arc::new(provider))
    }
}
