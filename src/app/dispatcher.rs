//! Distribution dispatcher: a fixed pool of workers that claim confirmed
//! payments and pay out the target token on the home chain.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{
    AppError, BlockchainError, DistributionClient, PaymentLedger, PaymentRecord, PaymentStatus,
    SignedTransfer,
};
use crate::infra::cache::{CacheKey, ContractDataCache};
use crate::infra::resilience::{BackoffPolicy, CircuitBreaker, CircuitBreakerConfig, CircuitState};

/// Configuration for the distribution dispatcher
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of concurrent workers
    pub workers: usize,
    /// Interval between claim attempts when idle
    pub poll_interval: Duration,
    /// How long to wait for a receipt after broadcast
    pub confirmation_timeout: Duration,
    /// Interval between receipt polls
    pub confirmation_poll_interval: Duration,
    /// Retry schedule; `max_attempts` bounds attempts per payment
    pub backoff: BackoffPolicy,
    /// Home-chain circuit breaker
    pub breaker: CircuitBreakerConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_secs(2),
            confirmation_timeout: Duration::from_secs(120),
            confirmation_poll_interval: Duration::from_secs(3),
            backoff: BackoffPolicy::new(Duration::from_secs(30), Duration::from_secs(1800), 5),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl DispatcherConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let read_u64 = |key: &str| std::env::var(key).ok().and_then(|v| v.parse::<u64>().ok());
        Self {
            workers: read_u64("DISPATCHER_WORKERS")
                .map(|v| v.max(1) as usize)
                .unwrap_or(defaults.workers),
            poll_interval: read_u64("DISPATCHER_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            confirmation_timeout: read_u64("DISPATCHER_CONFIRMATION_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.confirmation_timeout),
            confirmation_poll_interval: read_u64("DISPATCHER_CONFIRMATION_POLL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.confirmation_poll_interval),
            backoff: BackoffPolicy::from_env("DISPATCHER", defaults.backoff),
            breaker: CircuitBreakerConfig {
                failure_threshold: read_u64("HOME_CHAIN_BREAKER_THRESHOLD")
                    .map(|v| v.max(1) as u32)
                    .unwrap_or(defaults.breaker.failure_threshold),
                cooldown: read_u64("HOME_CHAIN_BREAKER_COOLDOWN_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.breaker.cooldown),
            },
        }
    }

    fn max_attempts(&self) -> i32 {
        i32::try_from(self.backoff.max_attempts).unwrap_or(i32::MAX)
    }
}

/// Pays out confirmed payments exactly once
pub struct DistributionDispatcher {
    ledger: Arc<dyn PaymentLedger>,
    client: Arc<dyn DistributionClient>,
    target_decimals: u32,
    /// Next nonce to use; `None` forces a re-query of the pending nonce
    nonce: Mutex<Option<u64>>,
    breaker: CircuitBreaker,
    cache: Option<Arc<ContractDataCache>>,
    config: DispatcherConfig,
}

impl DistributionDispatcher {
    pub fn new(
        ledger: Arc<dyn PaymentLedger>,
        client: Arc<dyn DistributionClient>,
        target_decimals: u32,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            ledger,
            client,
            target_decimals,
            nonce: Mutex::new(None),
            breaker: CircuitBreaker::new("home-chain", config.breaker),
            cache: None,
            config,
        }
    }

    /// Invalidate `cache` after every confirmed distribution
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<ContractDataCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    #[must_use]
    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Whether the home chain is believed reachable. While the circuit is
    /// open nothing is claimed; once half-open a health check decides.
    async fn home_chain_available(&self) -> bool {
        match self.breaker.state() {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => self
                .breaker
                .call(|| self.client.health_check())
                .await
                .is_ok(),
        }
    }

    fn observe(&self, result: &Result<(), AppError>) {
        match result {
            Ok(()) => self.breaker.record_success(),
            Err(e) if e.is_retryable() => self.breaker.record_failure(),
            Err(_) => {}
        }
    }

    /// Claim and process one payment. Returns `false` when nothing was claimed.
    pub async fn process_next(&self) -> Result<bool, AppError> {
        if !self.home_chain_available().await {
            debug!("Home chain circuit open, not claiming");
            return Ok(false);
        }

        let Some(record) = self.ledger.claim_for_distribution().await? else {
            return Ok(false);
        };

        let result = self.distribute(&record).await;
        self.observe(&result);
        if let Err(e) = result {
            self.schedule_retry(&record, &e).await?;
        }
        Ok(true)
    }

    /// Drive one claimed record to `distributed`, or fail with the reason
    #[instrument(skip(self, record), fields(network = %record.network, tx_hash = %record.source_tx_hash, attempt = record.attempt_count + 1))]
    async fn distribute(&self, record: &PaymentRecord) -> Result<(), AppError> {
        if let Some(pending) = &record.pending_distribution_tx_hash {
            match self.client.get_receipt_status(pending).await? {
                Some(true) => {
                    info!(distribution_tx = %pending, "Earlier distribution already confirmed");
                    return self.complete(record, pending).await;
                }
                Some(false) => {
                    warn!(distribution_tx = %pending, "Earlier distribution reverted, resending");
                }
                None => {
                    // Never sign a replacement while the earlier transfer may still land
                    if self.rebroadcast(record, pending).await? {
                        self.wait_for_receipt(pending).await?;
                        return self.complete(record, pending).await;
                    }
                }
            }
        }

        let amount = record.target_base_units(self.target_decimals)?;
        let transfer = self.submit(record, amount).await?;
        info!(
            distribution_tx = %transfer.tx_hash,
            nonce = transfer.nonce,
            amount = %record.target_amount,
            "Distribution broadcast"
        );

        self.wait_for_receipt(&transfer.tx_hash).await?;
        self.complete(record, &transfer.tx_hash).await
    }

    /// Resend the stored bytes of an unconfirmed transfer. Returns `false`
    /// once the node has definitely refused them and the pending hash was
    /// cleared, which makes signing a new transfer safe.
    async fn rebroadcast(&self, record: &PaymentRecord, pending: &str) -> Result<bool, AppError> {
        let Some(raw) = &record.pending_distribution_raw_tx else {
            return Ok(true);
        };
        match self.client.rebroadcast(pending, raw).await {
            Ok(_) => {
                debug!(distribution_tx = %pending, "Pending distribution resent");
                Ok(true)
            }
            // Something with this nonce was mined; if it was this transfer
            // its receipt will show up
            Err(e) if nonce_consumed(&e) => Ok(true),
            Err(e) if !e.is_retryable() => {
                warn!(
                    distribution_tx = %pending,
                    error = %e,
                    "Pending distribution refused, signing a new one"
                );
                self.ledger.clear_broadcast(&record.key(), pending).await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Allocate a nonce, sign, persist the hash and broadcast, all inside the
    /// nonce critical section.
    async fn submit(&self, record: &PaymentRecord, amount: u128) -> Result<SignedTransfer, AppError> {
        let mut next_nonce = self.nonce.lock().await;
        let nonce = match *next_nonce {
            Some(nonce) => nonce,
            None => self.client.pending_nonce().await?,
        };

        let result = async {
            let transfer = self
                .client
                .sign_transfer(&record.buyer_address, amount, nonce)
                .await?;
            self.ledger
                .record_broadcast(&record.key(), &transfer.tx_hash, &transfer.raw_transaction)
                .await?;
            if let Err(e) = self.client.broadcast(&transfer).await {
                // A refused transfer never reaches the chain; an ambiguous
                // failure keeps its hash so the same bytes are resent later
                if !e.is_retryable() {
                    self.ledger
                        .clear_broadcast(&record.key(), &transfer.tx_hash)
                        .await?;
                }
                return Err(e);
            }
            Ok(transfer)
        }
        .await;

        *next_nonce = match &result {
            Ok(_) => Some(nonce + 1),
            Err(_) => None,
        };
        result
    }

    async fn wait_for_receipt(&self, tx_hash: &str) -> Result<(), AppError> {
        let deadline = tokio::time::Instant::now() + self.config.confirmation_timeout;
        loop {
            match self.client.get_receipt_status(tx_hash).await {
                Ok(Some(true)) => return Ok(()),
                Ok(Some(false)) => {
                    return Err(AppError::Blockchain(BlockchainError::TransactionFailed(
                        format!("distribution {} reverted", tx_hash),
                    )));
                }
                Ok(None) => {}
                Err(e) => debug!(distribution_tx = %tx_hash, error = %e, "Receipt poll failed"),
            }
            if tokio::time::Instant::now() + self.config.confirmation_poll_interval > deadline {
                return Err(AppError::Blockchain(BlockchainError::ConfirmationTimeout(
                    tx_hash.to_string(),
                )));
            }
            tokio::time::sleep(self.config.confirmation_poll_interval).await;
        }
    }

    async fn complete(&self, record: &PaymentRecord, tx_hash: &str) -> Result<(), AppError> {
        self.ledger.mark_distributed(&record.key(), tx_hash).await?;
        if let Some(cache) = &self.cache {
            cache.invalidate(CacheKey::ContractStats).await;
        }
        info!(
            network = %record.network,
            tx_hash = %record.source_tx_hash,
            distribution_tx = %tx_hash,
            "Payment distributed"
        );
        Ok(())
    }

    /// Return a record to `confirmed` with a backoff delay, or to `failed`
    /// once its attempts are spent.
    async fn schedule_retry(&self, record: &PaymentRecord, reason: &AppError) -> Result<(), AppError> {
        let attempt = u32::try_from(record.attempt_count + 1).unwrap_or(u32::MAX);
        let delay = self.config.backoff.delay_for(attempt);
        let next_retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        let status = self
            .ledger
            .mark_retry(
                &record.key(),
                &reason.to_string(),
                self.config.max_attempts(),
                next_retry_at,
            )
            .await?;

        if status == PaymentStatus::Failed {
            error!(
                network = %record.network,
                tx_hash = %record.source_tx_hash,
                attempts = attempt,
                error = %reason,
                "Distribution failed permanently, manual action required"
            );
        } else {
            warn!(
                network = %record.network,
                tx_hash = %record.source_tx_hash,
                attempt = attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %reason,
                "Distribution attempt failed, will retry"
            );
        }
        Ok(())
    }

    /// Resolve a `distributing` record whose worker went away: mark it
    /// distributed if its pending transfer landed, otherwise make it
    /// retry-eligible.
    #[instrument(skip(self, record), fields(network = %record.network, tx_hash = %record.source_tx_hash))]
    pub async fn resolve_stale(&self, record: &PaymentRecord) -> Result<PaymentStatus, AppError> {
        if let Some(pending) = &record.pending_distribution_tx_hash
            && self.client.get_receipt_status(pending).await? == Some(true)
        {
            self.complete(record, pending).await?;
            return Ok(PaymentStatus::Distributed);
        }

        let reason = AppError::Blockchain(BlockchainError::ConfirmationTimeout(
            record
                .pending_distribution_tx_hash
                .clone()
                .unwrap_or_else(|| "no transaction broadcast".to_string()),
        ));
        self.schedule_retry(record, &reason).await?;
        Ok(self
            .ledger
            .get_payment(&record.key())
            .await?
            .map_or(PaymentStatus::Confirmed, |r| r.status))
    }

    /// Process claimable records until none are left or shutdown is requested
    async fn drain(&self, worker_id: usize, shutdown_rx: &watch::Receiver<bool>) {
        while !*shutdown_rx.borrow() {
            match self.process_next().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    error!(worker = worker_id, error = %e, "Dispatcher worker error");
                    break;
                }
            }
        }
    }

    async fn run_worker(self: Arc<Self>, worker_id: usize, mut shutdown_rx: watch::Receiver<bool>) {
        info!(worker = worker_id, "Distribution worker started");
        let mut interval = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.drain(worker_id, &shutdown_rx).await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(worker = worker_id, "Distribution worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Whether a node refused a transaction because its nonce is already used
fn nonce_consumed(error: &AppError) -> bool {
    matches!(
        error,
        AppError::Blockchain(BlockchainError::TransactionRejected(msg))
            if msg.to_ascii_lowercase().contains("nonce too low")
    )
}

/// Spawn the worker pool
pub fn spawn_dispatcher(
    dispatcher: Arc<DistributionDispatcher>,
) -> (Vec<JoinHandle<()>>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = (0..dispatcher.config.workers)
        .map(|worker_id| {
            let dispatcher = Arc::clone(&dispatcher);
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(dispatcher.run_worker(worker_id, shutdown_rx))
        })
        .collect();
    (handles, shutdown_tx)
}
