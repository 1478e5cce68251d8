//! Per-network block watcher.
//!
//! Each source network gets its own task that polls for new blocks, processes
//! them in order once they are `confirmations` deep, and checkpoints progress
//! after every block. A failure in one network never stalls another.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::classifier::PaymentClassifier;
use super::filter::TransferFilter;
use crate::domain::{
    AppError, Anomaly, AnomalyKind, BlockCheckpoint, BlockchainError, ChainBlock, ChainClient,
    ConfigError, InvalidPaymentError, NetworkConfig, PaymentLedger,
};
use crate::infra::RpcClientConfig;
use crate::infra::resilience::BackoffPolicy;

/// Configuration for network watchers
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Interval between head polls
    pub poll_interval: Duration,
    /// Deadline for one RPC call, covering the client's own retries
    pub rpc_timeout: Duration,
    /// Number of processed block hashes kept for reorg rewinds
    pub reorg_window: usize,
    /// Blocks processed per poll before yielding
    pub max_blocks_per_poll: u64,
    /// Delay schedule after consecutive failed polls
    pub backoff: BackoffPolicy,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            rpc_timeout: RpcClientConfig::default().call_budget(),
            reorg_window: 128,
            max_blocks_per_poll: 50,
            backoff: BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(30), 5),
        }
    }
}

impl WatcherConfig {
    /// Defaults overridden by the `WATCHER_*` variables. Without
    /// `WATCHER_RPC_DEADLINE_MS` the RPC deadline is the client's full call budget.
    #[must_use]
    pub fn from_env(rpc: &RpcClientConfig) -> Self {
        let defaults = Self::default();
        let read_u64 = |key: &str| std::env::var(key).ok().and_then(|v| v.parse::<u64>().ok());
        Self {
            poll_interval: read_u64("WATCHER_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            rpc_timeout: read_u64("WATCHER_RPC_DEADLINE_MS")
                .map(Duration::from_millis)
                .unwrap_or_else(|| rpc.call_budget()),
            reorg_window: read_u64("WATCHER_REORG_WINDOW")
                .map(|v| v.max(1) as usize)
                .unwrap_or(defaults.reorg_window),
            max_blocks_per_poll: read_u64("WATCHER_MAX_BLOCKS_PER_POLL")
                .map(|v| v.max(1))
                .unwrap_or(defaults.max_blocks_per_poll),
            backoff: BackoffPolicy::from_env("WATCHER", defaults.backoff),
        }
    }
}

/// Watches one source network
pub struct NetworkWatcher {
    network: NetworkConfig,
    client: Arc<dyn ChainClient>,
    classifier: Arc<PaymentClassifier>,
    ledger: Arc<dyn PaymentLedger>,
    filter: TransferFilter,
    config: WatcherConfig,
    /// Processed `(number, hash)` pairs, oldest first
    recent: VecDeque<(u64, String)>,
    next_block: u64,
}

impl NetworkWatcher {
    pub fn new(
        network: NetworkConfig,
        client: Arc<dyn ChainClient>,
        classifier: Arc<PaymentClassifier>,
        ledger: Arc<dyn PaymentLedger>,
        config: WatcherConfig,
    ) -> Self {
        let filter = TransferFilter::for_network(classifier.catalog(), &network.id);
        Self {
            network,
            client,
            classifier,
            ledger,
            filter,
            config,
            recent: VecDeque::new(),
            next_block: 0,
        }
    }

    /// Next block this watcher will process
    #[must_use]
    pub fn next_block(&self) -> u64 {
        self.next_block
    }

    /// RPC call under the watcher deadline. Transient failures are retried by
    /// the client; whatever still fails ends the poll.
    async fn rpc<T, Fut>(&self, operation: &str, call: Fut) -> Result<T, AppError>
    where
        Fut: Future<Output = Result<T, AppError>>,
    {
        let timeout = self.config.rpc_timeout;
        tokio::time::timeout(timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(AppError::Blockchain(BlockchainError::Timeout(format!(
                    "{} after {:?}",
                    operation, timeout
                ))))
            })
    }

    /// Check that the endpoint serves the configured chain
    #[instrument(skip(self), fields(network = %self.network.id))]
    pub async fn verify_chain(&self) -> Result<(), AppError> {
        let actual = self
            .rpc("eth_chainId", self.client.chain_id())
            .await
            .map_err(|e| ConfigError::Unreachable {
                network: self.network.id.clone(),
                message: e.to_string(),
            })?;
        if actual != self.network.chain_id {
            return Err(ConfigError::ChainIdMismatch {
                network: self.network.id.clone(),
                expected: self.network.chain_id,
                actual,
            }
            .into());
        }
        Ok(())
    }

    /// Position the watcher from its checkpoint, `start_block`, or the safe tip
    #[instrument(skip(self), fields(network = %self.network.id))]
    pub async fn initialize(&mut self) -> Result<(), AppError> {
        self.recent.clear();
        if let Some(checkpoint) = self.ledger.get_checkpoint(&self.network.id).await? {
            self.recent
                .push_back((checkpoint.block_number, checkpoint.block_hash));
            self.next_block = checkpoint.block_number + 1;
            info!(block = self.next_block, "Resuming from checkpoint");
            return Ok(());
        }

        self.next_block = match self.network.start_block {
            Some(start) => start,
            None => {
                let head = self
                    .rpc("eth_blockNumber", self.client.latest_block_number())
                    .await?;
                head.saturating_sub(self.network.confirmations)
            }
        };
        info!(block = self.next_block, "Starting without checkpoint");
        Ok(())
    }

    /// Process every block that has reached confirmation depth, up to
    /// `max_blocks_per_poll` blocks and rewinds. Returns the number of blocks
    /// handled.
    #[instrument(skip(self), fields(network = %self.network.id))]
    pub async fn poll_once(&mut self) -> Result<u64, AppError> {
        let head = self
            .rpc("eth_blockNumber", self.client.latest_block_number())
            .await?;

        let mut processed = 0;
        let mut steps = 0;
        while steps < self.config.max_blocks_per_poll
            && head >= self.next_block.saturating_add(self.network.confirmations)
        {
            steps += 1;
            let number = self.next_block;
            let Some(block) = self
                .rpc("eth_getBlockByNumber", self.client.get_block(number))
                .await?
            else {
                debug!(block = number, "Block not available yet");
                break;
            };

            if !self.is_continuous(&block) {
                self.handle_reorg(&block).await?;
                continue;
            }

            self.process_block(&block).await?;
            processed += 1;
        }
        Ok(processed)
    }

    fn is_continuous(&self, block: &ChainBlock) -> bool {
        match self.recent.back() {
            Some((number, hash)) if number + 1 == block.number => *hash == block.parent_hash,
            _ => true,
        }
    }

    /// Rewind to the newest retained block that is still canonical
    async fn handle_reorg(&mut self, block: &ChainBlock) -> Result<(), AppError> {
        warn!(
            block = block.number,
            parent_hash = %block.parent_hash,
            "Parent hash mismatch, rewinding"
        );

        let mut resume = block.number;
        while let Some((number, hash)) = self.recent.back().cloned() {
            let canonical = self
                .rpc("eth_getBlockByNumber", self.client.get_block(number))
                .await?;
            if canonical.is_some_and(|b| b.hash == hash) {
                break;
            }
            self.recent.pop_back();
            resume = number;
        }

        // Tip still canonical: the node served a block from another branch
        if resume == block.number {
            return Err(AppError::Blockchain(BlockchainError::RpcError(format!(
                "block {} parent {} does not match canonical block {}",
                block.number,
                block.parent_hash,
                block.number.saturating_sub(1)
            ))));
        }

        let anomaly = Anomaly::new(
            &self.network.id,
            AnomalyKind::DeepReorg,
            format!(
                "block {} parent {} does not extend processed chain, resuming at {}",
                block.number, block.parent_hash, resume
            ),
        )
        .with_block(block.number);
        self.ledger.record_anomaly(&anomaly).await?;
        self.flag_orphaned(resume).await?;

        match self.recent.back().cloned() {
            Some((number, hash)) => {
                self.ledger
                    .save_checkpoint(&BlockCheckpoint {
                        network: self.network.id.clone(),
                        block_number: number,
                        block_hash: hash,
                        updated_at: Utc::now(),
                    })
                    .await?;
            }
            None => error!(
                resume = resume,
                window = self.config.reorg_window,
                "Reorg deeper than retained window"
            ),
        }

        info!(resume = resume, "Rewound after reorg");
        self.next_block = resume;
        Ok(())
    }

    /// Flag recorded payments from rewound blocks that left the canonical chain
    async fn flag_orphaned(&self, from_block: u64) -> Result<(), AppError> {
        let records = self.ledger.get_from_block(&self.network.id, from_block).await?;
        for record in records {
            let still_mined = self
                .rpc(
                    "eth_getTransactionByHash",
                    self.client.get_transaction(&record.source_tx_hash),
                )
                .await?
                .is_some_and(|tx| tx.block_number.is_some());
            if still_mined {
                continue;
            }

            warn!(
                tx_hash = %record.source_tx_hash,
                block = record.block_number,
                status = %record.status,
                "Recorded payment orphaned by reorg"
            );
            let anomaly = Anomaly::new(
                &self.network.id,
                AnomalyKind::OrphanedPayment,
                format!(
                    "payment from block {} is no longer on the canonical chain (status {})",
                    record.block_number, record.status
                ),
            )
            .with_tx(&record.source_tx_hash)
            .with_block(u64::try_from(record.block_number).unwrap_or_default());
            self.ledger.record_anomaly(&anomaly).await?;
        }
        Ok(())
    }

    async fn process_block(&mut self, block: &ChainBlock) -> Result<(), AppError> {
        for tx in &block.transactions {
            let candidate = match self.filter.extract(tx, block.number) {
                Ok(Some(candidate)) => candidate,
                Ok(None) => continue,
                Err(reason) => {
                    self.record_rejected(&tx.hash, block.number, &reason).await?;
                    continue;
                }
            };

            let hash = candidate.source_tx_hash.clone();
            let status = self
                .rpc("eth_getTransactionReceipt", self.client.get_receipt_status(&hash))
                .await?;
            match status {
                Some(true) => {
                    self.classifier.record_or_flag(&candidate).await?;
                }
                Some(false) => {
                    let reason = InvalidPaymentError::Reverted(hash.clone());
                    self.classifier.flag(&candidate, &reason).await?;
                }
                None => {
                    return Err(AppError::Blockchain(BlockchainError::RpcError(format!(
                        "no receipt for mined transaction {}",
                        hash
                    ))));
                }
            }
        }

        self.ledger
            .save_checkpoint(&BlockCheckpoint {
                network: self.network.id.clone(),
                block_number: block.number,
                block_hash: block.hash.clone(),
                updated_at: Utc::now(),
            })
            .await?;

        self.recent.push_back((block.number, block.hash.clone()));
        while self.recent.len() > self.config.reorg_window {
            self.recent.pop_front();
        }
        self.next_block = block.number + 1;
        debug!(block = block.number, txs = block.transactions.len(), "Block processed");
        Ok(())
    }

    async fn record_rejected(
        &self,
        tx_hash: &str,
        block_number: u64,
        reason: &InvalidPaymentError,
    ) -> Result<(), AppError> {
        warn!(tx_hash = %tx_hash, block = block_number, reason = %reason, "Rejected transfer");
        let anomaly = Anomaly::new(&self.network.id, reason.anomaly_kind(), reason.to_string())
            .with_tx(tx_hash)
            .with_block(block_number);
        self.ledger.record_anomaly(&anomaly).await?;
        Ok(())
    }

    /// Run until shutdown is signalled.
    ///
    /// Returns an error only for startup configuration failures; runtime
    /// failures are logged and retried on the next poll.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), AppError> {
        self.verify_chain().await?;
        self.initialize().await?;

        info!(
            network = %self.network.id,
            confirmations = self.network.confirmations,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Network watcher started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.poll_once().await {
                        Ok(processed) => {
                            failures = 0;
                            if processed >= self.config.max_blocks_per_poll {
                                // Still behind; poll again without waiting
                                interval.reset_immediately();
                            }
                        }
                        Err(e) => {
                            failures = failures.saturating_add(1);
                            let delay = self.config.backoff.delay_for(failures);
                            error!(
                                network = %self.network.id,
                                error = %e,
                                failures = failures,
                                retry_in_ms = delay.as_millis() as u64,
                                "Watcher poll failed"
                            );
                            interval.reset_after(delay);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(network = %self.network.id, "Network watcher shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Spawn one task per watcher, sharing a shutdown channel
pub fn spawn_watchers(watchers: Vec<NetworkWatcher>) -> (Vec<JoinHandle<()>>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = watchers
        .into_iter()
        .map(|watcher| {
            let shutdown_rx = shutdown_rx.clone();
            let network = watcher.network.id.clone();
            tokio::spawn(async move {
                if let Err(e) = watcher.run(shutdown_rx).await {
                    error!(network = %network, error = %e, "Network watcher stopped");
                }
            })
        })
        .collect();
    (handles, shutdown_tx)
}
