//! Mock implementations for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::domain::{
    AggregateStats, AppError, Anomaly, BlockCheckpoint, BlockchainError, ChainBlock, ChainClient,
    ChainTransaction, ContractReader, DatabaseError, DistributionClient, InsertOutcome, PaymentKey,
    PaymentLedger, PaymentRecord, PaymentStatus, SignedTransfer, StatsBreakdown, normalize_hex,
};
use crate::infra::blockchain::abi::selector;

/// Configuration for mock behavior
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub should_fail: bool,
    pub error_message: Option<String>,
}

impl MockConfig {
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            should_fail: true,
            error_message: Some(message.into()),
        }
    }
}

/// In-memory ledger with the same transition rules as the Postgres one.
///
/// Every operation holds the storage lock for its whole duration, so
/// concurrent callers observe atomic updates.
pub struct MockLedger {
    records: Arc<Mutex<HashMap<PaymentKey, PaymentRecord>>>,
    checkpoints: Arc<Mutex<HashMap<String, BlockCheckpoint>>>,
    anomalies: Arc<Mutex<Vec<Anomaly>>>,
    config: MockConfig,
    is_healthy: AtomicBool,
}

impl MockLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            checkpoints: Arc::new(Mutex::new(HashMap::new())),
            anomalies: Arc::new(Mutex::new(Vec::new())),
            config,
            is_healthy: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Get all stored records (for testing)
    pub fn get_all_records(&self) -> Vec<PaymentRecord> {
        self.records.lock().unwrap().values().cloned().collect()
    }

    /// Recorded anomalies in insertion order
    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.anomalies.lock().unwrap().clone()
    }

    /// Store a record as-is, bypassing the state machine
    pub fn insert_record(&self, record: PaymentRecord) {
        self.records.lock().unwrap().insert(record.key(), record);
    }

    /// Backdate `updated_at` so the record looks stale
    pub fn set_updated_at(&self, key: &PaymentKey, updated_at: DateTime<Utc>) {
        if let Some(record) = self.records.lock().unwrap().get_mut(key) {
            record.updated_at = updated_at;
        }
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            let msg = self
                .config
                .error_message
                .clone()
                .unwrap_or_else(|| "Mock error".to_string());
            return Err(AppError::Database(DatabaseError::Query(msg)));
        }
        Ok(())
    }

    fn with_distributing<T>(
        &self,
        key: &PaymentKey,
        target: PaymentStatus,
        update: impl FnOnce(&mut PaymentRecord) -> T,
    ) -> Result<T, AppError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(key)
            .ok_or_else(|| AppError::Database(DatabaseError::NotFound(key.to_string())))?;
        if record.status != PaymentStatus::Distributing {
            return Err(AppError::InvalidTransition {
                from: record.status,
                to: target,
            });
        }
        let result = update(record);
        record.updated_at = Utc::now();
        Ok(result)
    }
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn add_to(breakdown: &mut StatsBreakdown, record: &PaymentRecord) {
    breakdown.payments += 1;
    breakdown.usd_raised += record.usd_value;
    if record.status == PaymentStatus::Distributed {
        breakdown.target_distributed += record.target_amount;
    }
}

#[async_trait]
impl PaymentLedger for MockLedger {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Database(DatabaseError::Connection(
                "Unhealthy".to_string(),
            )));
        }
        self.check_should_fail()
    }

    async fn upsert_detected(&self, record: &PaymentRecord) -> Result<InsertOutcome, AppError> {
        self.check_should_fail()?;
        let mut records = self.records.lock().unwrap();
        let key = record.key();
        if let Some(existing) = records.get(&key) {
            return Ok(InsertOutcome::AlreadyExists(existing.clone()));
        }
        records.insert(key, record.clone());
        Ok(InsertOutcome::Inserted(record.clone()))
    }

    async fn claim_for_distribution(&self) -> Result<Option<PaymentRecord>, AppError> {
        self.check_should_fail()?;
        let now = Utc::now();
        let mut records = self.records.lock().unwrap();
        let next = records
            .values_mut()
            .filter(|r| {
                r.status == PaymentStatus::Confirmed && r.next_retry_at.is_none_or(|t| t <= now)
            })
            .min_by_key(|r| r.created_at);
        Ok(next.map(|record| {
            record.status = PaymentStatus::Distributing;
            record.updated_at = now;
            record.clone()
        }))
    }

    async fn record_broadcast(
        &self,
        key: &PaymentKey,
        tx_hash: &str,
        raw_transaction: &str,
    ) -> Result<(), AppError> {
        self.check_should_fail()?;
        self.with_distributing(key, PaymentStatus::Distributing, |record| {
            record.pending_distribution_tx_hash = Some(tx_hash.to_string());
            record.pending_distribution_raw_tx = Some(raw_transaction.to_string());
        })
    }

    async fn clear_broadcast(&self, key: &PaymentKey, tx_hash: &str) -> Result<bool, AppError> {
        self.check_should_fail()?;
        let mut records = self.records.lock().unwrap();
        let Some(record) = records.get_mut(key) else {
            return Ok(false);
        };
        if record.status != PaymentStatus::Distributing
            || record.pending_distribution_tx_hash.as_deref() != Some(tx_hash)
        {
            return Ok(false);
        }
        record.pending_distribution_tx_hash = None;
        record.pending_distribution_raw_tx = None;
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_distributed(&self, key: &PaymentKey, tx_hash: &str) -> Result<(), AppError> {
        self.check_should_fail()?;
        self.with_distributing(key, PaymentStatus::Distributed, |record| {
            record.status = PaymentStatus::Distributed;
            record.distribution_tx_hash = Some(tx_hash.to_string());
            record.next_retry_at = None;
        })
    }

    async fn mark_retry(
        &self,
        key: &PaymentKey,
        error: &str,
        max_attempts: i32,
        next_retry_at: DateTime<Utc>,
    ) -> Result<PaymentStatus, AppError> {
        self.check_should_fail()?;
        self.with_distributing(key, PaymentStatus::Confirmed, |record| {
            record.attempt_count += 1;
            record.last_error = Some(error.to_string());
            if record.attempt_count >= max_attempts {
                record.status = PaymentStatus::Failed;
                record.next_retry_at = None;
            } else {
                record.status = PaymentStatus::Confirmed;
                record.next_retry_at = Some(next_retry_at);
            }
            record.status
        })
    }

    async fn get_payment(&self, key: &PaymentKey) -> Result<Option<PaymentRecord>, AppError> {
        self.check_should_fail()?;
        Ok(self.records.lock().unwrap().get(key).cloned())
    }

    async fn get_by_tx_hash(&self, tx_hash: &str) -> Result<Option<PaymentRecord>, AppError> {
        self.check_should_fail()?;
        let tx_hash = normalize_hex(tx_hash);
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.source_tx_hash == tx_hash)
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn get_by_user(&self, buyer_address: &str) -> Result<Vec<PaymentRecord>, AppError> {
        self.check_should_fail()?;
        let mut items: Vec<PaymentRecord> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.buyer_address.eq_ignore_ascii_case(buyer_address))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items)
    }

    async fn get_by_status(
        &self,
        status: PaymentStatus,
        limit: i64,
    ) -> Result<Vec<PaymentRecord>, AppError> {
        self.check_should_fail()?;
        let mut items: Vec<PaymentRecord> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        items.truncate(limit.clamp(1, 500) as usize);
        Ok(items)
    }

    async fn get_from_block(
        &self,
        network: &str,
        from_block: u64,
    ) -> Result<Vec<PaymentRecord>, AppError> {
        self.check_should_fail()?;
        let from_block = i64::try_from(from_block).unwrap_or(i64::MAX);
        let mut items: Vec<PaymentRecord> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.network == network && r.block_number >= from_block)
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            (a.block_number, &a.source_tx_hash).cmp(&(b.block_number, &b.source_tx_hash))
        });
        Ok(items)
    }

    async fn get_aggregate_stats(&self) -> Result<AggregateStats, AppError> {
        self.check_should_fail()?;
        let records = self.records.lock().unwrap();
        let mut stats = AggregateStats {
            by_network: BTreeMap::new(),
            by_token: BTreeMap::new(),
            ..Default::default()
        };
        for record in records.values() {
            stats.total_payments += 1;
            stats.total_usd_raised += record.usd_value;
            if record.status == PaymentStatus::Distributed {
                stats.total_target_distributed += record.target_amount;
            }
            add_to(
                stats.by_network.entry(record.network.clone()).or_default(),
                record,
            );
            add_to(
                stats.by_token.entry(record.payment_token.clone()).or_default(),
                record,
            );
        }
        Ok(stats)
    }

    async fn find_stale_distributing(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentRecord>, AppError> {
        self.check_should_fail()?;
        let mut items: Vec<PaymentRecord> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.status == PaymentStatus::Distributing && r.updated_at < older_than)
            .cloned()
            .collect();
        items.sort_by_key(|r| r.updated_at);
        items.truncate(limit.max(0) as usize);
        Ok(items)
    }

    async fn get_checkpoint(&self, network: &str) -> Result<Option<BlockCheckpoint>, AppError> {
        self.check_should_fail()?;
        Ok(self.checkpoints.lock().unwrap().get(network).cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &BlockCheckpoint) -> Result<(), AppError> {
        self.check_should_fail()?;
        self.checkpoints
            .lock()
            .unwrap()
            .insert(checkpoint.network.clone(), checkpoint.clone());
        Ok(())
    }

    async fn record_anomaly(&self, anomaly: &Anomaly) -> Result<bool, AppError> {
        self.check_should_fail()?;
        let mut anomalies = self.anomalies.lock().unwrap();
        let repeat = anomaly.source_tx_hash.is_some()
            && anomalies.iter().any(|a| {
                a.network == anomaly.network
                    && a.source_tx_hash == anomaly.source_tx_hash
                    && a.kind == anomaly.kind
            });
        if repeat {
            return Ok(false);
        }
        anomalies.push(anomaly.clone());
        Ok(true)
    }

    async fn list_anomalies(&self, limit: i64) -> Result<Vec<Anomaly>, AppError> {
        self.check_should_fail()?;
        let mut items = self.anomalies.lock().unwrap().clone();
        items.reverse();
        items.truncate(limit.max(0) as usize);
        Ok(items)
    }
}

/// Scriptable source chain.
///
/// Blocks are appended with [`add_block`](Self::add_block); block hashes
/// encode a fork counter so [`reorg`](Self::reorg) produces a competing
/// branch with different hashes. Every transaction gets a successful receipt
/// unless overridden.
pub struct MockChainClient {
    network: String,
    chain_id: u64,
    blocks: Mutex<BTreeMap<u64, ChainBlock>>,
    receipts: Mutex<HashMap<String, bool>>,
    /// `(holder, token contract)` to base units; `None` is the native coin
    balances: Mutex<HashMap<(String, Option<String>), u128>>,
    fork: AtomicU64,
    fail_next: AtomicU32,
    calls: AtomicUsize,
}

impl MockChainClient {
    /// Chain with only a genesis block (number 0)
    #[must_use]
    pub fn new(network: impl Into<String>, chain_id: u64) -> Self {
        let client = Self {
            network: network.into(),
            chain_id,
            blocks: Mutex::new(BTreeMap::new()),
            receipts: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
            fork: AtomicU64::new(0),
            fail_next: AtomicU32::new(0),
            calls: AtomicUsize::new(0),
        };
        client.add_block(Vec::new());
        client
    }

    fn block_hash(fork: u64, number: u64) -> String {
        format!("0x{:032x}{:032x}", fork, number)
    }

    /// Append a block on top of the current head; returns its number
    pub fn add_block(&self, transactions: Vec<ChainTransaction>) -> u64 {
        let mut blocks = self.blocks.lock().unwrap();
        let fork = self.fork.load(Ordering::SeqCst);
        let (number, parent_hash) = match blocks.last_key_value() {
            Some((n, b)) => (n + 1, b.hash.clone()),
            None => (0, Self::block_hash(0, u64::MAX)),
        };
        let mut receipts = self.receipts.lock().unwrap();
        let transactions = transactions
            .into_iter()
            .map(|mut tx| {
                tx.block_number = Some(number);
                receipts.entry(tx.hash.clone()).or_insert(true);
                tx
            })
            .collect();
        blocks.insert(
            number,
            ChainBlock {
                number,
                hash: Self::block_hash(fork, number),
                parent_hash,
                transactions,
            },
        );
        number
    }

    pub fn add_empty_blocks(&self, count: u64) {
        for _ in 0..count {
            self.add_block(Vec::new());
        }
    }

    /// Drop blocks from `from` upward and build a new branch in their place
    pub fn reorg(&self, from: u64, branch: Vec<Vec<ChainTransaction>>) {
        {
            let mut blocks = self.blocks.lock().unwrap();
            blocks.retain(|n, _| *n < from);
        }
        self.fork.fetch_add(1, Ordering::SeqCst);
        for transactions in branch {
            self.add_block(transactions);
        }
    }

    /// Serve block `number` with a parent from another branch, leaving its
    /// ancestors untouched
    pub fn set_parent_hash(&self, number: u64, parent_hash: &str) {
        if let Some(block) = self.blocks.lock().unwrap().get_mut(&number) {
            block.parent_hash = parent_hash.to_string();
        }
    }

    pub fn head(&self) -> u64 {
        self.blocks
            .lock()
            .unwrap()
            .last_key_value()
            .map(|(n, _)| *n)
            .unwrap_or(0)
    }

    pub fn set_receipt(&self, tx_hash: &str, success: bool) {
        self.receipts
            .lock()
            .unwrap()
            .insert(tx_hash.to_string(), success);
    }

    /// Balance of `holder` in `token` (`None` for the native coin)
    pub fn set_balance(&self, holder: &str, token: Option<&str>, amount: u128) {
        self.balances.lock().unwrap().insert(
            (normalize_hex(holder), token.map(normalize_hex)),
            amount,
        );
    }

    fn balance(&self, holder: &str, token: Option<&str>) -> u128 {
        self.balances
            .lock()
            .unwrap()
            .get(&(normalize_hex(holder), token.map(normalize_hex)))
            .copied()
            .unwrap_or(0)
    }

    /// Leave a mined transaction without a receipt, as a lagging node does
    pub fn clear_receipt(&self, tx_hash: &str) {
        self.receipts.lock().unwrap().remove(tx_hash);
    }

    /// Make the next `count` calls fail with a timeout
    pub fn fail_next_calls(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Transaction on the current canonical branch
    fn find_transaction(&self, tx_hash: &str) -> Option<ChainTransaction> {
        let tx_hash = normalize_hex(tx_hash);
        self.blocks
            .lock()
            .unwrap()
            .values()
            .flat_map(|b| b.transactions.iter())
            .find(|tx| tx.hash == tx_hash)
            .cloned()
    }

    fn tick(&self) -> Result<(), AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(AppError::Blockchain(BlockchainError::Timeout(
                "mock timeout".to_string(),
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    fn network(&self) -> &str {
        &self.network
    }

    async fn chain_id(&self) -> Result<u64, AppError> {
        self.tick()?;
        Ok(self.chain_id)
    }

    async fn latest_block_number(&self) -> Result<u64, AppError> {
        self.tick()?;
        Ok(self.head())
    }

    async fn get_block(&self, number: u64) -> Result<Option<ChainBlock>, AppError> {
        self.tick()?;
        Ok(self.blocks.lock().unwrap().get(&number).cloned())
    }

    async fn get_transaction(&self, tx_hash: &str) -> Result<Option<ChainTransaction>, AppError> {
        self.tick()?;
        Ok(self.find_transaction(tx_hash))
    }

    async fn get_receipt_status(&self, tx_hash: &str) -> Result<Option<bool>, AppError> {
        self.tick()?;
        if self.find_transaction(tx_hash).is_none() {
            return Ok(None);
        }
        Ok(self
            .receipts
            .lock()
            .unwrap()
            .get(&normalize_hex(tx_hash))
            .copied())
    }

    async fn native_balance(&self, address: &str) -> Result<u128, AppError> {
        self.tick()?;
        Ok(self.balance(address, None))
    }

    async fn token_balance(&self, token: &str, holder: &str) -> Result<u128, AppError> {
        self.tick()?;
        Ok(self.balance(holder, Some(token)))
    }
}

/// How the mock home chain settles broadcast transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptMode {
    /// Mined with a successful receipt
    Success,
    /// Mined but reverted
    Revert,
    /// Never mined
    Pending,
}

/// Mock home-chain client recording every signed and broadcast transfer
pub struct MockDistributionClient {
    signer: String,
    pending_nonce: AtomicU64,
    receipt_mode: Mutex<ReceiptMode>,
    receipts: Mutex<HashMap<String, bool>>,
    broadcasts: Mutex<Vec<SignedTransfer>>,
    fail_broadcasts: AtomicU32,
    drop_broadcasts: AtomicU32,
    broadcast_error: Mutex<String>,
    is_healthy: AtomicBool,
}

impl MockDistributionClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            signer: "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266".to_string(),
            pending_nonce: AtomicU64::new(0),
            receipt_mode: Mutex::new(ReceiptMode::Success),
            receipts: Mutex::new(HashMap::new()),
            broadcasts: Mutex::new(Vec::new()),
            fail_broadcasts: AtomicU32::new(0),
            drop_broadcasts: AtomicU32::new(0),
            broadcast_error: Mutex::new("nonce too low".to_string()),
            is_healthy: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn with_receipt_mode(mode: ReceiptMode) -> Self {
        let client = Self::new();
        client.set_receipt_mode(mode);
        client
    }

    pub fn set_receipt_mode(&self, mode: ReceiptMode) {
        *self.receipt_mode.lock().unwrap() = mode;
    }

    /// Make the next `count` broadcasts fail with a rejection
    pub fn fail_next_broadcasts(&self, count: u32, message: impl Into<String>) {
        *self.broadcast_error.lock().unwrap() = message.into();
        self.fail_broadcasts.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` broadcasts time out without reaching the chain
    pub fn drop_next_broadcasts(&self, count: u32) {
        self.drop_broadcasts.store(count, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Settle a transaction outside of the receipt mode
    pub fn set_receipt(&self, tx_hash: &str, success: bool) {
        self.receipts
            .lock()
            .unwrap()
            .insert(tx_hash.to_string(), success);
    }

    pub fn broadcasts(&self) -> Vec<SignedTransfer> {
        self.broadcasts.lock().unwrap().clone()
    }

    async fn accept(&self, transfer: SignedTransfer) -> Result<String, AppError> {
        self.health_check().await?;
        let take = |counter: &AtomicU32| {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        };
        if take(&self.drop_broadcasts) {
            return Err(AppError::Blockchain(BlockchainError::Timeout(
                "mock broadcast timeout".to_string(),
            )));
        }
        // A node already holding the transaction reports it as known
        if self
            .broadcasts
            .lock()
            .unwrap()
            .iter()
            .any(|t| t.tx_hash == transfer.tx_hash)
        {
            return Ok(transfer.tx_hash);
        }
        if take(&self.fail_broadcasts) {
            let message = self.broadcast_error.lock().unwrap().clone();
            return Err(AppError::Blockchain(BlockchainError::TransactionRejected(
                message,
            )));
        }

        self.pending_nonce
            .fetch_max(transfer.nonce + 1, Ordering::SeqCst);
        match *self.receipt_mode.lock().unwrap() {
            ReceiptMode::Success => self.set_receipt(&transfer.tx_hash, true),
            ReceiptMode::Revert => self.set_receipt(&transfer.tx_hash, false),
            ReceiptMode::Pending => {}
        }
        let tx_hash = transfer.tx_hash.clone();
        self.broadcasts.lock().unwrap().push(transfer);
        Ok(tx_hash)
    }
}

impl Default for MockDistributionClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributionClient for MockDistributionClient {
    async fn health_check(&self) -> Result<(), AppError> {
        if self.is_healthy.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(AppError::Blockchain(BlockchainError::Connection(
                "Unhealthy".to_string(),
            )))
        }
    }

    fn signer_address(&self) -> String {
        self.signer.clone()
    }

    async fn pending_nonce(&self) -> Result<u64, AppError> {
        self.health_check().await?;
        Ok(self.pending_nonce.load(Ordering::SeqCst))
    }

    async fn sign_transfer(
        &self,
        to: &str,
        amount: u128,
        nonce: u64,
    ) -> Result<SignedTransfer, AppError> {
        let raw = format!("{}:{}:{}", normalize_hex(to), amount, nonce);
        let tx_hash = format!("0x{}", hex::encode(Sha256::digest(raw.as_bytes())));
        Ok(SignedTransfer {
            tx_hash,
            raw_transaction: format!("0x{}", hex::encode(raw.as_bytes())),
            nonce,
        })
    }

    async fn broadcast(&self, transfer: &SignedTransfer) -> Result<String, AppError> {
        self.accept(transfer.clone()).await
    }

    async fn rebroadcast(&self, tx_hash: &str, raw_transaction: &str) -> Result<String, AppError> {
        let bytes = crate::infra::blockchain::abi::decode_hex(raw_transaction)
            .map_err(|e| AppError::Blockchain(BlockchainError::RpcError(e.to_string())))?;
        let nonce = String::from_utf8_lossy(&bytes)
            .rsplit(':')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or_default();
        self.accept(SignedTransfer {
            tx_hash: tx_hash.to_string(),
            raw_transaction: raw_transaction.to_string(),
            nonce,
        })
        .await
    }

    async fn get_receipt_status(&self, tx_hash: &str) -> Result<Option<bool>, AppError> {
        self.health_check().await?;
        Ok(self.receipts.lock().unwrap().get(tx_hash).copied())
    }
}

/// Mock sale contract answering view calls by function signature
pub struct MockContractReader {
    deployed: AtomicBool,
    responses: Mutex<HashMap<[u8; 4], Vec<[u8; 32]>>>,
    should_fail: AtomicBool,
    code_checks: AtomicUsize,
    calls: AtomicUsize,
}

impl MockContractReader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            deployed: AtomicBool::new(true),
            responses: Mutex::new(HashMap::new()),
            should_fail: AtomicBool::new(false),
            code_checks: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_deployed(&self, deployed: bool) {
        self.deployed.store(deployed, Ordering::SeqCst);
    }

    /// Answer `signature` (e.g. `getStats()`) with the given uint256 words
    pub fn set_response(&self, signature: &str, values: &[u128]) {
        let words = values
            .iter()
            .map(|v| {
                let mut word = [0u8; 32];
                word[16..].copy_from_slice(&v.to_be_bytes());
                word
            })
            .collect();
        self.responses
            .lock()
            .unwrap()
            .insert(selector(signature), words);
    }

    /// Make every call fail with a connection error
    pub fn set_failing(&self, failing: bool) {
        self.should_fail.store(failing, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn code_check_count(&self) -> usize {
        self.code_checks.load(Ordering::SeqCst)
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(AppError::Blockchain(BlockchainError::Connection(
                "mock contract unavailable".to_string(),
            )));
        }
        Ok(())
    }
}

impl Default for MockContractReader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContractReader for MockContractReader {
    async fn code_exists(&self, _address: &str) -> Result<bool, AppError> {
        self.code_checks.fetch_add(1, Ordering::SeqCst);
        self.check_should_fail()?;
        Ok(self.deployed.load(Ordering::SeqCst))
    }

    async fn call_words(&self, _address: &str, calldata: &[u8]) -> Result<Vec<[u8; 32]>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check_should_fail()?;
        if calldata.len() < 4 {
            return Err(AppError::Blockchain(BlockchainError::RpcError(
                "calldata too short".to_string(),
            )));
        }
        let mut sel = [0u8; 4];
        sel.copy_from_slice(&calldata[..4]);
        self.responses
            .lock()
            .unwrap()
            .get(&sel)
            .cloned()
            .ok_or_else(|| {
                AppError::Blockchain(BlockchainError::TransactionFailed(
                    "execution reverted".to_string(),
                ))
            })
    }
}
