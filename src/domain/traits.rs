//! Domain traits defining contracts for external systems.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::error::AppError;
use super::types::{
    AggregateStats, Anomaly, BlockCheckpoint, ChainBlock, ChainTransaction, PaymentKey,
    PaymentRecord, PaymentStatus,
};

/// Result of inserting a classified payment
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// The record did not exist and was stored
    Inserted(PaymentRecord),
    /// A record with the same identity already exists; it was not modified
    AlreadyExists(PaymentRecord),
}

impl InsertOutcome {
    #[must_use]
    pub fn record(&self) -> &PaymentRecord {
        match self {
            Self::Inserted(r) | Self::AlreadyExists(r) => r,
        }
    }

    #[must_use]
    pub fn into_record(self) -> PaymentRecord {
        match self {
            Self::Inserted(r) | Self::AlreadyExists(r) => r,
        }
    }
}

/// Durable payment ledger and its state machine.
///
/// Every mutation is atomic with respect to concurrent callers. Transitions
/// not allowed by [`PaymentStatus::can_transition_to`] fail with
/// [`AppError::InvalidTransition`].
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    /// Check database connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Insert a classified record unless its identity already exists
    async fn upsert_detected(&self, record: &PaymentRecord) -> Result<InsertOutcome, AppError>;

    /// Atomically move one eligible `confirmed` record to `distributing`.
    ///
    /// Eligible means `next_retry_at` is unset or in the past. Concurrent
    /// callers never receive the same record.
    async fn claim_for_distribution(&self) -> Result<Option<PaymentRecord>, AppError>;

    /// Remember a signed distribution transaction before broadcast
    async fn record_broadcast(
        &self,
        key: &PaymentKey,
        tx_hash: &str,
        raw_transaction: &str,
    ) -> Result<(), AppError>;

    /// Forget the pending transaction of a `distributing` record, but only if
    /// it is still `tx_hash`. Returns whether anything was cleared.
    async fn clear_broadcast(&self, key: &PaymentKey, tx_hash: &str) -> Result<bool, AppError>;

    /// `distributing -> distributed`
    async fn mark_distributed(&self, key: &PaymentKey, tx_hash: &str) -> Result<(), AppError>;

    /// `distributing -> confirmed` with a retry time, or `-> failed` once
    /// `attempt_count` reaches `max_attempts`. Returns the resulting status.
    async fn mark_retry(
        &self,
        key: &PaymentKey,
        error: &str,
        max_attempts: i32,
        next_retry_at: DateTime<Utc>,
    ) -> Result<PaymentStatus, AppError>;

    /// Get a record by identity
    async fn get_payment(&self, key: &PaymentKey) -> Result<Option<PaymentRecord>, AppError>;

    /// Get the most recent record for a source transaction hash on any network
    async fn get_by_tx_hash(&self, tx_hash: &str) -> Result<Option<PaymentRecord>, AppError>;

    /// All records for a buyer, newest first. Address match is case-insensitive.
    async fn get_by_user(&self, buyer_address: &str) -> Result<Vec<PaymentRecord>, AppError>;

    /// Records in `status`, most recently updated first
    async fn get_by_status(
        &self,
        status: PaymentStatus,
        limit: i64,
    ) -> Result<Vec<PaymentRecord>, AppError>;

    /// Records of `network` found at or above `from_block`
    async fn get_from_block(
        &self,
        network: &str,
        from_block: u64,
    ) -> Result<Vec<PaymentRecord>, AppError>;

    async fn get_aggregate_stats(&self) -> Result<AggregateStats, AppError>;

    /// `distributing` records last touched before `older_than`
    async fn find_stale_distributing(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentRecord>, AppError>;

    async fn get_checkpoint(&self, network: &str) -> Result<Option<BlockCheckpoint>, AppError>;

    async fn save_checkpoint(&self, checkpoint: &BlockCheckpoint) -> Result<(), AppError>;

    /// Store an anomaly. One tied to a transaction is stored once per kind;
    /// returns `false` for such a repeat.
    async fn record_anomaly(&self, anomaly: &Anomaly) -> Result<bool, AppError>;

    /// Newest anomalies first
    async fn list_anomalies(&self, limit: i64) -> Result<Vec<Anomaly>, AppError>;
}

/// Read access to a source chain
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Network id this client serves
    fn network(&self) -> &str;

    /// Chain id reported by the endpoint
    async fn chain_id(&self) -> Result<u64, AppError>;

    /// Current head block number
    async fn latest_block_number(&self) -> Result<u64, AppError>;

    /// Block with full transactions, `None` if not yet produced
    async fn get_block(&self, number: u64) -> Result<Option<ChainBlock>, AppError>;

    async fn get_transaction(&self, tx_hash: &str) -> Result<Option<ChainTransaction>, AppError>;

    /// `Some(true)` for a successful receipt, `Some(false)` for a revert,
    /// `None` while the transaction is not mined
    async fn get_receipt_status(&self, tx_hash: &str) -> Result<Option<bool>, AppError>;

    /// Native coin balance in base units at the latest block
    async fn native_balance(&self, address: &str) -> Result<u128, AppError>;

    /// ERC-20 `balanceOf(holder)` in base units at the latest block
    async fn token_balance(&self, token: &str, holder: &str) -> Result<u128, AppError>;
}

/// A signed home-chain transfer ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransfer {
    pub tx_hash: String,
    /// RLP-encoded signed transaction, `0x`-prefixed hex
    pub raw_transaction: String,
    pub nonce: u64,
}

/// Home-chain transfer submission
#[async_trait]
pub trait DistributionClient: Send + Sync {
    /// Check home-chain RPC connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Address distributions are sent from
    fn signer_address(&self) -> String;

    /// Next nonce including pending transactions
    async fn pending_nonce(&self) -> Result<u64, AppError>;

    /// Sign a transfer of `amount` base units of the target token to `to`
    async fn sign_transfer(
        &self,
        to: &str,
        amount: u128,
        nonce: u64,
    ) -> Result<SignedTransfer, AppError>;

    /// Submit a signed transfer, returning the transaction hash
    async fn broadcast(&self, transfer: &SignedTransfer) -> Result<String, AppError>;

    /// Resubmit the raw bytes of a transfer signed earlier. A node that
    /// already holds it counts as success.
    async fn rebroadcast(&self, tx_hash: &str, raw_transaction: &str) -> Result<String, AppError>;

    /// Same semantics as [`ChainClient::get_receipt_status`]
    async fn get_receipt_status(&self, tx_hash: &str) -> Result<Option<bool>, AppError>;
}

/// USD prices for a classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceQuote {
    pub token_usd: Decimal,
    pub target_usd: Decimal,
}

/// Source of USD prices, consulted once per classification
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Prices for the payment token `symbol` and the target token
    async fn quote(&self, symbol: &str) -> Result<PriceQuote, AppError>;
}

/// Read-only contract calls on the home chain
#[async_trait]
pub trait ContractReader: Send + Sync {
    /// Whether bytecode is deployed at `address`
    async fn code_exists(&self, address: &str) -> Result<bool, AppError>;

    /// `eth_call` with the given 4-byte-selector calldata; returns the raw
    /// result split into 32-byte words
    async fn call_words(&self, address: &str, calldata: &[u8]) -> Result<Vec<[u8; 32]>, AppError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn record() -> PaymentRecord {
        let now = Utc::now();
        PaymentRecord {
            network: "ethereum".into(),
            source_tx_hash: "0x01".into(),
            buyer_address: "0xb".into(),
            treasury_address: "0xt".into(),
            payment_token: "ETH".into(),
            token_contract: None,
            raw_amount: "1".into(),
            payment_amount: Decimal::ONE,
            token_price_usd: Decimal::ONE,
            target_price_usd: Decimal::ONE,
            usd_value: Decimal::ONE,
            target_amount: Decimal::ONE,
            status: PaymentStatus::Confirmed,
            distribution_tx_hash: None,
            pending_distribution_tx_hash: None,
            pending_distribution_raw_tx: None,
            block_number: 1,
            attempt_count: 0,
            last_error: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_insert_outcome_accessors() {
        let inserted = InsertOutcome::Inserted(record());
        assert_eq!(inserted.record().network, "ethereum");
        let existing = InsertOutcome::AlreadyExists(record());
        assert_eq!(existing.into_record().source_tx_hash, "0x01");
    }
}
