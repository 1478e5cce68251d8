//! Error types shared by every layer.
//!
//! Library code returns [`AppError`]; the HTTP layer maps it onto status codes
//! in `api::handlers`.

use thiserror::Error;

use super::types::{AnomalyKind, PaymentStatus};

/// Top-level application error
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Blockchain error: {0}")]
    Blockchain(#[from] BlockchainError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Invalid payment: {0}")]
    InvalidPayment(#[from] InvalidPaymentError),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Rate limit exceeded")]
    RateLimited,
}

impl AppError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Transient network conditions and lost database connections are
    /// retryable. Invalid payments, configuration problems and rejected
    /// transactions are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Blockchain(e) => e.is_transient(),
            AppError::Database(DatabaseError::Connection(_)) => true,
            AppError::RateLimited => true,
            _ => false,
        }
    }
}

/// Persistence errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound(err.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseError::Connection(err.to_string())
            }
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
                DatabaseError::Duplicate(db_err.message().to_string())
            }
            _ => DatabaseError::Query(err.to_string()),
        }
    }
}

/// Chain interaction errors for both source chains and the home chain
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("RPC error: {0}")]
    RpcError(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Provider rate limited: {0}")]
    RateLimited(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Insufficient funds")]
    InsufficientFunds,

    #[error("Transaction rejected: {0}")]
    TransactionRejected(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Confirmation timed out for {0}")]
    ConfirmationTimeout(String),

    #[error("Circuit open for {0}")]
    CircuitOpen(String),
}

impl BlockchainError {
    /// Transient errors are absorbed by backoff; the rest surface immediately.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BlockchainError::Connection(_)
                | BlockchainError::RpcError(_)
                | BlockchainError::Timeout(_)
                | BlockchainError::RateLimited(_)
        )
    }
}

/// Startup configuration errors. Fatal only for the component that owns them.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid catalog: {0}")]
    Catalog(String),

    #[error("Network {network} reports chain id {actual}, expected {expected}")]
    ChainIdMismatch {
        network: String,
        expected: u64,
        actual: u64,
    },

    #[error("Network {network} is unreachable: {message}")]
    Unreachable { network: String, message: String },
}

/// Request validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("{0}")]
    Multiple(String),
}

/// A candidate that cannot become a payment record.
///
/// These are never retried; each one produces an anomaly entry.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InvalidPaymentError {
    #[error("no payment token for treasury {treasury} on {network} (contract {contract})")]
    UnknownTreasuryToken {
        network: String,
        treasury: String,
        contract: String,
    },

    #[error("malformed transfer: {0}")]
    MalformedTransfer(String),

    #[error("transfer carries zero value")]
    ZeroValue,

    #[error("payment worth {usd_value} USD yields no target tokens")]
    Dust { usd_value: String },

    #[error("no USD price for {0}")]
    PriceUnavailable(String),

    #[error("source transaction reverted: {0}")]
    Reverted(String),

    #[error("claimed {field} does not match chain: {message}")]
    ReconciliationMismatch { field: String, message: String },
}

impl InvalidPaymentError {
    /// Anomaly category recorded for this rejection
    #[must_use]
    pub fn anomaly_kind(&self) -> AnomalyKind {
        match self {
            Self::UnknownTreasuryToken { .. } => AnomalyKind::UnknownTreasuryToken,
            Self::MalformedTransfer(_) => AnomalyKind::MalformedTransfer,
            Self::ZeroValue => AnomalyKind::ZeroValue,
            Self::Dust { .. } => AnomalyKind::DustPayment,
            Self::PriceUnavailable(_) => AnomalyKind::PriceUnavailable,
            Self::Reverted(_) => AnomalyKind::RevertedTransaction,
            Self::ReconciliationMismatch { .. } => AnomalyKind::ReconciliationMismatch,
        }
    }
}
