//! Domain layer containing core business types, traits, and error definitions.

pub mod catalog;
pub mod error;
pub mod traits;
pub mod types;

pub use catalog::{
    HomeChainConfig, NetworkConfig, OracleCatalog, PaymentTokenConfig, PriceConfig,
    TargetTokenConfig,
};
pub use error::{
    AppError, BlockchainError, ConfigError, DatabaseError, InvalidPaymentError, ValidationError,
};
pub use traits::{
    ChainClient, ContractReader, DistributionClient, InsertOutcome, PaymentLedger, PriceQuote,
    PriceSource, SignedTransfer,
};
pub use types::{
    AggregateStats, Anomaly, AnomalyKind, AnomalyListParams, BlockCheckpoint, ChainBlock,
    ChainTransaction, ErrorDetail, ErrorResponse, HealthResponse, HealthStatus, PaymentCandidate,
    PaymentKey, PaymentListParams, PaymentRecord, PaymentStatus, RateLimitResponse,
    ReconciliationOutcome, ReconciliationRequest, ReconciliationResponse, StatsBreakdown,
    TreasuryBalance, decimal_to_base_units, ensure_evm_address, normalize_hex,
};
