//! Domain types with validation support.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use super::error::{AppError, ValidationError};

/// Lifecycle status of a payment record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Seen on chain, not yet at confirmation depth
    #[default]
    Detected,
    /// At confirmation depth and priced, waiting for distribution
    Confirmed,
    /// Claimed by a dispatcher worker
    Distributing,
    /// Home-chain transfer confirmed
    Distributed,
    /// Retry budget exhausted, needs operator action
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::Confirmed => "confirmed",
            Self::Distributing => "distributing",
            Self::Distributed => "distributed",
            Self::Failed => "failed",
        }
    }

    /// Forward-only state machine. `Distributing -> Confirmed` is the retry edge.
    #[must_use]
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (Self::Detected, Self::Confirmed)
                | (Self::Confirmed, Self::Distributing)
                | (Self::Distributing, Self::Distributed)
                | (Self::Distributing, Self::Confirmed)
                | (Self::Distributing, Self::Failed)
        )
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Distributed | Self::Failed)
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detected" => Ok(Self::Detected),
            "confirmed" => Ok(Self::Confirmed),
            "distributing" => Ok(Self::Distributing),
            "distributed" => Ok(Self::Distributed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid payment status: {}", s)),
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity of a payment record: unique per source network
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentKey {
    pub network: String,
    pub source_tx_hash: String,
}

impl PaymentKey {
    #[must_use]
    pub fn new(network: impl Into<String>, source_tx_hash: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            source_tx_hash: normalize_hex(&source_tx_hash.into()),
        }
    }
}

impl std::fmt::Display for PaymentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.network, self.source_tx_hash)
    }
}

/// Durable record of one observed payment and its distribution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct PaymentRecord {
    /// Source network id
    #[schema(example = "ethereum")]
    pub network: String,
    /// Payment transaction hash on the source network
    #[schema(example = "0x5c504ed432cb51138bcf09aa5e8a410dd4a1e204ef84bfed1be16dfba1b22060")]
    pub source_tx_hash: String,
    /// Sender of the payment, lowercase hex
    #[schema(example = "0x8ba1f109551bd432803012645ac136ddd64dba72")]
    pub buyer_address: String,
    /// Treasury that received the payment
    pub treasury_address: String,
    /// Payment token symbol
    #[schema(example = "ETH")]
    pub payment_token: String,
    /// Token contract, absent for native coin payments
    pub token_contract: Option<String>,
    /// Amount in integer base units
    #[schema(example = "1000000000000000000")]
    pub raw_amount: String,
    /// Amount in natural token units
    #[schema(value_type = String, example = "1.0")]
    pub payment_amount: Decimal,
    /// USD price of the payment token at classification
    #[schema(value_type = String, example = "3000")]
    pub token_price_usd: Decimal,
    /// USD price of the target token at classification
    #[schema(value_type = String, example = "0.02")]
    pub target_price_usd: Decimal,
    /// USD value of the payment
    #[schema(value_type = String, example = "3000")]
    pub usd_value: Decimal,
    /// Home-chain tokens owed to the buyer
    #[schema(value_type = String, example = "150000")]
    pub target_amount: Decimal,
    pub status: PaymentStatus,
    /// Confirmed home-chain transfer, set only once distributed
    pub distribution_tx_hash: Option<String>,
    /// Most recently signed distribution transaction, written before broadcast
    pub pending_distribution_tx_hash: Option<String>,
    /// Signed bytes of the pending transaction, kept for rebroadcast
    #[serde(skip)]
    pub pending_distribution_raw_tx: Option<String>,
    /// Source block containing the payment
    pub block_number: i64,
    /// Distribution attempts made so far
    pub attempt_count: i32,
    pub last_error: Option<String>,
    /// Earliest time the next distribution attempt may start
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRecord {
    #[must_use]
    pub fn key(&self) -> PaymentKey {
        PaymentKey {
            network: self.network.clone(),
            source_tx_hash: self.source_tx_hash.clone(),
        }
    }

    /// Move to `next` if the state machine allows it.
    pub fn transition_to(&mut self, next: PaymentStatus) -> Result<(), AppError> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Target amount in integer base units of a token with `decimals` places.
    pub fn target_base_units(&self, decimals: u32) -> Result<u128, AppError> {
        decimal_to_base_units(self.target_amount, decimals)
    }
}

/// Scale a decimal amount to integer base units, truncating extra precision.
pub fn decimal_to_base_units(amount: Decimal, decimals: u32) -> Result<u128, AppError> {
    if amount.is_sign_negative() {
        return Err(AppError::Internal(format!("negative amount {}", amount)));
    }
    let mantissa = amount.mantissa().unsigned_abs();
    let scale = amount.scale();
    let units = if decimals >= scale {
        10u128
            .checked_pow(decimals - scale)
            .and_then(|factor| mantissa.checked_mul(factor))
    } else {
        10u128
            .checked_pow(scale - decimals)
            .map(|divisor| mantissa / divisor)
    };
    units.ok_or_else(|| {
        AppError::Internal(format!(
            "amount {} does not fit {} decimals",
            amount, decimals
        ))
    })
}

/// Lowercase a hex string and ensure a `0x` prefix.
#[must_use]
pub fn normalize_hex(value: &str) -> String {
    let trimmed = value.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    format!("0x{}", body.to_ascii_lowercase())
}

/// A treasury-bound transfer extracted from a confirmed block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentCandidate {
    pub network: String,
    pub source_tx_hash: String,
    pub block_number: u64,
    pub buyer_address: String,
    pub treasury_address: String,
    /// `None` for native coin transfers
    pub token_contract: Option<String>,
    /// Integer base units
    pub raw_amount: u128,
}

/// Last fully processed block of a source network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCheckpoint {
    pub network: String,
    pub block_number: u64,
    pub block_hash: String,
    pub updated_at: DateTime<Utc>,
}

/// Category of an operator-review entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    UnknownTreasuryToken,
    MalformedTransfer,
    ZeroValue,
    DustPayment,
    PriceUnavailable,
    DeepReorg,
    /// A recorded payment whose block left the canonical chain
    OrphanedPayment,
    RevertedTransaction,
    ReconciliationMismatch,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownTreasuryToken => "unknown_treasury_token",
            Self::MalformedTransfer => "malformed_transfer",
            Self::ZeroValue => "zero_value",
            Self::DustPayment => "dust_payment",
            Self::PriceUnavailable => "price_unavailable",
            Self::DeepReorg => "deep_reorg",
            Self::OrphanedPayment => "orphaned_payment",
            Self::RevertedTransaction => "reverted_transaction",
            Self::ReconciliationMismatch => "reconciliation_mismatch",
        }
    }
}

impl std::str::FromStr for AnomalyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown_treasury_token" => Ok(Self::UnknownTreasuryToken),
            "malformed_transfer" => Ok(Self::MalformedTransfer),
            "zero_value" => Ok(Self::ZeroValue),
            "dust_payment" => Ok(Self::DustPayment),
            "price_unavailable" => Ok(Self::PriceUnavailable),
            "deep_reorg" => Ok(Self::DeepReorg),
            "orphaned_payment" => Ok(Self::OrphanedPayment),
            "reverted_transaction" => Ok(Self::RevertedTransaction),
            "reconciliation_mismatch" => Ok(Self::ReconciliationMismatch),
            _ => Err(format!("Invalid anomaly kind: {}", s)),
        }
    }
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Append-only entry for operator review
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Anomaly {
    pub id: Uuid,
    #[schema(example = "ethereum")]
    pub network: String,
    pub source_tx_hash: Option<String>,
    pub block_number: Option<i64>,
    pub kind: AnomalyKind,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

impl Anomaly {
    #[must_use]
    pub fn new(network: impl Into<String>, kind: AnomalyKind, detail: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            network: network.into(),
            source_tx_hash: None,
            block_number: None,
            kind,
            detail: detail.into(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_tx(mut self, tx_hash: impl Into<String>) -> Self {
        self.source_tx_hash = Some(tx_hash.into());
        self
    }

    #[must_use]
    pub fn with_block(mut self, block_number: u64) -> Self {
        self.block_number = Some(block_number as i64);
        self
    }
}

/// Per-network or per-token slice of the aggregate stats
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct StatsBreakdown {
    pub payments: i64,
    #[schema(value_type = String)]
    pub usd_raised: Decimal,
    #[schema(value_type = String)]
    pub target_distributed: Decimal,
}

/// Ledger-wide totals
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct AggregateStats {
    pub total_payments: i64,
    #[schema(value_type = String, example = "12500.50")]
    pub total_usd_raised: Decimal,
    #[schema(value_type = String, example = "625025")]
    pub total_target_distributed: Decimal,
    pub by_network: BTreeMap<String, StatsBreakdown>,
    pub by_token: BTreeMap<String, StatsBreakdown>,
}

/// Raw block as returned by a source chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBlock {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub transactions: Vec<ChainTransaction>,
}

/// Raw transaction as returned by a source chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransaction {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    /// Native value in base units
    pub value: u128,
    /// Hex calldata including `0x`
    pub input: String,
    pub block_number: Option<u64>,
}

/// Manual reconciliation submission for a payment the watcher missed
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct ReconciliationRequest {
    /// Source network id
    #[validate(length(min = 1, message = "Network is required"))]
    #[schema(example = "ethereum")]
    pub network: String,
    /// Payment transaction hash
    #[validate(custom(function = "validate_tx_hash"))]
    #[schema(example = "0x5c504ed432cb51138bcf09aa5e8a410dd4a1e204ef84bfed1be16dfba1b22060")]
    pub source_tx_hash: String,
    /// Payment token symbol
    #[validate(length(min = 1, message = "Payment token is required"))]
    #[schema(example = "USDT")]
    pub payment_token: String,
    /// Amount in natural token units
    #[validate(custom(function = "validate_positive_amount"))]
    #[schema(value_type = String, example = "250.00")]
    pub payment_amount: Decimal,
    /// Sender of the payment
    #[validate(custom(function = "validate_evm_address"))]
    #[schema(example = "0x8ba1f109551bd432803012645ac136ddd64dba72")]
    pub buyer_address: String,
}

fn is_hex_of_len(value: &str, len: usize) -> bool {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .is_some_and(|body| body.len() == len && body.chars().all(|c| c.is_ascii_hexdigit()))
}

fn validate_tx_hash(value: &str) -> Result<(), validator::ValidationError> {
    if is_hex_of_len(value, 64) {
        Ok(())
    } else {
        Err(validator::ValidationError::new("tx_hash")
            .with_message("Transaction hash must be 0x followed by 64 hex characters".into()))
    }
}

fn validate_evm_address(value: &str) -> Result<(), validator::ValidationError> {
    if is_hex_of_len(value, 40) {
        Ok(())
    } else {
        Err(validator::ValidationError::new("address")
            .with_message("Address must be 0x followed by 40 hex characters".into()))
    }
}

fn validate_positive_amount(value: &Decimal) -> Result<(), validator::ValidationError> {
    if value.is_sign_positive() && !value.is_zero() {
        Ok(())
    } else {
        Err(validator::ValidationError::new("amount")
            .with_message("Amount must be greater than 0".into()))
    }
}

/// Check an address string without going through the validator derive.
pub fn ensure_evm_address(field: &str, value: &str) -> Result<(), AppError> {
    validate_evm_address(value).map_err(|_| {
        AppError::Validation(ValidationError::InvalidField {
            field: field.to_string(),
            message: "Address must be 0x followed by 40 hex characters".to_string(),
        })
    })
}

/// Outcome of a reconciliation submission
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationOutcome {
    /// A new record was created
    Recorded,
    /// The payment was already in the ledger; nothing changed
    AlreadyRecorded,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReconciliationResponse {
    pub outcome: ReconciliationOutcome,
    pub record: PaymentRecord,
}

/// Query parameters for listing anomalies
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct AnomalyListParams {
    /// Maximum number of entries to return (1-500, default: 50)
    #[validate(range(min = 1, max = 500, message = "Limit must be between 1 and 500"))]
    #[serde(default = "default_anomaly_limit")]
    #[schema(example = 50)]
    pub limit: i64,
}

fn default_anomaly_limit() -> i64 {
    50
}

impl Default for AnomalyListParams {
    fn default() -> Self {
        Self {
            limit: default_anomaly_limit(),
        }
    }
}

/// Query parameters for listing payments by status
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct PaymentListParams {
    /// Status to list, defaults to `failed`
    #[serde(default = "default_listed_status")]
    pub status: PaymentStatus,
    /// Maximum number of records to return (1-500, default: 50)
    #[validate(range(min = 1, max = 500, message = "Limit must be between 1 and 500"))]
    #[serde(default = "default_anomaly_limit")]
    #[schema(example = 50)]
    pub limit: i64,
}

fn default_listed_status() -> PaymentStatus {
    PaymentStatus::Failed
}

impl Default for PaymentListParams {
    fn default() -> Self {
        Self {
            status: default_listed_status(),
            limit: default_anomaly_limit(),
        }
    }
}

/// Current holdings of one treasury in one accepted token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct TreasuryBalance {
    #[schema(example = "ethereum")]
    pub network: String,
    #[schema(example = "USDT")]
    pub token: String,
    pub treasury: String,
    /// ERC-20 contract; absent for the native coin
    pub contract: Option<String>,
    /// Base units as a decimal string
    pub raw_balance: Option<String>,
    /// Balance scaled by the token's decimals
    #[schema(value_type = Option<String>)]
    pub balance: Option<Decimal>,
    /// Why the balance could not be read
    pub error: Option<String>,
}

/// Health status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Some systems degraded but functional
    Degraded,
    /// Critical systems unavailable
    Unhealthy,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Overall system status
    pub status: HealthStatus,
    /// Ledger database health status
    pub database: HealthStatus,
    /// Home-chain client health status
    pub home_chain: HealthStatus,
    /// Whether the distribution dispatcher is configured
    pub distribution_enabled: bool,
    /// Current server timestamp
    pub timestamp: DateTime<Utc>,
    /// Application version
    #[schema(example = "0.1.0")]
    pub version: String,
}

impl HealthResponse {
    #[must_use]
    pub fn new(database: HealthStatus, home_chain: HealthStatus, distribution_enabled: bool) -> Self {
        let status = match (&database, &home_chain) {
            (HealthStatus::Unhealthy, _) => HealthStatus::Unhealthy,
            (HealthStatus::Healthy, HealthStatus::Healthy) if distribution_enabled => {
                HealthStatus::Healthy
            }
            _ => HealthStatus::Degraded,
        };
        Self {
            status,
            database,
            home_chain,
            distribution_enabled,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Error response structure
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error details
    pub error: ErrorDetail,
}

/// Error detail structure
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Error type identifier
    #[schema(example = "validation_error")]
    pub r#type: String,
    /// Human-readable error message
    #[schema(example = "Address must be 0x followed by 40 hex characters")]
    pub message: String,
}

/// Rate limit exceeded response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RateLimitResponse {
    /// Error details
    pub error: ErrorDetail,
    /// Seconds until the current window resets
    #[schema(example = 540)]
    pub retry_after: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::str::FromStr;

    fn sample_record(status: PaymentStatus) -> PaymentRecord {
        let now = Utc::now();
        PaymentRecord {
            network: "ethereum".to_string(),
            source_tx_hash: "0xabc".to_string(),
            buyer_address: "0xbuyer".to_string(),
            treasury_address: "0xtreasury".to_string(),
            payment_token: "ETH".to_string(),
            token_contract: None,
            raw_amount: "1000000000000000000".to_string(),
            payment_amount: dec!(1),
            token_price_usd: dec!(3000),
            target_price_usd: dec!(0.02),
            usd_value: dec!(3000),
            target_amount: dec!(150000),
            status,
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
    fn test_payment_status_display_and_parsing() {
        let statuses = vec![
            (PaymentStatus::Detected, "detected"),
            (PaymentStatus::Confirmed, "confirmed"),
            (PaymentStatus::Distributing, "distributing"),
            (PaymentStatus::Distributed, "distributed"),
            (PaymentStatus::Failed, "failed"),
        ];

        for (status, string) in statuses {
            assert_eq!(status.as_str(), string);
            assert_eq!(status.to_string(), string);
            assert_eq!(PaymentStatus::from_str(string).unwrap(), status);
        }

        assert!(PaymentStatus::from_str("pending").is_err());
    }

    #[test]
    fn test_status_machine_allows_only_forward_edges() {
        use PaymentStatus::*;
        let all = [Detected, Confirmed, Distributing, Distributed, Failed];
        let allowed = [
            (Detected, Confirmed),
            (Confirmed, Distributing),
            (Distributing, Distributed),
            (Distributing, Confirmed),
            (Distributing, Failed),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(PaymentStatus::Distributed.is_terminal());
        assert!(PaymentStatus::Failed.is_terminal());
        assert!(!PaymentStatus::Distributing.is_terminal());
    }

    #[test]
    fn test_record_transition_rejects_backwards_move() {
        let mut record = sample_record(PaymentStatus::Distributed);
        let err = record.transition_to(PaymentStatus::Confirmed).unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidTransition {
                from: PaymentStatus::Distributed,
                to: PaymentStatus::Confirmed
            }
        ));
        assert_eq!(record.status, PaymentStatus::Distributed);

        let mut record = sample_record(PaymentStatus::Detected);
        record.transition_to(PaymentStatus::Confirmed).unwrap();
        assert_eq!(record.status, PaymentStatus::Confirmed);
    }

    #[test]
    fn test_target_base_units() {
        let record = sample_record(PaymentStatus::Confirmed);
        assert_eq!(
            record.target_base_units(18).unwrap(),
            150_000u128 * 10u128.pow(18)
        );
        assert_eq!(
            decimal_to_base_units(dec!(1.234567), 6).unwrap(),
            1_234_567
        );
        // Extra precision is truncated, never rounded up
        assert_eq!(decimal_to_base_units(dec!(0.0000019), 6).unwrap(), 1);
        assert!(decimal_to_base_units(dec!(-1), 6).is_err());
    }

    #[test]
    fn test_normalize_hex() {
        assert_eq!(normalize_hex("0xABCdef"), "0xabcdef");
        assert_eq!(normalize_hex("ABCDEF"), "0xabcdef");
        assert_eq!(normalize_hex(" 0XAb "), "0xab");
        assert_eq!(
            PaymentKey::new("bsc", "0xDEAD").source_tx_hash,
            "0xdead".to_string()
        );
    }

    #[test]
    fn test_reconciliation_request_validation() {
        let valid = ReconciliationRequest {
            network: "ethereum".to_string(),
            source_tx_hash: format!("0x{}", "a".repeat(64)),
            payment_token: "USDT".to_string(),
            payment_amount: dec!(250),
            buyer_address: format!("0x{}", "b".repeat(40)),
        };
        assert!(valid.validate().is_ok());

        let mut bad_hash = valid.clone();
        bad_hash.source_tx_hash = "0x1234".to_string();
        assert!(bad_hash.validate().is_err());

        let mut bad_address = valid.clone();
        bad_address.buyer_address = "not-an-address".to_string();
        assert!(bad_address.validate().is_err());

        let mut zero = valid.clone();
        zero.payment_amount = Decimal::ZERO;
        assert!(zero.validate().is_err());

        let mut no_network = valid;
        no_network.network = String::new();
        assert!(no_network.validate().is_err());
    }

    #[test]
    fn test_health_response_status_rollup() {
        use HealthStatus::*;
        assert_eq!(HealthResponse::new(Healthy, Healthy, true).status, Healthy);
        assert_eq!(HealthResponse::new(Healthy, Healthy, false).status, Degraded);
        assert_eq!(HealthResponse::new(Healthy, Unhealthy, true).status, Degraded);
        assert_eq!(HealthResponse::new(Unhealthy, Healthy, true).status, Unhealthy);
    }

    #[test]
    fn test_anomaly_builder() {
        let anomaly = Anomaly::new("bsc", AnomalyKind::DeepReorg, "parent mismatch")
            .with_tx("0xabc")
            .with_block(42);
        assert_eq!(anomaly.block_number, Some(42));
        assert_eq!(anomaly.source_tx_hash.as_deref(), Some("0xabc"));
        assert_eq!(
            AnomalyKind::from_str(anomaly.kind.as_str()).unwrap(),
            AnomalyKind::DeepReorg
        );
    }

    #[test]
    fn test_payment_record_serializes_amounts_as_strings() {
        let json = serde_json::to_value(sample_record(PaymentStatus::Confirmed)).unwrap();
        assert_eq!(json["target_amount"], "150000");
        assert_eq!(json["status"], "confirmed");
    }
}
