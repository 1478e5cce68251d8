//! Read-through cache for sale-contract statistics on the home chain.
//!
//! Stats entries live for a fixed TTL and are kept past expiry as the
//! last-known-good value served when a refresh fails. Whether the contract
//! is deployed at all is checked once and remembered until [`ContractDataCache::reset`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::domain::{AppError, BlockchainError, ContractReader};
use crate::infra::blockchain::abi::{selector, word_to_u128};
use crate::infra::resilience::{CircuitBreaker, CircuitBreakerConfig};

/// Fixed-point scale of every value the sale contract reports
const CONTRACT_DECIMALS: u32 = 18;

/// Cache configuration
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub breaker: CircuitBreakerConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let read_u64 = |key: &str| std::env::var(key).ok().and_then(|v| v.parse::<u64>().ok());
        Self {
            ttl: read_u64("CONTRACT_CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.ttl),
            breaker: CircuitBreakerConfig {
                failure_threshold: read_u64("CONTRACT_BREAKER_THRESHOLD")
                    .map(|v| v.max(1) as u32)
                    .unwrap_or(defaults.breaker.failure_threshold),
                cooldown: read_u64("CONTRACT_BREAKER_COOLDOWN_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.breaker.cooldown),
            },
        }
    }
}

/// Cached entries that can be invalidated individually
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKey {
    ContractStats,
    ContractExists,
}

/// Sale-contract figures in natural token units
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ContractStats {
    #[schema(value_type = String, example = "1250000")]
    pub total_sold: Decimal,
    #[schema(value_type = Option<String>)]
    pub total_raised: Option<Decimal>,
    #[schema(value_type = Option<String>)]
    pub remaining_supply: Option<Decimal>,
    #[schema(value_type = Option<String>)]
    pub contract_balance: Option<Decimal>,
    #[schema(value_type = Option<String>)]
    pub total_for_sale: Option<Decimal>,
    #[schema(value_type = Option<String>)]
    pub current_price: Option<Decimal>,
}

/// Which read strategy produced the stats
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(tag = "source", content = "stats", rename_all = "snake_case")]
pub enum StatsFetch {
    /// Single `getStats()` call
    Primary(ContractStats),
    /// Individual getters, used when `getStats()` is not available
    FieldByField(ContractStats),
    /// No bytecode at the configured address
    ContractMissing,
}

/// Stats as served to callers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ContractStatsSnapshot {
    #[serde(flatten)]
    pub fetch: StatsFetch,
    pub fetched_at: DateTime<Utc>,
    /// `true` when a refresh failed and this is the last-known-good value
    pub stale: bool,
}

#[derive(Debug, Clone)]
struct CachedStats {
    fetch: StatsFetch,
    fetched_at: DateTime<Utc>,
    stored_at: Instant,
    invalidated: bool,
}

impl CachedStats {
    fn is_fresh(&self, ttl: Duration) -> bool {
        !self.invalidated && self.stored_at.elapsed() < ttl
    }

    fn snapshot(&self, stale: bool) -> ContractStatsSnapshot {
        ContractStatsSnapshot {
            fetch: self.fetch.clone(),
            fetched_at: self.fetched_at,
            stale,
        }
    }
}

/// Convert an 18-decimal fixed-point integer into a decimal
pub fn from_fixed_point(value: u128) -> Result<Decimal, AppError> {
    let mantissa = i128::try_from(value).map_err(|_| out_of_range(value))?;
    Decimal::try_from_i128_with_scale(mantissa, CONTRACT_DECIMALS)
        .map(|d| d.normalize())
        .map_err(|_| out_of_range(value))
}

fn out_of_range(value: impl std::fmt::Display) -> AppError {
    AppError::Blockchain(BlockchainError::TransactionFailed(format!(
        "contract value {} out of range",
        value
    )))
}

pub struct ContractDataCache {
    reader: Arc<dyn ContractReader>,
    address: String,
    config: CacheConfig,
    /// Held across a refresh so only one is in flight
    stats: Mutex<Option<CachedStats>>,
    exists: Mutex<Option<bool>>,
    breaker: CircuitBreaker,
}

impl ContractDataCache {
    pub fn new(reader: Arc<dyn ContractReader>, address: impl Into<String>, config: CacheConfig) -> Self {
        Self {
            reader,
            address: address.into(),
            config,
            stats: Mutex::new(None),
            exists: Mutex::new(None),
            breaker: CircuitBreaker::new("contract-reader", config.breaker),
        }
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Current stats, refreshed when the cached entry is missing or expired.
    ///
    /// A failed refresh serves the last-known-good value marked stale; with
    /// nothing cached the error is returned.
    pub async fn get_stats(&self) -> Result<ContractStatsSnapshot, AppError> {
        let mut slot = self.stats.lock().await;
        if let Some(entry) = slot.as_ref()
            && entry.is_fresh(self.config.ttl)
        {
            debug!(contract = %self.address, "Contract stats cache hit");
            return Ok(entry.snapshot(false));
        }

        match self.breaker.call(|| self.fetch()).await {
            Ok(fetch) => {
                let entry = CachedStats {
                    fetch,
                    fetched_at: Utc::now(),
                    stored_at: Instant::now(),
                    invalidated: false,
                };
                let snapshot = entry.snapshot(false);
                *slot = Some(entry);
                Ok(snapshot)
            }
            Err(e) => match slot.as_ref() {
                Some(entry) => {
                    warn!(contract = %self.address, error = %e, "Contract stats refresh failed, serving last known value");
                    Ok(entry.snapshot(true))
                }
                None => Err(e),
            },
        }
    }

    /// Mark an entry expired. Invalidated stats still back the stale fallback.
    pub async fn invalidate(&self, key: CacheKey) {
        match key {
            CacheKey::ContractStats => {
                if let Some(entry) = self.stats.lock().await.as_mut() {
                    entry.invalidated = true;
                }
            }
            CacheKey::ContractExists => *self.exists.lock().await = None,
        }
        debug!(contract = %self.address, key = ?key, "Cache entry invalidated");
    }

    /// Drop everything, including the last-known-good stats
    pub async fn reset(&self) {
        *self.stats.lock().await = None;
        *self.exists.lock().await = None;
        info!(contract = %self.address, "Contract cache reset");
    }

    /// Try `getStats()` first, then the individual getters
    async fn fetch(&self) -> Result<StatsFetch, AppError> {
        if !self.contract_exists().await? {
            warn!(contract = %self.address, "No contract deployed at sale address");
            return Ok(StatsFetch::ContractMissing);
        }

        match self.read_primary().await {
            Ok(stats) => Ok(StatsFetch::Primary(stats)),
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                debug!(contract = %self.address, error = %e, "getStats() unavailable, reading fields");
                self.read_fields().await.map(StatsFetch::FieldByField)
            }
        }
    }

    async fn contract_exists(&self) -> Result<bool, AppError> {
        let mut exists = self.exists.lock().await;
        if let Some(known) = *exists {
            return Ok(known);
        }
        let deployed = self.reader.code_exists(&self.address).await?;
        *exists = Some(deployed);
        Ok(deployed)
    }

    async fn read_primary(&self) -> Result<ContractStats, AppError> {
        let words = self
            .reader
            .call_words(&self.address, &selector("getStats()"))
            .await?;
        if words.len() < 4 {
            return Err(AppError::Blockchain(BlockchainError::TransactionFailed(
                format!("getStats() returned {} words", words.len()),
            )));
        }
        let value = |i: usize| {
            word_to_u128(&words[i])
                .ok_or_else(|| out_of_range(format!("word {}", i)))
                .and_then(from_fixed_point)
        };
        Ok(ContractStats {
            total_sold: value(0)?,
            total_raised: Some(value(1)?),
            remaining_supply: Some(value(2)?),
            contract_balance: Some(value(3)?),
            total_for_sale: None,
            current_price: None,
        })
    }

    async fn read_fields(&self) -> Result<ContractStats, AppError> {
        Ok(ContractStats {
            total_sold: self.read_value("totalSold()").await?,
            total_for_sale: self.read_optional("totalForSale()").await?,
            current_price: self.read_optional("currentPrice()").await?,
            ..Default::default()
        })
    }

    async fn read_value(&self, signature: &str) -> Result<Decimal, AppError> {
        let words = self
            .reader
            .call_words(&self.address, &selector(signature))
            .await?;
        let word = words.first().ok_or_else(|| {
            AppError::Blockchain(BlockchainError::TransactionFailed(format!(
                "{} returned no data",
                signature
            )))
        })?;
        word_to_u128(word)
            .ok_or_else(|| out_of_range(signature))
            .and_then(from_fixed_point)
    }

    /// A getter the contract may not implement
    async fn read_optional(&self, signature: &str) -> Result<Option<Decimal>, AppError> {
        match self.read_value(signature).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_retryable() => Err(e),
            Err(_) => Ok(None),
        }
    }
}
