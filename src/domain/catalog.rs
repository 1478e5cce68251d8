//! Network, payment token and price configuration.
//!
//! The catalog is loaded once at startup from a JSON file and validated as a
//! whole; it is immutable afterwards.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::error::{AppError, ConfigError};
use super::types::normalize_hex;

/// Largest decimal precision a `rust_decimal::Decimal` can represent.
const MAX_DECIMALS: u32 = 28;

/// An EVM chain the oracle talks to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// Stable identifier used in records, e.g. `ethereum`
    pub id: String,
    /// EIP-155 chain id reported by `eth_chainId`
    pub chain_id: u64,
    /// JSON-RPC endpoints, tried in order
    pub rpc_urls: Vec<String>,
    /// Blocks required on top of a block before it is processed
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    /// First block to scan when no checkpoint exists
    #[serde(default)]
    pub start_block: Option<u64>,
    /// Outbound request budget for this network's endpoints
    #[serde(default)]
    pub rpc_requests_per_second: Option<u32>,
}

fn default_confirmations() -> u64 {
    12
}

/// A token accepted as payment on one network
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentTokenConfig {
    pub symbol: String,
    pub network: String,
    /// ERC-20 contract; `None` for the network's native coin
    #[serde(default)]
    pub contract: Option<String>,
    pub decimals: u32,
    /// Address payments must be sent to
    pub treasury: String,
    /// Key into the price table, defaults to `symbol`
    #[serde(default)]
    pub price_symbol: Option<String>,
}

impl PaymentTokenConfig {
    #[must_use]
    pub fn price_key(&self) -> &str {
        self.price_symbol.as_deref().unwrap_or(&self.symbol)
    }

    #[must_use]
    pub fn is_native(&self) -> bool {
        self.contract.is_none()
    }
}

/// The token distributed on the home chain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetTokenConfig {
    pub symbol: String,
    pub decimals: u32,
    /// ERC-20 contract; `None` when the target is the home chain's native coin
    #[serde(default)]
    pub contract: Option<String>,
}

/// Home chain settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HomeChainConfig {
    pub chain: NetworkConfig,
    pub target_token: TargetTokenConfig,
    /// Sale contract whose aggregate stats are exposed through the cache
    #[serde(default)]
    pub sale_contract: Option<String>,
    /// Environment variable holding the distribution signer key
    #[serde(default = "default_signer_key_env")]
    pub signer_key_env: String,
    /// Gas limit for distribution transfers
    #[serde(default)]
    pub gas_limit: Option<u64>,
}

fn default_signer_key_env() -> String {
    "ORACLE_PRIVATE_KEY".to_string()
}

/// Operator-maintained USD prices
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceConfig {
    /// Payment token symbol to USD price
    pub tokens_usd: BTreeMap<String, Decimal>,
    /// USD price of one target token
    pub target_usd: Decimal,
}

/// Complete startup configuration for networks, tokens and prices
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OracleCatalog {
    pub home: HomeChainConfig,
    pub networks: Vec<NetworkConfig>,
    pub tokens: Vec<PaymentTokenConfig>,
    pub prices: PriceConfig,
}

impl OracleCatalog {
    /// Read and validate a catalog file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(ConfigError::Catalog(format!(
                "cannot read {}: {}",
                path.display(),
                e
            )))
        })?;
        Self::from_json(&raw)
    }

    /// Parse and validate a catalog from JSON text
    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        let catalog: OracleCatalog = serde_json::from_str(raw)
            .map_err(|e| AppError::Config(ConfigError::Catalog(e.to_string())))?;
        catalog.normalized().validated()
    }

    /// Lowercase every address so lookups can compare strings directly.
    fn normalized(mut self) -> Self {
        for token in &mut self.tokens {
            token.treasury = normalize_hex(&token.treasury);
            token.contract = token.contract.as_deref().map(normalize_hex);
        }
        self.home.sale_contract = self.home.sale_contract.as_deref().map(normalize_hex);
        self.home.target_token.contract =
            self.home.target_token.contract.as_deref().map(normalize_hex);
        self
    }

    fn validated(self) -> Result<Self, AppError> {
        let invalid = |msg: String| AppError::Config(ConfigError::Catalog(msg));

        let mut ids = HashSet::new();
        for network in self.networks.iter().chain(std::iter::once(&self.home.chain)) {
            if !ids.insert(network.id.as_str()) {
                return Err(invalid(format!("duplicate network id {}", network.id)));
            }
            if network.rpc_urls.is_empty() {
                return Err(invalid(format!("network {} has no rpc_urls", network.id)));
            }
        }

        let mut token_keys = HashSet::new();
        for token in &self.tokens {
            if !self.networks.iter().any(|n| n.id == token.network) {
                return Err(invalid(format!(
                    "token {} references unknown source network {}",
                    token.symbol, token.network
                )));
            }
            if token.decimals > MAX_DECIMALS {
                return Err(invalid(format!(
                    "token {} has {} decimals, at most {} supported",
                    token.symbol, token.decimals, MAX_DECIMALS
                )));
            }
            let key = (
                token.network.as_str(),
                token.treasury.as_str(),
                token.contract.as_deref(),
            );
            if !token_keys.insert(key) {
                return Err(invalid(format!(
                    "token {} duplicates an existing (network, treasury, contract) entry",
                    token.symbol
                )));
            }
            match self.prices.tokens_usd.get(token.price_key()) {
                Some(price) if price.is_sign_positive() && !price.is_zero() => {}
                Some(_) => {
                    return Err(invalid(format!(
                        "price for {} must be positive",
                        token.price_key()
                    )));
                }
                None => {
                    return Err(invalid(format!("no price for {}", token.price_key())));
                }
            }
        }

        if self.prices.target_usd.is_sign_negative() || self.prices.target_usd.is_zero() {
            return Err(invalid("target_usd must be positive".to_string()));
        }
        if self.home.target_token.decimals > MAX_DECIMALS {
            return Err(invalid(format!(
                "target token has {} decimals, at most {} supported",
                self.home.target_token.decimals, MAX_DECIMALS
            )));
        }

        Ok(self)
    }

    #[must_use]
    pub fn network(&self, id: &str) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.id == id)
    }

    /// Tokens accepted on one source network
    pub fn tokens_for_network<'a>(
        &'a self,
        network: &'a str,
    ) -> impl Iterator<Item = &'a PaymentTokenConfig> + 'a {
        self.tokens.iter().filter(move |t| t.network == network)
    }

    /// Resolve the payment token for a transfer.
    ///
    /// `contract` is `None` for native coin transfers. Addresses are compared
    /// case-insensitively.
    #[must_use]
    pub fn resolve_token(
        &self,
        network: &str,
        treasury: &str,
        contract: Option<&str>,
    ) -> Option<&PaymentTokenConfig> {
        let treasury = normalize_hex(treasury);
        let contract = contract.map(normalize_hex);
        self.tokens.iter().find(|t| {
            t.network == network && t.treasury == treasury && t.contract == contract
        })
    }

    /// Look up a token by network and symbol, used by manual reconciliation
    #[must_use]
    pub fn token_by_symbol(&self, network: &str, symbol: &str) -> Option<&PaymentTokenConfig> {
        self.tokens
            .iter()
            .find(|t| t.network == network && t.symbol.eq_ignore_ascii_case(symbol))
    }
}
