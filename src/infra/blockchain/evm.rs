//! JSON-RPC client for EVM chains.
//!
//! [`EvmRpcProvider`] is the transport seam; [`HttpEvmRpcProvider`] talks
//! HTTP via reqwest and [`EvmRpcClient`] layers retries, endpoint failover
//! and typed decoding on top of it.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{info, instrument, warn};

use ethers::types::Address;

use super::abi::{decode_hex, encode_balance_of_call, encode_hex, split_words, word_to_u128};
use crate::domain::{
    AppError, BlockchainError, ChainBlock, ChainClient, ChainTransaction, ContractReader,
    NetworkConfig, normalize_hex,
};
use crate::infra::resilience::BackoffPolicy;

/// Configuration for the RPC client
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// Per-request timeout
    pub timeout: Duration,
    /// Retry schedule for transient failures
    pub backoff: BackoffPolicy,
    /// Outbound request budget per endpoint
    pub requests_per_second: Option<u32>,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(5), 4),
            requests_per_second: None,
        }
    }
}

impl RpcClientConfig {
    /// Defaults overridden by `RPC_TIMEOUT_MS` and the `RPC_*` backoff variables
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let timeout = std::env::var("RPC_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.timeout);
        Self {
            timeout,
            backoff: BackoffPolicy::from_env("RPC", defaults.backoff),
            requests_per_second: None,
        }
    }

    /// Longest a single client call can take, counting every attempt and the
    /// waits between them
    #[must_use]
    pub fn call_budget(&self) -> Duration {
        let attempts = self.backoff.max_attempts.max(1);
        let waits: Duration = (1..attempts).map(|a| self.backoff.base_delay_for(a)).sum();
        self.timeout.saturating_mul(attempts).saturating_add(waits)
    }
}

/// Abstract transport for JSON-RPC calls to enable testing
#[async_trait]
pub trait EvmRpcProvider: Send + Sync {
    /// Send a JSON-RPC request, returning the `result` member (`null` allowed)
    async fn send_request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError>;

    /// Endpoint this provider talks to, for logging
    fn endpoint(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<T: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: String,
    params: T,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Classify a JSON-RPC error object
fn map_rpc_error(code: i64, message: &str) -> BlockchainError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("insufficient funds") {
        BlockchainError::InsufficientFunds
    } else if code == -32005 || lower.contains("rate limit") || lower.contains("too many requests")
    {
        BlockchainError::RateLimited(message.to_string())
    } else if lower.contains("nonce too low")
        || lower.contains("already known")
        || lower.contains("replacement transaction underpriced")
        || lower.contains("intrinsic gas")
    {
        BlockchainError::TransactionRejected(message.to_string())
    } else if code == 3 || lower.contains("execution reverted") {
        BlockchainError::TransactionFailed(message.to_string())
    } else {
        BlockchainError::RpcError(format!("{}: {}", code, message))
    }
}

/// HTTP-based JSON-RPC provider
pub struct HttpEvmRpcProvider {
    http_client: Client,
    rpc_url: String,
    throttle: Option<DefaultDirectRateLimiter>,
    next_id: AtomicU64,
}

impl HttpEvmRpcProvider {
    pub fn new(
        rpc_url: &str,
        timeout: Duration,
        requests_per_second: Option<u32>,
    ) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Blockchain(BlockchainError::Connection(e.to_string())))?;

        let throttle = requests_per_second
            .and_then(NonZeroU32::new)
            .map(|rps| RateLimiter::direct(Quota::per_second(rps)));

        Ok(Self {
            http_client,
            rpc_url: rpc_url.to_string(),
            throttle,
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl EvmRpcProvider for HttpEvmRpcProvider {
    async fn send_request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        if let Some(throttle) = &self.throttle {
            throttle.until_ready().await;
        }

        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: method.to_string(),
            params,
        };

        let response = self
            .http_client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Blockchain(BlockchainError::Timeout(e.to_string()))
                } else {
                    AppError::Blockchain(BlockchainError::Connection(e.to_string()))
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::Blockchain(BlockchainError::RateLimited(format!(
                "{} returned 429",
                self.rpc_url
            ))));
        }
        if status.is_server_error() {
            return Err(AppError::Blockchain(BlockchainError::Connection(format!(
                "{} returned {}",
                self.rpc_url, status
            ))));
        }

        let rpc_response: JsonRpcResponse<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| AppError::Blockchain(BlockchainError::RpcError(e.to_string())))?;

        if let Some(error) = rpc_response.error {
            return Err(AppError::Blockchain(map_rpc_error(error.code, &error.message)));
        }

        Ok(rpc_response.result.unwrap_or(serde_json::Value::Null))
    }

    fn endpoint(&self) -> &str {
        &self.rpc_url
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    hash: String,
    from: String,
    to: Option<String>,
    value: String,
    #[serde(default)]
    input: Option<String>,
    block_number: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcBlock {
    number: String,
    hash: String,
    parent_hash: String,
    #[serde(default)]
    transactions: Vec<RpcTransaction>,
}

#[derive(Debug, Deserialize)]
struct RpcReceipt {
    status: Option<String>,
}

/// Parse a hex quantity such as `0x1b4`
pub fn parse_quantity(value: &str) -> Result<u128, AppError> {
    let body = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    if body.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(body, 16).map_err(|e| {
        AppError::Blockchain(BlockchainError::RpcError(format!(
            "invalid quantity {}: {}",
            value, e
        )))
    })
}

fn parse_quantity_u64(value: &str) -> Result<u64, AppError> {
    let quantity = parse_quantity(value)?;
    u64::try_from(quantity).map_err(|_| {
        AppError::Blockchain(BlockchainError::RpcError(format!(
            "quantity {} exceeds u64",
            value
        )))
    })
}

impl TryFrom<RpcTransaction> for ChainTransaction {
    type Error = AppError;

    fn try_from(tx: RpcTransaction) -> Result<Self, Self::Error> {
        Ok(ChainTransaction {
            hash: normalize_hex(&tx.hash),
            from: normalize_hex(&tx.from),
            to: tx.to.as_deref().map(normalize_hex),
            value: parse_quantity(&tx.value)?,
            input: tx.input.unwrap_or_else(|| "0x".to_string()),
            block_number: tx
                .block_number
                .as_deref()
                .map(parse_quantity_u64)
                .transpose()?,
        })
    }
}

impl TryFrom<RpcBlock> for ChainBlock {
    type Error = AppError;

    fn try_from(block: RpcBlock) -> Result<Self, Self::Error> {
        Ok(ChainBlock {
            number: parse_quantity_u64(&block.number)?,
            hash: normalize_hex(&block.hash),
            parent_hash: normalize_hex(&block.parent_hash),
            transactions: block
                .transactions
                .into_iter()
                .map(ChainTransaction::try_from)
                .collect::<Result<Vec<_>, _>>()?,
        })
    }
}

/// Typed JSON-RPC client for one EVM network
pub struct EvmRpcClient {
    network: String,
    providers: Vec<Box<dyn EvmRpcProvider>>,
    config: RpcClientConfig,
}

impl EvmRpcClient {
    /// Create a client with one HTTP provider per configured endpoint
    pub fn new(network: &NetworkConfig, config: RpcClientConfig) -> Result<Self, AppError> {
        let requests_per_second = network
            .rpc_requests_per_second
            .or(config.requests_per_second);
        let providers = network
            .rpc_urls
            .iter()
            .map(|url| {
                HttpEvmRpcProvider::new(url, config.timeout, requests_per_second)
                    .map(|p| Box::new(p) as Box<dyn EvmRpcProvider>)
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(network = %network.id, endpoints = providers.len(), "Created EVM RPC client");
        Ok(Self {
            network: network.id.clone(),
            providers,
            config,
        })
    }

    /// Create a new client with a specific provider (useful for testing)
    pub fn with_provider(
        network: impl Into<String>,
        provider: Box<dyn EvmRpcProvider>,
        config: RpcClientConfig,
    ) -> Self {
        Self {
            network: network.into(),
            providers: vec![provider],
            config,
        }
    }

    /// Make an RPC call with retries, rotating endpoints between attempts
    #[instrument(skip(self, params), fields(network = %self.network))]
    async fn rpc_call<P: Serialize + Send + Sync, R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: P,
    ) -> Result<R, AppError> {
        let params_value = serde_json::to_value(params).map_err(|e| {
            AppError::Blockchain(BlockchainError::RpcError(format!(
                "Serialization error: {}",
                e
            )))
        })?;

        if self.providers.is_empty() {
            return Err(AppError::Blockchain(BlockchainError::Connection(format!(
                "no endpoints configured for {}",
                self.network
            ))));
        }

        let mut attempt: u32 = 0;
        loop {
            let provider = &self.providers[attempt as usize % self.providers.len()];
            attempt += 1;

            let outcome = tokio::time::timeout(
                self.config.timeout,
                provider.send_request(method, params_value.clone()),
            )
            .await
            .unwrap_or_else(|_| {
                Err(AppError::Blockchain(BlockchainError::Timeout(format!(
                    "{} after {:?}",
                    method, self.config.timeout
                ))))
            });

            match outcome {
                Ok(result_value) => {
                    return serde_json::from_value(result_value).map_err(|e| {
                        AppError::Blockchain(BlockchainError::RpcError(format!(
                            "Deserialization error: {}",
                            e
                        )))
                    });
                }
                Err(e) if e.is_retryable() && self.config.backoff.should_retry(attempt) => {
                    let delay = self.config.backoff.delay_for(attempt);
                    warn!(
                        attempt = attempt,
                        endpoint = %provider.endpoint(),
                        error = %e,
                        method = %method,
                        "RPC call failed"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[instrument(skip(self), fields(network = %self.network))]
    pub async fn gas_price(&self) -> Result<u128, AppError> {
        let price: String = self.rpc_call("eth_gasPrice", Vec::<()>::new()).await?;
        parse_quantity(&price)
    }

    /// Transaction count for `address` at the `pending` block tag
    #[instrument(skip(self), fields(network = %self.network))]
    pub async fn pending_transaction_count(&self, address: &str) -> Result<u64, AppError> {
        let count: String = self
            .rpc_call("eth_getTransactionCount", serde_json::json!([address, "pending"]))
            .await?;
        parse_quantity_u64(&count)
    }

    #[instrument(skip(self, raw_transaction), fields(network = %self.network))]
    pub async fn send_raw_transaction(&self, raw_transaction: &str) -> Result<String, AppError> {
        let hash: String = self
            .rpc_call("eth_sendRawTransaction", serde_json::json!([raw_transaction]))
            .await?;
        Ok(normalize_hex(&hash))
    }
}

#[async_trait]
impl ChainClient for EvmRpcClient {
    fn network(&self) -> &str {
        &self.network
    }

    #[instrument(skip(self), fields(network = %self.network))]
    async fn chain_id(&self) -> Result<u64, AppError> {
        let id: String = self.rpc_call("eth_chainId", Vec::<()>::new()).await?;
        parse_quantity_u64(&id)
    }

    #[instrument(skip(self), fields(network = %self.network))]
    async fn latest_block_number(&self) -> Result<u64, AppError> {
        let number: String = self.rpc_call("eth_blockNumber", Vec::<()>::new()).await?;
        parse_quantity_u64(&number)
    }

    #[instrument(skip(self), fields(network = %self.network))]
    async fn get_block(&self, number: u64) -> Result<Option<ChainBlock>, AppError> {
        let block: Option<RpcBlock> = self
            .rpc_call(
                "eth_getBlockByNumber",
                serde_json::json!([format!("0x{:x}", number), true]),
            )
            .await?;
        block.map(ChainBlock::try_from).transpose()
    }

    #[instrument(skip(self), fields(network = %self.network))]
    async fn get_transaction(&self, tx_hash: &str) -> Result<Option<ChainTransaction>, AppError> {
        let tx: Option<RpcTransaction> = self
            .rpc_call("eth_getTransactionByHash", serde_json::json!([tx_hash]))
            .await?;
        tx.map(ChainTransaction::try_from).transpose()
    }

    #[instrument(skip(self), fields(network = %self.network))]
    async fn get_receipt_status(&self, tx_hash: &str) -> Result<Option<bool>, AppError> {
        let receipt: Option<RpcReceipt> = self
            .rpc_call("eth_getTransactionReceipt", serde_json::json!([tx_hash]))
            .await?;
        match receipt {
            None => Ok(None),
            Some(RpcReceipt { status: None }) => Ok(None),
            Some(RpcReceipt {
                status: Some(status),
            }) => Ok(Some(parse_quantity(&status)? == 1)),
        }
    }

    #[instrument(skip(self), fields(network = %self.network))]
    async fn native_balance(&self, address: &str) -> Result<u128, AppError> {
        let balance: String = self
            .rpc_call("eth_getBalance", serde_json::json!([address, "latest"]))
            .await?;
        parse_quantity(&balance)
    }

    #[instrument(skip(self), fields(network = %self.network))]
    async fn token_balance(&self, token: &str, holder: &str) -> Result<u128, AppError> {
        let holder: Address = holder.parse().map_err(|_| {
            AppError::Blockchain(BlockchainError::InvalidAddress(holder.to_string()))
        })?;
        let words = self.call_words(token, &encode_balance_of_call(holder)).await?;
        words.first().and_then(word_to_u128).ok_or_else(|| {
            AppError::Blockchain(BlockchainError::RpcError(format!(
                "balanceOf on {} returned no uint256 in range",
                token
            )))
        })
    }
}

#[async_trait]
impl ContractReader for EvmRpcClient {
    #[instrument(skip(self), fields(network = %self.network))]
    async fn code_exists(&self, address: &str) -> Result<bool, AppError> {
        let code: String = self
            .rpc_call("eth_getCode", serde_json::json!([address, "latest"]))
            .await?;
        let bytes = decode_hex(&code)
            .map_err(|e| AppError::Blockchain(BlockchainError::RpcError(e.to_string())))?;
        Ok(!bytes.is_empty())
    }

    #[instrument(skip(self, calldata), fields(network = %self.network))]
    async fn call_words(&self, address: &str, calldata: &[u8]) -> Result<Vec<[u8; 32]>, AppError> {
        let result: String = self
            .rpc_call(
                "eth_call",
                serde_json::json!([{ "to": address, "data": encode_hex(calldata) }, "latest"]),
            )
            .await?;
        let bytes = decode_hex(&result)
            .map_err(|e| AppError::Blockchain(BlockchainError::RpcError(e.to_string())))?;
        Ok(split_words(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Provider replaying a scripted sequence of responses
    struct ScriptedProvider {
        responses: Mutex<VecDeque<Result<serde_json::Value, AppError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<Result<serde_json::Value, AppError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EvmRpcProvider for ScriptedProvider {
        async fn send_request(
            &self,
            _method: &str,
            _params: serde_json::Value,
        ) -> Result<serde_json::Value, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(serde_json::Value::Null))
        }

        fn endpoint(&self) -> &str {
            "scripted"
        }
    }

    fn fast_config() -> RpcClientConfig {
        RpcClientConfig {
            timeout: Duration::from_secs(1),
            backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(2), 3),
            requests_per_second: None,
        }
    }

    fn client(responses: Vec<Result<serde_json::Value, AppError>>) -> EvmRpcClient {
        EvmRpcClient::with_provider("ethereum", Box::new(ScriptedProvider::new(responses)), fast_config())
    }

    #[test]
    fn test_rpc_client_config_default() {
        let config = RpcClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.backoff.max_attempts, 4);
        assert!(config.requests_per_second.is_none());
    }

    #[test]
    fn test_call_budget_covers_every_attempt() {
        let config = RpcClientConfig::default();
        // 4 x 10s requests plus 0.5s + 1s + 2s between them
        assert_eq!(config.call_budget(), Duration::from_millis(43_500));

        let single = RpcClientConfig {
            backoff: BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(5), 1),
            ..RpcClientConfig::default()
        };
        assert_eq!(single.call_budget(), single.timeout);
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_quantity("0x").unwrap(), 0);
        assert_eq!(parse_quantity("0x1b4").unwrap(), 436);
        assert_eq!(
            parse_quantity("0xde0b6b3a7640000").unwrap(),
            1_000_000_000_000_000_000
        );
        assert!(parse_quantity("0xnothex").is_err());
    }

    #[test]
    fn test_map_rpc_error() {
        assert!(matches!(
            map_rpc_error(-32000, "insufficient funds for gas * price + value"),
            BlockchainError::InsufficientFunds
        ));
        assert!(matches!(
            map_rpc_error(-32005, "limit exceeded"),
            BlockchainError::RateLimited(_)
        ));
        assert!(matches!(
            map_rpc_error(-32000, "nonce too low"),
            BlockchainError::TransactionRejected(_)
        ));
        assert!(matches!(
            map_rpc_error(3, "execution reverted"),
            BlockchainError::TransactionFailed(_)
        ));
        assert!(matches!(
            map_rpc_error(-32601, "method not found"),
            BlockchainError::RpcError(_)
        ));
    }

    #[test]
    fn test_block_conversion_normalizes_fields() {
        let raw: RpcBlock = serde_json::from_value(json!({
            "number": "0x10",
            "hash": "0xAB",
            "parentHash": "0xCD",
            "transactions": [{
                "hash": "0xEF",
                "from": "0xAAAA",
                "to": null,
                "value": "0x0",
                "input": "0x",
                "blockNumber": "0x10"
            }]
        }))
        .unwrap();
        let block = ChainBlock::try_from(raw).unwrap();
        assert_eq!(block.number, 16);
        assert_eq!(block.hash, "0xab");
        assert_eq!(block.parent_hash, "0xcd");
        assert_eq!(block.transactions[0].from, "0xaaaa");
        assert_eq!(block.transactions[0].to, None);
        assert_eq!(block.transactions[0].block_number, Some(16));
    }

    #[tokio::test]
    async fn test_rpc_client_retry_logic_success() {
        let client = client(vec![
            Err(AppError::Blockchain(BlockchainError::Timeout("t".into()))),
            Ok(json!("0x2a")),
        ]);
        assert_eq!(client.latest_block_number().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_rpc_client_retry_logic_failure() {
        let client = client(vec![
            Err(AppError::Blockchain(BlockchainError::Connection("a".into()))),
            Err(AppError::Blockchain(BlockchainError::Connection("b".into()))),
            Err(AppError::Blockchain(BlockchainError::Connection("c".into()))),
            Ok(json!("0x1")),
        ]);
        let result = client.latest_block_number().await;
        assert!(matches!(
            result,
            Err(AppError::Blockchain(BlockchainError::Connection(_)))
        ));
    }

    #[tokio::test]
    async fn test_no_retry_on_insufficient_funds() {
        let provider = ScriptedProvider::new(vec![
            Err(AppError::Blockchain(BlockchainError::InsufficientFunds)),
            Ok(json!("0xabc")),
        ]);
        let client = EvmRpcClient::with_provider("home", Box::new(provider), fast_config());
        let result = client.send_raw_transaction("0x00").await;
        assert!(matches!(
            result,
            Err(AppError::Blockchain(BlockchainError::InsufficientFunds))
        ));
    }

    #[tokio::test]
    async fn test_get_block_not_yet_produced() {
        let client = client(vec![Ok(serde_json::Value::Null)]);
        assert!(client.get_block(100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_receipt_status_mapping() {
        let client = client(vec![
            Ok(json!({ "status": "0x1" })),
            Ok(json!({ "status": "0x0" })),
            Ok(serde_json::Value::Null),
        ]);
        assert_eq!(client.get_receipt_status("0x1").await.unwrap(), Some(true));
        assert_eq!(client.get_receipt_status("0x2").await.unwrap(), Some(false));
        assert_eq!(client.get_receipt_status("0x3").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_contract_reader_calls() {
        let mut word = "00".repeat(31);
        word.push_str("05");
        let client = client(vec![
            Ok(json!("0x6080")),
            Ok(json!("0x")),
            Ok(json!(format!("0x{}", word))),
        ]);
        assert!(client.code_exists("0xc").await.unwrap());
        assert!(!client.code_exists("0xd").await.unwrap());
        let words = client.call_words("0xc", &[0, 1, 2, 3]).await.unwrap();
        assert_eq!(words.len(), 1);
        assert_eq!(words[0][31], 5);
    }

    #[tokio::test]
    async fn test_treasury_balance_queries() {
        let mut word = "00".repeat(30);
        word.push_str("0400");
        let client = client(vec![
            Ok(json!("0xde0b6b3a7640000")),
            Ok(json!(format!("0x{}", word))),
            Ok(json!("0x")),
        ]);
        assert_eq!(
            client.native_balance("0xtreasury").await.unwrap(),
            1_000_000_000_000_000_000
        );
        let holder = "0x1111111111111111111111111111111111111111";
        assert_eq!(client.token_balance("0xtoken", holder).await.unwrap(), 1024);
        // Empty return data from a contract without balanceOf
        assert!(client.token_balance("0xtoken", holder).await.is_err());
        assert!(matches!(
            client.token_balance("0xtoken", "not-an-address").await,
            Err(AppError::Blockchain(BlockchainError::InvalidAddress(_)))
        ));
    }

    #[test]
    fn test_http_provider_creation() {
        let provider =
            HttpEvmRpcProvider::new("http://localhost:8545", Duration::from_secs(5), Some(10));
        assert!(provider.is_ok());
        assert_eq!(provider.unwrap().endpoint(), "http://localhost:8545");
    }
}
