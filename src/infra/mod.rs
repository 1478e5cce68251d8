//! Infrastructure layer implementations.

pub mod blockchain;
pub mod cache;
pub mod database;
pub mod pricing;
pub mod resilience;

pub use blockchain::{EvmDistributionClient, EvmRpcClient, RpcClientConfig, wallet_from_secret};
pub use cache::{CacheConfig, CacheKey, ContractDataCache, ContractStatsSnapshot, StatsFetch};
pub use database::{PostgresConfig, PostgresLedger};
pub use pricing::StaticPriceTable;
