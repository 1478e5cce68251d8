//! EVM chain clients.
//!
//! [`EvmRpcClient`] reads source chains and the home chain over JSON-RPC;
//! [`EvmDistributionClient`] signs and submits home-chain transfers.

pub mod abi;
pub mod distribution;
pub mod evm;

pub use distribution::{EvmDistributionClient, wallet_from_secret};
pub use evm::{EvmRpcClient, EvmRpcProvider, HttpEvmRpcProvider, RpcClientConfig, parse_quantity};
