//! Test fixtures and in-memory mocks.

pub mod mocks;

use std::str::FromStr;

use ethers::types::{Address, U256};

pub use mocks::{
    MockChainClient, MockConfig, MockContractReader, MockDistributionClient, MockLedger,
    ReceiptMode,
};

use crate::domain::{ChainTransaction, OracleCatalog};
use crate::infra::blockchain::abi::{encode_hex, encode_transfer_call};

pub const ETH_TREASURY: &str = "0x1111111111111111111111111111111111111111";
pub const USDT_CONTRACT: &str = "0xdac17f958d2ee523a2206206994597c13d831ec7";
pub const SALE_CONTRACT: &str = "0x2222222222222222222222222222222222222222";
pub const BUYER: &str = "0x8ba1f109551bd432803012645ac136ddd64dba72";

/// Catalog with `ethereum` (ETH, USDT) and `bsc` (BNB) source networks.
///
/// Treasury addresses are written in uppercase to exercise normalization.
pub fn sample_catalog_json() -> String {
    format!(
        r#"{{
            "home": {{
                "chain": {{ "id": "home", "chain_id": 424242, "rpc_urls": ["http://home"], "confirmations": 1 }},
                "target_token": {{ "symbol": "BAK", "decimals": 18 }},
                "sale_contract": "{sale}"
            }},
            "networks": [
                {{ "id": "ethereum", "chain_id": 1, "rpc_urls": ["http://eth"], "confirmations": 12 }},
                {{ "id": "bsc", "chain_id": 56, "rpc_urls": ["http://bsc"] }}
            ],
            "tokens": [
                {{ "symbol": "ETH", "network": "ethereum", "decimals": 18, "treasury": "{treasury}" }},
                {{ "symbol": "USDT", "network": "ethereum", "decimals": 6, "treasury": "{treasury}", "contract": "{usdt}" }},
                {{ "symbol": "BNB", "network": "bsc", "decimals": 18, "treasury": "{treasury}" }}
            ],
            "prices": {{
                "tokens_usd": {{ "ETH": "3000", "USDT": "1", "BNB": "300" }},
                "target_usd": "0.02"
            }}
        }}"#,
        sale = SALE_CONTRACT,
        treasury = ETH_TREASURY.to_uppercase().replace("0X", "0x"),
        usdt = USDT_CONTRACT
    )
}

pub fn sample_catalog() -> OracleCatalog {
    OracleCatalog::from_json(&sample_catalog_json()).expect("sample catalog is valid")
}

/// Deterministic 32-byte hash for test number `n`
pub fn tx_hash(n: u64) -> String {
    format!("0x{:064x}", n)
}

/// Deterministic address for test number `n`
pub fn address(n: u64) -> String {
    format!("0x{:040x}", n)
}

pub fn native_transfer(hash: &str, from: &str, to: &str, value: u128) -> ChainTransaction {
    ChainTransaction {
        hash: hash.to_string(),
        from: from.to_string(),
        to: Some(to.to_string()),
        value,
        input: "0x".to_string(),
        block_number: None,
    }
}

pub fn token_transfer(
    hash: &str,
    from: &str,
    contract: &str,
    recipient: &str,
    amount: u128,
) -> ChainTransaction {
    let recipient = Address::from_str(recipient).expect("valid recipient");
    ChainTransaction {
        hash: hash.to_string(),
        from: from.to_string(),
        to: Some(contract.to_string()),
        value: 0,
        input: encode_hex(&encode_transfer_call(recipient, U256::from(amount))),
        block_number: None,
    }
}
