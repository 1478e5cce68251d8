//! Home-chain distribution signer.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, U256};
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, instrument, warn};

use super::abi::{address_to_string, encode_hex, encode_transfer_call};
use super::evm::EvmRpcClient;
use crate::domain::{
    AppError, BlockchainError, ChainClient, DistributionClient, SignedTransfer, TargetTokenConfig,
};

/// Gas for a plain value transfer
const NATIVE_TRANSFER_GAS: u64 = 21_000;
/// Gas for an ERC-20 `transfer` when none is configured
const DEFAULT_TOKEN_TRANSFER_GAS: u64 = 100_000;

/// Parse a hex private key (with or without `0x`) into a wallet
pub fn wallet_from_secret(secret: &SecretString) -> Result<LocalWallet, AppError> {
    let raw = secret.expose_secret().trim();
    let body = raw.strip_prefix("0x").unwrap_or(raw);
    LocalWallet::from_str(body)
        .map_err(|e| AppError::Blockchain(BlockchainError::Signing(format!("invalid key: {}", e))))
}

fn parse_address(field: &str, value: &str) -> Result<Address, AppError> {
    Address::from_str(value).map_err(|e| {
        AppError::Blockchain(BlockchainError::InvalidAddress(format!(
            "{} {}: {}",
            field, value, e
        )))
    })
}

/// Signs and submits target-token transfers on the home chain
pub struct EvmDistributionClient {
    rpc: Arc<EvmRpcClient>,
    wallet: LocalWallet,
    chain_id: u64,
    target: TargetTokenConfig,
    gas_limit: u64,
}

impl EvmDistributionClient {
    pub fn new(
        rpc: Arc<EvmRpcClient>,
        secret: &SecretString,
        chain_id: u64,
        target: TargetTokenConfig,
        gas_limit: Option<u64>,
    ) -> Result<Self, AppError> {
        let wallet = wallet_from_secret(secret)?.with_chain_id(chain_id);
        let gas_limit = gas_limit.unwrap_or(if target.contract.is_some() {
            DEFAULT_TOKEN_TRANSFER_GAS
        } else {
            NATIVE_TRANSFER_GAS
        });

        info!(
            signer = %address_to_string(&wallet.address()),
            chain_id = chain_id,
            token = %target.symbol,
            "Created distribution client"
        );

        Ok(Self {
            rpc,
            wallet,
            chain_id,
            target,
            gas_limit,
        })
    }

    /// Unsigned transaction moving `amount` base units of the target token
    fn build_transfer(
        &self,
        to: Address,
        amount: U256,
        nonce: u64,
        gas_price: U256,
    ) -> Result<TypedTransaction, AppError> {
        let request = TransactionRequest::new()
            .from(self.wallet.address())
            .nonce(nonce)
            .gas(self.gas_limit)
            .gas_price(gas_price)
            .chain_id(self.chain_id);

        let request = match &self.target.contract {
            Some(contract) => request
                .to(parse_address("token contract", contract)?)
                .value(U256::zero())
                .data(Bytes::from(encode_transfer_call(to, amount))),
            None => request.to(to).value(amount),
        };

        Ok(request.into())
    }

    async fn send_signed(&self, tx_hash: &str, raw_transaction: &str) -> Result<String, AppError> {
        match self.rpc.send_raw_transaction(raw_transaction).await {
            Ok(hash) => {
                if hash != tx_hash {
                    warn!(
                        returned = %hash,
                        expected = %tx_hash,
                        "Node returned a different transaction hash"
                    );
                }
                Ok(hash)
            }
            // A resubmission of an identical signed transaction
            Err(AppError::Blockchain(BlockchainError::TransactionRejected(msg)))
                if msg.to_ascii_lowercase().contains("already known") =>
            {
                Ok(tx_hash.to_string())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl DistributionClient for EvmDistributionClient {
    async fn health_check(&self) -> Result<(), AppError> {
        self.rpc.latest_block_number().await.map(|_| ())
    }

    fn signer_address(&self) -> String {
        address_to_string(&self.wallet.address())
    }

    async fn pending_nonce(&self) -> Result<u64, AppError> {
        self.rpc
            .pending_transaction_count(&self.signer_address())
            .await
    }

    #[instrument(skip(self), fields(token = %self.target.symbol))]
    async fn sign_transfer(
        &self,
        to: &str,
        amount: u128,
        nonce: u64,
    ) -> Result<SignedTransfer, AppError> {
        let recipient = parse_address("recipient", to)?;
        let gas_price = U256::from(self.rpc.gas_price().await?);
        let tx = self.build_transfer(recipient, U256::from(amount), nonce, gas_price)?;

        let signature = self
            .wallet
            .sign_transaction_sync(&tx)
            .map_err(|e| AppError::Blockchain(BlockchainError::Signing(e.to_string())))?;
        let raw = tx.rlp_signed(&signature);
        let tx_hash = encode_hex(&ethers::utils::keccak256(&raw));

        Ok(SignedTransfer {
            tx_hash,
            raw_transaction: encode_hex(&raw),
            nonce,
        })
    }

    #[instrument(skip(self, transfer), fields(tx_hash = %transfer.tx_hash, nonce = transfer.nonce))]
    async fn broadcast(&self, transfer: &SignedTransfer) -> Result<String, AppError> {
        self.send_signed(&transfer.tx_hash, &transfer.raw_transaction)
            .await
    }

    async fn rebroadcast(&self, tx_hash: &str, raw_transaction: &str) -> Result<String, AppError> {
        self.send_signed(tx_hash, raw_transaction).await
    }

    async fn get_receipt_status(&self, tx_hash: &str) -> Result<Option<bool>, AppError> {
        self.rpc.get_receipt_status(tx_hash).await
    }
}
