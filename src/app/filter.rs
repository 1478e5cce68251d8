//! Selects treasury-bound transfers out of raw chain transactions.

use std::collections::HashSet;

use crate::domain::{
    ChainTransaction, InvalidPaymentError, OracleCatalog, PaymentCandidate, normalize_hex,
};
use crate::infra::blockchain::abi::decode_transfer_call;

/// Treasury and token-contract sets for one source network
#[derive(Debug, Clone)]
pub struct TransferFilter {
    network: String,
    treasuries: HashSet<String>,
    token_contracts: HashSet<String>,
}

impl TransferFilter {
    #[must_use]
    pub fn for_network(catalog: &OracleCatalog, network: &str) -> Self {
        let tokens: Vec<_> = catalog.tokens_for_network(network).collect();
        Self {
            network: network.to_string(),
            treasuries: tokens.iter().map(|t| t.treasury.clone()).collect(),
            token_contracts: tokens.iter().filter_map(|t| t.contract.clone()).collect(),
        }
    }

    #[must_use]
    pub fn network(&self) -> &str {
        &self.network
    }

    /// The payment carried by `tx`, if any.
    ///
    /// Native transfers to a treasury and ERC-20 `transfer` calls on a known
    /// token contract whose recipient is a treasury qualify. A transfer call
    /// with undecodable arguments is an error.
    pub fn extract(
        &self,
        tx: &ChainTransaction,
        block_number: u64,
    ) -> Result<Option<PaymentCandidate>, InvalidPaymentError> {
        let Some(to) = tx.to.as_deref().map(normalize_hex) else {
            return Ok(None);
        };
        let candidate = |treasury: String, token_contract: Option<String>, raw_amount: u128| {
            PaymentCandidate {
                network: self.network.clone(),
                source_tx_hash: normalize_hex(&tx.hash),
                block_number,
                buyer_address: normalize_hex(&tx.from),
                treasury_address: treasury,
                token_contract,
                raw_amount,
            }
        };

        if self.treasuries.contains(&to) {
            // Calls into a treasury contract are not payments
            let plain = tx.input.is_empty() || tx.input == "0x";
            if plain {
                return Ok(Some(candidate(to, None, tx.value)));
            }
            return Ok(None);
        }

        if self.token_contracts.contains(&to) {
            return Ok(decode_transfer_call(&tx.input)?.and_then(|(recipient, amount)| {
                let recipient = normalize_hex(&recipient);
                self.treasuries
                    .contains(&recipient)
                    .then(|| candidate(recipient, Some(to.clone()), amount))
            }));
        }

        Ok(None)
    }
}
