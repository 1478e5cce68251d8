//! Operator-maintained USD price table.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::domain::{AppError, InvalidPaymentError, PriceConfig, PriceQuote, PriceSource};

/// Fixed prices loaded from the catalog at startup
#[derive(Debug, Clone)]
pub struct StaticPriceTable {
    tokens_usd: BTreeMap<String, Decimal>,
    target_usd: Decimal,
}

impl StaticPriceTable {
    #[must_use]
    pub fn new(config: &PriceConfig) -> Self {
        Self {
            tokens_usd: config
                .tokens_usd
                .iter()
                .map(|(symbol, price)| (symbol.to_ascii_uppercase(), *price))
                .collect(),
            target_usd: config.target_usd,
        }
    }
}

#[async_trait]
impl PriceSource for StaticPriceTable {
    async fn quote(&self, symbol: &str) -> Result<PriceQuote, AppError> {
        let token_usd = self
            .tokens_usd
            .get(&symbol.to_ascii_uppercase())
            .copied()
            .filter(|p| p.is_sign_positive() && !p.is_zero())
            .ok_or_else(|| InvalidPaymentError::PriceUnavailable(symbol.to_string()))?;
        Ok(PriceQuote {
            token_usd,
            target_usd: self.target_usd,
        })
    }
}
