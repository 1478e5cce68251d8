//! Turns payment candidates into priced ledger records.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{info, instrument, warn};

use crate::domain::{
    AppError, Anomaly, InsertOutcome, InvalidPaymentError, OracleCatalog, PaymentCandidate,
    PaymentLedger, PaymentRecord, PaymentStatus, PriceSource,
};

/// Natural-unit amount of `raw` base units with `decimals` places
pub fn payment_amount(raw: u128, decimals: u32) -> Result<Decimal, InvalidPaymentError> {
    i128::try_from(raw)
        .ok()
        .and_then(|raw| Decimal::try_from_i128_with_scale(raw, decimals).ok())
        .map(|amount| amount.normalize())
        .ok_or_else(|| {
            InvalidPaymentError::MalformedTransfer(format!(
                "amount {} with {} decimals is out of range",
                raw, decimals
            ))
        })
}

/// `(usd_value, target_amount)` for a payment.
///
/// The target amount is truncated toward zero at `target_decimals` places.
pub fn compute_target_amount(
    amount: Decimal,
    token_price_usd: Decimal,
    target_price_usd: Decimal,
    target_decimals: u32,
) -> Result<(Decimal, Decimal), InvalidPaymentError> {
    let overflow =
        || InvalidPaymentError::MalformedTransfer(format!("value of {} overflows", amount));
    if target_price_usd.is_zero() || target_price_usd.is_sign_negative() {
        return Err(InvalidPaymentError::PriceUnavailable(
            "target token".to_string(),
        ));
    }

    let usd_value = amount.checked_mul(token_price_usd).ok_or_else(overflow)?;
    let target_amount = usd_value
        .checked_div(target_price_usd)
        .ok_or_else(overflow)?
        .round_dp_with_strategy(target_decimals, RoundingStrategy::ToZero)
        .normalize();
    Ok((usd_value.normalize(), target_amount))
}

/// Resolves candidates against the catalog and prices them
pub struct PaymentClassifier {
    catalog: Arc<OracleCatalog>,
    prices: Arc<dyn PriceSource>,
    ledger: Arc<dyn PaymentLedger>,
}

impl PaymentClassifier {
    pub fn new(
        catalog: Arc<OracleCatalog>,
        prices: Arc<dyn PriceSource>,
        ledger: Arc<dyn PaymentLedger>,
    ) -> Self {
        Self {
            catalog,
            prices,
            ledger,
        }
    }

    #[must_use]
    pub fn catalog(&self) -> &OracleCatalog {
        &self.catalog
    }

    /// Build the `confirmed` record for a candidate without storing it
    pub async fn classify(&self, candidate: &PaymentCandidate) -> Result<PaymentRecord, AppError> {
        let token = self
            .catalog
            .resolve_token(
                &candidate.network,
                &candidate.treasury_address,
                candidate.token_contract.as_deref(),
            )
            .ok_or_else(|| InvalidPaymentError::UnknownTreasuryToken {
                network: candidate.network.clone(),
                treasury: candidate.treasury_address.clone(),
                contract: candidate
                    .token_contract
                    .clone()
                    .unwrap_or_else(|| "native".to_string()),
            })?;

        if candidate.raw_amount == 0 {
            return Err(InvalidPaymentError::ZeroValue.into());
        }

        let amount = payment_amount(candidate.raw_amount, token.decimals)?;
        let quote = self.prices.quote(token.price_key()).await?;
        let (usd_value, target_amount) = compute_target_amount(
            amount,
            quote.token_usd,
            quote.target_usd,
            self.catalog.home.target_token.decimals,
        )?;
        if target_amount.is_zero() {
            return Err(InvalidPaymentError::Dust {
                usd_value: usd_value.to_string(),
            }
            .into());
        }

        let now = Utc::now();
        let mut record = PaymentRecord {
            network: candidate.network.clone(),
            source_tx_hash: candidate.source_tx_hash.clone(),
            buyer_address: candidate.buyer_address.clone(),
            treasury_address: token.treasury.clone(),
            payment_token: token.symbol.clone(),
            token_contract: token.contract.clone(),
            raw_amount: candidate.raw_amount.to_string(),
            payment_amount: amount,
            token_price_usd: quote.token_usd,
            target_price_usd: quote.target_usd,
            usd_value,
            target_amount,
            status: PaymentStatus::Detected,
            distribution_tx_hash: None,
            pending_distribution_tx_hash: None,
            pending_distribution_raw_tx: None,
            block_number: candidate.block_number as i64,
            attempt_count: 0,
            last_error: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        };
        record.transition_to(PaymentStatus::Confirmed)?;
        Ok(record)
    }

    /// Classify and insert; a candidate already in the ledger is left untouched
    #[instrument(skip(self, candidate), fields(network = %candidate.network, tx_hash = %candidate.source_tx_hash))]
    pub async fn record(&self, candidate: &PaymentCandidate) -> Result<InsertOutcome, AppError> {
        let record = self.classify(candidate).await?;
        let outcome = self.ledger.upsert_detected(&record).await?;
        match &outcome {
            InsertOutcome::Inserted(r) => info!(
                token = %r.payment_token,
                amount = %r.payment_amount,
                usd_value = %r.usd_value,
                target_amount = %r.target_amount,
                "Payment recorded"
            ),
            InsertOutcome::AlreadyExists(_) => info!("Payment already recorded"),
        }
        Ok(outcome)
    }

    /// Like [`record`](Self::record), but invalid payments become anomalies
    /// and yield `Ok(None)`.
    pub async fn record_or_flag(
        &self,
        candidate: &PaymentCandidate,
    ) -> Result<Option<InsertOutcome>, AppError> {
        match self.record(candidate).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(AppError::InvalidPayment(reason)) => {
                self.flag(candidate, &reason).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Record an anomaly for a rejected candidate
    pub async fn flag(
        &self,
        candidate: &PaymentCandidate,
        reason: &InvalidPaymentError,
    ) -> Result<(), AppError> {
        warn!(
            network = %candidate.network,
            tx_hash = %candidate.source_tx_hash,
            kind = %reason.anomaly_kind(),
            reason = %reason,
            "Payment rejected"
        );
        let anomaly = Anomaly::new(&candidate.network, reason.anomaly_kind(), reason.to_string())
            .with_tx(&candidate.source_tx_hash)
            .with_block(candidate.block_number);
        self.ledger.record_anomaly(&anomaly).await?;
        Ok(())
    }
}
