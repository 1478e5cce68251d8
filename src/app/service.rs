//! Query, reconciliation and health operations behind the HTTP API.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, instrument, warn};
use validator::Validate;

use super::classifier::{PaymentClassifier, payment_amount};
use super::filter::TransferFilter;
use crate::domain::{
    AggregateStats, Anomaly, AnomalyKind, AnomalyListParams, AppError, ChainClient,
    DatabaseError, DistributionClient, HealthResponse, HealthStatus, InsertOutcome,
    InvalidPaymentError, PaymentCandidate, PaymentKey, PaymentLedger, PaymentListParams,
    PaymentRecord, ReconciliationOutcome, ReconciliationRequest, ReconciliationResponse,
    TreasuryBalance, ValidationError, ensure_evm_address, normalize_hex,
};
use crate::infra::cache::{ContractDataCache, ContractStatsSnapshot};

/// Application service for the ledger query interface and manual reconciliation
pub struct OracleService {
    ledger: Arc<dyn PaymentLedger>,
    classifier: Arc<PaymentClassifier>,
    chains: HashMap<String, Arc<dyn ChainClient>>,
    filters: HashMap<String, TransferFilter>,
    home_chain: Option<Arc<dyn DistributionClient>>,
    contract_cache: Option<Arc<ContractDataCache>>,
}

impl OracleService {
    #[must_use]
    pub fn new(
        ledger: Arc<dyn PaymentLedger>,
        classifier: Arc<PaymentClassifier>,
        chains: Vec<Arc<dyn ChainClient>>,
    ) -> Self {
        let filters = classifier
            .catalog()
            .networks
            .iter()
            .map(|n| (n.id.clone(), TransferFilter::for_network(classifier.catalog(), &n.id)))
            .collect();
        let chains = chains
            .into_iter()
            .map(|c| (c.network().to_string(), c))
            .collect();
        Self {
            ledger,
            classifier,
            chains,
            filters,
            home_chain: None,
            contract_cache: None,
        }
    }

    /// Report home-chain health and enable distribution status
    #[must_use]
    pub fn with_home_chain(mut self, client: Arc<dyn DistributionClient>) -> Self {
        self.home_chain = Some(client);
        self
    }

    #[must_use]
    pub fn with_contract_cache(mut self, cache: Arc<ContractDataCache>) -> Self {
        self.contract_cache = Some(cache);
        self
    }

    /// Most recent record for a source transaction hash on any network
    #[instrument(skip(self))]
    pub async fn get_payment_status(&self, tx_hash: &str) -> Result<PaymentRecord, AppError> {
        let tx_hash = normalize_hex(tx_hash);
        if tx_hash.len() != 66 || !tx_hash[2..].chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AppError::Validation(ValidationError::InvalidField {
                field: "tx_hash".to_string(),
                message: "Transaction hash must be 0x followed by 64 hex characters".to_string(),
            }));
        }
        self.ledger
            .get_by_tx_hash(&tx_hash)
            .await?
            .ok_or(AppError::Database(DatabaseError::NotFound(tx_hash)))
    }

    /// All payments from a buyer, newest first
    #[instrument(skip(self))]
    pub async fn get_user_payments(&self, buyer_address: &str) -> Result<Vec<PaymentRecord>, AppError> {
        ensure_evm_address("address", buyer_address.trim())?;
        self.ledger.get_by_user(buyer_address).await
    }

    pub async fn get_aggregate_stats(&self) -> Result<AggregateStats, AppError> {
        self.ledger.get_aggregate_stats().await
    }

    pub async fn list_anomalies(&self, params: &AnomalyListParams) -> Result<Vec<Anomaly>, AppError> {
        params
            .validate()
            .map_err(|e| AppError::Validation(ValidationError::Multiple(e.to_string())))?;
        self.ledger.list_anomalies(params.limit).await
    }

    /// Records in one status, most recently updated first
    pub async fn list_payments(
        &self,
        params: &PaymentListParams,
    ) -> Result<Vec<PaymentRecord>, AppError> {
        params
            .validate()
            .map_err(|e| AppError::Validation(ValidationError::Multiple(e.to_string())))?;
        self.ledger.get_by_status(params.status, params.limit).await
    }

    /// Live balance of every configured treasury in its accepted token.
    ///
    /// A failed read is reported on its entry instead of failing the listing.
    #[instrument(skip(self))]
    pub async fn treasury_balances(&self) -> Vec<TreasuryBalance> {
        let mut balances = Vec::with_capacity(self.classifier.catalog().tokens.len());
        for token in &self.classifier.catalog().tokens {
            let read = match self.chains.get(&token.network) {
                None => Err(AppError::NotSupported(format!(
                    "no RPC client for {}",
                    token.network
                ))),
                Some(client) => match &token.contract {
                    None => client.native_balance(&token.treasury).await,
                    Some(contract) => client.token_balance(contract, &token.treasury).await,
                },
            };
            let scaled = read.and_then(|raw| Ok((raw, payment_amount(raw, token.decimals)?)));

            let mut entry = TreasuryBalance {
                network: token.network.clone(),
                token: token.symbol.clone(),
                treasury: token.treasury.clone(),
                contract: token.contract.clone(),
                raw_balance: None,
                balance: None,
                error: None,
            };
            match scaled {
                Ok((raw, amount)) => {
                    entry.raw_balance = Some(raw.to_string());
                    entry.balance = Some(amount);
                }
                Err(e) => {
                    warn!(
                        network = %token.network,
                        token = %token.symbol,
                        error = %e,
                        "Treasury balance unavailable"
                    );
                    entry.error = Some(e.to_string());
                }
            }
            balances.push(entry);
        }
        balances
    }

    /// Sale-contract stats through the read-through cache
    pub async fn contract_stats(&self) -> Result<ContractStatsSnapshot, AppError> {
        let cache = self
            .contract_cache
            .as_ref()
            .ok_or_else(|| AppError::NotSupported("Sale contract not configured".to_string()))?;
        cache.get_stats().await
    }

    /// Record a payment the watcher missed, after verifying it on chain.
    ///
    /// The claimed token, amount and sender must match the decoded transaction;
    /// a mismatch is rejected and logged as an anomaly. Submitting a payment
    /// that is already in the ledger changes nothing.
    #[instrument(skip(self, request), fields(network = %request.network, tx_hash = %request.source_tx_hash))]
    pub async fn submit_reconciliation(
        &self,
        request: &ReconciliationRequest,
    ) -> Result<ReconciliationResponse, AppError> {
        request.validate().map_err(|e| {
            warn!(error = %e, "Validation failed");
            AppError::Validation(ValidationError::Multiple(e.to_string()))
        })?;

        let catalog = self.classifier.catalog();
        let network = catalog.network(&request.network).ok_or_else(|| {
            AppError::Validation(ValidationError::InvalidField {
                field: "network".to_string(),
                message: format!("Unknown network '{}'", request.network),
            })
        })?;
        let token = catalog
            .token_by_symbol(&network.id, &request.payment_token)
            .ok_or_else(|| {
                AppError::Validation(ValidationError::InvalidField {
                    field: "payment_token".to_string(),
                    message: format!(
                        "Token '{}' is not accepted on {}",
                        request.payment_token, network.id
                    ),
                })
            })?;
        let (Some(chain), Some(filter)) = (self.chains.get(&network.id), self.filters.get(&network.id))
        else {
            return Err(AppError::NotSupported(format!(
                "Network {} has no chain client",
                network.id
            )));
        };

        let key = PaymentKey::new(&network.id, &request.source_tx_hash);
        if let Some(existing) = self.ledger.get_payment(&key).await? {
            info!("Reconciliation for a payment already in the ledger");
            return Ok(ReconciliationResponse {
                outcome: ReconciliationOutcome::AlreadyRecorded,
                record: existing,
            });
        }

        let Some(tx) = chain.get_transaction(&key.source_tx_hash).await? else {
            return Err(self
                .mismatch(&key, None, "source_tx_hash", "transaction not found on chain")
                .await);
        };
        let Some(block_number) = tx.block_number else {
            return Err(self
                .mismatch(&key, None, "source_tx_hash", "transaction is not mined")
                .await);
        };

        let head = chain.latest_block_number().await?;
        if head < block_number.saturating_add(network.confirmations) {
            return Err(AppError::Validation(ValidationError::InvalidField {
                field: "source_tx_hash".to_string(),
                message: format!(
                    "Transaction has {} of {} confirmations",
                    head.saturating_sub(block_number),
                    network.confirmations
                ),
            }));
        }

        match chain.get_receipt_status(&key.source_tx_hash).await? {
            Some(true) => {}
            Some(false) => {
                return Err(self
                    .mismatch(&key, Some(block_number), "source_tx_hash", "transaction reverted")
                    .await);
            }
            None => {
                return Err(self
                    .mismatch(&key, Some(block_number), "source_tx_hash", "no receipt available")
                    .await);
            }
        }

        let candidate = match filter.extract(&tx, block_number) {
            Ok(Some(candidate)) => candidate,
            Ok(None) => {
                return Err(self
                    .mismatch(
                        &key,
                        Some(block_number),
                        "source_tx_hash",
                        "transaction is not a payment to a treasury",
                    )
                    .await);
            }
            Err(e) => {
                return Err(self
                    .mismatch(&key, Some(block_number), "source_tx_hash", &e.to_string())
                    .await);
            }
        };

        self.verify_claim(&key, &candidate, request, token.decimals, &token.symbol)
            .await?;

        let outcome = match self.classifier.record(&candidate).await {
            Ok(outcome) => outcome,
            Err(AppError::InvalidPayment(reason)) => {
                self.classifier.flag(&candidate, &reason).await?;
                return Err(reason.into());
            }
            Err(e) => return Err(e),
        };

        Ok(match outcome {
            InsertOutcome::Inserted(record) => {
                info!(target_amount = %record.target_amount, "Reconciled payment recorded");
                ReconciliationResponse {
                    outcome: ReconciliationOutcome::Recorded,
                    record,
                }
            }
            InsertOutcome::AlreadyExists(record) => ReconciliationResponse {
                outcome: ReconciliationOutcome::AlreadyRecorded,
                record,
            },
        })
    }

    /// Compare the submitted claim against the decoded on-chain payment
    async fn verify_claim(
        &self,
        key: &PaymentKey,
        candidate: &PaymentCandidate,
        request: &ReconciliationRequest,
        decimals: u32,
        symbol: &str,
    ) -> Result<(), AppError> {
        let block = Some(candidate.block_number);
        let catalog = self.classifier.catalog();

        let paid_with = catalog.resolve_token(
            &candidate.network,
            &candidate.treasury_address,
            candidate.token_contract.as_deref(),
        );
        if paid_with.map(|t| t.symbol.as_str()) != Some(symbol) {
            let actual = paid_with.map_or("an unknown token", |t| t.symbol.as_str());
            return Err(self
                .mismatch(key, block, "payment_token", &format!("paid with {}", actual))
                .await);
        }

        let amount = payment_amount(candidate.raw_amount, decimals)?;
        if amount.normalize() != request.payment_amount.normalize() {
            return Err(self
                .mismatch(key, block, "payment_amount", &format!("chain shows {}", amount))
                .await);
        }

        if normalize_hex(&request.buyer_address) != candidate.buyer_address {
            return Err(self
                .mismatch(
                    key,
                    block,
                    "buyer_address",
                    &format!("sent by {}", candidate.buyer_address),
                )
                .await);
        }
        Ok(())
    }

    /// Record a reconciliation mismatch anomaly and build the rejection
    async fn mismatch(
        &self,
        key: &PaymentKey,
        block_number: Option<u64>,
        field: &str,
        message: &str,
    ) -> AppError {
        let reason = InvalidPaymentError::ReconciliationMismatch {
            field: field.to_string(),
            message: message.to_string(),
        };
        warn!(network = %key.network, tx_hash = %key.source_tx_hash, reason = %reason, "Reconciliation rejected");

        let mut anomaly = Anomaly::new(&key.network, AnomalyKind::ReconciliationMismatch, reason.to_string())
            .with_tx(&key.source_tx_hash);
        if let Some(block) = block_number {
            anomaly = anomaly.with_block(block);
        }
        if let Err(e) = self.ledger.record_anomaly(&anomaly).await {
            warn!(error = %e, "Failed to record reconciliation anomaly");
        }
        reason.into()
    }

    /// Ledger and home-chain health
    pub async fn health_check(&self) -> HealthResponse {
        let database = match self.ledger.health_check().await {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => {
                warn!(error = %e, "Ledger health check failed");
                HealthStatus::Unhealthy
            }
        };
        let home_chain = match &self.home_chain {
            Some(client) => match client.health_check().await {
                Ok(()) => HealthStatus::Healthy,
                Err(e) => {
                    warn!(error = %e, "Home chain health check failed");
                    HealthStatus::Unhealthy
                }
            },
            None => HealthStatus::Degraded,
        };
        HealthResponse::new(database, home_chain, self.home_chain.is_some())
    }
}
