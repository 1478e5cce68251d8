//! HTTP request handlers with OpenAPI documentation.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::error;
use utoipa::OpenApi;

use crate::app::AppState;
use crate::domain::{
    AggregateStats, AppError, BlockchainError, DatabaseError, ErrorDetail, ErrorResponse,
    HealthResponse, HealthStatus, PaymentRecord, RateLimitResponse, ReconciliationOutcome,
    ReconciliationRequest, ReconciliationResponse, StatsBreakdown,
};
use crate::infra::cache::{ContractStats, ContractStatsSnapshot, StatsFetch};

/// OpenAPI documentation structure
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Cross-Chain Payment Oracle API",
        version = "0.1.0",
        description = "Payment status, sale statistics and manual reconciliation for treasury payments observed across EVM chains",
        license(
            name = "MIT"
        )
    ),
    paths(
        get_payment_handler,
        get_user_payments_handler,
        get_stats_handler,
        get_contract_stats_handler,
        submit_reconciliation_handler,
        health_check_handler,
        liveness_handler,
        readiness_handler,
        super::admin::list_anomalies_handler,
        super::admin::list_payments_handler,
        super::admin::treasury_balances_handler,
    ),
    components(
        schemas(
            PaymentRecord,
            crate::domain::PaymentStatus,
            AggregateStats,
            StatsBreakdown,
            ContractStats,
            ContractStatsSnapshot,
            StatsFetch,
            ReconciliationRequest,
            ReconciliationResponse,
            ReconciliationOutcome,
            crate::domain::Anomaly,
            crate::domain::AnomalyKind,
            crate::domain::TreasuryBalance,
            super::admin::ListAnomaliesResponse,
            super::admin::ListPaymentsResponse,
            super::admin::TreasuryBalancesResponse,
            HealthResponse,
            HealthStatus,
            ErrorResponse,
            ErrorDetail,
            RateLimitResponse,
        )
    ),
    tags(
        (name = "payments", description = "Payment ledger queries"),
        (name = "stats", description = "Sale statistics"),
        (name = "reconciliation", description = "Manual recording of missed payments"),
        (name = "health", description = "Health check endpoints"),
        (name = "admin", description = "Operator endpoints")
    )
)]
pub struct ApiDoc;

/// Get a payment by source transaction hash
///
/// Returns the most recent record for the hash on any network. Records in
/// `failed` carry `last_error` and need operator action.
#[utoipa::path(
    get,
    path = "/payments/{tx_hash}",
    tag = "payments",
    params(
        ("tx_hash" = String, Path, description = "Source transaction hash")
    ),
    responses(
        (status = 200, description = "Payment found", body = PaymentRecord),
        (status = 400, description = "Malformed transaction hash", body = ErrorResponse),
        (status = 404, description = "Payment not found", body = ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = RateLimitResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn get_payment_handler(
    State(state): State<Arc<AppState>>,
    Path(tx_hash): Path<String>,
) -> Result<Json<PaymentRecord>, AppError> {
    let record = state.service.get_payment_status(&tx_hash).await?;
    Ok(Json(record))
}

/// List payments sent by a buyer
///
/// Address matching is case-insensitive. Newest first.
#[utoipa::path(
    get,
    path = "/users/{address}/payments",
    tag = "payments",
    params(
        ("address" = String, Path, description = "Buyer address")
    ),
    responses(
        (status = 200, description = "Payments by this buyer", body = Vec<PaymentRecord>),
        (status = 400, description = "Malformed address", body = ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = RateLimitResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn get_user_payments_handler(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<Json<Vec<PaymentRecord>>, AppError> {
    let records = state.service.get_user_payments(&address).await?;
    Ok(Json(records))
}

/// Ledger-wide totals by network and token
#[utoipa::path(
    get,
    path = "/stats",
    tag = "stats",
    responses(
        (status = 200, description = "Aggregate statistics", body = AggregateStats),
        (status = 429, description = "Rate limit exceeded", body = RateLimitResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn get_stats_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<AggregateStats>, AppError> {
    let stats = state.service.get_aggregate_stats().await?;
    Ok(Json(stats))
}

/// Sale-contract statistics from the home chain
///
/// Served from a short-lived cache. `stale` is set when the latest refresh
/// failed and the last known value is returned instead.
#[utoipa::path(
    get,
    path = "/contract/stats",
    tag = "stats",
    responses(
        (status = 200, description = "Contract statistics", body = ContractStatsSnapshot),
        (status = 429, description = "Rate limit exceeded", body = RateLimitResponse),
        (status = 501, description = "Sale contract not configured", body = ErrorResponse),
        (status = 503, description = "Home chain unavailable", body = ErrorResponse)
    )
)]
pub async fn get_contract_stats_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ContractStatsSnapshot>, AppError> {
    let stats = state.service.contract_stats().await?;
    Ok(Json(stats))
}

/// Submit a payment the watcher missed
///
/// The transaction is looked up on its source chain and must be a confirmed,
/// successful payment to a treasury matching the claimed token, amount and
/// sender. Resubmitting a recorded payment returns `already_recorded`.
#[utoipa::path(
    post,
    path = "/reconciliations",
    tag = "reconciliation",
    request_body = ReconciliationRequest,
    responses(
        (status = 200, description = "Payment recorded or already present", body = ReconciliationResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 422, description = "Claim does not match the chain", body = ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = RateLimitResponse),
        (status = 503, description = "Source chain unavailable", body = ErrorResponse)
    )
)]
pub async fn submit_reconciliation_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ReconciliationRequest>,
) -> Result<Json<ReconciliationResponse>, AppError> {
    let response = state.service.submit_reconciliation(&payload).await?;
    Ok(Json(response))
}

/// Detailed health check
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Health status", body = HealthResponse)
    )
)]
pub async fn health_check_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let health = state.service.health_check().await;
    Json(health)
}

/// Kubernetes liveness endpoint
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "health",
    responses(
        (status = 200, description = "Application is alive")
    )
)]
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness endpoint
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Application is ready to serve traffic"),
        (status = 503, description = "Application is not ready")
    )
)]
pub async fn readiness_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    let health = state.service.health_check().await;
    match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_type, message) = match &self {
            AppError::Database(db_err) => match db_err {
                DatabaseError::Connection(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "database_error",
                    self.to_string(),
                ),
                DatabaseError::NotFound(_) => {
                    (StatusCode::NOT_FOUND, "not_found", self.to_string())
                }
                DatabaseError::Duplicate(_) => {
                    (StatusCode::CONFLICT, "duplicate", self.to_string())
                }
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    self.to_string(),
                ),
            },
            AppError::Blockchain(bc_err) => match bc_err {
                BlockchainError::Connection(_)
                | BlockchainError::RpcError(_)
                | BlockchainError::RateLimited(_)
                | BlockchainError::CircuitOpen(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "blockchain_unavailable",
                    self.to_string(),
                ),
                BlockchainError::Timeout(_) => {
                    (StatusCode::GATEWAY_TIMEOUT, "timeout", self.to_string())
                }
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "blockchain_error",
                    self.to_string(),
                ),
            },
            AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "configuration_error",
                self.to_string(),
            ),
            AppError::Validation(_) => (
                StatusCode::BAD_REQUEST,
                "validation_error",
                self.to_string(),
            ),
            AppError::InvalidPayment(_) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_payment",
                self.to_string(),
            ),
            AppError::InvalidTransition { .. } => (
                StatusCode::CONFLICT,
                "invalid_transition",
                self.to_string(),
            ),
            AppError::Authentication(_) => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                self.to_string(),
            ),
            AppError::Serialization(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "serialization_error",
                self.to_string(),
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                self.to_string(),
            ),
            AppError::NotSupported(_) => (
                StatusCode::NOT_IMPLEMENTED,
                "not_supported",
                self.to_string(),
            ),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Rate limit exceeded".to_string(),
            ),
        };

        if status.is_server_error() {
            error!(error_type = %error_type, message = %message, "Server error");
        }

        let body = Json(ErrorResponse {
            error: ErrorDetail {
                r#type: error_type.to_string(),
                message,
            },
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{InvalidPaymentError, PaymentStatus, ValidationError};

    fn status_of(err: AppError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_of(AppError::Database(DatabaseError::NotFound("x".into()))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(AppError::Validation(ValidationError::MissingField("network".into()))),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(AppError::InvalidPayment(InvalidPaymentError::ZeroValue)),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(AppError::InvalidTransition {
                from: PaymentStatus::Distributed,
                to: PaymentStatus::Distributing,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(AppError::Blockchain(BlockchainError::CircuitOpen("home".into()))),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_of(AppError::RateLimited), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            status_of(AppError::NotSupported("cache".into())),
            StatusCode::NOT_IMPLEMENTED
        );
    }

    #[test]
    fn test_openapi_lists_routes() {
        let doc = ApiDoc::openapi();
        for path in [
            "/payments/{tx_hash}",
            "/users/{address}/payments",
            "/stats",
            "/contract/stats",
            "/reconciliations",
            "/admin/anomalies",
            "/admin/payments",
            "/admin/treasury-balances",
            "/health",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {}", path);
        }
    }
}
