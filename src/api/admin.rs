//! Operator endpoints.
//!
//! When an admin token is configured every request must carry it as
//! `Authorization: Bearer <token>`.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;
use utoipa::ToSchema;

use crate::app::AppState;
use crate::domain::{
    Anomaly, AnomalyListParams, AppError, PaymentListParams, PaymentRecord, TreasuryBalance,
};

/// Anomalies awaiting operator review
#[derive(Debug, Serialize, ToSchema)]
pub struct ListAnomaliesResponse {
    pub count: usize,
    pub anomalies: Vec<Anomaly>,
}

/// List recent anomalies, newest first
///
/// GET /admin/anomalies
#[utoipa::path(
    get,
    path = "/admin/anomalies",
    tag = "admin",
    params(
        ("limit" = Option<i64>, Query, description = "Maximum number of entries (1-500, default: 50)")
    ),
    responses(
        (status = 200, description = "Recent anomalies", body = ListAnomaliesResponse),
        (status = 400, description = "Invalid limit", body = crate::domain::ErrorResponse),
        (status = 401, description = "Missing or invalid admin token", body = crate::domain::ErrorResponse),
    )
)]
pub async fn list_anomalies_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AnomalyListParams>,
) -> Result<Json<ListAnomaliesResponse>, AppError> {
    let anomalies = state.service.list_anomalies(&params).await?;
    Ok(Json(ListAnomaliesResponse {
        count: anomalies.len(),
        anomalies,
    }))
}

/// Records in the requested status
#[derive(Debug, Serialize, ToSchema)]
pub struct ListPaymentsResponse {
    pub count: usize,
    pub payments: Vec<PaymentRecord>,
}

/// List payments by status, most recently updated first
///
/// GET /admin/payments?status=failed
#[utoipa::path(
    get,
    path = "/admin/payments",
    tag = "admin",
    params(
        ("status" = Option<String>, Query, description = "Payment status to list (default: failed)"),
        ("limit" = Option<i64>, Query, description = "Maximum number of records (1-500, default: 50)")
    ),
    responses(
        (status = 200, description = "Matching payments", body = ListPaymentsResponse),
        (status = 400, description = "Invalid status or limit", body = crate::domain::ErrorResponse),
        (status = 401, description = "Missing or invalid admin token", body = crate::domain::ErrorResponse),
    )
)]
pub async fn list_payments_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaymentListParams>,
) -> Result<Json<ListPaymentsResponse>, AppError> {
    let payments = state.service.list_payments(&params).await?;
    Ok(Json(ListPaymentsResponse {
        count: payments.len(),
        payments,
    }))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TreasuryBalancesResponse {
    pub balances: Vec<TreasuryBalance>,
}

/// Live treasury balances per accepted token
///
/// GET /admin/treasury-balances
#[utoipa::path(
    get,
    path = "/admin/treasury-balances",
    tag = "admin",
    responses(
        (status = 200, description = "One entry per configured token; unreadable balances carry an error", body = TreasuryBalancesResponse),
        (status = 401, description = "Missing or invalid admin token", body = crate::domain::ErrorResponse),
    )
)]
pub async fn treasury_balances_handler(
    State(state): State<Arc<AppState>>,
) -> Json<TreasuryBalancesResponse> {
    Json(TreasuryBalancesResponse {
        balances: state.service.treasury_balances().await,
    })
}

/// Reject admin requests without the configured bearer token
pub async fn require_admin_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Some(expected) = &state.admin_token {
        let provided = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| AppError::Authentication("Missing admin token".to_string()))?;

        // Compare digests so the comparison time does not depend on the prefix match
        if Sha256::digest(provided.as_bytes()) != Sha256::digest(expected.as_bytes()) {
            warn!("Rejected admin request with invalid token");
            return Err(AppError::Authentication("Invalid admin token".to_string()));
        }
    }
    Ok(next.run(request).await)
}
