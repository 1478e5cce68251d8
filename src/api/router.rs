//! Router configuration and rate-limit middleware.

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use sha2::{Digest, Sha256};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use super::admin::{
    list_anomalies_handler, list_payments_handler, require_admin_token, treasury_balances_handler,
};
use super::handlers::{
    ApiDoc, get_contract_stats_handler, get_payment_handler, get_stats_handler,
    get_user_payments_handler, health_check_handler, liveness_handler, readiness_handler,
    submit_reconciliation_handler,
};
use crate::app::AppState;
use crate::domain::{ErrorDetail, RateLimitResponse};
use crate::infra::resilience::{
    EndpointClass, FixedWindowRateLimiter, RateLimitDecision, RateLimitRule,
};

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Rate limiting configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub rules: HashMap<EndpointClass, RateLimitRule>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let rules = [
            (EndpointClass::Query, RateLimitRule::new(120, Duration::from_secs(60))),
            (EndpointClass::Stats, RateLimitRule::new(60, Duration::from_secs(60))),
            (
                EndpointClass::Reconciliation,
                RateLimitRule::new(5, Duration::from_secs(600)),
            ),
            (EndpointClass::Admin, RateLimitRule::new(30, Duration::from_secs(60))),
        ];
        Self {
            rules: rules.into_iter().collect(),
        }
    }
}

impl RateLimitConfig {
    /// Per-class overrides from `RATE_LIMIT_<CLASS>_MAX` and
    /// `RATE_LIMIT_<CLASS>_WINDOW_SECS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        for class in [
            EndpointClass::Query,
            EndpointClass::Stats,
            EndpointClass::Reconciliation,
            EndpointClass::Admin,
        ] {
            let prefix = format!("RATE_LIMIT_{}", class.as_str().to_ascii_uppercase());
            let Some(default) = config.rules.get(&class).copied() else {
                continue;
            };
            let max_requests = env::var(format!("{prefix}_MAX"))
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_requests);
            let window = env::var(format!("{prefix}_WINDOW_SECS"))
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.window);
            config
                .rules
                .insert(class, RateLimitRule::new(max_requests, window));
        }
        config
    }

    /// Replace the rule for one endpoint class (builder pattern)
    #[must_use]
    pub fn with_rule(mut self, class: EndpointClass, rule: RateLimitRule) -> Self {
        self.rules.insert(class, rule);
        self
    }
}

/// Create the application router without rate limiting
pub fn create_router(app_state: Arc<AppState>) -> Router {
    build_router(app_state, None)
}

/// Create the application router with per-client rate limits
pub fn create_router_with_rate_limit(app_state: Arc<AppState>, config: RateLimitConfig) -> Router {
    let limiter = Arc::new(FixedWindowRateLimiter::new(config.rules));
    build_router(app_state, Some(limiter))
}

fn build_router(app_state: Arc<AppState>, limiter: Option<Arc<FixedWindowRateLimiter>>) -> Router {
    let classed = |class: EndpointClass, routes: Router<Arc<AppState>>| match &limiter {
        Some(limiter) => routes.route_layer(middleware::from_fn_with_state(
            (Arc::clone(limiter), class),
            rate_limit_middleware,
        )),
        None => routes,
    };

    let query_routes = classed(
        EndpointClass::Query,
        Router::new()
            .route("/payments/{tx_hash}", get(get_payment_handler))
            .route("/users/{address}/payments", get(get_user_payments_handler)),
    );

    let stats_routes = classed(
        EndpointClass::Stats,
        Router::new()
            .route("/stats", get(get_stats_handler))
            .route("/contract/stats", get(get_contract_stats_handler)),
    );

    let reconciliation_routes = classed(
        EndpointClass::Reconciliation,
        Router::new().route("/reconciliations", post(submit_reconciliation_handler)),
    );

    let admin_routes = classed(
        EndpointClass::Admin,
        Router::new()
            .route("/admin/anomalies", get(list_anomalies_handler))
            .route("/admin/payments", get(list_payments_handler))
            .route("/admin/treasury-balances", get(treasury_balances_handler))
            .route_layer(middleware::from_fn_with_state(
                Arc::clone(&app_state),
                require_admin_token,
            )),
    );

    let health_routes = Router::new()
        .route("/health", get(health_check_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler));

    Router::new()
        .merge(query_routes)
        .merge(stats_routes)
        .merge(reconciliation_routes)
        .merge(admin_routes)
        .merge(health_routes)
        .with_state(app_state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn rate_limit_middleware(
    State((limiter, class)): State<(Arc<FixedWindowRateLimiter>, EndpointClass)>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_identity(&request);
    match limiter.check(class, &client) {
        RateLimitDecision::Unlimited => next.run(request).await,
        RateLimitDecision::Allowed {
            limit,
            remaining,
            reset_after,
        } => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
            headers.insert(X_RATELIMIT_RESET, HeaderValue::from(ceil_secs(reset_after)));
            response
        }
        RateLimitDecision::Limited { limit, retry_after } => {
            let retry_after = ceil_secs(retry_after);
            warn!(
                class = class.as_str(),
                client = %client,
                retry_after,
                "Rate limit exceeded"
            );
            let body = Json(RateLimitResponse {
                error: ErrorDetail {
                    r#type: "rate_limited".to_string(),
                    message: format!(
                        "Too many {} requests, retry in {} seconds",
                        class.as_str(),
                        retry_after
                    ),
                },
                retry_after,
            });
            let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
            let headers = response.headers_mut();
            headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(retry_after));
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u32));
            headers.insert(X_RATELIMIT_RESET, HeaderValue::from(retry_after));
            response
        }
    }
}

/// Identify the caller by source address and user agent.
///
/// The first `X-Forwarded-For` hop wins, then `X-Real-IP`, then the socket
/// peer. The user agent is hashed so that clients sharing a NAT address are
/// counted apart.
fn client_identity(request: &Request) -> String {
    let headers = request.headers();
    let ip = forwarded_ip(headers)
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    let agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let digest = Sha256::digest(agent.as_bytes());
    let identity = format!("{}|{}", ip, hex::encode(&digest[..8]));
    debug!(identity = %identity, "Resolved client identity");
    identity
}

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
        headers.get(name).and_then(|v| v.to_str().ok())
    }
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .or_else(|| header_str(headers, "x-real-ip"))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 { secs + 1 } else { secs }
}
