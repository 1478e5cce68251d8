//! Integration tests for the API and the detection-to-distribution pipeline.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use rust_decimal_macros::dec;
use tower::ServiceExt;

use payment_oracle::api::{RateLimitConfig, create_router, create_router_with_rate_limit};
use payment_oracle::app::{
    AppState, DispatcherConfig, DistributionDispatcher, NetworkWatcher, OracleService,
    PaymentClassifier, WatcherConfig,
};
use payment_oracle::domain::{
    AggregateStats, ErrorResponse, HealthResponse, HealthStatus, PaymentRecord, PaymentStatus,
    RateLimitResponse, ReconciliationOutcome, ReconciliationRequest, ReconciliationResponse,
};
use payment_oracle::infra::StaticPriceTable;
use payment_oracle::infra::resilience::{BackoffPolicy, CircuitBreakerConfig};
use payment_oracle::test_utils::{
    BUYER, ETH_TREASURY, MockChainClient, MockDistributionClient, MockLedger, USDT_CONTRACT,
    native_transfer, sample_catalog, token_transfer, tx_hash,
};

const ONE_ETH: u128 = 1_000_000_000_000_000_000;

struct TestEnv {
    ledger: Arc<MockLedger>,
    chain: Arc<MockChainClient>,
    classifier: Arc<PaymentClassifier>,
}

impl TestEnv {
    fn new() -> Self {
        Self::with_ledger(Arc::new(MockLedger::new()))
    }

    fn with_ledger(ledger: Arc<MockLedger>) -> Self {
        let catalog = Arc::new(sample_catalog());
        let prices = Arc::new(StaticPriceTable::new(&catalog.prices));
        let classifier = Arc::new(PaymentClassifier::new(catalog, prices, ledger.clone()));
        Self {
            ledger,
            chain: Arc::new(MockChainClient::new("ethereum", 1)),
            classifier,
        }
    }

    fn service(&self) -> OracleService {
        OracleService::new(
            self.ledger.clone(),
            self.classifier.clone(),
            vec![self.chain.clone()],
        )
    }

    fn state(&self) -> Arc<AppState> {
        Arc::new(AppState::new(Arc::new(self.service())))
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post_json<T: serde::Serialize>(uri: &str, payload: &T) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/json")
        .header("X-Forwarded-For", "198.51.100.4")
        .body(Body::from(serde_json::to_string(payload).unwrap()))
        .unwrap()
}

async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body_bytes).unwrap()
}

fn reconciliation(hash: &str, token: &str, amount: rust_decimal::Decimal) -> ReconciliationRequest {
    ReconciliationRequest {
        network: "ethereum".to_string(),
        source_tx_hash: hash.to_string(),
        payment_token: token.to_string(),
        payment_amount: amount,
        buyer_address: BUYER.to_string(),
    }
}

#[tokio::test]
async fn test_get_payment_found() {
    let env = TestEnv::new();
    env.chain.add_block(vec![native_transfer(&tx_hash(1), BUYER, ETH_TREASURY, ONE_ETH)]);
    env.chain.add_empty_blocks(12);
    env.service()
        .submit_reconciliation(&reconciliation(&tx_hash(1), "ETH", dec!(1)))
        .await
        .unwrap();

    let router = create_router(env.state());
    let response = router.oneshot(get(&format!("/payments/{}", tx_hash(1)))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let record: PaymentRecord = body_json(response).await;
    assert_eq!(record.network, "ethereum");
    assert_eq!(record.target_amount, dec!(150000));
    assert_eq!(record.status, PaymentStatus::Confirmed);
}

#[tokio::test]
async fn test_get_payment_not_found() {
    let env = TestEnv::new();
    let router = create_router(env.state());

    let response = router.oneshot(get(&format!("/payments/{}", tx_hash(77)))).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let error: ErrorResponse = body_json(response).await;
    assert_eq!(error.error.r#type, "not_found");
}

#[tokio::test]
async fn test_get_payment_malformed_hash() {
    let env = TestEnv::new();
    let router = create_router(env.state());

    let response = router.oneshot(get("/payments/0x1234")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_user_payments_case_insensitive() {
    let env = TestEnv::new();
    env.chain.add_block(vec![
        native_transfer(&tx_hash(1), BUYER, ETH_TREASURY, ONE_ETH),
        token_transfer(&tx_hash(2), BUYER, USDT_CONTRACT, ETH_TREASURY, 250_000_000),
    ]);
    env.chain.add_empty_blocks(12);
    let service = env.service();
    service
        .submit_reconciliation(&reconciliation(&tx_hash(1), "ETH", dec!(1)))
        .await
        .unwrap();
    service
        .submit_reconciliation(&reconciliation(&tx_hash(2), "USDT", dec!(250)))
        .await
        .unwrap();

    let router = create_router(env.state());
    let upper = BUYER.to_uppercase().replace("0X", "0x");
    let response = router
        .oneshot(get(&format!("/users/{}/payments", upper)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let records: Vec<PaymentRecord> = body_json(response).await;
    assert_eq!(records.len(), 2);
}

#[tokio::test]
async fn test_stats_empty_ledger() {
    let env = TestEnv::new();
    let router = create_router(env.state());

    let response = router.oneshot(get("/stats")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stats: AggregateStats = body_json(response).await;
    assert_eq!(stats.total_payments, 0);
}

#[tokio::test]
async fn test_contract_stats_not_configured() {
    let env = TestEnv::new();
    let router = create_router(env.state());

    let response = router.oneshot(get("/contract/stats")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn test_reconciliation_recorded_then_already_recorded() {
    let env = TestEnv::new();
    env.chain.add_block(vec![token_transfer(
        &tx_hash(3),
        BUYER,
        USDT_CONTRACT,
        ETH_TREASURY,
        250_000_000,
    )]);
    env.chain.add_empty_blocks(12);
    let router = create_router(env.state());

    let payload = reconciliation(&tx_hash(3), "USDT", dec!(250.00));
    let response = router
        .clone()
        .oneshot(post_json("/reconciliations", &payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let first: ReconciliationResponse = body_json(response).await;
    assert_eq!(first.outcome, ReconciliationOutcome::Recorded);
    assert_eq!(first.record.target_amount, dec!(12500));

    let response = router
        .oneshot(post_json("/reconciliations", &payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let second: ReconciliationResponse = body_json(response).await;
    assert_eq!(second.outcome, ReconciliationOutcome::AlreadyRecorded);
    assert_eq!(env.ledger.get_all_records().len(), 1);
}

#[tokio::test]
async fn test_reconciliation_mismatch_is_unprocessable() {
    let env = TestEnv::new();
    env.chain.add_block(vec![native_transfer(&tx_hash(4), BUYER, ETH_TREASURY, ONE_ETH)]);
    env.chain.add_empty_blocks(12);
    let router = create_router(env.state());

    let payload = reconciliation(&tx_hash(4), "ETH", dec!(5));
    let response = router
        .oneshot(post_json("/reconciliations", &payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(env.ledger.get_all_records().is_empty());
    assert_eq!(env.ledger.anomalies().len(), 1);
}

#[tokio::test]
async fn test_reconciliation_malformed_json() {
    let env = TestEnv::new();
    let router = create_router(env.state());

    let request = Request::builder()
        .method("POST")
        .uri("/reconciliations")
        .header("Content-Type", "application/json")
        .body(Body::from("{ invalid json }"))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_reconciliation_rate_limited_after_five() {
    let env = TestEnv::new();
    let router = create_router_with_rate_limit(env.state(), RateLimitConfig::default());

    // Unknown transactions still count against the quota
    for n in 0..5 {
        let payload = reconciliation(&tx_hash(100 + n), "ETH", dec!(1));
        let response = router
            .clone()
            .oneshot(post_json("/reconciliations", &payload))
            .await
            .unwrap();
        assert_ne!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("x-ratelimit-remaining"));
    }

    let payload = reconciliation(&tx_hash(200), "ETH", dec!(1));
    let response = router
        .clone()
        .oneshot(post_json("/reconciliations", &payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let retry_after: u64 = response
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0 && retry_after <= 600);

    let body: RateLimitResponse = body_json(response).await;
    assert_eq!(body.error.r#type, "rate_limited");
    assert_eq!(body.retry_after, retry_after);

    // Query endpoints have their own budget
    let response = router.oneshot(get("/stats")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limit_tracks_clients_separately() {
    let env = TestEnv::new();
    let router = create_router_with_rate_limit(env.state(), RateLimitConfig::default());

    for _ in 0..5 {
        let payload = reconciliation(&tx_hash(1), "ETH", dec!(1));
        router
            .clone()
            .oneshot(post_json("/reconciliations", &payload))
            .await
            .unwrap();
    }

    let request = Request::builder()
        .method("POST")
        .uri("/reconciliations")
        .header("Content-Type", "application/json")
        .header("X-Forwarded-For", "203.0.113.9")
        .body(Body::from(
            serde_json::to_string(&reconciliation(&tx_hash(1), "ETH", dec!(1))).unwrap(),
        ))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_ne!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_admin_anomalies_requires_token() {
    let env = TestEnv::new();
    env.chain.add_block(vec![native_transfer(&tx_hash(4), BUYER, ETH_TREASURY, ONE_ETH)]);
    env.chain.add_empty_blocks(12);
    let _ = env
        .service()
        .submit_reconciliation(&reconciliation(&tx_hash(4), "ETH", dec!(9)))
        .await;

    let state = Arc::new(
        AppState::new(Arc::new(env.service())).with_admin_token(Some("s3cret".to_string())),
    );
    let router = create_router(state);

    let response = router.clone().oneshot(get("/admin/anomalies")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/admin/anomalies")
        .header("Authorization", "Bearer wrong")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/admin/anomalies?limit=10")
        .header("Authorization", "Bearer s3cret")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: serde_json::Value = body_json(response).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["anomalies"][0]["kind"], "reconciliation_mismatch");
}

#[tokio::test]
async fn test_admin_anomalies_invalid_limit() {
    let env = TestEnv::new();
    let router = create_router(env.state());

    let response = router.oneshot(get("/admin/anomalies?limit=0")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_lists_payments_by_status() {
    let env = TestEnv::new();
    for n in [5, 6] {
        env.chain
            .add_block(vec![native_transfer(&tx_hash(n), BUYER, ETH_TREASURY, ONE_ETH)]);
    }
    env.chain.add_empty_blocks(12);
    let service = env.service();
    for n in [5, 6] {
        service
            .submit_reconciliation(&reconciliation(&tx_hash(n), "ETH", dec!(1)))
            .await
            .unwrap();
    }
    let mut failed = env
        .ledger
        .get_all_records()
        .into_iter()
        .find(|r| r.source_tx_hash == tx_hash(5))
        .unwrap();
    failed.status = PaymentStatus::Failed;
    failed.last_error = Some("insufficient funds".to_string());
    env.ledger.insert_record(failed);

    let router = create_router(env.state());
    let response = router
        .clone()
        .oneshot(get("/admin/payments?status=failed"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = body_json(response).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["payments"][0]["source_tx_hash"], tx_hash(5));
    assert_eq!(body["payments"][0]["last_error"], "insufficient funds");

    // Status defaults to failed
    let response = router.clone().oneshot(get("/admin/payments")).await.unwrap();
    let body: serde_json::Value = body_json(response).await;
    assert_eq!(body["count"], 1);

    let response = router
        .clone()
        .oneshot(get("/admin/payments?status=confirmed&limit=10"))
        .await
        .unwrap();
    let body: serde_json::Value = body_json(response).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["payments"][0]["source_tx_hash"], tx_hash(6));

    let response = router
        .clone()
        .oneshot(get("/admin/payments?status=lost"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = router
        .oneshot(get("/admin/payments?limit=501"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_treasury_balances() {
    let env = TestEnv::new();
    env.chain
        .set_balance(ETH_TREASURY, None, 2 * ONE_ETH + ONE_ETH / 2);
    env.chain
        .set_balance(ETH_TREASURY, Some(USDT_CONTRACT), 1_250_000);
    let router = create_router(env.state());

    let response = router
        .oneshot(get("/admin/treasury-balances"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = body_json(response).await;
    let balances = body["balances"].as_array().unwrap();
    assert_eq!(balances.len(), 3);

    let entry = |symbol: &str| {
        balances
            .iter()
            .find(|b| b["token"] == symbol)
            .unwrap()
            .clone()
    };
    assert_eq!(entry("ETH")["balance"], "2.5");
    assert_eq!(entry("ETH")["raw_balance"], "2500000000000000000");
    assert!(entry("ETH")["contract"].is_null());
    assert_eq!(entry("USDT")["balance"], "1.25");
    assert_eq!(entry("USDT")["contract"], USDT_CONTRACT);

    // No RPC client for bsc in this environment
    let bnb = entry("BNB");
    assert!(bnb["balance"].is_null());
    assert!(bnb["error"].as_str().unwrap().contains("bsc"));
}

#[tokio::test]
async fn test_admin_operator_routes_require_token() {
    let env = TestEnv::new();
    let state = Arc::new(
        AppState::new(Arc::new(env.service())).with_admin_token(Some("s3cret".to_string())),
    );
    let router = create_router(state);

    for uri in ["/admin/payments", "/admin/treasury-balances"] {
        let response = router.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{}", uri);

        let request = Request::builder()
            .uri(uri)
            .header("Authorization", "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{}", uri);
    }
}

#[tokio::test]
async fn test_health_check_without_distribution_is_degraded() {
    let env = TestEnv::new();
    let router = create_router(env.state());

    let response = router.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let health: HealthResponse = body_json(response).await;
    assert_eq!(health.status, HealthStatus::Degraded);
    assert_eq!(health.database, HealthStatus::Healthy);
    assert!(!health.distribution_enabled);
}

#[tokio::test]
async fn test_health_check_healthy_with_home_chain() {
    let env = TestEnv::new();
    let service = env
        .service()
        .with_home_chain(Arc::new(MockDistributionClient::new()));
    let router = create_router(Arc::new(AppState::new(Arc::new(service))));

    let response = router.oneshot(get("/health")).await.unwrap();
    let health: HealthResponse = body_json(response).await;
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.home_chain, HealthStatus::Healthy);
}

#[tokio::test]
async fn test_liveness() {
    let env = TestEnv::new();
    let router = create_router(env.state());

    let response = router.oneshot(get("/health/live")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_readiness_unhealthy() {
    let ledger = Arc::new(MockLedger::new());
    ledger.set_healthy(false);
    let env = TestEnv::with_ledger(ledger);
    let router = create_router(env.state());

    let response = router.oneshot(get("/health/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_database_failure() {
    let env = TestEnv::with_ledger(Arc::new(MockLedger::failing("DB error")));
    let router = create_router(env.state());

    let response = router.oneshot(get(&format!("/payments/{}", tx_hash(1)))).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_openapi_spec_available() {
    let env = TestEnv::new();
    let router = create_router(env.state());

    let response = router.oneshot(get("/api-docs/openapi.json")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let spec: serde_json::Value = body_json(response).await;
    assert!(spec.get("openapi").is_some());
    assert!(spec["paths"].get("/reconciliations").is_some());
}

#[tokio::test]
async fn test_swagger_ui_available() {
    let env = TestEnv::new();
    let router = create_router(env.state());

    let response = router.oneshot(get("/swagger-ui/")).await.unwrap();
    assert!(response.status().is_success() || response.status().is_redirection());
}

#[tokio::test]
async fn test_detected_payment_is_distributed() {
    let env = TestEnv::new();
    let mut network = sample_catalog().network("ethereum").unwrap().clone();
    network.confirmations = 2;
    network.start_block = Some(1);

    env.chain.add_block(vec![native_transfer(&tx_hash(9), BUYER, ETH_TREASURY, ONE_ETH)]);
    env.chain.add_empty_blocks(2);

    let mut watcher = NetworkWatcher::new(
        network,
        env.chain.clone(),
        env.classifier.clone(),
        env.ledger.clone(),
        WatcherConfig {
            poll_interval: Duration::from_millis(10),
            ..WatcherConfig::default()
        },
    );
    watcher.initialize().await.unwrap();
    assert_eq!(watcher.poll_once().await.unwrap(), 1);

    let home = Arc::new(MockDistributionClient::new());
    let dispatcher = DistributionDispatcher::new(
        env.ledger.clone(),
        home.clone(),
        18,
        DispatcherConfig {
            workers: 1,
            poll_interval: Duration::from_millis(10),
            confirmation_timeout: Duration::from_millis(100),
            confirmation_poll_interval: Duration::from_millis(5),
            backoff: BackoffPolicy::new(Duration::ZERO, Duration::ZERO, 5),
            breaker: CircuitBreakerConfig::default(),
        },
    );
    assert!(dispatcher.process_next().await.unwrap());
    assert!(!dispatcher.process_next().await.unwrap());

    let records = env.ledger.get_all_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, PaymentStatus::Distributed);
    assert_eq!(records[0].target_amount, dec!(150000));
    assert!(records[0].distribution_tx_hash.is_some());
    assert_eq!(home.broadcasts().len(), 1);

    // The query interface reflects the completed distribution
    let service = env.service().with_home_chain(home);
    let record = service.get_payment_status(&tx_hash(9)).await.unwrap();
    assert_eq!(record.status, PaymentStatus::Distributed);
}
