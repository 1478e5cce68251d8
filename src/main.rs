//! Application entry point.

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use secrecy::SecretString;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use payment_oracle::api::{RateLimitConfig, create_router, create_router_with_rate_limit};
use payment_oracle::app::{
    AppState, CrankConfig, DispatcherConfig, DistributionDispatcher, NetworkWatcher,
    OracleService, PaymentClassifier, StaleDistributionCrank, WatcherConfig, spawn_crank,
    spawn_dispatcher, spawn_watchers,
};
use payment_oracle::domain::{
    ChainClient, ContractReader, DistributionClient, OracleCatalog, PaymentLedger,
};
use payment_oracle::infra::{
    CacheConfig, ContractDataCache, EvmDistributionClient, EvmRpcClient, PostgresConfig,
    PostgresLedger, RpcClientConfig, StaticPriceTable,
};

/// Application configuration
struct Config {
    database_url: String,
    catalog_path: String,
    host: String,
    port: u16,
    enable_rate_limiting: bool,
    rate_limit_config: RateLimitConfig,
    /// Run the distribution dispatcher and stale crank
    enable_distribution: bool,
    /// Bearer token for `/admin` routes (optional)
    admin_token: Option<String>,
    json_logs: bool,
}

impl Config {
    fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let catalog_path =
            env::var("ORACLE_CATALOG_PATH").unwrap_or_else(|_| "oracle.json".to_string());
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);
        let enable_rate_limiting = env::var("ENABLE_RATE_LIMITING")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);
        let enable_distribution = env::var("ENABLE_DISTRIBUTION")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);
        let admin_token = env::var("ADMIN_API_TOKEN").ok().filter(|t| !t.is_empty());

        Ok(Self {
            database_url,
            catalog_path,
            host,
            port,
            enable_rate_limiting,
            rate_limit_config: RateLimitConfig::from_env(),
            enable_distribution,
            admin_token,
            json_logs: json_logs_requested(),
        })
    }
}

fn json_logs_requested() -> bool {
    env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,sqlx=warn"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Read the distribution signer from the variable the catalog names
fn load_signer(catalog: &OracleCatalog) -> Option<SecretString> {
    let var = &catalog.home.signer_key_env;
    match env::var(var) {
        Ok(key) if !key.trim().is_empty() => {
            info!("Loading distribution signer from {}", var);
            Some(SecretString::from(key))
        }
        _ => {
            warn!(
                "   ⚠ {} not set - distribution disabled, payments will queue as pending",
                var
            );
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing(json_logs_requested());

    info!(
        "🏗️  Cross-Chain Payment Oracle v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::from_env()?;
    if config.json_logs {
        info!("Structured JSON logging enabled");
    }

    let catalog = OracleCatalog::load(&config.catalog_path)
        .with_context(|| format!("Failed to load catalog from {}", config.catalog_path))?;
    let catalog = Arc::new(catalog);
    info!(
        "📒 Catalog loaded: {} networks, {} payment tokens, home chain {}",
        catalog.networks.len(),
        catalog.tokens.len(),
        catalog.home.chain.id
    );

    info!("📦 Initializing infrastructure...");

    // Initialize database
    let ledger = PostgresLedger::new(&config.database_url, PostgresConfig::from_env()).await?;
    ledger.run_migrations().await?;
    let ledger: Arc<dyn PaymentLedger> = Arc::new(ledger);
    info!("   ✓ Database connected and migrations applied");

    // One RPC client per source network
    let rpc_config = RpcClientConfig::from_env();
    let mut chains: Vec<Arc<dyn ChainClient>> = Vec::with_capacity(catalog.networks.len());
    for network in &catalog.networks {
        let client = EvmRpcClient::new(network, rpc_config.clone())
            .with_context(|| format!("Failed to create RPC client for {}", network.id))?;
        chains.push(Arc::new(client));
        info!("   ✓ RPC client for {} (chain id {})", network.id, network.chain_id);
    }

    let home_rpc = Arc::new(EvmRpcClient::new(&catalog.home.chain, rpc_config.clone())?);
    info!("   ✓ Home chain RPC client for {}", catalog.home.chain.id);

    let prices = Arc::new(StaticPriceTable::new(&catalog.prices));
    let classifier = Arc::new(PaymentClassifier::new(
        Arc::clone(&catalog),
        prices,
        Arc::clone(&ledger),
    ));
    info!("   ✓ Payment classifier ready");

    let contract_cache = match &catalog.home.sale_contract {
        Some(address) => {
            let reader: Arc<dyn ContractReader> = Arc::clone(&home_rpc) as Arc<dyn ContractReader>;
            let cache = Arc::new(ContractDataCache::new(
                reader,
                address.clone(),
                CacheConfig::from_env(),
            ));
            info!("   ✓ Contract data cache for {}", address);
            Some(cache)
        }
        None => {
            info!("   ○ Contract data cache disabled (no sale contract configured)");
            None
        }
    };

    let distribution_client: Option<Arc<dyn DistributionClient>> = if config.enable_distribution {
        match load_signer(&catalog) {
            Some(secret) => {
                let client = EvmDistributionClient::new(
                    Arc::clone(&home_rpc),
                    &secret,
                    catalog.home.chain.chain_id,
                    catalog.home.target_token.clone(),
                    catalog.home.gas_limit,
                )?;
                info!("   ✓ Distribution client created");
                let client: Arc<dyn DistributionClient> = Arc::new(client);
                Some(client)
            }
            None => None,
        }
    } else {
        info!("   ○ Distribution disabled via config");
        None
    };

    let mut service = OracleService::new(Arc::clone(&ledger), Arc::clone(&classifier), chains.clone());
    if let Some(client) = &distribution_client {
        service = service.with_home_chain(Arc::clone(client));
    }
    if let Some(cache) = &contract_cache {
        service = service.with_contract_cache(Arc::clone(cache));
    }
    let app_state = Arc::new(
        AppState::new(Arc::new(service)).with_admin_token(config.admin_token.clone()),
    );
    if config.admin_token.is_some() {
        info!("   ✓ Admin API token configured");
    } else {
        warn!("   ⚠ ADMIN_API_TOKEN not set - admin routes are unauthenticated");
    }

    // Start one watcher per source network
    let watcher_config = WatcherConfig::from_env(&rpc_config);
    let watchers = catalog
        .networks
        .iter()
        .zip(chains)
        .map(|(network, client)| {
            NetworkWatcher::new(
                network.clone(),
                client,
                Arc::clone(&classifier),
                Arc::clone(&ledger),
                watcher_config.clone(),
            )
        })
        .collect::<Vec<_>>();
    let watcher_count = watchers.len();
    let (watcher_handles, watcher_shutdown_tx) = spawn_watchers(watchers);
    info!("   ✓ {} network watchers started", watcher_count);

    // Start the dispatcher pool and the stale crank when a signer is available
    let mut background: Vec<JoinHandle<()>> = watcher_handles;
    let mut shutdown_txs = vec![watcher_shutdown_tx];
    if let Some(client) = distribution_client {
        let dispatcher_config = DispatcherConfig::from_env();
        let confirmation_timeout = dispatcher_config.confirmation_timeout;
        let workers = dispatcher_config.workers;
        let mut dispatcher = DistributionDispatcher::new(
            Arc::clone(&ledger),
            client,
            catalog.home.target_token.decimals,
            dispatcher_config,
        );
        if let Some(cache) = &contract_cache {
            dispatcher = dispatcher.with_cache(Arc::clone(cache));
        }
        let dispatcher = Arc::new(dispatcher);

        let (handles, shutdown_tx) = spawn_dispatcher(Arc::clone(&dispatcher));
        background.extend(handles);
        shutdown_txs.push(shutdown_tx);
        info!("   ✓ Distribution dispatcher started ({} workers)", workers);

        let crank_config = CrankConfig::from_env().at_least(confirmation_timeout);
        if crank_config.enabled {
            let poll_secs = crank_config.poll_interval.as_secs();
            let stale_after = crank_config.stale_after_secs;
            let crank = StaleDistributionCrank::new(Arc::clone(&ledger), dispatcher, crank_config);
            let (handle, shutdown_tx) = spawn_crank(crank);
            background.push(handle);
            shutdown_txs.push(shutdown_tx);
            info!(
                "   ✓ Stale distribution crank started (poll: {}s, stale_after: {}s)",
                poll_secs, stale_after
            );
        } else {
            info!("   ○ Stale distribution crank disabled");
        }
    } else {
        info!("   ○ Distribution dispatcher not started");
    }

    // Create router
    let router = if config.enable_rate_limiting {
        info!("   ✓ Rate limiting enabled");
        create_router_with_rate_limit(app_state, config.rate_limit_config)
    } else {
        info!("   ○ Rate limiting disabled");
        create_router(app_state)
    };

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("🚀 Server starting on http://{}", addr);
    info!("📖 Swagger UI available at http://{}/swagger-ui", addr);
    info!("📄 OpenAPI spec at http://{}/api-docs/openapi.json", addr);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Signal background tasks to shut down and let in-flight work finish
    for tx in shutdown_txs {
        let _ = tx.send(true);
    }
    for handle in background {
        let _ = handle.await;
    }

    info!("Server shutdown complete");
    Ok(())
}
