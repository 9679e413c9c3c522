//! Faucet service binary

use anyhow::anyhow;
use clap::Parser;
use drip_common::utils::logging::init_logging;
use drip_faucet::api::{router, AppState, ClientThrottle};
use drip_faucet::credential::{address_of, signing_key_from_hex, CredentialVerifier};
use drip_faucet::metrics::FaucetMetrics;
use drip_faucet::rpc::{RpcLedger, RpcLedgerOptions};
use drip_faucet::{
    Dispenser, DispenserParams, FaucetConfig, FaucetDatabase, Ledger, LedgerMode, MemoryLedger,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Faucet service CLI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Server address
    #[arg(long)]
    server_addr: Option<String>,

    /// RPC URL
    #[arg(long)]
    rpc_url: Option<String>,

    /// Private key
    #[arg(long)]
    private_key: Option<String>,

    /// Amount dispensed per request (base units)
    #[arg(long)]
    max_tokens: Option<String>,

    /// Seconds between requests by one address
    #[arg(long)]
    interval: Option<u64>,

    /// Use an in-process ledger instead of the RPC token
    #[arg(long)]
    memory_ledger: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => FaucetConfig::load(path)?,
        None => FaucetConfig::from_env(),
    };

    // Override with CLI arguments
    if let Some(addr) = args.server_addr {
        config.server_addr = addr;
    }

    if let Some(rpc_url) = args.rpc_url {
        config.rpc_url = rpc_url;
    }

    if let Some(key) = args.private_key {
        config.private_key = key;
    }

    if let Some(amount) = args.max_tokens {
        config.max_tokens = amount;
    }

    if let Some(interval) = args.interval {
        config.interval_secs = interval;
    }

    if args.memory_ledger {
        config.ledger = LedgerMode::Memory;
    }

    if args.debug {
        config.logging.level = "debug".to_string();
    }

    init_logging(&config.logging).map_err(|e| anyhow!("failed to initialize logging: {}", e))?;
    info!("Starting Drip Faucet v{}", env!("CARGO_PKG_VERSION"));

    config.validate()?;

    let signing_key = signing_key_from_hex(&config.private_key)?;
    let faucet_address = address_of(signing_key.verifying_key());
    let params = DispenserParams::new(
        config.asset_address()?,
        config.max_tokens_amount()?,
        config.interval_secs,
    )?;
    let owner = config.owner_address()?;

    info!("Configuration:");
    info!("  Server address: {}", config.server_addr);
    info!("  Faucet address: {}", faucet_address);
    info!("  Asset: {}", params.asset);
    info!("  Max tokens: {}", params.max_tokens);
    info!("  Interval: {}s", params.interval);
    info!("  Ledger: {:?}", config.ledger);
    info!(
        "  Rate limit: {} requests / {}s",
        config.max_requests_per_window, config.rate_limit_window_secs
    );

    let ledger: Arc<dyn Ledger> = match config.ledger {
        LedgerMode::Memory => {
            let ledger = MemoryLedger::new(params.asset);
            let owner_balance = config.memory_owner_balance_amount()?;
            ledger.mint(&owner, owner_balance).await?;
            ledger.approve(&owner, &faucet_address, owner_balance).await;
            ledger
                .mint(&faucet_address, config.memory_initial_inventory_amount()?)
                .await?;
            Arc::new(ledger)
        }
        LedgerMode::Rpc => {
            info!("  RPC URL: {}", config.rpc_url);
            let options = RpcLedgerOptions {
                chain_id: config.chain_id,
                gas_price: config.gas_price_amount()?,
                gas_limit: config.gas_limit,
                ..RpcLedgerOptions::default()
            };
            Arc::new(RpcLedger::new(
                config.rpc_url.clone(),
                params.asset,
                signing_key,
                options,
            ))
        }
    };

    // Initialize database
    let database = FaucetDatabase::new(&config.db_path)?;
    info!("Database initialized at: {}", config.db_path);

    // Print statistics
    let stats = database.get_statistics()?;
    info!("Previous statistics:");
    info!("  Total distributions: {}", stats.total_distributions);
    info!("  Unique addresses: {}", stats.unique_addresses);

    let metrics = if config.metrics_enabled {
        Some(Arc::new(FaucetMetrics::new()?))
    } else {
        None
    };

    let mut dispenser = Dispenser::new(params, owner, faucet_address, ledger, database)?
        .with_programmatic_identities(config.programmatic_addresses()?);
    if let Some(metrics) = &metrics {
        dispenser = dispenser.with_metrics(metrics.clone());
    }
    let dispenser = Arc::new(dispenser);
    info!("Dispenser initialized, owner {}", dispenser.owner().await);

    // Log every event
    let mut events = dispenser.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => info!(target: "drip_faucet::events", "{}", json),
                Err(_) => info!(target: "drip_faucet::events", "{:?}", event),
            }
        }
    });

    let state = AppState {
        dispenser,
        verifier: Arc::new(CredentialVerifier::new(
            faucet_address,
            config.credential_ttl_secs,
        )),
        throttle: Arc::new(ClientThrottle::new(
            config.max_requests_per_window,
            config.rate_limit_duration(),
        )?),
        metrics,
    };

    // Build router
    let mut app = router(state).layer(TraceLayer::new_for_http());

    // Add CORS if enabled
    if config.cors_enabled {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        app = app.layer(cors);
        info!("CORS enabled");
    }

    // Start server
    let addr: SocketAddr = config.server_addr.parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down gracefully");
    Ok(())
}

/// Graceful shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
