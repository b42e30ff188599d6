//! Venue router entry point.
//!
//! Loads configuration, initialises structured logging, opens the store,
//! starts the background jobs and the chain listener, and serves the HTTP
//! API until Ctrl+C.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use venue_router::api::{self, ApiState};
use venue_router::chain::escrow::EscrowExecutor;
use venue_router::chain::listener::{ChainEventSink, ChainListener};
use venue_router::config::AppConfig;
use venue_router::engine::coordinator::OrderCoordinator;
use venue_router::engine::sync::{spawn_jobs, SyncService};
use venue_router::fiat::{CircleClient, FiatConverter, StablecoinParity};
use venue_router::logging;
use venue_router::platforms::VenueRegistry;
use venue_router::storage::Store;

const DEFAULT_CONFIG_PATH: &str = "config.toml";
const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path =
        std::env::var("VENUE_ROUTER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let cfg = AppConfig::load(&config_path)?;

    // Held for the life of the process so buffered log lines are flushed.
    let _log_guard = logging::init_logging(&cfg.log, &cfg.server.mode)?;

    info!(
        config = %config_path,
        port = cfg.server.port,
        mode = %cfg.server.mode,
        chain_id = cfg.chain.chain_id,
        "venue-router starting up"
    );

    // -- Initialise components -------------------------------------------

    let store = Store::connect(&cfg.database)
        .await
        .context("Failed to open database")?;
    let registry = VenueRegistry::from_config(&cfg)?;
    info!(venues = registry.len(), "Venue adapters configured");

    match CircleClient::new(&cfg.circle) {
        Ok(client) if client.has_credentials() => {
            if let Err(e) = client.ping().await {
                warn!(error = %format!("{e:#}"), "Circle API unreachable at startup");
            }
        }
        Ok(_) => info!("Circle credentials not set; fiat payouts are not checked"),
        Err(e) => warn!(error = %format!("{e:#}"), "Circle client unavailable"),
    }
    let fiat: Arc<dyn FiatConverter> = Arc::new(StablecoinParity);

    let cancel = CancellationToken::new();

    let mut coordinator = OrderCoordinator::new(store.clone(), registry.clone(), fiat)
        .with_settlement_contract(cfg.chain.settlement_address.clone())
        .with_cancellation(cancel.clone());
    match EscrowExecutor::from_config(&cfg.chain)? {
        Some(executor) => coordinator = coordinator.with_releaser(Arc::new(executor)),
        None => warn!("Chain executor not configured; unfreeze is disabled"),
    }

    // -- Background tasks ------------------------------------------------

    let sync = SyncService::new(store.clone(), registry.clone(), cfg.sync.enabled_platforms.clone());
    let mut handles = spawn_jobs(sync.clone(), &cfg.sync, cancel.clone())?;

    let sink: Arc<dyn ChainEventSink> = Arc::new(coordinator.clone());
    match ChainListener::from_config(&cfg.chain, sink)? {
        Some(listener) => {
            let token = cancel.clone();
            handles.push(tokio::spawn(async move {
                supervise_listener(listener, token).await;
            }));
        }
        None => warn!("Chain listener not configured; deposits will not be observed"),
    }

    // -- HTTP API --------------------------------------------------------

    let state = Arc::new(ApiState {
        store: store.clone(),
        coordinator,
        sync,
        cancel: cancel.clone(),
    });
    let app = api::build_router(state, &cfg.server.cors_allow_origins);

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received."),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
        shutdown.cancel();
    });

    let served = api::serve(cfg.server.port, app, cancel.clone()).await;
    cancel.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Background task panicked");
        }
    }
    store.close().await;

    served?;
    info!("venue-router shut down cleanly.");
    Ok(())
}

/// Keep the chain listener subscribed, reconnecting after failures.
async fn supervise_listener(listener: ChainListener, cancel: CancellationToken) {
    loop {
        match listener.run(cancel.clone()).await {
            Ok(()) => return,
            Err(e) => error!(error = %format!("{e:#}"), "Chain listener stopped"),
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(LISTENER_RETRY_DELAY) => {
                info!("Reconnecting chain listener");
            }
        }
    }
}
