// =============================================================================
// Navfolio — Main Entry Point
// =============================================================================
//
// Boots the transactional portfolio engine, the NAV cache, and the scheduled
// NAV refresh loop, then serves the REST API until a shutdown signal arrives.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod auth;
mod config;
mod errors;
mod nav_refresh;
mod nav_store;
mod position_engine;
mod quote_client;
mod scheme_catalog;
mod transaction_log;
mod types;
mod valuation;

use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::AppConfig;

const CONFIG_PATH: &str = "navfolio_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Navfolio — starting up");

    let config = AppConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        AppConfig::default()
    });

    info!(
        cron_schedule = %config.cron_schedule,
        provider = %config.provider.base_url,
        "config loaded"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config));

    // ── 3. Start the API server ───────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = std::env::var("NAVFOLIO_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());
    let bind_addr_clone = bind_addr.clone();

    let server_handle = tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr_clone)
            .await
            .expect("failed to bind API server");
        info!(addr = %bind_addr_clone, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    // ── 4. NAV refresh scheduler ───────────────────────────────────────────
    let refresh_state = state.clone();
    let refresh_handle = tokio::spawn(async move {
        nav_refresh::scheduler_loop(refresh_state).await;
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ───────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    state.shutdown.notify_waiters();
    server_handle.abort();

    // give any in-flight NAV refresh run up to 2 batch-delays to cancel
    let grace = {
        let cfg = state.config.read();
        std::time::Duration::from_millis(cfg.nav.batch_delay_ms * 2)
    };
    let _ = tokio::time::timeout(grace, refresh_handle).await;

    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save config on shutdown");
    }

    info!("Navfolio shut down complete.");
    Ok(())
}
