// =============================================================================
// Titan Execution Core — Main Entry Point
// =============================================================================
//
// The engine runs against the paper broker unless TITAN_LIVE_BROKER=1 is set
// explicitly. Configuration is environment-driven and validated fail-fast:
// an invalid environment exits with code 1 before anything connects.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod admission;
mod api;
mod app_state;
mod broker;
mod config;
mod error;
mod events;
mod market_data;
mod phase;
mod ratelimit;
mod reconcile;
mod safety;
mod shadow;
mod storage;
mod strategy;
mod types;
mod validator;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broker::paper::{FillMode, PaperAdapter};
use crate::broker::rest::RestAdapter;
use crate::broker::Adapter;
use crate::config::Config;
use crate::events::EngineEvent;
use crate::storage::LogSink;
use crate::types::CloseReason;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new(std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()))
            }),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Titan Execution Core — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = Config::load_or_exit();
    info!(summary = %config.masked_summary(), "configuration validated");

    // ── 2. Broker adapter ────────────────────────────────────────────────
    let live = std::env::var("TITAN_LIVE_BROKER").map(|v| v == "1").unwrap_or(false);
    let adapter: Arc<dyn Adapter> = if live {
        warn!("LIVE broker adapter selected — real orders will be sent");
        let base_url = std::env::var("TITAN_BROKER_URL")
            .unwrap_or_else(|_| "https://api.binance.com".to_string());
        Arc::new(RestAdapter::new(
            config.broker_api_key.clone(),
            config.broker_api_secret.clone(),
            base_url,
        ))
    } else {
        info!("paper broker adapter selected (set TITAN_LIVE_BROKER=1 for live)");
        Arc::new(PaperAdapter::new(FillMode::ImmediateFill))
    };

    // ── 3. Build shared state ────────────────────────────────────────────
    let symbols = config.symbols.clone();
    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config, adapter, Arc::new(LogSink));

    if let Err(e) = state.gateway.test_connection().await {
        warn!(error = %e, "broker connection test failed at startup");
    }

    // ── 4. Depth streams (single writer into the L2 cache) ───────────────
    let ws_base = std::env::var("TITAN_WS_BASE")
        .unwrap_or_else(|_| "wss://stream.binance.com:9443".to_string());
    for symbol in &symbols {
        let cache = state.cache.clone();
        let base = ws_base.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = market_data::run_depth_stream(&base, &sym, &cache).await {
                    error!(symbol = %sym, error = %e, "depth stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    }
    info!(count = symbols.len(), "depth streams launched");

    // ── 5. API server ────────────────────────────────────────────────────
    let api_state = state.clone();
    tokio::spawn(async move {
        let app = api::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    // ── 6. Safety loops ──────────────────────────────────────────────────
    tokio::spawn(state.heartbeat.clone().run(state.flattener.clone()));
    tokio::spawn(state.reconciler.clone().run(state.flattener.clone()));
    tokio::spawn(state.pyramid.clone().run());

    // Equity sampling feeds the flash-crash detector.
    {
        let drift = state.drift.clone();
        let phase = state.phase.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(1));
            loop {
                ticker.tick().await;
                drift.record_equity(phase.equity());
            }
        });
    }

    // Guard reactor: the drift guard publishes its verdicts; this task turns
    // them into the shared emergency flatten.
    {
        let flattener = state.flattener.clone();
        let mut events = state.events.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(EngineEvent::SafetyStop { .. }) => {
                        flattener
                            .emergency_flatten("ZSCORE_SAFETY_STOP", CloseReason::HardKill)
                            .await;
                    }
                    Ok(EngineEvent::HardKill { reason, .. }) => {
                        flattener
                            .emergency_flatten(&reason, CloseReason::HardKill)
                            .await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "guard reactor lagged on the event bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // ── 7. Console fan-out ───────────────────────────────────────────────
    tokio::spawn(api::console::run_console_broadcast(state.clone()));

    info!("all subsystems running — Ctrl+C to stop");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    let cancelled = state.chases.cancel_all();
    if cancelled > 0 {
        warn!(cancelled, "in-flight strategies cancelled on shutdown");
    }

    info!("Titan execution core shut down complete");
    Ok(())
}
