// =============================================================================
// Meridian Trading Kernel — Main Entry Point
// =============================================================================
//
// Startup order: config (fatal on malformed values, exit 2), state tree,
// venue adapters, bus wiring, supervised tasks, control-plane server. With no
// venue credentials the engine runs against the paper adapter so the control
// plane and guard chain are fully exercisable without touching an exchange.
//
// Exit codes: 0 clean shutdown, 1 watchdog self-kill or shutdown overrun,
// 2 fatal configuration error.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod bracket;
mod bus;
mod config;
mod engine_state;
mod fills;
mod guards;
mod ops;
mod policy;
mod router;
mod state;
mod supervisor;
mod telemetry;
mod types;
mod universe;
mod ws_runner;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::bracket::BracketGovernor;
use crate::config::EngineConfig;
use crate::engine_state::EngineState;
use crate::fills::FillsListener;
use crate::guards::depeg::DepegGuard;
use crate::ops::digest::DigestJob;
use crate::ops::fee_manager::FeeManager;
use crate::ops::model_watcher::ModelPromotionWatcher;
use crate::router::binance::{BinanceFuturesRouter, BinanceSpotRouter, SignedClient};
use crate::router::paper::PaperRouter;
use crate::router::RouterRegistry;
use crate::supervisor::{Supervisor, Watchdog};
use crate::types::OrderUpdate;
use crate::ws_runner::{BinanceUserStream, OrderUpdateStream, WsRunner};

/// Depeg parity check cadence; one confirmation window per tick.
const DEPEG_TICK_SEC: u64 = 30;

fn build_routers(config: &EngineConfig) -> anyhow::Result<Arc<RouterRegistry>> {
    let mut registry = RouterRegistry::new(&config.router.default_venue);

    if config.router.api_key.is_empty() || config.router.api_secret.is_empty() {
        warn!("no venue credentials — registering paper adapter (dry run)");
        registry.register("BINANCE", Arc::new(PaperRouter::new("BINANCE")));
        registry.register("BINANCE_FUTURES", Arc::new(PaperRouter::new("BINANCE_FUTURES")));
        return Ok(Arc::new(registry));
    }

    let spot_client = SignedClient::new(
        &config.router.api_key,
        &config.router.api_secret,
        "https://api.binance.com",
        config.router.request_timeout_sec,
    )?;
    let futures_client = SignedClient::new(
        &config.router.api_key,
        &config.router.api_secret,
        "https://fapi.binance.com",
        config.router.request_timeout_sec,
    )?;
    registry.register(
        "BINANCE",
        Arc::new(BinanceSpotRouter::new(
            spot_client,
            config.bracket.allow_stop_amend,
        )),
    );
    registry.register(
        "BINANCE_FUTURES",
        Arc::new(BinanceFuturesRouter::new(
            futures_client,
            config.bracket.allow_stop_amend,
        )),
    );
    Ok(Arc::new(registry))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Meridian Engine — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "fatal configuration error");
            std::process::exit(2);
        }
    };

    // ── 2. Venue adapters & shared state ─────────────────────────────────
    let routers = match build_routers(&config) {
        Ok(routers) => routers,
        Err(e) => {
            error!(error = %e, "fatal: failed to build venue adapters");
            std::process::exit(2);
        }
    };
    let state = EngineState::new(config.clone(), routers.clone());

    // ── 3. Bus subscribers ───────────────────────────────────────────────
    let bracket = BracketGovernor::new(config.bracket.clone(), routers.clone());
    bracket.wire(&state.bus);

    // ── 4. Supervisor & watchdog ─────────────────────────────────────────
    let supervisor = Supervisor::new(config.supervisor.clone());
    let watchdog = Arc::new(Watchdog::new(config.supervisor.watchdog_timeout_sec));
    watchdog.start();
    supervisor.spawn("watchdog-ticker", watchdog.ticker());

    // ── 5. WS runner + fills listener ────────────────────────────────────
    if !config.router.api_key.is_empty() {
        let fills = FillsListener::new(state.bus.clone());
        let api_key = config.router.api_key.clone();
        let ws_cfg = config.ws.clone();
        let bus = state.bus.clone();
        supervisor.spawn(
            "ws-user-stream",
            Box::new(move |shutdown_rx| {
                let fills = fills.clone();
                let api_key = api_key.clone();
                let ws_cfg = ws_cfg.clone();
                let bus = bus.clone();
                Box::pin(async move {
                    let factory_key = api_key.clone();
                    let runner = WsRunner::new(
                        Box::new(move || {
                            let key = factory_key.clone();
                            Box::pin(async move {
                                let stream = BinanceUserStream::connect(&key).await?;
                                Ok(Box::new(stream) as Box<dyn OrderUpdateStream>)
                            })
                        }),
                        Arc::new(move |upd: OrderUpdate| {
                            let fills = fills.clone();
                            Box::pin(async move {
                                fills.on_update(&upd);
                            })
                        }),
                        bus,
                        ws_cfg,
                    );
                    runner.run(shutdown_rx).await
                })
            }),
        );
    } else {
        info!("ws runner idle — no venue credentials");
    }

    // ── 6. Depeg guard tick loop ─────────────────────────────────────────
    let depeg = Arc::new(DepegGuard::new(
        config.depeg.clone(),
        routers.clone(),
        state.bus.clone(),
        state.depeg_flag.clone(),
    ));
    if config.depeg.enabled {
        supervisor.spawn(
            "depeg-guard",
            Box::new(move |mut shutdown_rx| {
                let depeg = depeg.clone();
                Box::pin(async move {
                    let mut interval =
                        tokio::time::interval(std::time::Duration::from_secs(DEPEG_TICK_SEC));
                    loop {
                        tokio::select! {
                            _ = interval.tick() => depeg.tick().await,
                            _ = shutdown_rx.changed() => return Ok(()),
                        }
                    }
                })
            }),
        );
    }

    // ── 7. Fee manager ───────────────────────────────────────────────────
    let fee_manager = FeeManager::new(config.fees.clone(), routers.clone());
    supervisor.spawn(
        "fee-manager",
        Box::new(move |shutdown_rx| {
            let fee_manager = fee_manager.clone();
            Box::pin(async move { fee_manager.run(shutdown_rx).await })
        }),
    );

    // ── 8. Digest job ────────────────────────────────────────────────────
    let digest = DigestJob::new(
        config.digest.clone(),
        state.rollups.clone(),
        state.buckets.clone(),
        state.sink.clone(),
    );
    supervisor.spawn(
        "digest",
        Box::new(move |shutdown_rx| {
            let digest = digest.clone();
            Box::pin(async move { digest.run(shutdown_rx).await })
        }),
    );

    // ── 9. Model promotion watcher ───────────────────────────────────────
    let model_watcher = ModelPromotionWatcher::new(&config.model_watch, state.bus.clone());
    supervisor.spawn(
        "model-watcher",
        Box::new(move |shutdown_rx| {
            let model_watcher = model_watcher.clone();
            Box::pin(async move { model_watcher.run(shutdown_rx).await })
        }),
    );

    // ── 10. Control-plane server ─────────────────────────────────────────
    let app = api::rest::router(state.clone());
    let bind_addr = config.ops.bind_addr.clone();
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "fatal: control plane bind failed");
            std::process::exit(2);
        }
    };
    info!(addr = %bind_addr, "control plane listening");

    let mut server_shutdown = supervisor.shutdown_receiver();
    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = server_shutdown.changed().await;
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %e, "control plane server failed");
        }
    });

    info!("all subsystems running — Ctrl+C to stop");

    // ── 11. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping tasks");

    let clean = supervisor.shutdown().await;
    let _ = server.await;

    if let Err(e) = state.training_cursor.set(state.training_cursor.get()) {
        warn!(error = %e, "failed to persist training cursor on shutdown");
    }

    if !clean {
        error!("one or more tasks exceeded shutdown grace — terminating");
        std::process::exit(1);
    }

    info!("Meridian engine shut down complete");
    Ok(())
}
