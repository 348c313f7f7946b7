// =============================================================================
// Vela Engine — Main Entry Point
// =============================================================================
//
// The engine starts Paused for safety: market data flows and strategies
// evaluate, but no signal reaches order creation until an operator resumes
// trading via the API.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vela::api;
use vela::app_state::AppState;
use vela::config::EngineConfig;
use vela::types::{Pair, TradingMode};

const CONFIG_PATH: &str = "vela_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });

    // SAFETY: always boot with signal routing disabled.
    config.trading_mode = TradingMode::Paused;

    if let Ok(pairs) = std::env::var("VELA_PAIRS") {
        config.pairs = pairs
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    info!(
        pairs = ?config.pairs,
        exchanges = ?config.exchanges,
        trading_mode = %config.trading_mode,
        "vela engine starting (paused)"
    );

    let pairs: Vec<Pair> = config
        .pairs
        .iter()
        .filter_map(|p| match Pair::parse(p) {
            Ok(pair) => Some(pair),
            Err(e) => {
                warn!(pair = %p, error = %e, "skipping unparseable pair");
                None
            }
        })
        .collect();
    if pairs.is_empty() {
        anyhow::bail!("no valid trading pairs configured");
    }

    // ── 2. Build the component graph ─────────────────────────────────────
    let exchanges = config.exchanges.clone();
    let venue_config = config.venue.clone();
    let aggregation_interval = Duration::from_millis(config.aggregation_interval_ms);
    let tick_interval = Duration::from_secs(config.strategy_tick_secs);

    let (state, order_queue_rx) = AppState::new(config, CONFIG_PATH)?;

    // ── 3. Market data ───────────────────────────────────────────────────
    state
        .aggregator
        .start(&exchanges, &pairs, &venue_config, aggregation_interval)?;

    // ── 4. Order worker ──────────────────────────────────────────────────
    tokio::spawn(state.orders.clone().run_worker(order_queue_rx));

    // ── 5. Strategy scheduler ────────────────────────────────────────────
    tokio::spawn(state.scheduler.clone().run_loop(tick_interval));

    // ── 6. Cache janitor ─────────────────────────────────────────────────
    {
        let cache = state.cache.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                let evicted = cache.sweep();
                if evicted > 0 {
                    info!(evicted, "cache swept");
                }
            }
        });
    }

    // ── 7. API server ────────────────────────────────────────────────────
    let bind_addr = std::env::var("VELA_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    {
        let api_state = state.clone();
        let bind_addr = bind_addr.clone();
        tokio::spawn(async move {
            let app = api::rest::router(api_state);
            let listener = tokio::net::TcpListener::bind(&bind_addr)
                .await
                .expect("failed to bind API server");
            info!(addr = %bind_addr, "API server listening");
            axum::serve(listener, app).await.expect("API server failed");
        });
    }

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    state.aggregator.shutdown();
    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save config on shutdown");
    }

    info!("vela engine shut down complete");
    Ok(())
}
