// =============================================================================
// keylevel-engine — Main Entry Point
// =============================================================================
//
// Wires the collaborator ports, the signal-generation core, and the
// crash-recoverable ingestion pipeline together, one pipeline per configured
// instrument, then serves the read-only REST/WS observability API alongside
// it.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod api;
mod api_state;
mod atr_tracker;
mod config;
mod engine_core;
mod errors;
mod indicators;
mod ingestion;
mod outcome_tracker;
mod ports;
mod signal_generator;
mod streak;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api_state::ApiState;
use crate::atr_tracker::AtrTracker;
use crate::config::EngineConfig;
use crate::engine_core::EngineCore;
use crate::ingestion::IngestionPipeline;
use crate::outcome_tracker::OutcomeTracker;
use crate::ports::binance::BinanceExchangeSource;
use crate::ports::memory::{BroadcastObserverBus, InMemoryBarStore, InMemorySignalStore, InMemoryStreakStore};
use crate::ports::{BarProcessor, BarStore, ExchangeSource, SignalStore, StreakStore};
use crate::signal_generator::SignalGenerator;
use crate::streak::StreakTracker;

const CONFIG_PATH: &str = "engine_config.json";

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
    info!("║         keylevel-engine — Starting Up                   ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load engine config, using defaults");
        EngineConfig::default()
    });

    info!(instruments = ?config.instruments, "configured instruments");

    // ── 2. Build collaborator ports ──────────────────────────────────────
    let bar_store: Arc<dyn BarStore> = Arc::new(InMemoryBarStore::new());
    let signal_store: Arc<dyn SignalStore> = Arc::new(InMemorySignalStore::new());
    let streak_store: Arc<dyn StreakStore> = Arc::new(InMemoryStreakStore::new());
    let exchange: Arc<dyn ExchangeSource> = Arc::new(BinanceExchangeSource::new());
    let observer_bus = BroadcastObserverBus::new(1024);

    // ── 3. Build the engine core ─────────────────────────────────────────
    let atr_tracker = Arc::new(AtrTracker::new(&config.atr_tracker));
    let streaks = Arc::new(StreakTracker::new());
    let generator = Arc::new(SignalGenerator::new(
        config.strategy.clone(),
        config.whitelist(),
        atr_tracker,
        streaks.clone(),
        signal_store.clone(),
        observer_bus.clone(),
    ));
    let outcomes = Arc::new(OutcomeTracker::new(
        signal_store.clone(),
        streaks.clone(),
        generator.clone(),
        observer_bus.clone(),
    ));

    // Restore active signals and streak state so RESTORE/REPLAY rebuild
    // exactly the position-lock and streak state the process had before the
    // crash (spec.md §4.G).
    if let Ok(active) = signal_store.load_active().await {
        for signal in &active {
            generator.restore_lock(&crate::types::SeriesKey::new(signal.instrument.clone(), signal.timeframe));
        }
        outcomes.restore(active);
    }
    if let Ok(saved_streaks) = streak_store.load_all().await {
        for (key, state) in saved_streaks {
            streaks.restore(&key, state);
        }
    }

    let processor: Arc<dyn BarProcessor> = Arc::new(EngineCore::new(generator.clone(), outcomes.clone(), bar_store.clone()));

    // ── 4. Spawn one ingestion pipeline per instrument ───────────────────
    for instrument in &config.instruments {
        let pipeline = Arc::new(IngestionPipeline::new(
            instrument.clone(),
            exchange.clone(),
            bar_store.clone(),
            processor.clone(),
            config.ingestion.initial_history_hours,
            config.ingestion.replay_checkpoint_every,
        ));
        let instrument = instrument.clone();
        tokio::spawn(async move {
            if let Err(e) = pipeline.run_forever().await {
                error!(instrument = %instrument, error = %e, "ingestion pipeline exited with error");
            }
        });
    }

    info!(count = config.instruments.len(), "ingestion pipelines launched");

    // ── 5. Start the API server ──────────────────────────────────────────
    let api_state = Arc::new(ApiState::new(config.clone(), signal_store, streak_store, observer_bus));
    let bind_addr = std::env::var("ENGINE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());

    let server_state = api_state.clone();
    tokio::spawn(async move {
        let app = api::rest::router(server_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ──────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    if let Err(e) = api_state.config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save engine config on shutdown");
    }

    info!("keylevel-engine shut down complete.");
    Ok(())
}
