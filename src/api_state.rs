// =============================================================================
// Central API state
// =============================================================================
//
// The read-only view the REST/WS surface hands out. Grounded in
// `app_state::AppState`: an atomic version counter bumped on every
// meaningful mutation so the WebSocket feed can detect staleness, plus
// `Arc` handles to every collaborator a dashboard might want to query. This
// engine has no control surface (no pause/resume/kill — there is nothing to
// execute), so what remains is a pure observability snapshot: active
// signals, per-series streak state, and engine configuration.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::config::EngineConfig;
use crate::ports::memory::BroadcastObserverBus;
use crate::ports::{SignalStore, StreakStore};
use crate::types::{Signal, StreakState};

pub struct ApiState {
    pub state_version: AtomicU64,
    pub ws_sequence_number: AtomicU64,

    pub config: RwLock<EngineConfig>,
    pub signal_store: Arc<dyn SignalStore>,
    pub streak_store: Arc<dyn StreakStore>,
    pub observer_bus: Arc<BroadcastObserverBus>,

    pub ws_user_connected: RwLock<bool>,
    pub last_ws_user_event: RwLock<std::time::Instant>,
    pub start_time: std::time::Instant,
}

impl ApiState {
    pub fn new(
        config: EngineConfig,
        signal_store: Arc<dyn SignalStore>,
        streak_store: Arc<dyn StreakStore>,
        observer_bus: Arc<BroadcastObserverBus>,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            ws_sequence_number: AtomicU64::new(0),
            config: RwLock::new(config),
            signal_store,
            streak_store,
            observer_bus,
            ws_user_connected: RwLock::new(false),
            last_ws_user_event: RwLock::new(std::time::Instant::now()),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    /// Build a point-in-time snapshot for `GET /api/v1/state` and the
    /// WebSocket's initial push.
    pub async fn build_snapshot(&self) -> anyhow::Result<StateSnapshot> {
        let active_signals = self.signal_store.load_active().await?;
        let streaks = self.streak_store.load_all().await?;
        let config = self.config.read();

        Ok(StateSnapshot {
            state_version: self.current_state_version(),
            server_time: chrono::Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            instruments: config.instruments.clone(),
            active_signals,
            streaks: streaks.into_iter().map(|(key, state)| (key.to_string(), state)).collect(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub instruments: Vec<String>,
    pub active_signals: Vec<Signal>,
    pub streaks: std::collections::HashMap<String, StreakState>,
}
