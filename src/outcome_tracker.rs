// =============================================================================
// Outcome / position tracker (spec.md §4.F)
// =============================================================================
//
// Tracks ACTIVE signals to TP/SL closure via two independent input paths —
// tick-by-tick (live) and bar-range (replay/backtest, pessimistic when a
// bar's range spans both TP and SL). Grounded in
// `position_engine::PositionManager`: an `RwLock<HashMap>` of live entries,
// a `check_exits`-style ordered scan (SL checked before TP, same precedence
// as `check_exits`' stop-loss-first ordering), and a `close_position`-style
// terminal transition that records the final state once and moves on.
//
// On outcome, this module fans out to every collaborator spec.md §4.F names
// as an observer: the signal store (persist close), the streak tracker
// (record the outcome), the signal generator (release the position lock),
// and the observer bus (SIGNAL_CLOSED).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::errors::{EngineError, EngineResult};
use crate::ports::{ObserverBus, SignalStore};
use crate::signal_generator::SignalGenerator;
use crate::streak::StreakTracker;
use crate::types::{Bar, Direction, Instrument, ObserverEvent, SeriesKey, Signal, SignalState, Trade};

const MAE_MFE_PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

struct ActiveEntry {
    signal: Signal,
    worst_adverse: f64,
    best_favorable: f64,
    last_published: Option<Instant>,
}

impl ActiveEntry {
    fn new(signal: Signal) -> Self {
        Self { signal, worst_adverse: 0.0, best_favorable: 0.0, last_published: None }
    }

    fn key(&self) -> SeriesKey {
        SeriesKey::new(self.signal.instrument.clone(), self.signal.timeframe)
    }

    fn update_excursion(&mut self, price: f64) {
        let (adverse, favorable) = match self.signal.direction {
            Direction::Long => ((self.signal.entry - price).max(0.0), (price - self.signal.entry).max(0.0)),
            Direction::Short => ((price - self.signal.entry).max(0.0), (self.signal.entry - price).max(0.0)),
        };
        self.worst_adverse = self.worst_adverse.max(adverse);
        self.best_favorable = self.best_favorable.max(favorable);
    }

    fn mae_ratio(&self) -> f64 {
        let denom = (self.signal.entry - self.signal.sl).abs();
        if denom <= 0.0 { 0.0 } else { self.worst_adverse / denom }
    }

    fn mfe_ratio(&self) -> f64 {
        let denom = (self.signal.tp - self.signal.entry).abs();
        if denom <= 0.0 { 0.0 } else { self.best_favorable / denom }
    }

    /// Tick-path hit test: SL checked before TP (spec.md §4.F ordering,
    /// mirrored from `PositionManager::check_exits`).
    fn tick_outcome(&self, price: f64) -> Option<(SignalState, f64)> {
        match self.signal.direction {
            Direction::Long => {
                if price <= self.signal.sl {
                    Some((SignalState::Sl, self.signal.sl))
                } else if price >= self.signal.tp {
                    Some((SignalState::Tp, self.signal.tp))
                } else {
                    None
                }
            }
            Direction::Short => {
                if price >= self.signal.sl {
                    Some((SignalState::Sl, self.signal.sl))
                } else if price <= self.signal.tp {
                    Some((SignalState::Tp, self.signal.tp))
                } else {
                    None
                }
            }
        }
    }

    /// Bar-path hit test: both touches evaluated from the bar's range; if
    /// both are touched, SL wins (pessimistic rule).
    fn bar_outcome(&self, bar: &Bar) -> Option<SignalState> {
        let (tp_touched, sl_touched) = match self.signal.direction {
            Direction::Long => (bar.high >= self.signal.tp, bar.low <= self.signal.sl),
            Direction::Short => (bar.low <= self.signal.tp, bar.high >= self.signal.sl),
        };
        match (tp_touched, sl_touched) {
            (_, true) => Some(SignalState::Sl),
            (true, false) => Some(SignalState::Tp),
            (false, false) => None,
        }
    }
}

pub struct OutcomeTracker {
    active: RwLock<HashMap<String, ActiveEntry>>,
    signal_store: Arc<dyn SignalStore>,
    streaks: Arc<StreakTracker>,
    generator: Arc<SignalGenerator>,
    observer_bus: Arc<dyn ObserverBus>,
}

impl OutcomeTracker {
    pub fn new(
        signal_store: Arc<dyn SignalStore>,
        streaks: Arc<StreakTracker>,
        generator: Arc<SignalGenerator>,
        observer_bus: Arc<dyn ObserverBus>,
    ) -> Self {
        Self { active: RwLock::new(HashMap::new()), signal_store, streaks, generator, observer_bus }
    }

    /// Register a newly emitted ACTIVE signal for tracking.
    pub fn track(&self, signal: Signal) {
        self.active.write().insert(signal.id.clone(), ActiveEntry::new(signal));
    }

    /// Reload ACTIVE signals persisted from a prior run (ingestion RESTORE).
    pub fn restore(&self, signals: Vec<Signal>) {
        let mut active = self.active.write();
        for signal in signals {
            active.insert(signal.id.clone(), ActiveEntry::new(signal));
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    /// Tick path: evaluate every ACTIVE signal on `instrument` against one
    /// trade print. Throttles MAE/MFE publication to at most 1 Hz/signal.
    pub async fn on_trade(&self, instrument: &Instrument, trade: &Trade) -> EngineResult<()> {
        let candidates: Vec<String> = {
            let active = self.active.read();
            active.values().filter(|e| &e.signal.instrument == instrument).map(|e| e.signal.id.clone()).collect()
        };

        for id in candidates {
            let outcome = {
                let mut active = self.active.write();
                let Some(entry) = active.get_mut(&id) else { continue };
                entry.update_excursion(trade.price);
                let hit = entry.tick_outcome(trade.price);
                if hit.is_none() {
                    let should_publish = entry.last_published.map_or(true, |t| t.elapsed() >= MAE_MFE_PUBLISH_INTERVAL);
                    if should_publish {
                        entry.last_published = Some(Instant::now());
                        Some((None, entry.mae_ratio(), entry.mfe_ratio()))
                    } else {
                        None
                    }
                } else {
                    Some((hit, entry.mae_ratio(), entry.mfe_ratio()))
                }
            };

            match outcome {
                Some((Some((state, close_price)), mae, mfe)) => {
                    self.finalize(&id, state, trade.timestamp_ms, close_price, mae, mfe).await?;
                }
                Some((None, mae, mfe)) => {
                    self.signal_store.update_mae_mfe(&id, mae, mfe).await.map_err(|source| {
                        EngineError::PortFailure { port: "signal_store::update_mae_mfe", transient: true, source }
                    })?;
                    self.observer_bus.publish(ObserverEvent::SignalMaeUpdated { id: id.clone(), mae_ratio: mae, mfe_ratio: mfe })?;
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Bar path: pessimistic TP/SL resolution from a closed bar's range,
    /// used during replay and backtesting when no tick stream is present.
    pub async fn on_bar(&self, instrument: &Instrument, bar: &Bar) -> EngineResult<()> {
        let candidates: Vec<String> = {
            let active = self.active.read();
            active.values().filter(|e| &e.signal.instrument == instrument).map(|e| e.signal.id.clone()).collect()
        };

        for id in candidates {
            let outcome = {
                let mut active = self.active.write();
                let Some(entry) = active.get_mut(&id) else { continue };
                entry.update_excursion(bar.close);
                entry.bar_outcome(bar).map(|state| {
                    let close_price = match state {
                        SignalState::Tp => entry.signal.tp,
                        _ => entry.signal.sl,
                    };
                    (state, close_price, entry.mae_ratio(), entry.mfe_ratio())
                })
            };
            if let Some((state, close_price, mae, mfe)) = outcome {
                self.finalize(&id, state, bar.open_time, close_price, mae, mfe).await?;
            }
        }
        Ok(())
    }

    async fn finalize(&self, id: &str, state: SignalState, close_time: i64, close_price: f64, mae: f64, mfe: f64) -> EngineResult<()> {
        let Some(entry) = self.active.write().remove(id) else { return Ok(()) };
        let key = entry.key();

        self.signal_store.update_state(id, state, close_time, close_price).await.map_err(|source| {
            EngineError::PortFailure { port: "signal_store::update_state", transient: true, source }
        })?;
        self.signal_store.update_mae_mfe(id, mae, mfe).await.map_err(|source| {
            EngineError::PortFailure { port: "signal_store::update_mae_mfe", transient: true, source }
        })?;

        self.streaks.apply_outcome(&key, state);
        self.generator.release_lock(&key);
        self.observer_bus.publish(ObserverEvent::SignalClosed { id: id.to_string(), state, close_time, close_price })?;

        debug!(%key, id, state = %state, close_price, "signal closed");
        info!(%key, id, state = %state, close_price, "position outcome resolved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::memory::{BroadcastObserverBus, InMemorySignalStore};
    use crate::signal_generator::SignalGenerator;
    use crate::config::{AtrTrackerConfig, StrategyConfig};
    use crate::atr_tracker::AtrTracker;
    use crate::types::Timeframe;

    fn long_signal() -> Signal {
        Signal {
            id: "sig-1".into(), instrument: "BTCUSDT".into(), timeframe: Timeframe::FiveMin,
            time: 0, direction: Direction::Long, entry: 100.0, tp: 102.0, sl: 91.16,
            atr_at_signal: 1.0, streak_at_signal: 0, state: SignalState::Active,
            mae_ratio: 0.0, mfe_ratio: 0.0, close_time: None, close_price: None,
        }
    }

    fn tracker() -> OutcomeTracker {
        tracker_with_store().0
    }

    fn tracker_with_store() -> (OutcomeTracker, Arc<InMemorySignalStore>) {
        let generator = Arc::new(SignalGenerator::new(
            StrategyConfig::default(), None,
            Arc::new(AtrTracker::new(&AtrTrackerConfig { max_history: 100, min_samples: 0 })),
            Arc::new(StreakTracker::new()),
            Arc::new(InMemorySignalStore::new()),
            BroadcastObserverBus::new(16),
        ));
        let signal_store = Arc::new(InMemorySignalStore::new());
        let tracker = OutcomeTracker::new(signal_store.clone(), Arc::new(StreakTracker::new()), generator, BroadcastObserverBus::new(16));
        (tracker, signal_store)
    }

    #[tokio::test]
    async fn bar_path_resolves_both_touches_as_sl() {
        let tracker = tracker();
        tracker.track(long_signal());
        let bar = Bar { open_time: 0, open: 100.0, high: 103.0, low: 91.0, close: 95.0, volume: 1.0, closed: true };
        tracker.on_bar(&"BTCUSDT".to_string(), &bar).await.unwrap();
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn tick_path_checks_sl_before_tp() {
        let tracker = tracker();
        tracker.track(long_signal());
        // A single trade exactly at SL closes the signal even if a later
        // trade in the same batch would have hit TP.
        tracker.on_trade(&"BTCUSDT".to_string(), &Trade { timestamp_ms: 0, price: 91.0, quantity: 1.0 }).await.unwrap();
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn tp_hit_without_sl_touch() {
        let tracker = tracker();
        tracker.track(long_signal());
        tracker.on_trade(&"BTCUSDT".to_string(), &Trade { timestamp_ms: 0, price: 103.0, quantity: 1.0 }).await.unwrap();
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn non_matching_instrument_is_untouched() {
        let tracker = tracker();
        tracker.track(long_signal());
        tracker.on_trade(&"ETHUSDT".to_string(), &Trade { timestamp_ms: 0, price: 1.0, quantity: 1.0 }).await.unwrap();
        assert_eq!(tracker.active_count(), 1);
    }

    #[tokio::test]
    async fn finalize_persists_final_mae_and_mfe() {
        let (tracker, store) = tracker_with_store();
        let signal = long_signal();
        let id = signal.id.clone();
        tracker.track(signal);
        // Runs up favorably to 101 (MFE) before reversing down through SL.
        tracker.on_trade(&"BTCUSDT".to_string(), &Trade { timestamp_ms: 0, price: 101.0, quantity: 1.0 }).await.unwrap();
        tracker.on_trade(&"BTCUSDT".to_string(), &Trade { timestamp_ms: 1, price: 91.0, quantity: 1.0 }).await.unwrap();

        let closed = store.get(&id).unwrap();
        assert_eq!(closed.state, SignalState::Sl);
        assert!(closed.mae_ratio > 0.0);
        assert!(closed.mfe_ratio > 0.0);
    }
}
