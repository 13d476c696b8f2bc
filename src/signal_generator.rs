// =============================================================================
// Signal generator (spec.md §4.E)
// =============================================================================
//
// Per-bar retest detection, TP/SL pricing, filter gate, and position lock.
// Pipeline shape grounded in `strategy::StrategyEngine::evaluate_symbol` —
// numbered steps, early-return on each gate, an `info!` at the end carrying
// every priced field. The scoring/regime/insurance machinery there has no
// counterpart here; this generator has exactly one trigger (the retest) and
// exactly one gate (the filter whitelist).
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, trace, warn};

use crate::atr_tracker::AtrTracker;
use crate::config::{filter_key, FilterConfig, StrategyConfig};
use crate::errors::{EngineError, EngineResult};
use crate::indicators::IndicatorState;
use crate::ports::{ObserverBus, SignalStore};
use crate::streak::StreakTracker;
use crate::types::{Bar, Direction, IndicatorSnapshot, ObserverEvent, SeriesKey, Signal, SignalState};

struct LevelClassification {
    support_score: f64,
    resistance_score: f64,
    nearest_support: Option<f64>,
    nearest_resistance: Option<f64>,
}

fn proximity_score(price: f64, level: f64) -> f64 {
    1.0 / (1.0 + (price - level).abs() / price * 100.0)
}

/// Classify the four tracked levels against `close` (spec.md §4.E step 4).
/// A level is a support iff `close > level`, strictly — equality falls to
/// resistance, same as the literal comparison operator in the step.
fn classify_levels(close: f64, snapshot: &IndicatorSnapshot) -> LevelClassification {
    let levels = [snapshot.fib_382, snapshot.fib_500, snapshot.fib_618, snapshot.vwap];

    let mut support_score = 0.0;
    let mut resistance_score = 0.0;
    let mut nearest_support: Option<f64> = None;
    let mut nearest_resistance: Option<f64> = None;

    for level in levels {
        let score = proximity_score(close, level);
        if close > level {
            support_score += score;
            nearest_support = Some(match nearest_support {
                Some(cur) if (close - cur).abs() <= (close - level).abs() => cur,
                _ => level,
            });
        } else {
            resistance_score += score;
            nearest_resistance = Some(match nearest_resistance {
                Some(cur) if (close - cur).abs() <= (close - level).abs() => cur,
                _ => level,
            });
        }
    }

    LevelClassification { support_score, resistance_score, nearest_support, nearest_resistance }
}

pub struct SignalGenerator {
    strategy: StrategyConfig,
    whitelist: Option<HashMap<String, FilterConfig>>,
    indicators: RwLock<HashMap<SeriesKey, IndicatorState>>,
    prev_bar: RwLock<HashMap<SeriesKey, Bar>>,
    locks: RwLock<HashSet<SeriesKey>>,
    atr_tracker: Arc<AtrTracker>,
    streaks: Arc<StreakTracker>,
    signal_store: Arc<dyn SignalStore>,
    observer_bus: Arc<dyn ObserverBus>,
}

impl SignalGenerator {
    pub fn new(
        strategy: StrategyConfig,
        whitelist: Option<HashMap<String, FilterConfig>>,
        atr_tracker: Arc<AtrTracker>,
        streaks: Arc<StreakTracker>,
        signal_store: Arc<dyn SignalStore>,
        observer_bus: Arc<dyn ObserverBus>,
    ) -> Self {
        Self {
            strategy,
            whitelist,
            indicators: RwLock::new(HashMap::new()),
            prev_bar: RwLock::new(HashMap::new()),
            locks: RwLock::new(HashSet::new()),
            atr_tracker,
            streaks,
            signal_store,
            observer_bus,
        }
    }

    pub fn is_locked(&self, key: &SeriesKey) -> bool {
        self.locks.read().contains(key)
    }

    /// Called by the outcome tracker (F) when an ACTIVE signal closes.
    pub fn release_lock(&self, key: &SeriesKey) {
        self.locks.write().remove(key);
    }

    /// Restore a lock without going through emission — used during RESTORE
    /// when persisted active signals are loaded back into memory.
    pub fn restore_lock(&self, key: &SeriesKey) {
        self.locks.write().insert(key.clone());
    }

    /// Prime the indicator state and ATR tracker from history without
    /// checking locks, classifying levels, or publishing anything — the
    /// ingestion pipeline's RESTORE phase (spec.md §4.G).
    pub fn warm_up(&self, key: &SeriesKey, bar: &Bar) {
        let snapshot = {
            let mut indicators = self.indicators.write();
            let state = indicators.entry(key.clone()).or_insert_with(|| IndicatorState::new(&self.strategy));
            state.on_closed_bar(bar)
        };
        if let Some(snapshot) = snapshot {
            self.atr_tracker.record(key, snapshot.atr9);
        }
        self.remember_bar(key, bar);
    }

    pub async fn on_closed_bar(&self, key: &SeriesKey, bar: &Bar) -> EngineResult<Option<Signal>> {
        // Step 1: indicator snapshot.
        let snapshot = {
            let mut indicators = self.indicators.write();
            let state = indicators.entry(key.clone()).or_insert_with(|| IndicatorState::new(&self.strategy));
            state.on_closed_bar(bar)
        };
        let Some(snapshot) = snapshot else {
            self.remember_bar(key, bar);
            return Ok(None);
        };

        // Step 2: ATR tracker updates unconditionally with atr9.
        let percentile = self.atr_tracker.record(key, snapshot.atr9);

        let prev = { self.prev_bar.read().get(key).copied() };
        self.remember_bar(key, bar);

        // Step 3: position lock check.
        if self.is_locked(key) {
            return Ok(None);
        }

        let Some(prev) = prev else {
            return Ok(None);
        };

        let classification = classify_levels(bar.close, &snapshot);

        // Steps 5 & 6: candidate classification.
        let short_candidate = bar.close > snapshot.ema50
            && classification.nearest_support.is_some()
            && classification.support_score >= self.strategy.score_threshold
            && classification
                .nearest_support
                .is_some_and(|s| bar.low <= s || prev.low <= s)
            && bar.close > bar.open;

        let long_candidate = bar.close < snapshot.ema50
            && classification.nearest_resistance.is_some()
            && classification.resistance_score >= self.strategy.score_threshold
            && classification
                .nearest_resistance
                .is_some_and(|r| bar.high >= r || prev.high >= r)
            && bar.close < bar.open;

        // Step 7: these are mutually exclusive by construction (the ema50
        // comparison cannot be both `>` and `<`). Guard anyway and log.
        let direction = match (short_candidate, long_candidate) {
            (true, true) => {
                warn!(%key, "both SHORT and LONG candidates matched on one bar; discarding both");
                return Ok(None);
            }
            (true, false) => Direction::Short,
            (false, true) => Direction::Long,
            (false, false) => return Ok(None),
        };

        // Step 8: TP/SL pricing.
        let entry = bar.close;
        let atr = snapshot.atr9;
        let (tp, sl) = match direction {
            Direction::Long => (
                (entry + self.strategy.tp_atr_mult * atr).min(bar.high + atr),
                entry - self.strategy.sl_atr_mult * atr,
            ),
            Direction::Short => (
                (entry - self.strategy.tp_atr_mult * atr).max(bar.low - atr),
                entry + self.strategy.sl_atr_mult * atr,
            ),
        };

        // Step 9: stamp streak at signal.
        let streak_at_signal = self.streaks.current(key).streak;

        // Step 10: filter gate.
        if !self.passes_filter(key, streak_at_signal, percentile) {
            trace!(%key, streak_at_signal, ?percentile, "candidate discarded by filter gate");
            return Ok(None);
        }

        let signal = Signal {
            id: Signal::derive_id(&key.instrument, key.timeframe, bar.open_time, direction),
            instrument: key.instrument.clone(),
            timeframe: key.timeframe,
            time: bar.open_time,
            direction,
            entry,
            tp,
            sl,
            atr_at_signal: atr,
            streak_at_signal,
            state: SignalState::Active,
            mae_ratio: 0.0,
            mfe_ratio: 0.0,
            close_time: None,
            close_price: None,
        };

        // Step 11: persist, then lock, then publish. Lock is not acquired
        // until persistence succeeds (spec.md §4.E failure semantics).
        self.signal_store.save(&signal).await.map_err(|source| EngineError::PortFailure {
            port: "signal_store::save",
            transient: true,
            source,
        })?;
        self.locks.write().insert(key.clone());
        self.observer_bus.publish(ObserverEvent::SignalEmitted(signal.clone()))?;

        info!(
            %key,
            direction = %direction,
            entry,
            tp,
            sl,
            atr,
            streak_at_signal,
            ?percentile,
            "signal emitted"
        );

        Ok(Some(signal))
    }

    fn remember_bar(&self, key: &SeriesKey, bar: &Bar) {
        self.prev_bar.write().insert(key.clone(), *bar);
    }

    fn passes_filter(&self, key: &SeriesKey, streak: i32, percentile: Option<f64>) -> bool {
        let Some(whitelist) = &self.whitelist else {
            return true;
        };
        let Some(entry) = whitelist.get(&filter_key(&key.instrument, key.timeframe)) else {
            return false;
        };
        if !entry.enabled || !entry.accepts_streak(streak) {
            return false;
        }
        match percentile {
            Some(p) => p > entry.atr_pct_threshold * 100.0,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AtrTrackerConfig;
    use crate::ports::memory::{BroadcastObserverBus, InMemorySignalStore};
    use crate::types::Timeframe;

    fn key() -> SeriesKey {
        SeriesKey::new("BTCUSDT", Timeframe::FiveMin)
    }

    fn generator(whitelist: Option<HashMap<String, FilterConfig>>) -> SignalGenerator {
        SignalGenerator::new(
            StrategyConfig::default(),
            whitelist,
            Arc::new(AtrTracker::new(&AtrTrackerConfig { max_history: 1000, min_samples: 0 })),
            Arc::new(StreakTracker::new()),
            Arc::new(InMemorySignalStore::new()),
            BroadcastObserverBus::new(16),
        )
    }

    fn bar(open_time: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar { open_time, open, high, low, close, volume: 10.0, closed: true }
    }

    #[test]
    fn level_classification_splits_support_and_resistance() {
        let snapshot = IndicatorSnapshot { ema50: 100.0, atr9: 1.0, fib_382: 101.0, fib_500: 99.0, fib_618: 98.0, vwap: 100.5 };
        let classification = classify_levels(100.2, &snapshot);
        // 100.2 > 99, 98 => supports; 100.2 <= 101, 100.5 => resistances.
        assert!(classification.support_score > 0.0);
        assert!(classification.resistance_score > 0.0);
    }

    #[tokio::test]
    async fn warms_up_without_emitting() {
        let generator = generator(None);
        let key = key();
        // First bar can never emit: there is no "prior closed bar" yet.
        for i in 0..60 {
            let result = generator.on_closed_bar(&key, &bar(i * 300_000, 100.0, 101.0, 99.0, 100.0)).await.unwrap();
            assert!(result.is_none());
        }
    }

    #[tokio::test]
    async fn locked_series_never_emits_again() {
        let generator = generator(None);
        let key = key();
        generator.restore_lock(&key);
        let result = generator.on_closed_bar(&key, &bar(0, 100.0, 101.0, 99.0, 100.0)).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn filter_gate_rejects_unlisted_key() {
        let whitelist = HashMap::new();
        let generator = generator(Some(whitelist));
        assert!(!generator.passes_filter(&key(), 0, Some(50.0)));
    }

    #[tokio::test]
    async fn filter_gate_accepts_when_no_whitelist_configured() {
        let generator = generator(None);
        assert!(generator.passes_filter(&key(), 999, None));
    }
}
