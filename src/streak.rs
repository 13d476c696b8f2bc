// =============================================================================
// Streak tracker — consecutive TP/SL counter per series
// =============================================================================
//
// Grounded in `signals::signal_decay::SignalDecayManager`'s
// `RwLock<HashMap<key, entry>>` shape, generalised from a decaying strength
// entry to a persistable signed streak counter.
//
// Positive streak = consecutive TPs, negative = consecutive SLs, 0 = no
// closed signals yet for this series. A TP resets a negative streak to +1
// and vice versa (spec.md §3 StreakState).
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::{SeriesKey, SignalState, StreakState};

pub struct StreakTracker {
    streaks: RwLock<HashMap<SeriesKey, StreakState>>,
}

impl StreakTracker {
    pub fn new() -> Self {
        Self { streaks: RwLock::new(HashMap::new()) }
    }

    /// Restore a persisted streak state, e.g. during ingestion RESTORE
    /// (spec.md §4.G). Overwrites any in-memory state for the key.
    pub fn restore(&self, key: &SeriesKey, state: StreakState) {
        self.streaks.write().insert(key.clone(), state);
    }

    pub fn current(&self, key: &SeriesKey) -> StreakState {
        self.streaks.read().get(key).copied().unwrap_or_default()
    }

    /// Apply a closed signal's outcome to the series' streak. `Active` is
    /// not a terminal outcome and must never be passed here.
    pub fn apply_outcome(&self, key: &SeriesKey, outcome: SignalState) -> StreakState {
        debug_assert!(outcome != SignalState::Active, "streak only updates on terminal outcomes");
        let mut map = self.streaks.write();
        let entry = map.entry(key.clone()).or_default();
        match outcome {
            SignalState::Tp => {
                entry.wins += 1;
                entry.streak = if entry.streak >= 0 { entry.streak + 1 } else { 1 };
            }
            SignalState::Sl => {
                entry.losses += 1;
                entry.streak = if entry.streak <= 0 { entry.streak - 1 } else { -1 };
            }
            SignalState::Active => {}
        }
        *entry
    }
}

impl Default for StreakTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;

    fn key() -> SeriesKey {
        SeriesKey::new("BTCUSDT", Timeframe::FiveMin)
    }

    #[test]
    fn fresh_series_starts_at_zero() {
        let tracker = StreakTracker::new();
        let state = tracker.current(&key());
        assert_eq!(state.streak, 0);
        assert_eq!(state.wins, 0);
        assert_eq!(state.losses, 0);
    }

    #[test]
    fn consecutive_tps_increment_positive_streak() {
        let tracker = StreakTracker::new();
        tracker.apply_outcome(&key(), SignalState::Tp);
        tracker.apply_outcome(&key(), SignalState::Tp);
        let state = tracker.apply_outcome(&key(), SignalState::Tp);
        assert_eq!(state.streak, 3);
        assert_eq!(state.wins, 3);
    }

    #[test]
    fn consecutive_sls_decrement_negative_streak() {
        let tracker = StreakTracker::new();
        tracker.apply_outcome(&key(), SignalState::Sl);
        let state = tracker.apply_outcome(&key(), SignalState::Sl);
        assert_eq!(state.streak, -2);
        assert_eq!(state.losses, 2);
    }

    #[test]
    fn streak_flips_sign_on_opposite_outcome() {
        let tracker = StreakTracker::new();
        tracker.apply_outcome(&key(), SignalState::Sl);
        tracker.apply_outcome(&key(), SignalState::Sl);
        let state = tracker.apply_outcome(&key(), SignalState::Tp);
        assert_eq!(state.streak, 1);
        assert_eq!(state.wins, 1);
        assert_eq!(state.losses, 2);
    }

    #[test]
    fn restore_overwrites_in_memory_state() {
        let tracker = StreakTracker::new();
        tracker.apply_outcome(&key(), SignalState::Tp);
        tracker.restore(&key(), StreakState { streak: -7, wins: 1, losses: 8 });
        assert_eq!(tracker.current(&key()).streak, -7);
    }
}
