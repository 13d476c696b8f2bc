// =============================================================================
// ATR percentile tracker
// =============================================================================
//
// Tracks the empirical distribution of ATR readings per series in a bounded
// ring buffer (oldest dropped first past `max_history`), and reports where a
// new ATR value falls as an empirical CDF percentile in `[0, 100]`.
//
// Grounded in `market_data::candle_buffer::CandleBuffer`'s ring-trim shape
// (`VecDeque` + `pop_front` once over capacity), generalised from storing
// candles to storing scalar ATR samples.
//
// Below `min_samples` (default 200, spec.md §4.C) the tracker has not seen
// enough history to trust a percentile read and reports `None` rather than a
// noisy estimate.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

use crate::config::AtrTrackerConfig;
use crate::types::SeriesKey;

struct Ring {
    samples: VecDeque<f64>,
    max_history: usize,
}

impl Ring {
    fn new(max_history: usize) -> Self {
        Self { samples: VecDeque::with_capacity(max_history.min(4096)), max_history }
    }

    fn push(&mut self, value: f64) {
        self.samples.push_back(value);
        while self.samples.len() > self.max_history {
            self.samples.pop_front();
        }
    }

    /// Empirical CDF percentile of `value` against the current samples:
    /// the fraction of stored samples at or below `value`, as `[0, 100]`.
    fn percentile_of(&self, value: f64) -> f64 {
        let below_or_equal = self.samples.iter().filter(|&&s| s <= value).count();
        100.0 * below_or_equal as f64 / self.samples.len() as f64
    }
}

/// Bounded per-series ATR history with percentile lookup.
pub struct AtrTracker {
    min_samples: usize,
    max_history: usize,
    rings: RwLock<HashMap<SeriesKey, Ring>>,
}

impl AtrTracker {
    pub fn new(config: &AtrTrackerConfig) -> Self {
        Self { min_samples: config.min_samples, max_history: config.max_history, rings: RwLock::new(HashMap::new()) }
    }

    /// Record a new ATR reading and return its percentile against the
    /// series' history so far, including the just-recorded sample. `None`
    /// while fewer than `min_samples` readings have been recorded.
    pub fn record(&self, key: &SeriesKey, atr: f64) -> Option<f64> {
        if !atr.is_finite() || atr <= 0.0 {
            return None;
        }
        let mut rings = self.rings.write();
        let ring = rings.entry(key.clone()).or_insert_with(|| Ring::new(self.max_history));
        ring.push(atr);
        if ring.samples.len() < self.min_samples {
            return None;
        }
        Some(ring.percentile_of(atr))
    }

    /// Bulk-ingest historical ATR readings without computing a percentile
    /// for each — used by the ingestion pipeline's BACKFILL phase to warm
    /// the tracker before LIVE readings start arriving (spec.md §4.G).
    pub fn warm_start(&self, key: &SeriesKey, history: impl IntoIterator<Item = f64>) {
        let mut rings = self.rings.write();
        let ring = rings.entry(key.clone()).or_insert_with(|| Ring::new(self.max_history));
        for atr in history {
            if atr.is_finite() && atr > 0.0 {
                ring.push(atr);
            }
        }
    }

    pub fn sample_count(&self, key: &SeriesKey) -> usize {
        self.rings.read().get(key).map_or(0, |r| r.samples.len())
    }
}
