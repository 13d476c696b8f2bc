// =============================================================================
// Bar aggregator — derives 3m/5m/15m/30m bars from the 1-minute feed
// =============================================================================
//
// Grounded in `market_data::candle_buffer::CandleBuffer::update`: an
// in-progress bar is replaced in place on every tick, and a closed bar is
// appended and the ring trimmed. Here the "ring" is a single in-progress
// aggregate per (instrument, timeframe); the 1-minute bars themselves are
// held by the caller's `BarStore` port, not duplicated here.
//
// Slot boundary: `floor(bar.open_time / period_ms) * period_ms`. A 1-minute
// bar belongs to the derived slot it falls within; the slot closes once a
// 1-minute bar with `open_time >= slot_start + period_ms` arrives.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::trace;

use crate::types::{Bar, Instrument, SeriesKey, Timeframe};

#[derive(Debug, Clone, Copy)]
struct InProgress {
    slot_start: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl InProgress {
    fn start(slot_start: i64, bar: &Bar) -> Self {
        Self { slot_start, open: bar.open, high: bar.high, low: bar.low, close: bar.close, volume: bar.volume }
    }

    fn fold(&mut self, bar: &Bar) {
        self.high = self.high.max(bar.high);
        self.low = self.low.min(bar.low);
        self.close = bar.close;
        self.volume += bar.volume;
    }

    fn into_bar(self, period_ms: i64) -> Bar {
        let _ = period_ms;
        Bar { open_time: self.slot_start, open: self.open, high: self.high, low: self.low, close: self.close, volume: self.volume, closed: true }
    }
}

fn slot_start(open_time: i64, period_ms: i64) -> i64 {
    open_time - open_time.rem_euclid(period_ms)
}

/// Aggregates 1-minute bars into every derived timeframe for a fixed set of
/// instruments. One instance is shared (via `Arc`) across ingestion and the
/// signal pipeline.
pub struct BarAggregator {
    in_progress: RwLock<HashMap<SeriesKey, InProgress>>,
}

impl BarAggregator {
    pub fn new() -> Self {
        Self { in_progress: RwLock::new(HashMap::new()) }
    }

    /// Feed one closed 1-minute bar. Returns the closed derived bars (if
    /// any) produced across every derived timeframe — zero, one, or more,
    /// since a 1m bar can close several higher-timeframe slots only when a
    /// gap in the feed skips a boundary (handled by immediately closing the
    /// stale in-progress aggregate rather than silently dropping it).
    pub fn ingest_one_minute(&self, instrument: &Instrument, bar: &Bar) -> Vec<(Timeframe, Bar)> {
        if !bar.closed {
            return Vec::new();
        }
        let mut closed = Vec::new();
        let mut map = self.in_progress.write();

        for timeframe in Timeframe::derived() {
            let period_ms = timeframe.period_ms();
            let key = SeriesKey::new(instrument.clone(), timeframe);
            let this_slot = slot_start(bar.open_time, period_ms);

            match map.get_mut(&key) {
                Some(agg) if agg.slot_start == this_slot => {
                    agg.fold(bar);
                }
                Some(agg) => {
                    let finished = *agg;
                    closed.push((timeframe, finished.into_bar(period_ms)));
                    trace!(%key, "derived bar closed");
                    map.insert(key, InProgress::start(this_slot, bar));
                }
                None => {
                    map.insert(key, InProgress::start(this_slot, bar));
                }
            }
        }

        closed
    }

    /// Current in-progress aggregate for a series, if one exists yet.
    pub fn peek(&self, key: &SeriesKey) -> Option<Bar> {
        let map = self.in_progress.read();
        map.get(key).map(|agg| {
            let mut b = agg.into_bar(key.timeframe.period_ms());
            b.closed = false;
            b
        })
    }
}

impl Default for BarAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_min(open_time: i64, price: f64) -> Bar {
        Bar { open_time, open: price, high: price + 0.5, low: price - 0.5, close: price, volume: 1.0, closed: true }
    }

    #[test]
    fn slot_start_floors_to_period() {
        assert_eq!(slot_start(125_000, 300_000), 0);
        assert_eq!(slot_start(305_000, 300_000), 300_000);
    }

    #[test]
    fn five_minute_bar_closes_after_five_ticks() {
        let agg = BarAggregator::new();
        let instrument = "BTCUSDT".to_string();
        let mut all_closed = Vec::new();
        for i in 0..5 {
            let closed = agg.ingest_one_minute(&instrument, &one_min(i * 60_000, 100.0 + i as f64));
            all_closed.extend(closed);
        }
        // Five 1m bars span exactly one 5m slot; it only closes once the
        // sixth 1m bar starts a new slot.
        assert!(all_closed.is_empty());

        let closed = agg.ingest_one_minute(&instrument, &one_min(5 * 60_000, 105.0));
        let five_min = closed.iter().find(|(tf, _)| *tf == Timeframe::FiveMin).unwrap();
        assert_eq!(five_min.1.open_time, 0);
        assert!((five_min.1.open - 100.0).abs() < 1e-9);
        assert!((five_min.1.high - 104.5).abs() < 1e-9);
        assert!((five_min.1.volume - 5.0).abs() < 1e-9);
    }

    #[test]
    fn unclosed_bar_is_ignored() {
        let agg = BarAggregator::new();
        let mut bar = one_min(0, 100.0);
        bar.closed = false;
        assert!(agg.ingest_one_minute(&"ETHUSDT".to_string(), &bar).is_empty());
    }

    #[test]
    fn peek_returns_unclosed_flag() {
        let agg = BarAggregator::new();
        let instrument = "BTCUSDT".to_string();
        agg.ingest_one_minute(&instrument, &one_min(0, 100.0));
        let key = SeriesKey::new(instrument, Timeframe::FiveMin);
        let partial = agg.peek(&key).unwrap();
        assert!(!partial.closed);
    }
}
