// =============================================================================
// Technical indicators
// =============================================================================
//
// Pure, side-effect-free building blocks (`ema`, `atr`, `fib`, `vwap`) plus
// `IndicatorState`, which folds closed bars into a running
// `IndicatorSnapshot` one bar at a time — the stateful counterpart the
// signal generator and aggregator actually drive, grounded in the same
// incremental-update shape as `market_data::candle_buffer::CandleBuffer`.

pub mod atr;
pub mod ema;
pub mod fib;
pub mod vwap;

use std::collections::VecDeque;

use crate::config::StrategyConfig;
use crate::types::{Bar, IndicatorSnapshot};
use vwap::SessionVwap;

/// Incremental indicator computation for a single (instrument, timeframe)
/// series. One instance per series, owned by the aggregator.
pub struct IndicatorState {
    ema_period: usize,
    atr_period: usize,
    fib_window: usize,

    ema_seed: Vec<f64>,
    ema_prev: Option<f64>,

    atr_seed: Vec<Bar>,
    atr_prev: Option<f64>,
    atr_prev_close: Option<f64>,

    fib_window_buf: VecDeque<Bar>,
    vwap: SessionVwap,
}

impl IndicatorState {
    pub fn new(config: &StrategyConfig) -> Self {
        Self {
            ema_period: config.ema_period,
            atr_period: config.atr_period,
            fib_window: config.fib_window,
            ema_seed: Vec::with_capacity(config.ema_period),
            ema_prev: None,
            atr_seed: Vec::with_capacity(config.atr_period + 1),
            atr_prev: None,
            atr_prev_close: None,
            fib_window_buf: VecDeque::with_capacity(config.fib_window),
            vwap: SessionVwap::new(),
        }
    }

    /// Fold one newly closed bar into the running state. Returns a
    /// snapshot once every indicator has enough history to produce a
    /// value; `None` during warm-up.
    pub fn on_closed_bar(&mut self, bar: &Bar) -> Option<IndicatorSnapshot> {
        self.vwap.update(bar);
        self.step_ema(bar.close);
        self.step_atr(bar);
        self.push_fib_window(*bar);

        let ema50 = self.ema_prev?;
        let atr9 = self.atr_prev?;
        let fib = fib::rolling_fib_levels(
            &self.fib_window_buf.iter().copied().collect::<Vec<_>>(),
            self.fib_window,
        )?;
        let vwap = self.vwap.value()?;

        Some(IndicatorSnapshot {
            ema50,
            atr9,
            fib_382: fib.fib_382,
            fib_500: fib.fib_500,
            fib_618: fib.fib_618,
            vwap,
        })
    }

    fn step_ema(&mut self, close: f64) {
        if let Some(prev) = self.ema_prev {
            let multiplier = 2.0 / (self.ema_period + 1) as f64;
            let next = close * multiplier + prev * (1.0 - multiplier);
            if next.is_finite() {
                self.ema_prev = Some(next);
            }
            return;
        }
        self.ema_seed.push(close);
        if self.ema_seed.len() == self.ema_period {
            let seed = ema::latest_ema(&self.ema_seed, self.ema_period);
            self.ema_prev = seed;
        }
    }

    fn step_atr(&mut self, bar: &Bar) {
        if let (Some(prev_atr), Some(prev_close)) = (self.atr_prev, self.atr_prev_close) {
            if let Some(next) = atr::step_atr(prev_atr, prev_close, bar, self.atr_period) {
                self.atr_prev = Some(next);
            }
            self.atr_prev_close = Some(bar.close);
            return;
        }
        self.atr_seed.push(*bar);
        if self.atr_seed.len() == self.atr_period + 1 {
            self.atr_prev = atr::calculate_atr(&self.atr_seed, self.atr_period);
        }
        self.atr_prev_close = Some(bar.close);
    }

    fn push_fib_window(&mut self, bar: Bar) {
        self.fib_window_buf.push_back(bar);
        while self.fib_window_buf.len() > self.fib_window {
            self.fib_window_buf.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(i: i64, price: f64) -> Bar {
        Bar { open_time: i * 60_000, open: price, high: price + 1.0, low: price - 1.0, close: price, volume: 10.0, closed: true }
    }

    #[test]
    fn warms_up_then_produces_snapshots() {
        let config = StrategyConfig { ema_period: 5, atr_period: 3, fib_window: 4, ..StrategyConfig::default() };
        let mut state = IndicatorState::new(&config);

        let mut produced = 0;
        for i in 0..20 {
            let snap = state.on_closed_bar(&bar(i, 100.0 + i as f64));
            if snap.is_some() {
                produced += 1;
            }
        }
        assert!(produced > 0);
    }

    #[test]
    fn incremental_ema_matches_batch_after_warmup() {
        let config = StrategyConfig { ema_period: 5, atr_period: 3, fib_window: 4, ..StrategyConfig::default() };
        let mut state = IndicatorState::new(&config);
        let closes: Vec<f64> = (0..15).map(|i| 100.0 + i as f64).collect();
        let mut last_snap = None;
        for (i, &c) in closes.iter().enumerate() {
            last_snap = state.on_closed_bar(&bar(i as i64, c)).or(last_snap);
        }
        let batch = ema::latest_ema(&closes, 5).unwrap();
        assert!((last_snap.unwrap().ema50 - batch).abs() < 1e-6);
    }
}
