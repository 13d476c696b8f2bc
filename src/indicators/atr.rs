// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is the smoothed average of TR using Wilder's recursion:
//   ATR_0 = SMA of first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// Default period: 9 (spec.md §4.A).
// =============================================================================

use crate::types::Bar;

/// Compute the most recent ATR value from a slice of closed bars (oldest
/// first) using Wilder's smoothing.
///
/// Returns `None` when `period == 0`, there are fewer than `period + 1`
/// bars, or any intermediate value is non-finite.
pub fn calculate_atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let mut tr_values: Vec<f64> = Vec::with_capacity(bars.len() - 1);
    for i in 1..bars.len() {
        let high = bars[i].high;
        let low = bars[i].low;
        let prev_close = bars[i - 1].close;

        let hl = high - low;
        let hc = (high - prev_close).abs();
        let lc = (low - prev_close).abs();

        tr_values.push(hl.max(hc).max(lc));
    }

    if tr_values.len() < period {
        return None;
    }

    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return None;
    }

    let period_f = period as f64;
    let mut atr = seed;
    for &tr in &tr_values[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            return None;
        }
    }

    Some(atr)
}

/// Single-step Wilder update given the previous ATR, allowing the indicator
/// snapshot to be maintained incrementally rather than recomputed from the
/// full bar history on every close.
pub fn step_atr(prev_atr: f64, prev_close: f64, bar: &Bar, period: usize) -> Option<f64> {
    if period == 0 || !prev_atr.is_finite() {
        return None;
    }
    let hl = bar.high - bar.low;
    let hc = (bar.high - prev_close).abs();
    let lc = (bar.low - prev_close).abs();
    let tr = hl.max(hc).max(lc);
    let period_f = period as f64;
    let next = (prev_atr * (period_f - 1.0) + tr) / period_f;
    next.is_finite().then_some(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open_time: i64, high: f64, low: f64, close: f64) -> Bar {
        Bar { open_time, open: close, high, low, close, volume: 100.0, closed: true }
    }

    #[test]
    fn atr_period_zero() {
        let bars = vec![bar(0, 105.0, 95.0, 102.0); 20];
        assert!(calculate_atr(&bars, 0).is_none());
    }

    #[test]
    fn atr_insufficient_data() {
        let bars = vec![bar(0, 105.0, 95.0, 102.0); 5];
        assert!(calculate_atr(&bars, 9).is_none());
    }

    #[test]
    fn atr_exact_minimum_data() {
        let bars = vec![
            bar(0, 102.0, 98.0, 101.0),
            bar(1, 104.0, 99.0, 103.0),
            bar(2, 106.0, 100.0, 105.0),
            bar(3, 108.0, 102.0, 107.0),
        ];
        let atr = calculate_atr(&bars, 3);
        assert!(atr.is_some());
        assert!(atr.unwrap() > 0.0);
    }

    #[test]
    fn atr_constant_range_converges() {
        let mut bars = Vec::new();
        for i in 0..30 {
            let base = 100.0 + i as f64 * 0.1;
            bars.push(bar(i, base + 5.0, base - 5.0, base));
        }
        let atr = calculate_atr(&bars, 9).unwrap();
        assert!((atr - 10.0).abs() < 1.0, "expected ATR near 10.0, got {atr}");
    }

    #[test]
    fn atr_true_range_uses_prev_close_gap() {
        let bars = vec![
            bar(0, 105.0, 95.0, 95.0),
            bar(1, 115.0, 108.0, 112.0),
            bar(2, 118.0, 110.0, 115.0),
            bar(3, 120.0, 113.0, 118.0),
        ];
        let atr = calculate_atr(&bars, 3).unwrap();
        assert!(atr > 7.0, "ATR should reflect the gap, got {atr}");
    }

    #[test]
    fn atr_nan_returns_none() {
        let bars = vec![
            bar(0, 105.0, 95.0, 100.0),
            bar(1, f64::NAN, 95.0, 100.0),
            bar(2, 105.0, 95.0, 100.0),
            bar(3, 105.0, 95.0, 100.0),
        ];
        assert!(calculate_atr(&bars, 3).is_none());
    }

    #[test]
    fn step_atr_matches_batch_recursion() {
        let bars: Vec<Bar> = (0..20)
            .map(|i| bar(i, 100.0 + i as f64, 90.0 + i as f64, 95.0 + i as f64))
            .collect();
        let batch = calculate_atr(&bars, 9).unwrap();

        let seed_bars = &bars[..10];
        let mut atr = calculate_atr(seed_bars, 9).unwrap();
        let mut prev_close = seed_bars.last().unwrap().close;
        for b in &bars[10..] {
            atr = step_atr(atr, prev_close, b, 9).unwrap();
            prev_close = b.close;
        }
        assert!((atr - batch).abs() < 1e-9);
    }
}
