// =============================================================================
// Rolling Fibonacci retracement levels
// =============================================================================
//
// Over the most recent `window` closed bars, the highest high (`hh`) and
// lowest low (`ll`) anchor a retracement ladder:
//
//   level(f) = hh - (hh - ll) * f
//
// Default window: 9 bars (spec.md §4.A). Levels are recomputed fresh every
// bar close rather than maintained incrementally — the window is small and
// the swing anchors can change on either edge as the window slides.
// =============================================================================

use crate::types::Bar;

/// The three retracement ratios the engine tracks.
pub const RATIOS: [f64; 3] = [0.382, 0.5, 0.618];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FibLevels {
    pub fib_382: f64,
    pub fib_500: f64,
    pub fib_618: f64,
}

/// Compute the rolling Fibonacci levels over the last `window` bars.
///
/// Returns `None` when fewer than `window` bars are available or the swing
/// range collapses to zero (`hh == ll`, which would make every level equal
/// and the retest logic meaningless).
pub fn rolling_fib_levels(bars: &[Bar], window: usize) -> Option<FibLevels> {
    if window == 0 || bars.len() < window {
        return None;
    }
    let recent = &bars[bars.len() - window..];

    let hh = recent.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
    let ll = recent.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);

    if !hh.is_finite() || !ll.is_finite() || hh <= ll {
        return None;
    }

    let level = |f: f64| hh - (hh - ll) * f;
    Some(FibLevels { fib_382: level(RATIOS[0]), fib_500: level(RATIOS[1]), fib_618: level(RATIOS[2]) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(high: f64, low: f64) -> Bar {
        Bar { open_time: 0, open: (high + low) / 2.0, high, low, close: (high + low) / 2.0, volume: 1.0, closed: true }
    }

    #[test]
    fn insufficient_window_returns_none() {
        let bars = vec![bar(110.0, 90.0); 5];
        assert!(rolling_fib_levels(&bars, 9).is_none());
    }

    #[test]
    fn levels_ordered_between_swing() {
        let bars: Vec<Bar> = (0..9).map(|i| bar(100.0 + i as f64, 90.0 + i as f64 * 0.5)).collect();
        let levels = rolling_fib_levels(&bars, 9).unwrap();
        assert!(levels.fib_382 > levels.fib_500);
        assert!(levels.fib_500 > levels.fib_618);
    }

    #[test]
    fn flat_range_returns_none() {
        let bars = vec![bar(100.0, 100.0); 9];
        assert!(rolling_fib_levels(&bars, 9).is_none());
    }

    #[test]
    fn window_slides_with_new_extreme() {
        let mut bars: Vec<Bar> = (0..9).map(|_| bar(105.0, 95.0)).collect();
        let before = rolling_fib_levels(&bars, 9).unwrap();
        bars.remove(0);
        bars.push(bar(120.0, 95.0));
        let after = rolling_fib_levels(&bars, 9).unwrap();
        assert!(after.fib_382 > before.fib_382);
    }
}
