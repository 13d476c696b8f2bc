// =============================================================================
// Session-cumulative VWAP
// =============================================================================
//
// VWAP = sum(typical_price * volume) / sum(volume), accumulated since the
// start of the current session.
//
// spec.md §8 leaves the reset cadence open; the decision recorded there is
// "never reset by default". `SessionVwap::roll_session` exists so a future
// daily-reset policy can be wired in without changing the accumulation math,
// but nothing in this engine calls it yet.
// =============================================================================

use crate::types::Bar;

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionVwap {
    cumulative_pv: f64,
    cumulative_volume: f64,
}

impl SessionVwap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one closed bar into the running accumulation. Bars with zero
    /// volume contribute nothing (and cannot divide the running total). A
    /// non-finite typical price is rejected here too, as a second line of
    /// defense behind the ingestion-path `Bar::is_valid` check — one bad
    /// tick must not poison the cumulative sums for every bar after it.
    pub fn update(&mut self, bar: &Bar) {
        if bar.volume <= 0.0 {
            return;
        }
        let typical = bar.typical_price();
        if !typical.is_finite() {
            return;
        }
        self.cumulative_pv += typical * bar.volume;
        self.cumulative_volume += bar.volume;
    }

    /// Current VWAP, or `None` before any volume has accumulated.
    pub fn value(&self) -> Option<f64> {
        if self.cumulative_volume <= 0.0 {
            None
        } else {
            Some(self.cumulative_pv / self.cumulative_volume)
        }
    }

    /// Reset the accumulation to start a new session. Unused while the
    /// never-reset default is in effect.
    pub fn roll_session(&mut self) {
        self.cumulative_pv = 0.0;
        self.cumulative_volume = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(typical: f64, volume: f64) -> Bar {
        Bar { open_time: 0, open: typical, high: typical, low: typical, close: typical, volume, closed: true }
    }

    #[test]
    fn empty_vwap_is_none() {
        assert_eq!(SessionVwap::new().value(), None);
    }

    #[test]
    fn single_bar_vwap_equals_typical_price() {
        let mut vwap = SessionVwap::new();
        vwap.update(&bar(100.0, 5.0));
        assert!((vwap.value().unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn volume_weighted_average() {
        let mut vwap = SessionVwap::new();
        vwap.update(&bar(100.0, 1.0));
        vwap.update(&bar(200.0, 3.0));
        // (100*1 + 200*3) / 4 = 175
        assert!((vwap.value().unwrap() - 175.0).abs() < 1e-9);
    }

    #[test]
    fn non_finite_typical_price_is_ignored() {
        let mut vwap = SessionVwap::new();
        vwap.update(&bar(100.0, 5.0));
        vwap.update(&bar(f64::NAN, 5.0));
        assert!((vwap.value().unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn zero_volume_bar_is_ignored() {
        let mut vwap = SessionVwap::new();
        vwap.update(&bar(100.0, 0.0));
        assert_eq!(vwap.value(), None);
    }

    #[test]
    fn roll_session_resets_accumulation() {
        let mut vwap = SessionVwap::new();
        vwap.update(&bar(100.0, 5.0));
        vwap.roll_session();
        assert_eq!(vwap.value(), None);
    }
}
