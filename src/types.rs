// =============================================================================
// Shared domain types for the retest signal engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Instrument identifier (e.g. "BTCUSDT"). Kept as a plain `String` rather
/// than an interned symbol type — the engine only ever holds a handful of
/// these per process and clones them freely, same as the teacher's
/// `CandleKey { symbol: String, .. }`.
pub type Instrument = String;

/// Timeframes the engine understands. `OneMin` is the only timeframe the
/// exchange source delivers directly; the rest are derived locally by the
/// bar aggregator (see `aggregator.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    OneMin,
    ThreeMin,
    FiveMin,
    FifteenMin,
    ThirtyMin,
}

impl Timeframe {
    /// Period length in milliseconds, used for slot alignment
    /// (`open_time % period_ms == 0`).
    pub const fn period_ms(self) -> i64 {
        match self {
            Self::OneMin => 60_000,
            Self::ThreeMin => 3 * 60_000,
            Self::FiveMin => 5 * 60_000,
            Self::FifteenMin => 15 * 60_000,
            Self::ThirtyMin => 30 * 60_000,
        }
    }

    /// Higher timeframes the aggregator derives from 1-minute bars.
    pub const fn derived() -> [Timeframe; 4] {
        [Self::ThreeMin, Self::FiveMin, Self::FifteenMin, Self::ThirtyMin]
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::OneMin => "1m",
            Self::ThreeMin => "3m",
            Self::FiveMin => "5m",
            Self::FifteenMin => "15m",
            Self::ThirtyMin => "30m",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// A closed (or in-progress) OHLCV bar. Canonical timestamps are integer
/// milliseconds aligned to the timeframe's period boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub closed: bool,
}

impl Bar {
    /// True when every price/volume field is finite and `high >= low`.
    /// The engine rejects bars that fail this check rather than letting
    /// NaN/Inf propagate into indicators.
    pub fn is_valid(&self) -> bool {
        self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.volume.is_finite()
            && self.volume >= 0.0
            && self.high >= self.low
    }

    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Trade direction of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Lifecycle state of a `Signal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalState {
    Active,
    Tp,
    Sl,
}

impl std::fmt::Display for SignalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Tp => write!(f, "TP"),
            Self::Sl => write!(f, "SL"),
        }
    }
}

/// A retest signal emitted by the signal generator and tracked to outcome.
///
/// `id` is derived deterministically from `(instrument, timeframe, time,
/// direction)` via `blake3` so that REPLAY re-runs produce byte-identical
/// ids and the signal store's `save` becomes an idempotent upsert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub instrument: Instrument,
    pub timeframe: Timeframe,
    pub time: i64,
    pub direction: Direction,
    pub entry: f64,
    pub tp: f64,
    pub sl: f64,
    pub atr_at_signal: f64,
    pub streak_at_signal: i32,
    pub state: SignalState,
    pub mae_ratio: f64,
    pub mfe_ratio: f64,
    #[serde(default)]
    pub close_time: Option<i64>,
    #[serde(default)]
    pub close_price: Option<f64>,
}

impl Signal {
    /// Deterministic, restart-stable signal id (spec.md §7).
    pub fn derive_id(instrument: &str, timeframe: Timeframe, time: i64, direction: Direction) -> String {
        let key = format!("{instrument}|{timeframe}|{time}|{direction}");
        blake3::hash(key.as_bytes()).to_hex()[..32].to_string()
    }
}

/// Per-(instrument, timeframe) streak state. Positive = consecutive TPs,
/// negative = consecutive SLs, 0 = no history yet.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StreakState {
    pub streak: i32,
    pub wins: u32,
    pub losses: u32,
}

/// Composite key identifying a unique (instrument, timeframe) series —
/// the teacher's `CandleKey` generalised to a typed timeframe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub instrument: Instrument,
    pub timeframe: Timeframe,
}

impl SeriesKey {
    pub fn new(instrument: impl Into<Instrument>, timeframe: Timeframe) -> Self {
        Self { instrument: instrument.into(), timeframe }
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.instrument, self.timeframe)
    }
}

/// A single executed trade, used by the outcome tracker's tick path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Trade {
    pub timestamp_ms: i64,
    pub price: f64,
    pub quantity: f64,
}

/// Observer-bus event kinds (spec.md §4.I, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ObserverEvent {
    SignalEmitted(Signal),
    SignalMaeUpdated { id: String, mae_ratio: f64, mfe_ratio: f64 },
    SignalClosed { id: String, state: SignalState, close_time: i64, close_price: f64 },
}

/// Indicator snapshot computed per closed bar (spec.md §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub ema50: f64,
    pub atr9: f64,
    pub fib_382: f64,
    pub fib_500: f64,
    pub fib_618: f64,
    pub vwap: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_rejects_non_finite() {
        let mut b = Bar { open_time: 0, open: 1.0, high: 2.0, low: 0.5, close: 1.5, volume: 10.0, closed: true };
        assert!(b.is_valid());
        b.close = f64::NAN;
        assert!(!b.is_valid());
    }

    #[test]
    fn bar_rejects_high_below_low() {
        let b = Bar { open_time: 0, open: 1.0, high: 0.5, low: 2.0, close: 1.5, volume: 10.0, closed: true };
        assert!(!b.is_valid());
    }

    #[test]
    fn signal_id_is_deterministic() {
        let a = Signal::derive_id("BTCUSDT", Timeframe::FiveMin, 300_000, Direction::Short);
        let b = Signal::derive_id("BTCUSDT", Timeframe::FiveMin, 300_000, Direction::Short);
        assert_eq!(a, b);
        let c = Signal::derive_id("BTCUSDT", Timeframe::FiveMin, 300_000, Direction::Long);
        assert_ne!(a, c);
    }

    #[test]
    fn timeframe_period_alignment() {
        assert_eq!(Timeframe::FiveMin.period_ms(), 300_000);
        assert_eq!(300_000 % Timeframe::FiveMin.period_ms(), 0);
    }
}
