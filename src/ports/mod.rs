// =============================================================================
// Collaborator ports (spec.md §4.I)
// =============================================================================
//
// The core depends only on these abstractions; concrete implementations
// (in-memory for tests, a real exchange client for production) live in
// `ports::memory` and `ports::binance`. I/O-bound methods are `async` via
// `async_trait`, the same shape `hapticfish-RustRaptor` uses for its
// exchange-adapter traits — the teacher itself has no async trait methods,
// since it only ever talks to one concrete Binance client.
//
// `ObserverBus::publish` is deliberately synchronous: per spec.md §5 the
// pure core logic never blocks, and observer fan-out (a broadcast channel
// send) does not need to.
// =============================================================================

pub mod binance;
pub mod memory;

use async_trait::async_trait;

use crate::errors::EngineResult;
use crate::types::{Bar, Instrument, ObserverEvent, SeriesKey, Signal, SignalState, StreakState, Timeframe, Trade};

#[async_trait]
pub trait BarStore: Send + Sync {
    async fn upsert(&self, instrument: &Instrument, timeframe: Timeframe, bar: Bar) -> anyhow::Result<()>;
    async fn range(&self, instrument: &Instrument, timeframe: Timeframe, from: i64, to: i64) -> anyhow::Result<Vec<Bar>>;
    async fn last_time(&self, instrument: &Instrument, timeframe: Timeframe) -> anyhow::Result<Option<i64>>;
    async fn tail(&self, instrument: &Instrument, timeframe: Timeframe, n: usize) -> anyhow::Result<Vec<Bar>>;
}

#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn save(&self, signal: &Signal) -> anyhow::Result<()>;
    async fn update_state(&self, id: &str, state: SignalState, close_time: i64, close_price: f64) -> anyhow::Result<()>;
    async fn load_active(&self) -> anyhow::Result<Vec<Signal>>;
    async fn update_mae_mfe(&self, id: &str, mae_ratio: f64, mfe_ratio: f64) -> anyhow::Result<()>;
}

#[async_trait]
pub trait StreakStore: Send + Sync {
    async fn save(&self, key: &SeriesKey, state: StreakState) -> anyhow::Result<()>;
    async fn load_all(&self) -> anyhow::Result<Vec<(SeriesKey, StreakState)>>;
}

/// Delivered to `ExchangeSource::subscribe_bars_1m` subscribers.
#[derive(Debug, Clone, Copy)]
pub struct BarEvent {
    pub timeframe: Timeframe,
    pub bar: Bar,
}

/// Delivered to `ExchangeSource::subscribe_trades` subscribers.
#[derive(Debug, Clone, Copy)]
pub struct TradeEvent {
    pub trade: Trade,
}

#[async_trait]
pub trait ExchangeSource: Send + Sync {
    /// Stream closed 1-minute bars for each instrument into `tx`, keyed by
    /// instrument via the returned channel's tag. Runs until the upstream
    /// disconnects or the task is dropped; callers reconnect by calling
    /// again (the ingestion pipeline owns the reconnect loop).
    async fn subscribe_bars_1m(
        &self,
        instrument: &Instrument,
        tx: tokio::sync::mpsc::Sender<BarEvent>,
    ) -> anyhow::Result<()>;

    async fn subscribe_trades(
        &self,
        instrument: &Instrument,
        tx: tokio::sync::mpsc::Sender<TradeEvent>,
    ) -> anyhow::Result<()>;

    async fn fetch_bars(&self, instrument: &Instrument, from: i64, to: i64) -> anyhow::Result<Vec<Bar>>;
}

pub trait ObserverBus: Send + Sync {
    fn publish(&self, event: ObserverEvent) -> EngineResult<()>;
}

/// The engine core's single entry point for a closed bar, implemented by
/// `engine_core::EngineCore`. The ingestion pipeline is deliberately kept
/// ignorant of indicator/signal/outcome internals — it only knows how to
/// get bars into this port in the right order (spec.md §9: port interfaces
/// over callback injection).
#[async_trait]
pub trait BarProcessor: Send + Sync {
    /// Full fixed-order processing for a closed bar (spec.md §5): bar-path
    /// outcome check, signal generation, then (for a 1-minute bar) bar
    /// aggregation and the same two steps for every higher timeframe that
    /// closes as a result.
    async fn process_bar(&self, instrument: &Instrument, bar: Bar) -> EngineResult<()>;

    /// Route one executed trade print into the outcome tracker's tick path
    /// (spec.md §4.F). Unlike `process_bar` this never touches the bar
    /// store, aggregator, or signal generator — a tick only resolves
    /// signals that are already ACTIVE.
    async fn process_trade(&self, instrument: &Instrument, trade: Trade) -> EngineResult<()>;

    /// Indicator/ATR-tracker warm-up only, no outcome checks, no signal
    /// generation, no observer publication — used by the ingestion
    /// pipeline's RESTORE phase to prime caches from history.
    fn warm_up(&self, instrument: &Instrument, bar: &Bar);
}
