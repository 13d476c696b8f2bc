// =============================================================================
// In-memory collaborator implementations
// =============================================================================
//
// Used by tests and the backtester (spec.md §1, "downstream events" out of
// scope but the backtester still needs a BarStore/SignalStore to run
// against). Grounded in the teacher's own in-process-only state style —
// everything the teacher holds (`CandleBuffer`, `balances`, `positions`) is
// a `parking_lot::RwLock` over a plain collection, never a real database.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::errors::EngineResult;
use crate::ports::{BarEvent, BarStore, ExchangeSource, ObserverBus, SignalStore, StreakStore, TradeEvent};
use crate::types::{Bar, Instrument, ObserverEvent, SeriesKey, Signal, SignalState, StreakState, Timeframe};

#[derive(Default)]
pub struct InMemoryBarStore {
    bars: RwLock<HashMap<SeriesKey, Vec<Bar>>>,
}

impl InMemoryBarStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BarStore for InMemoryBarStore {
    async fn upsert(&self, instrument: &Instrument, timeframe: Timeframe, bar: Bar) -> anyhow::Result<()> {
        let key = SeriesKey::new(instrument.clone(), timeframe);
        let mut map = self.bars.write();
        let series = map.entry(key).or_default();
        match series.iter_mut().find(|b| b.open_time == bar.open_time) {
            Some(existing) => *existing = bar,
            None => series.push(bar),
        }
        series.sort_by_key(|b| b.open_time);
        Ok(())
    }

    async fn range(&self, instrument: &Instrument, timeframe: Timeframe, from: i64, to: i64) -> anyhow::Result<Vec<Bar>> {
        let key = SeriesKey::new(instrument.clone(), timeframe);
        let map = self.bars.read();
        Ok(map.get(&key).map(|series| {
            series.iter().filter(|b| b.open_time >= from && b.open_time <= to).copied().collect()
        }).unwrap_or_default())
    }

    async fn last_time(&self, instrument: &Instrument, timeframe: Timeframe) -> anyhow::Result<Option<i64>> {
        let key = SeriesKey::new(instrument.clone(), timeframe);
        let map = self.bars.read();
        Ok(map.get(&key).and_then(|series| series.last()).map(|b| b.open_time))
    }

    async fn tail(&self, instrument: &Instrument, timeframe: Timeframe, n: usize) -> anyhow::Result<Vec<Bar>> {
        let key = SeriesKey::new(instrument.clone(), timeframe);
        let map = self.bars.read();
        Ok(map.get(&key).map(|series| {
            let start = series.len().saturating_sub(n);
            series[start..].to_vec()
        }).unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemorySignalStore {
    signals: RwLock<HashMap<String, Signal>>,
}

impl InMemorySignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a persisted signal regardless of state, active or closed.
    pub fn get(&self, id: &str) -> Option<Signal> {
        self.signals.read().get(id).cloned()
    }
}

#[async_trait]
impl SignalStore for InMemorySignalStore {
    async fn save(&self, signal: &Signal) -> anyhow::Result<()> {
        self.signals.write().insert(signal.id.clone(), signal.clone());
        Ok(())
    }

    async fn update_state(&self, id: &str, state: SignalState, close_time: i64, close_price: f64) -> anyhow::Result<()> {
        let mut map = self.signals.write();
        if let Some(signal) = map.get_mut(id) {
            signal.state = state;
            signal.close_time = Some(close_time);
            signal.close_price = Some(close_price);
        }
        Ok(())
    }

    async fn load_active(&self) -> anyhow::Result<Vec<Signal>> {
        Ok(self.signals.read().values().filter(|s| s.state == SignalState::Active).cloned().collect())
    }

    async fn update_mae_mfe(&self, id: &str, mae_ratio: f64, mfe_ratio: f64) -> anyhow::Result<()> {
        let mut map = self.signals.write();
        if let Some(signal) = map.get_mut(id) {
            signal.mae_ratio = mae_ratio;
            signal.mfe_ratio = mfe_ratio;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryStreakStore {
    streaks: RwLock<HashMap<SeriesKey, StreakState>>,
}

impl InMemoryStreakStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StreakStore for InMemoryStreakStore {
    async fn save(&self, key: &SeriesKey, state: StreakState) -> anyhow::Result<()> {
        self.streaks.write().insert(key.clone(), state);
        Ok(())
    }

    async fn load_all(&self) -> anyhow::Result<Vec<(SeriesKey, StreakState)>> {
        Ok(self.streaks.read().iter().map(|(k, v)| (k.clone(), *v)).collect())
    }
}

/// An exchange source with no upstream — useful for backtests that drive
/// bars directly through the closed-bar handler instead of a live feed.
pub struct NullExchangeSource;

#[async_trait]
impl ExchangeSource for NullExchangeSource {
    async fn subscribe_bars_1m(&self, _instrument: &Instrument, _tx: tokio::sync::mpsc::Sender<BarEvent>) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn subscribe_trades(&self, _instrument: &Instrument, _tx: tokio::sync::mpsc::Sender<TradeEvent>) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn fetch_bars(&self, _instrument: &Instrument, _from: i64, _to: i64) -> anyhow::Result<Vec<Bar>> {
        Ok(Vec::new())
    }
}

/// Broadcast-channel observer bus. `publish` never blocks: a full or
/// receiver-less channel simply drops the event, same as a WS push with no
/// client connected.
pub struct BroadcastObserverBus {
    sender: broadcast::Sender<ObserverEvent>,
}

impl BroadcastObserverBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _rx) = broadcast::channel(capacity);
        Arc::new(Self { sender })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ObserverEvent> {
        self.sender.subscribe()
    }
}

impl ObserverBus for BroadcastObserverBus {
    fn publish(&self, event: ObserverEvent) -> EngineResult<()> {
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    fn bar(open_time: i64, close: f64) -> Bar {
        Bar { open_time, open: close, high: close + 1.0, low: close - 1.0, close, volume: 1.0, closed: true }
    }

    #[tokio::test]
    async fn bar_store_upsert_is_idempotent() {
        let store = InMemoryBarStore::new();
        let instrument = "BTCUSDT".to_string();
        store.upsert(&instrument, Timeframe::OneMin, bar(0, 100.0)).await.unwrap();
        store.upsert(&instrument, Timeframe::OneMin, bar(0, 101.0)).await.unwrap();
        let tail = store.tail(&instrument, Timeframe::OneMin, 10).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert!((tail[0].close - 101.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn signal_store_round_trip() {
        let store = InMemorySignalStore::new();
        let signal = Signal {
            id: "abc".into(), instrument: "BTCUSDT".into(), timeframe: Timeframe::FiveMin,
            time: 0, direction: Direction::Long, entry: 100.0, tp: 110.0, sl: 90.0,
            atr_at_signal: 5.0, streak_at_signal: 0, state: SignalState::Active,
            mae_ratio: 0.0, mfe_ratio: 0.0, close_time: None, close_price: None,
        };
        store.save(&signal).await.unwrap();
        assert_eq!(store.load_active().await.unwrap().len(), 1);
        store.update_state("abc", SignalState::Tp, 1000, 110.0).await.unwrap();
        assert_eq!(store.load_active().await.unwrap().len(), 0);
    }

    #[test]
    fn observer_bus_publish_without_subscriber_does_not_error() {
        let bus = BroadcastObserverBus::new(16);
        let result = bus.publish(ObserverEvent::SignalClosed {
            id: "abc".into(), state: SignalState::Tp, close_time: 0, close_price: 100.0,
        });
        assert!(result.is_ok());
    }
}
