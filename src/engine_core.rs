// =============================================================================
// Engine core — single serialization domain (spec.md §5)
// =============================================================================
//
// Ties the aggregator (B), ATR tracker (C), streak tracker (D), signal
// generator (E), and outcome tracker (F) together behind one `BarProcessor`
// entry point. Grounded in `app_state::AppState`: one struct owning every
// collaborator, handed out as a single `Arc` to every task that needs it.
//
// Processing order per closed bar is fixed (spec.md §5): the bar-path
// outcome check runs before signal generation, so a signal cannot close and
// re-open within the same invocation; the 1-minute signal generator runs
// before bar aggregation, so a derived bar's generator never sees a 1m
// signal emitted from the same tick; each higher timeframe that closes as a
// result is then processed in ascending order (3m, 5m, 15m, 30m).
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::aggregator::BarAggregator;
use crate::errors::{EngineError, EngineResult};
use crate::outcome_tracker::OutcomeTracker;
use crate::ports::{BarProcessor, BarStore};
use crate::signal_generator::SignalGenerator;
use crate::types::{Bar, Instrument, SeriesKey, Timeframe, Trade};

pub struct EngineCore {
    aggregator: BarAggregator,
    generator: Arc<SignalGenerator>,
    outcomes: Arc<OutcomeTracker>,
    bar_store: Arc<dyn BarStore>,
}

impl EngineCore {
    pub fn new(generator: Arc<SignalGenerator>, outcomes: Arc<OutcomeTracker>, bar_store: Arc<dyn BarStore>) -> Self {
        Self { aggregator: BarAggregator::new(), generator, outcomes, bar_store }
    }

    async fn process_one(&self, instrument: &Instrument, timeframe: Timeframe, bar: Bar) -> EngineResult<()> {
        let key = SeriesKey::new(instrument.clone(), timeframe);

        if !bar.is_valid() {
            return Err(EngineError::InvalidInput {
                key,
                reason: "non-finite OHLCV field, negative volume, or high < low".to_string(),
            });
        }

        self.bar_store.upsert(instrument, timeframe, bar).await.map_err(|source| EngineError::PortFailure {
            port: "bar_store::upsert",
            transient: true,
            source,
        })?;

        // Bar-path outcome check before generation, so a signal that closes
        // on this exact bar cannot immediately reopen.
        self.outcomes.on_bar(instrument, &bar).await?;

        if let Some(signal) = self.generator.on_closed_bar(&key, &bar).await? {
            self.outcomes.track(signal);
        }
        Ok(())
    }
}

#[async_trait]
impl BarProcessor for EngineCore {
    #[instrument(skip(self, bar), fields(instrument = %instrument))]
    async fn process_bar(&self, instrument: &Instrument, bar: Bar) -> EngineResult<()> {
        self.process_one(instrument, Timeframe::OneMin, bar).await?;

        for (timeframe, derived_bar) in self.aggregator.ingest_one_minute(instrument, &bar) {
            self.process_one(instrument, timeframe, derived_bar).await?;
        }
        Ok(())
    }

    async fn process_trade(&self, instrument: &Instrument, trade: Trade) -> EngineResult<()> {
        self.outcomes.on_trade(instrument, &trade).await
    }

    fn warm_up(&self, instrument: &Instrument, bar: &Bar) {
        if !bar.is_valid() {
            return;
        }

        let key = SeriesKey::new(instrument.clone(), Timeframe::OneMin);
        self.generator.warm_up(&key, bar);

        // Seed the aggregator (B) the same way `process_bar` does, so
        // RESTORE leaves every derived timeframe's indicator state (A)
        // primed, not just the 1-minute series.
        for (timeframe, derived_bar) in self.aggregator.ingest_one_minute(instrument, bar) {
            let derived_key = SeriesKey::new(instrument.clone(), timeframe);
            self.generator.warm_up(&derived_key, &derived_bar);
        }
    }
}
