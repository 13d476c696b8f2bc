// =============================================================================
// Strategy & filter configuration — hot-reloadable, atomically persisted
// =============================================================================
//
// Every tunable parameter lives here so the engine can be reconfigured
// without a restart. Persistence uses the teacher's atomic tmp + rename
// pattern (see `runtime_config.rs` in the source corpus this is grounded
// on) to avoid a torn write on crash. Every field carries `#[serde(default
// = "...")]` so that adding a new field never breaks loading an older
// config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{Instrument, Timeframe};

fn default_ema_period() -> usize { 50 }
fn default_atr_period() -> usize { 9 }
fn default_fib_window() -> usize { 9 }
fn default_tp_atr_mult() -> f64 { 2.0 }
fn default_sl_atr_mult() -> f64 { 8.84 }
fn default_score_threshold() -> f64 { 1.0 }
fn default_max_history() -> usize { 10_000 }
fn default_min_samples() -> usize { 200 }
fn default_buffer_capacity() -> usize { 5_000 }
fn default_replay_checkpoint_every() -> usize { 100 }
fn default_initial_history_hours() -> u64 { 48 }

/// Core indicator/strategy parameters (spec.md §6 configuration table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default = "default_ema_period")]
    pub ema_period: usize,
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
    #[serde(default = "default_fib_window")]
    pub fib_window: usize,
    #[serde(default = "default_tp_atr_mult")]
    pub tp_atr_mult: f64,
    #[serde(default = "default_sl_atr_mult")]
    pub sl_atr_mult: f64,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            ema_period: default_ema_period(),
            atr_period: default_atr_period(),
            fib_window: default_fib_window(),
            tp_atr_mult: default_tp_atr_mult(),
            sl_atr_mult: default_sl_atr_mult(),
            score_threshold: default_score_threshold(),
        }
    }
}

/// ATR percentile tracker parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtrTrackerConfig {
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

impl Default for AtrTrackerConfig {
    fn default() -> Self {
        Self { max_history: default_max_history(), min_samples: default_min_samples() }
    }
}

/// Ingestion pipeline parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_replay_checkpoint_every")]
    pub replay_checkpoint_every: usize,
    #[serde(default = "default_initial_history_hours")]
    pub initial_history_hours: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            replay_checkpoint_every: default_replay_checkpoint_every(),
            initial_history_hours: default_initial_history_hours(),
        }
    }
}

/// Per-(instrument, timeframe) filter gate (spec.md §3, §4.H).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FilterConfig {
    pub enabled: bool,
    pub streak_lo: i32,
    pub streak_hi: i32,
    pub atr_pct_threshold: f64,
    pub position_qty: f64,
}

impl FilterConfig {
    /// `streak_at_signal` falls within `[streak_lo, streak_hi]`.
    pub fn accepts_streak(&self, streak: i32) -> bool {
        streak >= self.streak_lo && streak <= self.streak_hi
    }
}

/// Which filter whitelist is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Portfolio {
    A,
    B,
    Custom(HashMap<String, FilterConfig>),
}

/// Preset "A" — conservative: narrow streak band, higher ATR percentile
/// floor. Applies to every configured instrument at 5m and 15m.
fn preset_a(instruments: &[Instrument]) -> HashMap<String, FilterConfig> {
    let mut map = HashMap::new();
    for instrument in instruments {
        for tf in [Timeframe::FiveMin, Timeframe::FifteenMin] {
            map.insert(
                filter_key(instrument, tf),
                FilterConfig {
                    enabled: true,
                    streak_lo: -2,
                    streak_hi: 3,
                    atr_pct_threshold: 0.5,
                    position_qty: 1.0,
                },
            );
        }
    }
    map
}

/// Preset "B" — permissive: wider streak band, lower ATR percentile floor,
/// includes 3m and 30m as well.
fn preset_b(instruments: &[Instrument]) -> HashMap<String, FilterConfig> {
    let mut map = HashMap::new();
    for instrument in instruments {
        for tf in Timeframe::derived() {
            map.insert(
                filter_key(instrument, tf),
                FilterConfig {
                    enabled: true,
                    streak_lo: -5,
                    streak_hi: 5,
                    atr_pct_threshold: 0.2,
                    position_qty: 1.0,
                },
            );
        }
    }
    map
}

pub(crate) fn filter_key(instrument: &str, timeframe: Timeframe) -> String {
    format!("{instrument}@{timeframe}")
}

impl Portfolio {
    /// Build the whitelist map for this preset, given the configured
    /// instrument set (presets are templated, not hard-coded to symbols).
    pub fn whitelist(&self, instruments: &[Instrument]) -> HashMap<String, FilterConfig> {
        match self {
            Portfolio::A => preset_a(instruments),
            Portfolio::B => preset_b(instruments),
            Portfolio::Custom(map) => map.clone(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_instruments")]
    pub instruments: Vec<Instrument>,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub atr_tracker: AtrTrackerConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub portfolio: Option<Portfolio>,
}

fn default_instruments() -> Vec<Instrument> {
    vec!["BTCUSDT".into(), "ETHUSDT".into()]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instruments: default_instruments(),
            strategy: StrategyConfig::default(),
            atr_tracker: AtrTrackerConfig::default(),
            ingestion: IngestionConfig::default(),
            portfolio: None,
        }
    }
}

impl EngineConfig {
    /// Build the active whitelist. `None` (legacy/testing mode, spec.md
    /// §4.H) means the filter gate accepts every candidate.
    pub fn whitelist(&self) -> Option<HashMap<String, FilterConfig>> {
        self.portfolio.as_ref().map(|p| p.whitelist(&self.instruments))
    }

    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;
        info!(path = %path.display(), instruments = ?config.instruments, "engine config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename) — prevents corruption on crash.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.strategy.ema_period, 50);
        assert_eq!(cfg.strategy.atr_period, 9);
        assert!((cfg.strategy.sl_atr_mult - 8.84).abs() < f64::EPSILON);
        assert_eq!(cfg.atr_tracker.min_samples, 200);
        assert!(cfg.whitelist().is_none());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.instruments, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(cfg.ingestion.replay_checkpoint_every, 100);
    }

    #[test]
    fn preset_a_is_narrower_than_preset_b() {
        let instruments = vec!["BTCUSDT".to_string()];
        let a = Portfolio::A.whitelist(&instruments);
        let b = Portfolio::B.whitelist(&instruments);
        let a_entry = a.get(&filter_key("BTCUSDT", Timeframe::FiveMin)).unwrap();
        let b_entry = b.get(&filter_key("BTCUSDT", Timeframe::FiveMin)).unwrap();
        assert!(a_entry.streak_hi - a_entry.streak_lo < b_entry.streak_hi - b_entry.streak_lo);
        assert!(a_entry.atr_pct_threshold > b_entry.atr_pct_threshold);
    }

    #[test]
    fn custom_portfolio_roundtrips() {
        let mut map = HashMap::new();
        map.insert(
            filter_key("ETHUSDT", Timeframe::OneMin),
            FilterConfig { enabled: true, streak_lo: -1, streak_hi: 1, atr_pct_threshold: 0.3, position_qty: 2.0 },
        );
        let portfolio = Portfolio::Custom(map);
        let json = serde_json::to_string(&portfolio).unwrap();
        let round: Portfolio = serde_json::from_str(&json).unwrap();
        let resolved = round.whitelist(&[]);
        assert_eq!(resolved.len(), 1);
    }
}
