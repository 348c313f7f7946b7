// =============================================================================
// Engine Configuration — Hot-reloadable settings with atomic save
// =============================================================================
//
// Every tunable the trading core recognises lives here: risk limits, backtest
// execution model, optimizer settings, ingestor pacing, and per-venue
// aggregator parameters.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::TradingMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_pairs() -> Vec<String> {
    vec![
        "BTC/USDT".to_string(),
        "ETH/USDT".to_string(),
        "SOL/USDT".to_string(),
    ]
}

fn default_exchanges() -> Vec<String> {
    vec!["binance".to_string(), "coinbase".to_string(), "kraken".to_string()]
}

fn default_max_position_size() -> f64 {
    0.2
}

fn default_max_total_exposure() -> f64 {
    0.8
}

fn default_max_concentration() -> f64 {
    0.4
}

fn default_max_daily_loss() -> f64 {
    0.05
}

fn default_max_daily_trades() -> u32 {
    100
}

fn default_max_daily_volume() -> f64 {
    100_000.0
}

fn default_max_drawdown_pct() -> f64 {
    10.0
}

fn default_max_consecutive_losses() -> u32 {
    5
}

fn default_circuit_breaker_ms() -> i64 {
    3_600_000
}

fn default_trade_cooldown_ms() -> i64 {
    1_000
}

fn default_max_slippage_pct() -> f64 {
    2.0
}

fn default_max_price_deviation_pct() -> f64 {
    5.0
}

fn default_initial_balance() -> f64 {
    10_000.0
}

fn default_maker_fee() -> f64 {
    0.001
}

fn default_taker_fee() -> f64 {
    0.002
}

fn default_slippage_bps() -> f64 {
    5.0
}

fn default_train_ratio() -> f64 {
    0.7
}

fn default_n_splits() -> usize {
    3
}

fn default_opt_metric() -> String {
    "sharpeRatio".to_string()
}

fn default_min_trades() -> usize {
    10
}

fn default_rate_limit_ms() -> u64 {
    100
}

fn default_chunk_size() -> usize {
    1_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_heartbeat_ms() -> u64 {
    30_000
}

fn default_aggregation_interval_ms() -> u64 {
    1_000
}

fn default_strategy_tick_secs() -> u64 {
    30
}

fn default_data_dir() -> String {
    "data/candles".to_string()
}

fn default_meta_db() -> String {
    "data/vela-meta.db".to_string()
}

// =============================================================================
// Sections
// =============================================================================

/// Pre-trade risk limits. Fractions unless the name says `pct`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,
    #[serde(default = "default_max_total_exposure")]
    pub max_total_exposure: f64,
    #[serde(default = "default_max_concentration")]
    pub max_concentration: f64,
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,
    #[serde(default = "default_max_daily_trades")]
    pub max_daily_trades: u32,
    #[serde(default = "default_max_daily_volume")]
    pub max_daily_volume: f64,
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    /// How long a tripped circuit breaker suspends trading, in milliseconds.
    #[serde(default = "default_circuit_breaker_ms")]
    pub circuit_breaker_duration_ms: i64,
    #[serde(default = "default_trade_cooldown_ms")]
    pub trade_cooldown_ms: i64,
    #[serde(default = "default_max_slippage_pct")]
    pub max_slippage_pct: f64,
    #[serde(default = "default_max_price_deviation_pct")]
    pub max_price_deviation_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty object deserialises to defaults")
    }
}

/// Slippage model applied by the backtest execution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlippageModel {
    None,
    Fixed,
    Dynamic,
}

impl Default for SlippageModel {
    fn default() -> Self {
        Self::Fixed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,
    #[serde(default = "default_maker_fee")]
    pub maker_fee: f64,
    #[serde(default = "default_taker_fee")]
    pub taker_fee: f64,
    #[serde(default)]
    pub slippage_model: SlippageModel,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty object deserialises to defaults")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_train_ratio")]
    pub train_ratio: f64,
    #[serde(default = "default_n_splits")]
    pub n_splits: usize,
    /// One of: sharpeRatio, totalReturn, profitFactor, winRate, calmarRatio,
    /// composite.
    #[serde(default = "default_opt_metric")]
    pub metric: String,
    #[serde(default = "default_min_trades")]
    pub min_trades: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty object deserialises to defaults")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestorConfig {
    /// Venue the backfill pulls from.
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_rate_limit_ms")]
    pub rate_limit_ms: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_exchange() -> String {
    "binance".to_string()
}

impl Default for IngestorConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty object deserialises to defaults")
    }
}

/// Per-venue WebSocket client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
}

impl Default for VenueConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty object deserialises to defaults")
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Vela engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Current trading mode. The engine always boots Paused; flipping to Live
    /// is an explicit operator action via the API.
    #[serde(default)]
    pub trading_mode: TradingMode,

    /// Pairs the engine watches and trades, canonical `BASE/QUOTE`.
    #[serde(default = "default_pairs")]
    pub pairs: Vec<String>,

    /// Venues the aggregator connects to.
    #[serde(default = "default_exchanges")]
    pub exchanges: Vec<String>,

    /// Seconds between strategy scheduler ticks.
    #[serde(default = "default_strategy_tick_secs")]
    pub strategy_tick_secs: u64,

    /// Milliseconds between VWAP aggregation passes.
    #[serde(default = "default_aggregation_interval_ms")]
    pub aggregation_interval_ms: u64,

    /// Root directory for columnar candle files.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Path of the sqlite metadata database.
    #[serde(default = "default_meta_db")]
    pub meta_db: String,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub backtest: BacktestConfig,

    #[serde(default)]
    pub optimizer: OptimizerConfig,

    #[serde(default)]
    pub ingestor: IngestorConfig,

    #[serde(default)]
    pub venue: VenueConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty object deserialises to defaults")
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// Returns an error when the file is missing or malformed so the caller
    /// can fall back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            pairs = ?config.pairs,
            exchanges = ?config.exchanges,
            trading_mode = %config.trading_mode,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_limits() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert!((cfg.risk.max_position_size - 0.2).abs() < f64::EPSILON);
        assert!((cfg.risk.max_total_exposure - 0.8).abs() < f64::EPSILON);
        assert!((cfg.risk.max_concentration - 0.4).abs() < f64::EPSILON);
        assert!((cfg.risk.max_daily_loss - 0.05).abs() < f64::EPSILON);
        assert_eq!(cfg.risk.max_daily_trades, 100);
        assert_eq!(cfg.risk.circuit_breaker_duration_ms, 3_600_000);
        assert!((cfg.backtest.initial_balance - 10_000.0).abs() < f64::EPSILON);
        assert!((cfg.backtest.taker_fee - 0.002).abs() < f64::EPSILON);
        assert!((cfg.optimizer.train_ratio - 0.7).abs() < f64::EPSILON);
        assert_eq!(cfg.optimizer.n_splits, 3);
        assert_eq!(cfg.ingestor.chunk_size, 1_000);
        assert_eq!(cfg.venue.max_reconnect_attempts, 5);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.pairs, default_pairs());
        assert_eq!(cfg.strategy_tick_secs, 30);
        assert_eq!(cfg.aggregation_interval_ms, 1_000);
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"risk": {"max_daily_trades": 7}}"#).unwrap();
        assert_eq!(cfg.risk.max_daily_trades, 7);
        assert!((cfg.risk.max_daily_loss - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut cfg = EngineConfig::default();
        cfg.pairs = vec!["BTC/USD".to_string()];
        cfg.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.pairs, vec!["BTC/USD".to_string()]);
    }
}
