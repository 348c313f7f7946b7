// =============================================================================
// Market Context — the snapshot a strategy decides on
// =============================================================================
//
// Built from a recent candle window (live: the aggregator's synthesized
// candles; backtest: the replay window). Indicator values are derived once
// here so every strategy sees identical numbers.
// =============================================================================

use serde::Serialize;

use crate::indicators::{bollinger, last_ema, last_rsi, sma, BollingerBands};
use crate::types::{Candle, Pair};

/// Standard indicator set exposed to strategies.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IndicatorSet {
    pub sma20: Option<f64>,
    pub sma50: Option<f64>,
    pub ema12: Option<f64>,
    pub ema26: Option<f64>,
    pub rsi14: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bb: Option<BollingerBandsView>,
}

/// Serializable Bollinger triplet.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BollingerBandsView {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

impl From<BollingerBands> for BollingerBandsView {
    fn from(bb: BollingerBands) -> Self {
        Self {
            upper: bb.upper,
            middle: bb.middle,
            lower: bb.lower,
        }
    }
}

/// Everything a strategy sees for one evaluation.
#[derive(Debug, Clone)]
pub struct MarketCtx {
    pub timestamp: i64,
    pub pair: Pair,
    /// Evaluation price (live: VWAP; backtest: candle close).
    pub price: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub recent_candles: Vec<Candle>,
    pub indicators: IndicatorSet,
}

impl MarketCtx {
    /// Build a context from a candle window, pricing at `price`.
    ///
    /// Returns `None` when the window is empty; individual indicators that
    /// lack data stay `None` and strategies decide whether they can act.
    pub fn from_candles(pair: Pair, candles: &[Candle], price: f64) -> Option<Self> {
        let latest = candles.last()?;
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let indicators = IndicatorSet {
            sma20: sma(&closes, 20),
            sma50: sma(&closes, 50),
            ema12: last_ema(&closes, 12),
            ema26: last_ema(&closes, 26),
            rsi14: last_rsi(&closes, 14),
            bb: bollinger(&closes, 20, 2.0).map(Into::into),
        };

        Some(Self {
            timestamp: latest.timestamp,
            pair,
            price,
            open: latest.open,
            high: latest.high,
            low: latest.low,
            close: latest.close,
            volume: latest.volume,
            recent_candles: candles.to_vec(),
            indicators,
        })
    }

    /// Close series of the window, oldest first.
    pub fn closes(&self) -> Vec<f64> {
        self.recent_candles.iter().map(|c| c.close).collect()
    }
}
