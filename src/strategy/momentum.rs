// =============================================================================
// Momentum Strategy — EMA cross + MACD with a ratcheting trailing stop
// =============================================================================
//
// Long when the fast EMA is above the slow EMA, the MACD histogram clears the
// threshold, and the recent candle window shows enough one-sided pressure
// (`|up - down| / (up + down)`). Symmetric short. While in a position the
// stop ratchets from the high-watermark (low-watermark for shorts); exits on
// the stop or an opposite cross.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{MarketCtx, Strategy, StrategyDescriptor, StrategyKind};
use crate::error::{CoreError, CoreResult};
use crate::indicators::macd;
use crate::types::{Side, Signal, SignalAction};

/// Candles inspected for the trend-strength filter.
const TREND_WINDOW: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MomentumParams {
    pub macd_threshold: f64,
    /// Minimum `|up - down| / (up + down)` over the trend window.
    pub min_trend_strength: f64,
    /// Trailing stop distance from the watermark, as a fraction.
    pub trailing_stop_pct: f64,
    /// Order size as a fraction of balance.
    pub amount_fraction: f64,
}

impl Default for MomentumParams {
    fn default() -> Self {
        Self {
            macd_threshold: 0.0,
            min_trend_strength: 0.3,
            trailing_stop_pct: 0.02,
            amount_fraction: 0.1,
        }
    }
}

impl MomentumParams {
    fn validate(&self) -> CoreResult<()> {
        if !(0.0..=1.0).contains(&self.min_trend_strength) {
            return Err(CoreError::validation("minTrendStrength must be in [0, 1]"));
        }
        if self.trailing_stop_pct <= 0.0 || self.trailing_stop_pct >= 1.0 {
            return Err(CoreError::validation("trailingStopPct must be in (0, 1)"));
        }
        if self.amount_fraction <= 0.0 || self.amount_fraction > 1.0 {
            return Err(CoreError::validation("amountFraction must be in (0, 1]"));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct MomentumStrategy {
    params: MomentumParams,
    /// Open exposure: side, entry price, and the stop watermark.
    position: Option<OpenPosition>,
}

#[derive(Debug, Clone, Copy)]
struct OpenPosition {
    side: Side,
    entry: f64,
    /// High-watermark for longs, low-watermark for shorts.
    watermark: f64,
}

impl MomentumStrategy {
    pub fn from_params(params: &Value) -> CoreResult<Self> {
        let params: MomentumParams = serde_json::from_value(params.clone())
            .map_err(|e| CoreError::validation(format!("bad momentum params: {e}")))?;
        params.validate()?;
        Ok(Self {
            params,
            position: None,
        })
    }

    /// One-sided pressure over the last [`TREND_WINDOW`] candles.
    fn trend_strength(ctx: &MarketCtx) -> Option<(f64, bool)> {
        let candles = &ctx.recent_candles;
        if candles.len() < 2 {
            return None;
        }
        let window = &candles[candles.len().saturating_sub(TREND_WINDOW + 1)..];

        let mut up = 0u32;
        let mut down = 0u32;
        for w in window.windows(2) {
            if w[1].close > w[0].close {
                up += 1;
            } else if w[1].close < w[0].close {
                down += 1;
            }
        }
        let total = up + down;
        if total == 0 {
            return None;
        }
        let strength = (up as f64 - down as f64).abs() / total as f64;
        Some((strength, up >= down))
    }
}

impl Strategy for MomentumStrategy {
    fn generate_signal(&mut self, ctx: &MarketCtx) -> CoreResult<Signal> {
        let (Some(ema12), Some(ema26)) = (ctx.indicators.ema12, ctx.indicators.ema26) else {
            return Ok(Signal::hold(ctx.price, "insufficient data for EMAs"));
        };
        let closes = ctx.closes();
        let Some(m) = macd(&closes, 12, 26) else {
            return Ok(Signal::hold(ctx.price, "insufficient data for MACD"));
        };
        let price = ctx.price;
        let p = self.params.clone();

        // Manage the open position: ratchet the watermark, check exits.
        if let Some(pos) = self.position.as_mut() {
            let (stop, stop_hit, crossed) = match pos.side {
                Side::Buy => {
                    pos.watermark = pos.watermark.max(price);
                    let stop = pos.watermark * (1.0 - p.trailing_stop_pct);
                    (stop, price <= stop, ema12 < ema26)
                }
                Side::Sell => {
                    pos.watermark = pos.watermark.min(price);
                    let stop = pos.watermark * (1.0 + p.trailing_stop_pct);
                    (stop, price >= stop, ema12 > ema26)
                }
            };

            if stop_hit || crossed {
                let side = pos.side;
                let entry = pos.entry;
                self.position = None;
                let reason = if stop_hit {
                    format!("trailing stop {stop:.2} hit (entry {entry:.2})")
                } else {
                    "opposite EMA cross".to_string()
                };
                return Ok(Signal {
                    action: match side {
                        Side::Buy => SignalAction::Sell,
                        Side::Sell => SignalAction::Buy,
                    },
                    confidence: 0.6,
                    price,
                    amount: p.amount_fraction,
                    reason,
                    stop_loss: None,
                    take_profit: None,
                    trailing_stop: None,
                });
            }
            return Ok(Signal {
                action: SignalAction::Hold,
                confidence: 0.0,
                price,
                amount: 0.0,
                reason: "riding trend".to_string(),
                stop_loss: None,
                take_profit: None,
                trailing_stop: Some(stop),
            });
        }

        // Entry gates: cross direction, histogram threshold, trend pressure.
        let Some((strength, upward)) = Self::trend_strength(ctx) else {
            return Ok(Signal::hold(price, "no trend window"));
        };
        if strength < p.min_trend_strength {
            return Ok(Signal::hold(
                price,
                format!("trend strength {strength:.2} below threshold"),
            ));
        }

        let long_setup = ema12 > ema26 && m.histogram > p.macd_threshold && upward;
        let short_setup = ema12 < ema26 && m.histogram < -p.macd_threshold && !upward;

        if long_setup || short_setup {
            let side = if long_setup { Side::Buy } else { Side::Sell };
            self.position = Some(OpenPosition {
                side,
                entry: price,
                watermark: price,
            });
            let trail = match side {
                Side::Buy => price * (1.0 - p.trailing_stop_pct),
                Side::Sell => price * (1.0 + p.trailing_stop_pct),
            };
            return Ok(Signal {
                action: if long_setup {
                    SignalAction::Buy
                } else {
                    SignalAction::Sell
                },
                confidence: (0.5 + strength / 2.0).clamp(0.5, 1.0),
                price,
                amount: p.amount_fraction,
                reason: format!(
                    "EMA cross ({ema12:.2} vs {ema26:.2}), histogram {:.4}, strength {strength:.2}",
                    m.histogram
                ),
                stop_loss: None,
                take_profit: None,
                trailing_stop: Some(trail),
            });
        }

        Ok(Signal::hold(price, "no momentum setup"))
    }

    fn update_params(&mut self, params: &Value) -> CoreResult<()> {
        let parsed: MomentumParams = serde_json::from_value(params.clone())
            .map_err(|e| CoreError::validation(format!("bad momentum params: {e}")))?;
        parsed.validate()?;
        self.params = parsed;
        Ok(())
    }

    fn config(&self) -> StrategyDescriptor {
        StrategyDescriptor {
            kind: StrategyKind::Momentum,
            params: serde_json::to_value(&self.params).unwrap_or_default(),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::context::MarketCtx;
    use crate::types::{Candle, Pair};

    fn ctx_from_closes(closes: &[f64]) -> MarketCtx {
        let candles: Vec<Candle> = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                timestamp: 1_700_000_000_000 + i as i64 * 60_000,
                open: close,
                high: close + 0.5,
                low: close - 0.5,
                close,
                volume: 1.0,
            })
            .collect();
        let price = *closes.last().unwrap();
        MarketCtx::from_candles(Pair::new("BTC", "USDT"), &candles, price).unwrap()
    }

    #[test]
    fn steady_uptrend_enters_long() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let mut s = MomentumStrategy::from_params(&serde_json::json!({})).unwrap();

        let signal = s.generate_signal(&ctx_from_closes(&closes)).unwrap();
        assert_eq!(signal.action, SignalAction::Buy);
        assert!(signal.trailing_stop.is_some());
        assert!(signal.confidence > 0.5);
    }

    #[test]
    fn steady_downtrend_enters_short() {
        let closes: Vec<f64> = (0..60).map(|i| 200.0 - i as f64).collect();
        let mut s = MomentumStrategy::from_params(&serde_json::json!({})).unwrap();

        let signal = s.generate_signal(&ctx_from_closes(&closes)).unwrap();
        assert_eq!(signal.action, SignalAction::Sell);
    }

    #[test]
    fn choppy_market_fails_trend_filter() {
        let closes: Vec<f64> = (0..60)
            .map(|i| if i % 2 == 0 { 100.0 } else { 101.0 })
            .collect();
        let mut s = MomentumStrategy::from_params(&serde_json::json!({})).unwrap();

        let signal = s.generate_signal(&ctx_from_closes(&closes)).unwrap();
        assert_eq!(signal.action, SignalAction::Hold);
    }

    #[test]
    fn trailing_stop_ratchets_and_fires() {
        let mut s = MomentumStrategy::from_params(&serde_json::json!({
            "trailingStopPct": 0.02,
        }))
        .unwrap();

        // Enter long on a clean uptrend ending at 159.
        let mut closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let entry = s.generate_signal(&ctx_from_closes(&closes)).unwrap();
        assert_eq!(entry.action, SignalAction::Buy);

        // Price pushes to 170: still holding, stop follows the watermark.
        closes.push(170.0);
        let hold = s.generate_signal(&ctx_from_closes(&closes)).unwrap();
        assert_eq!(hold.action, SignalAction::Hold);
        let stop = hold.trailing_stop.unwrap();
        assert!((stop - 170.0 * 0.98).abs() < 1e-9);

        // A drop through the stop exits.
        closes.push(165.0);
        let exit = s.generate_signal(&ctx_from_closes(&closes)).unwrap();
        assert_eq!(exit.action, SignalAction::Sell);
        assert!(exit.reason.contains("trailing stop"));
    }

    #[test]
    fn short_data_window_holds() {
        let mut s = MomentumStrategy::from_params(&serde_json::json!({})).unwrap();
        let signal = s
            .generate_signal(&ctx_from_closes(&[100.0, 101.0, 102.0]))
            .unwrap();
        assert_eq!(signal.action, SignalAction::Hold);
    }

    #[test]
    fn invalid_params_rejected() {
        let err = MomentumStrategy::from_params(&serde_json::json!({
            "trailingStopPct": 1.5,
        }))
        .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
