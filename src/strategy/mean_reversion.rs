// =============================================================================
// Mean-Reversion Strategy — Bollinger Bands + RSI
// =============================================================================
//
// Entry short when price breaks above the upper band while RSI is overbought;
// entry long when price breaks below the lower band while RSI is oversold.
// Exits at the middle band (take-profit-at-mean) or at the percentage stop
// from entry. Confidence blends RSI extremity and band distance, clamped to
// [0.5, 1].
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{MarketCtx, Strategy, StrategyDescriptor, StrategyKind};
use crate::error::{CoreError, CoreResult};
use crate::types::{Side, Signal, SignalAction};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeanReversionParams {
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    /// Stop distance from entry, as a fraction (0.02 = 2%).
    pub stop_loss_pct: f64,
    /// Exit at the middle band instead of a fixed target.
    pub take_profit_at_mean: bool,
    /// Order size as a fraction of balance.
    pub amount_fraction: f64,
}

impl Default for MeanReversionParams {
    fn default() -> Self {
        Self {
            rsi_overbought: 70.0,
            rsi_oversold: 30.0,
            stop_loss_pct: 0.02,
            take_profit_at_mean: true,
            amount_fraction: 0.1,
        }
    }
}

impl MeanReversionParams {
    fn validate(&self) -> CoreResult<()> {
        if self.rsi_oversold >= self.rsi_overbought {
            return Err(CoreError::validation(
                "rsiOversold must be below rsiOverbought",
            ));
        }
        if !(0.0..1.0).contains(&self.stop_loss_pct) || self.stop_loss_pct <= 0.0 {
            return Err(CoreError::validation("stopLossPct must be in (0, 1)"));
        }
        if !(0.0..=1.0).contains(&self.amount_fraction) || self.amount_fraction <= 0.0 {
            return Err(CoreError::validation("amountFraction must be in (0, 1]"));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct MeanReversionStrategy {
    params: MeanReversionParams,
    /// Open exposure taken by this strategy: side + entry price.
    position: Option<(Side, f64)>,
}

impl MeanReversionStrategy {
    pub fn from_params(params: &Value) -> CoreResult<Self> {
        let params: MeanReversionParams = serde_json::from_value(params.clone())
            .map_err(|e| CoreError::validation(format!("bad mean-reversion params: {e}")))?;
        params.validate()?;
        Ok(Self {
            params,
            position: None,
        })
    }

    /// Blend RSI extremity with band distance; floor 0.5, cap 1.0.
    fn confidence(&self, rsi: f64, price: f64, band: f64, middle: f64, short: bool) -> f64 {
        let rsi_extremity = if short {
            (rsi - self.params.rsi_overbought) / (100.0 - self.params.rsi_overbought)
        } else {
            (self.params.rsi_oversold - rsi) / self.params.rsi_oversold
        };
        let half_width = (band - middle).abs().max(f64::EPSILON);
        let band_distance = ((price - band).abs() / half_width).min(1.0);
        (0.5 + 0.25 * rsi_extremity.clamp(0.0, 1.0) + 0.25 * band_distance).clamp(0.5, 1.0)
    }
}

impl Strategy for MeanReversionStrategy {
    fn generate_signal(&mut self, ctx: &MarketCtx) -> CoreResult<Signal> {
        let (Some(bb), Some(rsi)) = (ctx.indicators.bb, ctx.indicators.rsi14) else {
            return Ok(Signal::hold(ctx.price, "insufficient data for BB/RSI"));
        };
        let price = ctx.price;
        let p = &self.params;

        // Manage an open position first: mean target or stop.
        if let Some((side, entry)) = self.position {
            let (target_hit, stop_hit, stop) = match side {
                Side::Buy => {
                    let stop = entry * (1.0 - p.stop_loss_pct);
                    (p.take_profit_at_mean && price >= bb.middle, price <= stop, stop)
                }
                Side::Sell => {
                    let stop = entry * (1.0 + p.stop_loss_pct);
                    (p.take_profit_at_mean && price <= bb.middle, price >= stop, stop)
                }
            };
            if target_hit || stop_hit {
                self.position = None;
                let reason = if target_hit {
                    "reverted to mean"
                } else {
                    "stop hit"
                };
                return Ok(Signal {
                    action: match side {
                        Side::Buy => SignalAction::Sell,
                        Side::Sell => SignalAction::Buy,
                    },
                    confidence: 0.5,
                    price,
                    amount: p.amount_fraction,
                    reason: format!("{reason} (entry {entry:.2}, stop {stop:.2})"),
                    stop_loss: None,
                    take_profit: None,
                    trailing_stop: None,
                });
            }
            return Ok(Signal::hold(price, "holding mean-reversion position"));
        }

        // Short entry: stretched above the upper band and overbought.
        if price > bb.upper && rsi > p.rsi_overbought {
            self.position = Some((Side::Sell, price));
            return Ok(Signal {
                action: SignalAction::Sell,
                confidence: self.confidence(rsi, price, bb.upper, bb.middle, true),
                price,
                amount: p.amount_fraction,
                reason: format!(
                    "price {price:.2} above upper band {:.2}, RSI {rsi:.1} overbought",
                    bb.upper
                ),
                stop_loss: Some(price * (1.0 + p.stop_loss_pct)),
                take_profit: p.take_profit_at_mean.then_some(bb.middle),
                trailing_stop: None,
            });
        }

        // Long entry: stretched below the lower band and oversold.
        if price < bb.lower && rsi < p.rsi_oversold {
            self.position = Some((Side::Buy, price));
            return Ok(Signal {
                action: SignalAction::Buy,
                confidence: self.confidence(rsi, price, bb.lower, bb.middle, false),
                price,
                amount: p.amount_fraction,
                reason: format!(
                    "price {price:.2} below lower band {:.2}, RSI {rsi:.1} oversold",
                    bb.lower
                ),
                stop_loss: Some(price * (1.0 - p.stop_loss_pct)),
                take_profit: p.take_profit_at_mean.then_some(bb.middle),
                trailing_stop: None,
            });
        }

        Ok(Signal::hold(price, "price within bands"))
    }

    fn update_params(&mut self, params: &Value) -> CoreResult<()> {
        let parsed: MeanReversionParams = serde_json::from_value(params.clone())
            .map_err(|e| CoreError::validation(format!("bad mean-reversion params: {e}")))?;
        parsed.validate()?;
        self.params = parsed;
        Ok(())
    }

    fn config(&self) -> StrategyDescriptor {
        StrategyDescriptor {
            kind: StrategyKind::MeanReversion,
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
    use crate::strategy::context::{BollingerBandsView, IndicatorSet};
    use crate::types::Pair;

    /// Context with pinned indicator values, bypassing derivation.
    fn ctx(price: f64, bb: (f64, f64, f64), rsi: f64) -> MarketCtx {
        MarketCtx {
            timestamp: 1_700_000_000_000,
            pair: Pair::new("BTC", "USDT"),
            price,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1.0,
            recent_candles: Vec::new(),
            indicators: IndicatorSet {
                sma20: Some(bb.1),
                sma50: None,
                ema12: None,
                ema26: None,
                rsi14: Some(rsi),
                bb: Some(BollingerBandsView {
                    upper: bb.0,
                    middle: bb.1,
                    lower: bb.2,
                }),
            },
        }
    }

    #[test]
    fn overbought_breakout_sells_with_stop_and_mean_target() {
        let mut s = MeanReversionStrategy::from_params(&serde_json::json!({})).unwrap();
        let signal = s
            .generate_signal(&ctx(105.0, (100.0, 95.0, 90.0), 75.0))
            .unwrap();

        assert_eq!(signal.action, SignalAction::Sell);
        assert!((signal.stop_loss.unwrap() - 107.1).abs() < 1e-9);
        assert!((signal.take_profit.unwrap() - 95.0).abs() < 1e-9);
        assert!(signal.confidence >= 0.5 && signal.confidence <= 1.0);
    }

    #[test]
    fn oversold_breakdown_buys() {
        let mut s = MeanReversionStrategy::from_params(&serde_json::json!({})).unwrap();
        let signal = s
            .generate_signal(&ctx(85.0, (100.0, 95.0, 90.0), 20.0))
            .unwrap();

        assert_eq!(signal.action, SignalAction::Buy);
        assert!((signal.stop_loss.unwrap() - 85.0 * 0.98).abs() < 1e-9);
        assert_eq!(signal.take_profit, Some(95.0));
    }

    #[test]
    fn inside_bands_holds() {
        let mut s = MeanReversionStrategy::from_params(&serde_json::json!({})).unwrap();
        let signal = s
            .generate_signal(&ctx(95.0, (100.0, 95.0, 90.0), 50.0))
            .unwrap();
        assert_eq!(signal.action, SignalAction::Hold);
    }

    #[test]
    fn overbought_price_without_band_break_holds() {
        let mut s = MeanReversionStrategy::from_params(&serde_json::json!({})).unwrap();
        // RSI hot but price still below upper band: no entry.
        let signal = s
            .generate_signal(&ctx(99.0, (100.0, 95.0, 90.0), 80.0))
            .unwrap();
        assert_eq!(signal.action, SignalAction::Hold);
    }

    #[test]
    fn long_position_exits_at_mean() {
        let mut s = MeanReversionStrategy::from_params(&serde_json::json!({})).unwrap();
        let entry = s
            .generate_signal(&ctx(85.0, (100.0, 95.0, 90.0), 20.0))
            .unwrap();
        assert_eq!(entry.action, SignalAction::Buy);

        // Price recovers to the middle band: take profit.
        let exit = s
            .generate_signal(&ctx(95.5, (100.0, 95.0, 90.0), 55.0))
            .unwrap();
        assert_eq!(exit.action, SignalAction::Sell);
        assert!(exit.reason.contains("mean"));

        // Flat again afterwards.
        let after = s
            .generate_signal(&ctx(95.5, (100.0, 95.0, 90.0), 55.0))
            .unwrap();
        assert_eq!(after.action, SignalAction::Hold);
    }

    #[test]
    fn long_position_exits_at_stop() {
        let mut s = MeanReversionStrategy::from_params(&serde_json::json!({})).unwrap();
        s.generate_signal(&ctx(85.0, (100.0, 95.0, 90.0), 20.0))
            .unwrap();

        // 2% below the 85.0 entry is 83.3.
        let exit = s
            .generate_signal(&ctx(83.0, (100.0, 95.0, 90.0), 15.0))
            .unwrap();
        assert_eq!(exit.action, SignalAction::Sell);
        assert!(exit.reason.contains("stop"));
    }

    #[test]
    fn confidence_grows_with_extremity() {
        let mut mild = MeanReversionStrategy::from_params(&serde_json::json!({})).unwrap();
        let mut wild = MeanReversionStrategy::from_params(&serde_json::json!({})).unwrap();

        let c_mild = mild
            .generate_signal(&ctx(100.5, (100.0, 95.0, 90.0), 71.0))
            .unwrap()
            .confidence;
        let c_wild = wild
            .generate_signal(&ctx(110.0, (100.0, 95.0, 90.0), 95.0))
            .unwrap()
            .confidence;
        assert!(c_wild > c_mild);
        assert!(c_wild <= 1.0);
    }

    #[test]
    fn invalid_params_are_rejected() {
        let err = MeanReversionStrategy::from_params(&serde_json::json!({
            "rsiOverbought": 30.0,
            "rsiOversold": 70.0,
        }))
        .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn missing_indicators_hold() {
        let mut s = MeanReversionStrategy::from_params(&serde_json::json!({})).unwrap();
        let mut bare = ctx(100.0, (100.0, 95.0, 90.0), 50.0);
        bare.indicators.bb = None;
        let signal = s.generate_signal(&bare).unwrap();
        assert_eq!(signal.action, SignalAction::Hold);
    }
}
