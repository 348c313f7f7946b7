// =============================================================================
// Grid Strategy — symmetric limit ladder around a moving center
// =============================================================================
//
// N levels sit `spacing%` apart around the center price: N/2 buys below, N/2
// sells above. When price crosses a pending level the level fills and the
// adjacent level (one step toward where price went) re-arms on the opposite
// side, harvesting oscillation. The whole ladder recenters when price walks
// `rebalance_threshold` of the grid range away from center, at most once per
// five minutes.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{MarketCtx, Strategy, StrategyDescriptor, StrategyKind};
use crate::error::{CoreError, CoreResult};
use crate::types::{Side, Signal, SignalAction};

/// Minimum interval between grid rebalances.
const REBALANCE_MIN_INTERVAL_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GridParams {
    /// Total level count; half buys below center, half sells above.
    pub grid_levels: usize,
    /// Distance between adjacent levels, as a fraction of center.
    pub grid_spacing_pct: f64,
    /// Fraction of the grid range price must travel to trigger a recenter.
    pub rebalance_threshold: f64,
    /// Order size per level, as a fraction of balance.
    pub amount_per_level: f64,
    /// Optional fixed initial center; defaults to first observed price.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub center_price: Option<f64>,
}

impl Default for GridParams {
    fn default() -> Self {
        Self {
            grid_levels: 10,
            grid_spacing_pct: 0.01,
            rebalance_threshold: 0.5,
            amount_per_level: 0.05,
            center_price: None,
        }
    }
}

impl GridParams {
    fn validate(&self) -> CoreResult<()> {
        if self.grid_levels < 2 || self.grid_levels % 2 != 0 {
            return Err(CoreError::validation("gridLevels must be even and >= 2"));
        }
        if self.grid_spacing_pct <= 0.0 || self.grid_spacing_pct >= 1.0 {
            return Err(CoreError::validation("gridSpacingPct must be in (0, 1)"));
        }
        if self.rebalance_threshold <= 0.0 || self.rebalance_threshold > 1.0 {
            return Err(CoreError::validation("rebalanceThreshold must be in (0, 1]"));
        }
        if self.amount_per_level <= 0.0 || self.amount_per_level > 1.0 {
            return Err(CoreError::validation("amountPerLevel must be in (0, 1]"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct GridLevel {
    price: f64,
    side: Side,
    pending: bool,
}

#[derive(Debug)]
pub struct GridStrategy {
    params: GridParams,
    center: Option<f64>,
    /// Levels sorted ascending by price.
    levels: Vec<GridLevel>,
    last_rebalance_ms: i64,
}

impl GridStrategy {
    pub fn from_params(params: &Value) -> CoreResult<Self> {
        let params: GridParams = serde_json::from_value(params.clone())
            .map_err(|e| CoreError::validation(format!("bad grid params: {e}")))?;
        params.validate()?;
        Ok(Self {
            params,
            center: None,
            levels: Vec::new(),
            last_rebalance_ms: 0,
        })
    }

    fn build_levels(&mut self, center: f64) {
        let half = self.params.grid_levels / 2;
        let spacing = self.params.grid_spacing_pct;
        let mut levels = Vec::with_capacity(self.params.grid_levels);

        for k in (1..=half).rev() {
            levels.push(GridLevel {
                price: center * (1.0 - spacing * k as f64),
                side: Side::Buy,
                pending: true,
            });
        }
        for k in 1..=half {
            levels.push(GridLevel {
                price: center * (1.0 + spacing * k as f64),
                side: Side::Sell,
                pending: true,
            });
        }

        self.center = Some(center);
        self.levels = levels;
    }

    fn grid_range(&self) -> f64 {
        match (self.levels.first(), self.levels.last()) {
            (Some(lo), Some(hi)) => hi.price - lo.price,
            _ => 0.0,
        }
    }

    /// Index of the pending level `price` has crossed, preferring the level
    /// closest to the current price.
    fn crossed_level(&self, price: f64) -> Option<usize> {
        self.levels
            .iter()
            .enumerate()
            .filter(|(_, level)| {
                level.pending
                    && match level.side {
                        Side::Buy => price <= level.price,
                        Side::Sell => price >= level.price,
                    }
            })
            .min_by(|(_, a), (_, b)| {
                (a.price - price)
                    .abs()
                    .partial_cmp(&(b.price - price).abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i)
    }
}

impl Strategy for GridStrategy {
    fn generate_signal(&mut self, ctx: &MarketCtx) -> CoreResult<Signal> {
        let price = ctx.price;
        if price <= 0.0 {
            return Ok(Signal::hold(price, "no price"));
        }

        let Some(center) = self.center else {
            let center = self.params.center_price.unwrap_or(price);
            self.build_levels(center);
            self.last_rebalance_ms = ctx.timestamp;
            return Ok(Signal::hold(
                price,
                format!("grid initialized around {center:.2}"),
            ));
        };

        // Recenter when price has walked far enough from center, throttled.
        let range = self.grid_range();
        if range > 0.0
            && (price - center).abs() >= self.params.rebalance_threshold * range
            && ctx.timestamp - self.last_rebalance_ms >= REBALANCE_MIN_INTERVAL_MS
        {
            self.build_levels(price);
            self.last_rebalance_ms = ctx.timestamp;
            return Ok(Signal::hold(
                price,
                format!("grid rebalanced from {center:.2} to {price:.2}"),
            ));
        }

        let Some(idx) = self.crossed_level(price) else {
            return Ok(Signal::hold(price, "no level crossed"));
        };

        let level = self.levels[idx];
        self.levels[idx].pending = false;

        // Re-arm the adjacent level on the opposite side: one step up after a
        // buy fill, one step down after a sell fill.
        let adjacent = match level.side {
            Side::Buy => idx.checked_add(1).filter(|&i| i < self.levels.len()),
            Side::Sell => idx.checked_sub(1),
        };
        if let Some(adj) = adjacent {
            self.levels[adj].side = level.side.flipped();
            self.levels[adj].pending = true;
        }

        Ok(Signal {
            action: match level.side {
                Side::Buy => SignalAction::Buy,
                Side::Sell => SignalAction::Sell,
            },
            confidence: 0.7,
            price: level.price,
            amount: self.params.amount_per_level,
            reason: format!(
                "grid {} level {:.2} crossed at {price:.2}",
                level.side, level.price
            ),
            stop_loss: None,
            take_profit: None,
            trailing_stop: None,
        })
    }

    fn update_params(&mut self, params: &Value) -> CoreResult<()> {
        let parsed: GridParams = serde_json::from_value(params.clone())
            .map_err(|e| CoreError::validation(format!("bad grid params: {e}")))?;
        parsed.validate()?;
        self.params = parsed;
        // A new geometry invalidates the ladder; rebuild on next tick.
        self.center = None;
        self.levels.clear();
        Ok(())
    }

    fn config(&self) -> StrategyDescriptor {
        StrategyDescriptor {
            kind: StrategyKind::Grid,
            params: serde_json::to_value(&self.params).unwrap_or_default(),
        }
    }
}
