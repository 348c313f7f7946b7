// =============================================================================
// Strategy Runtime — contract, factory, lifecycle
// =============================================================================
//
// A strategy is a pure decision function over a market context plus whatever
// internal state it needs (grid levels, trailing watermarks). Strategies are
// built by the factory from a kind tag and a JSON parameter object; the same
// factory path serves live trading, backtesting, and the optimizer's grid
// enumeration.
// =============================================================================

pub mod context;
pub mod grid;
pub mod mean_reversion;
pub mod momentum;
pub mod scheduler;

pub use context::{IndicatorSet, MarketCtx};
pub use scheduler::StrategyScheduler;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{CoreError, CoreResult};
use crate::types::Signal;

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// The strategy contract shared by live execution, backtest, and optimizer.
pub trait Strategy: Send {
    /// Evaluate the market context and return an intent. Errors isolate the
    /// strategy (scheduler moves it to `Error` status) without stalling the
    /// tick.
    fn generate_signal(&mut self, ctx: &MarketCtx) -> CoreResult<Signal>;

    /// Apply a new parameter object, replacing current values.
    fn update_params(&mut self, params: &Value) -> CoreResult<()>;

    /// Current kind + parameters, for persistence and the API.
    fn config(&self) -> StrategyDescriptor;
}

/// Kind + parameters snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyDescriptor {
    pub kind: StrategyKind,
    pub params: Value,
}

// ---------------------------------------------------------------------------
// Kinds & factory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    MeanReversion,
    Momentum,
    Grid,
}

impl StrategyKind {
    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "mean_reversion" => Ok(Self::MeanReversion),
            "momentum" => Ok(Self::Momentum),
            "grid" => Ok(Self::Grid),
            other => Err(CoreError::validation(format!(
                "unknown strategy kind: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MeanReversion => "mean_reversion",
            Self::Momentum => "momentum",
            Self::Grid => "grid",
        };
        write!(f, "{s}")
    }
}

/// Build a strategy instance from its kind and parameter object.
pub fn build_strategy(kind: StrategyKind, params: &Value) -> CoreResult<Box<dyn Strategy>> {
    match kind {
        StrategyKind::MeanReversion => Ok(Box::new(
            mean_reversion::MeanReversionStrategy::from_params(params)?,
        )),
        StrategyKind::Momentum => Ok(Box::new(momentum::MomentumStrategy::from_params(params)?)),
        StrategyKind::Grid => Ok(Box::new(grid::GridStrategy::from_params(params)?)),
    }
}

/// Parameter schema for a kind: name → {default, min, max}. The optimizer
/// validates grid axes against this and the API serves it to clients.
pub fn param_schema(kind: StrategyKind) -> Value {
    match kind {
        StrategyKind::MeanReversion => json!({
            "rsiOverbought": { "default": 70.0, "min": 50.0, "max": 95.0 },
            "rsiOversold": { "default": 30.0, "min": 5.0, "max": 50.0 },
            "stopLossPct": { "default": 0.02, "min": 0.001, "max": 0.2 },
            "takeProfitAtMean": { "default": true },
            "amountFraction": { "default": 0.1, "min": 0.01, "max": 1.0 },
        }),
        StrategyKind::Momentum => json!({
            "macdThreshold": { "default": 0.0, "min": -10.0, "max": 10.0 },
            "minTrendStrength": { "default": 0.3, "min": 0.0, "max": 1.0 },
            "trailingStopPct": { "default": 0.02, "min": 0.001, "max": 0.2 },
            "amountFraction": { "default": 0.1, "min": 0.01, "max": 1.0 },
        }),
        StrategyKind::Grid => json!({
            "gridLevels": { "default": 10, "min": 2, "max": 100 },
            "gridSpacingPct": { "default": 0.01, "min": 0.0005, "max": 0.2 },
            "rebalanceThreshold": { "default": 0.5, "min": 0.1, "max": 1.0 },
            "amountPerLevel": { "default": 0.05, "min": 0.001, "max": 1.0 },
        }),
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Strategy lifecycle status.
///
/// `Error` is terminal until the strategy is deactivated and re-activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyStatus {
    Inactive,
    Active,
    Paused,
    Error,
}

impl StrategyStatus {
    /// Legal transitions of the lifecycle machine.
    pub fn can_transition(self, to: StrategyStatus) -> bool {
        use StrategyStatus::*;
        matches!(
            (self, to),
            (Inactive, Active)
                | (Active, Paused)
                | (Active, Inactive)
                | (Active, Error)
                | (Paused, Active)
                | (Paused, Inactive)
                | (Error, Inactive)
        )
    }
}

impl std::fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Aggregate performance counters for one strategy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyPerformance {
    pub signals: u64,
    pub trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub realized_pnl: f64,
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips() {
        for kind in [
            StrategyKind::MeanReversion,
            StrategyKind::Momentum,
            StrategyKind::Grid,
        ] {
            assert_eq!(StrategyKind::parse(&kind.to_string()).unwrap(), kind);
        }
        assert!(StrategyKind::parse("martingale").is_err());
    }

    #[test]
    fn factory_builds_every_kind_with_defaults() {
        for kind in [
            StrategyKind::MeanReversion,
            StrategyKind::Momentum,
            StrategyKind::Grid,
        ] {
            let strategy = build_strategy(kind, &json!({})).unwrap();
            assert_eq!(strategy.config().kind, kind);
        }
    }

    #[test]
    fn status_machine_matches_lifecycle() {
        use StrategyStatus::*;
        assert!(Inactive.can_transition(Active));
        assert!(Active.can_transition(Paused));
        assert!(Active.can_transition(Error));
        assert!(Paused.can_transition(Active));
        assert!(Error.can_transition(Inactive));

        // Error is terminal until reset through Inactive.
        assert!(!Error.can_transition(Active));
        assert!(!Inactive.can_transition(Paused));
        assert!(!Paused.can_transition(Error));
    }

    #[test]
    fn schema_covers_every_kind() {
        for kind in [
            StrategyKind::MeanReversion,
            StrategyKind::Momentum,
            StrategyKind::Grid,
        ] {
            assert!(param_schema(kind).is_object());
        }
    }
}
