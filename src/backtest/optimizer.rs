// =============================================================================
// Walk-Forward Optimizer — grid search over train windows, scored on test
// =============================================================================
//
// The data is cut into `n_splits` equal slices; each split trains on a fixed
// `train_ratio` window and tests on the remainder, with the cursor advancing
// by the test size. Train windows therefore overlap across splits — the
// advance is deliberately smaller than the window so every regime is trained
// on more than once.
//
// Per split: every parameter combination is backtested on the train window,
// scored by the chosen metric, filtered by a minimum trade count, and the
// winner is re-run on the unseen test window. Aggregates compare train and
// test scores to flag overfitting.
// =============================================================================

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::engine::{BacktestEngine, BacktestSummary};
use crate::config::{BacktestConfig, OptimizerConfig};
use crate::error::{CoreError, CoreResult};
use crate::strategy::{build_strategy, StrategyKind};
use crate::types::{Candle, Pair};

/// Parameter grid: axis name → candidate values. Ordered so enumeration is
/// deterministic.
pub type ParamGrid = BTreeMap<String, Vec<Value>>;

/// Composite metric weights.
const COMPOSITE_SHARPE_W: f64 = 0.3;
const COMPOSITE_RETURN_W: f64 = 0.25;
const COMPOSITE_PROFIT_FACTOR_W: f64 = 0.2;
const COMPOSITE_WIN_RATE_W: f64 = 0.15;
const COMPOSITE_MAX_DD_W: f64 = -0.1;

/// Datasets smaller than this relax the min-trades filter to 1.
const SMALL_DATASET: usize = 100;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CombinationResult {
    pub params: Value,
    pub score: f64,
    pub trades: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitResult {
    pub split: usize,
    pub train_range: (usize, usize),
    pub test_range: (usize, usize),
    pub best_params: Value,
    pub train_score: f64,
    pub test_score: f64,
    pub test_summary: BacktestSummary,
    pub all_results: Vec<CombinationResult>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationAggregate {
    pub mean_train_score: f64,
    pub std_train_score: f64,
    pub mean_test_score: f64,
    pub std_test_score: f64,
    pub min_test_score: f64,
    pub max_test_score: f64,
    /// `max(0, 1 - σ_test / μ_test)` when `μ_test > 0`, else 0.
    pub consistency: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationReport {
    pub strategy_kind: StrategyKind,
    pub metric: String,
    pub splits: Vec<SplitResult>,
    pub aggregate: OptimizationAggregate,
    pub recommendations: Vec<String>,
}

// ---------------------------------------------------------------------------
// Split arithmetic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Split {
    pub train: (usize, usize),
    pub test: (usize, usize),
}

/// Walk-forward split boundaries over `n` bars.
///
/// `split = ⌊n / s⌋`, `train = ⌊split · ratio⌋`, `test = split − train`;
/// split `i` trains on `[i·test, i·test + train)` and tests on the following
/// `test` bars.
pub fn compute_splits(n: usize, n_splits: usize, train_ratio: f64) -> Vec<Split> {
    if n == 0 || n_splits == 0 {
        return Vec::new();
    }
    let split_size = n / n_splits;
    let train_size = (split_size as f64 * train_ratio).floor() as usize;
    let test_size = split_size - train_size;
    if train_size == 0 || test_size == 0 {
        return Vec::new();
    }

    (0..n_splits)
        .filter_map(|i| {
            let start = i * test_size;
            let train_end = start + train_size;
            let test_end = train_end + test_size;
            (test_end <= n).then_some(Split {
                train: (start, train_end),
                test: (train_end, test_end),
            })
        })
        .collect()
}

/// Cartesian product of the grid axes, in axis-name order.
pub fn enumerate_grid(grid: &ParamGrid) -> Vec<Value> {
    let mut combos: Vec<Map<String, Value>> = vec![Map::new()];
    for (axis, values) in grid {
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for value in values {
                let mut extended = combo.clone();
                extended.insert(axis.clone(), value.clone());
                next.push(extended);
            }
        }
        combos = next;
    }
    combos.into_iter().map(Value::Object).collect()
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Score a backtest summary by the named metric.
pub fn score_summary(metric: &str, summary: &BacktestSummary) -> CoreResult<f64> {
    let score = match metric {
        "sharpeRatio" => summary.sharpe_ratio,
        "totalReturn" => summary.total_return_pct,
        "profitFactor" => finite_or_zero(summary.profit_factor),
        "winRate" => summary.win_rate,
        "calmarRatio" => {
            if summary.max_drawdown_pct > 0.0 {
                summary.total_return_pct / summary.max_drawdown_pct
            } else {
                summary.total_return_pct
            }
        }
        "composite" => {
            COMPOSITE_SHARPE_W * summary.sharpe_ratio
                + COMPOSITE_RETURN_W * summary.total_return_pct
                + COMPOSITE_PROFIT_FACTOR_W * finite_or_zero(summary.profit_factor)
                + COMPOSITE_WIN_RATE_W * summary.win_rate
                + COMPOSITE_MAX_DD_W * summary.max_drawdown_pct
        }
        other => {
            return Err(CoreError::validation(format!(
                "unknown optimizer metric: {other}"
            )))
        }
    };
    Ok(score)
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Optimizer
// ---------------------------------------------------------------------------

pub struct WalkForwardOptimizer {
    config: OptimizerConfig,
    backtest: BacktestConfig,
}

impl WalkForwardOptimizer {
    pub fn new(config: OptimizerConfig, backtest: BacktestConfig) -> Self {
        Self { config, backtest }
    }

    /// Grid-search `kind` over `data` with walk-forward validation.
    pub fn optimize(
        &self,
        kind: StrategyKind,
        pair: &Pair,
        data: &[Candle],
        grid: &ParamGrid,
    ) -> CoreResult<OptimizationReport> {
        let combos = enumerate_grid(grid);
        if combos.is_empty() {
            return Err(CoreError::validation("parameter grid is empty"));
        }
        let splits = compute_splits(data.len(), self.config.n_splits, self.config.train_ratio);
        if splits.is_empty() {
            return Err(CoreError::validation(format!(
                "not enough data for {} walk-forward splits over {} bars",
                self.config.n_splits,
                data.len()
            )));
        }

        // Small datasets and degenerate grids relax the trade-count filter.
        let min_trades = if data.len() < SMALL_DATASET || combos.len() == 1 {
            1
        } else {
            self.config.min_trades
        };

        let engine = BacktestEngine::new(self.backtest.clone());
        let mut split_results: Vec<SplitResult> = Vec::with_capacity(splits.len());

        for (index, split) in splits.iter().enumerate() {
            let train_data = &data[split.train.0..split.train.1];
            let test_data = &data[split.test.0..split.test.1];

            let mut all_results: Vec<CombinationResult> = Vec::with_capacity(combos.len());
            let mut best: Option<(usize, f64)> = None;

            for (combo_index, params) in combos.iter().enumerate() {
                let mut strategy = build_strategy(kind, params)?;
                let report = engine.run(strategy.as_mut(), pair, train_data)?;
                let score = score_summary(&self.config.metric, &report.summary)?;
                let trades = report.summary.total_trades;

                all_results.push(CombinationResult {
                    params: params.clone(),
                    score,
                    trades,
                });

                if trades < min_trades {
                    continue;
                }
                if best.map_or(true, |(_, best_score)| score > best_score) {
                    best = Some((combo_index, score));
                }
            }

            // When every combination was filtered out, fall back to the raw
            // argmax so the split still reports something actionable.
            let (best_index, train_score) = best.unwrap_or_else(|| {
                all_results
                    .iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| {
                        a.score
                            .partial_cmp(&b.score)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|(i, r)| (i, r.score))
                    .expect("non-empty combos")
            });
            let best_params = combos[best_index].clone();

            let mut strategy = build_strategy(kind, &best_params)?;
            let test_report = engine.run(strategy.as_mut(), pair, test_data)?;
            let test_score = score_summary(&self.config.metric, &test_report.summary)?;

            debug!(
                split = index,
                train_score,
                test_score,
                best_params = %best_params,
                "walk-forward split evaluated"
            );

            split_results.push(SplitResult {
                split: index,
                train_range: split.train,
                test_range: split.test,
                best_params,
                train_score,
                test_score,
                test_summary: test_report.summary,
                all_results,
            });
        }

        let aggregate = aggregate(&split_results);
        let recommendations = self.recommend(&split_results, &aggregate, min_trades);

        info!(
            kind = %kind,
            splits = split_results.len(),
            combos = combos.len(),
            mean_test = aggregate.mean_test_score,
            "optimization finished"
        );

        Ok(OptimizationReport {
            strategy_kind: kind,
            metric: self.config.metric.clone(),
            splits: split_results,
            aggregate,
            recommendations,
        })
    }

    fn recommend(
        &self,
        splits: &[SplitResult],
        aggregate: &OptimizationAggregate,
        min_trades: usize,
    ) -> Vec<String> {
        let mut out = Vec::new();

        if aggregate.mean_train_score > 1.5 * aggregate.mean_test_score
            && aggregate.mean_test_score > 0.0
        {
            out.push(
                "possible overfit: train scores exceed test scores by more than 1.5x".to_string(),
            );
        }
        if aggregate.consistency < 0.5 {
            out.push(format!(
                "low consistency ({:.2}): test performance varies widely across splits",
                aggregate.consistency
            ));
        }
        let avg_test_trades = if splits.is_empty() {
            0.0
        } else {
            splits
                .iter()
                .map(|s| s.test_summary.total_trades as f64)
                .sum::<f64>()
                / splits.len() as f64
        };
        if avg_test_trades < min_trades as f64 {
            out.push(format!(
                "low trade frequency: {avg_test_trades:.1} trades per test window (minimum {min_trades})"
            ));
        }
        out
    }
}

impl std::fmt::Debug for WalkForwardOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalkForwardOptimizer")
            .field("config", &self.config)
            .finish()
    }
}

fn aggregate(splits: &[SplitResult]) -> OptimizationAggregate {
    let train: Vec<f64> = splits.iter().map(|s| s.train_score).collect();
    let test: Vec<f64> = splits.iter().map(|s| s.test_score).collect();

    let mean = |xs: &[f64]| {
        if xs.is_empty() {
            0.0
        } else {
            xs.iter().sum::<f64>() / xs.len() as f64
        }
    };
    let std = |xs: &[f64], mu: f64| {
        if xs.is_empty() {
            0.0
        } else {
            (xs.iter().map(|x| (x - mu).powi(2)).sum::<f64>() / xs.len() as f64).sqrt()
        }
    };

    let mean_train = mean(&train);
    let mean_test = mean(&test);
    let std_test = std(&test, mean_test);

    OptimizationAggregate {
        mean_train_score: mean_train,
        std_train_score: std(&train, mean_train),
        mean_test_score: mean_test,
        std_test_score: std_test,
        min_test_score: test.iter().copied().fold(f64::INFINITY, f64::min),
        max_test_score: test.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        consistency: if mean_test > 0.0 {
            (1.0 - std_test / mean_test).max(0.0)
        } else {
            0.0
        },
    }
}
