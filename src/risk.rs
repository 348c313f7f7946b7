// =============================================================================
// Risk Manager — pre-trade gating, circuit breaker, daily accounting
// =============================================================================
//
// `check_trade` runs the full check battery and returns a composite decision;
// the trade is allowed only when every check passes. Failures in the
// daily-limit, drawdown, or consecutive-loss families trip the per-user
// circuit breaker, which suspends that user's trading for a configured
// window (manually resettable).
//
// Daily statistics roll over at the local-day boundary on first access, with
// a double-checked write lock so concurrent accessors reset exactly once.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Local, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::RiskConfig;
use crate::event_bus::{EventBus, PublishOpts, SubscribeOpts};
use crate::types::{Pair, Side};

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// The intended trade under evaluation.
#[derive(Debug, Clone)]
pub struct TradeParams {
    pub pair: Pair,
    pub side: Side,
    pub amount: f64,
    pub price: f64,
    /// Price the strategy expected, for slippage measurement.
    pub expected_price: Option<f64>,
    /// Price actually executed (post-trade re-check), for slippage.
    pub executed_price: Option<f64>,
    /// Current market price, for deviation measurement.
    pub market_price: Option<f64>,
}

impl TradeParams {
    pub fn value(&self) -> f64 {
        self.amount * self.price
    }
}

/// Caller-supplied view of the user's portfolio at check time.
#[derive(Debug, Clone, Copy)]
pub struct PortfolioView {
    /// Total portfolio value (cash + positions).
    pub total_value: f64,
    /// Equity used for drawdown tracking.
    pub equity: f64,
    /// Value of all open positions.
    pub current_exposure: f64,
    /// Value already held in the trade's asset.
    pub asset_value: f64,
    /// Equity at the start of the day, the base for the daily-loss limit.
    pub initial_equity: f64,
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// One predicate's verdict.
#[derive(Debug, Clone, Serialize)]
pub struct RiskCheck {
    pub name: &'static str,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub metrics: serde_json::Value,
}

impl RiskCheck {
    fn pass(name: &'static str, metrics: serde_json::Value) -> Self {
        Self {
            name,
            allowed: true,
            reason: None,
            metrics,
        }
    }

    fn fail(name: &'static str, reason: String, metrics: serde_json::Value) -> Self {
        Self {
            name,
            allowed: false,
            reason: Some(reason),
            metrics,
        }
    }
}

/// Composite result of `check_trade`.
#[derive(Debug, Clone, Serialize)]
pub struct RiskDecision {
    pub allowed: bool,
    pub checks: Vec<RiskCheck>,
    pub failed_checks: Vec<String>,
}

/// Per-user circuit breaker state.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreaker {
    pub triggered_at: i64,
    pub duration_ms: i64,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DailyStats {
    pub date: String,
    pub trade_count: u32,
    pub volume: f64,
    pub fees: f64,
    pub realized_pnl: f64,
}

/// Snapshot of one user's risk state for the API.
#[derive(Debug, Clone, Serialize)]
pub struct RiskStateSnapshot {
    pub daily: DailyStats,
    pub last_trade_at: Option<i64>,
    pub peak_equity: f64,
    pub consecutive_losses: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreaker>,
}

#[derive(Debug, Default)]
struct UserRiskState {
    daily: DailyStats,
    last_trade_at: Option<i64>,
    peak_equity: f64,
    consecutive_losses: u32,
    circuit_breaker: Option<CircuitBreaker>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Check families whose failure trips the circuit breaker.
const BREAKER_FAMILIES: &[&str] = &["dailyLimits", "drawdown", "consecutiveLosses"];

pub struct RiskManager {
    config: RiskConfig,
    bus: Arc<EventBus>,
    users: RwLock<HashMap<String, UserRiskState>>,
}

impl RiskManager {
    pub fn new(config: RiskConfig, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            config,
            bus,
            users: RwLock::new(HashMap::new()),
        })
    }

    // -------------------------------------------------------------------------
    // Pre-trade gate
    // -------------------------------------------------------------------------

    /// Run every check and return the composite decision.
    ///
    /// Side effects: peak equity is updated, breaker-family failures trip the
    /// circuit breaker, and denials emit `risk:checkFailed`.
    pub async fn check_trade(
        &self,
        user_id: &str,
        trade: &TradeParams,
        portfolio: &PortfolioView,
    ) -> RiskDecision {
        self.maybe_reset_daily(user_id);
        let now = Utc::now().timestamp_millis();
        let cfg = &self.config;
        let trade_value = trade.value();

        let mut checks: Vec<RiskCheck> = Vec::with_capacity(12);

        // ── 1. Circuit breaker window ────────────────────────────────
        checks.push(self.check_circuit_breaker(user_id, now));

        {
            let users = self.users.read();
            let state = users.get(user_id);
            let daily = state.map(|s| s.daily.clone()).unwrap_or_default();
            let consecutive = state.map(|s| s.consecutive_losses).unwrap_or(0);
            let last_trade_at = state.and_then(|s| s.last_trade_at);

            // ── 2. Daily loss ────────────────────────────────────────
            let daily_loss = (-daily.realized_pnl.min(0.0)).abs();
            let loss_limit = portfolio.initial_equity * cfg.max_daily_loss;
            checks.push(if daily_loss >= loss_limit && loss_limit > 0.0 {
                RiskCheck::fail(
                    "dailyLimits",
                    format!("daily loss {daily_loss:.2} >= limit {loss_limit:.2}"),
                    json!({ "dailyLoss": daily_loss, "limit": loss_limit }),
                )
            } else {
                RiskCheck::pass(
                    "dailyLimits",
                    json!({ "dailyLoss": daily_loss, "limit": loss_limit }),
                )
            });

            // ── 3. Daily trade count ─────────────────────────────────
            checks.push(if daily.trade_count >= cfg.max_daily_trades {
                RiskCheck::fail(
                    "dailyTradeCount",
                    format!(
                        "daily trades {} >= limit {}",
                        daily.trade_count, cfg.max_daily_trades
                    ),
                    json!({ "tradeCount": daily.trade_count, "limit": cfg.max_daily_trades }),
                )
            } else {
                RiskCheck::pass(
                    "dailyTradeCount",
                    json!({ "tradeCount": daily.trade_count, "limit": cfg.max_daily_trades }),
                )
            });

            // ── 4. Daily volume ──────────────────────────────────────
            let projected = daily.volume + trade_value;
            checks.push(if projected > cfg.max_daily_volume {
                RiskCheck::fail(
                    "dailyVolume",
                    format!(
                        "projected daily volume {projected:.2} > limit {:.2}",
                        cfg.max_daily_volume
                    ),
                    json!({ "projected": projected, "limit": cfg.max_daily_volume }),
                )
            } else {
                RiskCheck::pass(
                    "dailyVolume",
                    json!({ "projected": projected, "limit": cfg.max_daily_volume }),
                )
            });

            // ── 5. Position size ─────────────────────────────────────
            let position_share = ratio(trade_value, portfolio.total_value);
            checks.push(if position_share > cfg.max_position_size {
                RiskCheck::fail(
                    "positionSize",
                    format!(
                        "trade is {:.1}% of portfolio (limit {:.1}%)",
                        position_share * 100.0,
                        cfg.max_position_size * 100.0
                    ),
                    json!({ "share": position_share, "limit": cfg.max_position_size }),
                )
            } else {
                RiskCheck::pass(
                    "positionSize",
                    json!({ "share": position_share, "limit": cfg.max_position_size }),
                )
            });

            // ── 6. Total exposure ────────────────────────────────────
            let exposure_share =
                ratio(portfolio.current_exposure + trade_value, portfolio.total_value);
            checks.push(if exposure_share > cfg.max_total_exposure {
                RiskCheck::fail(
                    "totalExposure",
                    format!(
                        "exposure would reach {:.1}% (limit {:.1}%)",
                        exposure_share * 100.0,
                        cfg.max_total_exposure * 100.0
                    ),
                    json!({ "share": exposure_share, "limit": cfg.max_total_exposure }),
                )
            } else {
                RiskCheck::pass(
                    "totalExposure",
                    json!({ "share": exposure_share, "limit": cfg.max_total_exposure }),
                )
            });

            // ── 7. Asset concentration ───────────────────────────────
            let concentration =
                ratio(portfolio.asset_value + trade_value, portfolio.total_value);
            checks.push(if concentration > cfg.max_concentration {
                RiskCheck::fail(
                    "concentration",
                    format!(
                        "{} would be {:.1}% of portfolio (limit {:.1}%)",
                        trade.pair.asset(),
                        concentration * 100.0,
                        cfg.max_concentration * 100.0
                    ),
                    json!({ "share": concentration, "limit": cfg.max_concentration }),
                )
            } else {
                RiskCheck::pass(
                    "concentration",
                    json!({ "share": concentration, "limit": cfg.max_concentration }),
                )
            });

            // ── 8. Cooldown ──────────────────────────────────────────
            let since_last = last_trade_at.map(|t| now - t);
            checks.push(match since_last {
                Some(elapsed) if elapsed < cfg.trade_cooldown_ms => RiskCheck::fail(
                    "cooldown",
                    format!(
                        "only {elapsed}ms since last trade (cooldown {}ms)",
                        cfg.trade_cooldown_ms
                    ),
                    json!({ "elapsedMs": elapsed, "cooldownMs": cfg.trade_cooldown_ms }),
                ),
                _ => RiskCheck::pass(
                    "cooldown",
                    json!({ "elapsedMs": since_last, "cooldownMs": cfg.trade_cooldown_ms }),
                ),
            });

            // ── 10a. Consecutive losses ──────────────────────────────
            checks.push(if consecutive >= cfg.max_consecutive_losses {
                RiskCheck::fail(
                    "consecutiveLosses",
                    format!(
                        "{consecutive} consecutive losses (limit {})",
                        cfg.max_consecutive_losses
                    ),
                    json!({ "losses": consecutive, "limit": cfg.max_consecutive_losses }),
                )
            } else {
                RiskCheck::pass(
                    "consecutiveLosses",
                    json!({ "losses": consecutive, "limit": cfg.max_consecutive_losses }),
                )
            });
        }

        // ── 9. Drawdown (updates the peak) ───────────────────────────
        checks.push(self.check_drawdown(user_id, portfolio.equity));

        // ── 10b. Slippage ────────────────────────────────────────────
        if let (Some(expected), Some(executed)) = (trade.expected_price, trade.executed_price) {
            let slippage_pct = ratio((executed - expected).abs(), expected.abs()) * 100.0;
            checks.push(if slippage_pct > cfg.max_slippage_pct {
                RiskCheck::fail(
                    "slippage",
                    format!(
                        "slippage {slippage_pct:.2}% > limit {:.2}%",
                        cfg.max_slippage_pct
                    ),
                    json!({ "slippagePct": slippage_pct, "limit": cfg.max_slippage_pct }),
                )
            } else {
                RiskCheck::pass(
                    "slippage",
                    json!({ "slippagePct": slippage_pct, "limit": cfg.max_slippage_pct }),
                )
            });
        }

        // ── 10c. Price deviation from market ─────────────────────────
        if let Some(market) = trade.market_price {
            let deviation_pct = ratio((trade.price - market).abs(), market.abs()) * 100.0;
            checks.push(if deviation_pct > cfg.max_price_deviation_pct {
                RiskCheck::fail(
                    "priceDeviation",
                    format!(
                        "price deviates {deviation_pct:.2}% from market (limit {:.2}%)",
                        cfg.max_price_deviation_pct
                    ),
                    json!({ "deviationPct": deviation_pct, "limit": cfg.max_price_deviation_pct }),
                )
            } else {
                RiskCheck::pass(
                    "priceDeviation",
                    json!({ "deviationPct": deviation_pct, "limit": cfg.max_price_deviation_pct }),
                )
            });
        }

        let failed_checks: Vec<String> = checks
            .iter()
            .filter(|c| !c.allowed)
            .map(|c| c.name.to_string())
            .collect();
        let allowed = failed_checks.is_empty();

        if !allowed {
            warn!(user_id, failed = ?failed_checks, "risk check denied trade");
            self.bus
                .publish(
                    "risk:checkFailed",
                    json!({
                        "userId": user_id,
                        "tradeParams": {
                            "pair": trade.pair.to_string(),
                            "side": trade.side.to_string(),
                            "amount": trade.amount,
                            "price": trade.price,
                        },
                        "failedChecks": failed_checks,
                        "ts": now,
                    }),
                    PublishOpts::default(),
                )
                .await;

            let breaker_reasons: Vec<String> = failed_checks
                .iter()
                .filter(|name| BREAKER_FAMILIES.contains(&name.as_str()))
                .cloned()
                .collect();
            if !breaker_reasons.is_empty() {
                self.trip_breaker(user_id, breaker_reasons).await;
            }
        }

        RiskDecision {
            allowed,
            checks,
            failed_checks,
        }
    }

    fn check_circuit_breaker(&self, user_id: &str, now: i64) -> RiskCheck {
        let mut users = self.users.write();
        let state = users.entry(user_id.to_string()).or_default();

        match &state.circuit_breaker {
            Some(cb) if now - cb.triggered_at < cb.duration_ms => {
                let remaining = cb.duration_ms - (now - cb.triggered_at);
                RiskCheck::fail(
                    "circuitBreaker",
                    format!("circuit breaker active for another {remaining}ms"),
                    json!({ "remainingMs": remaining, "reasons": cb.reasons }),
                )
            }
            Some(_) => {
                // Window elapsed: clear on access.
                state.circuit_breaker = None;
                debug!(user_id, "circuit breaker window elapsed — cleared");
                RiskCheck::pass("circuitBreaker", json!({ "active": false }))
            }
            None => RiskCheck::pass("circuitBreaker", json!({ "active": false })),
        }
    }

    fn check_drawdown(&self, user_id: &str, equity: f64) -> RiskCheck {
        let mut users = self.users.write();
        let state = users.entry(user_id.to_string()).or_default();

        if equity > state.peak_equity {
            state.peak_equity = equity;
        }
        let peak = state.peak_equity;
        let drawdown_pct = if peak > 0.0 {
            (peak - equity) / peak * 100.0
        } else {
            0.0
        };

        if drawdown_pct >= self.config.max_drawdown_pct {
            RiskCheck::fail(
                "drawdown",
                format!(
                    "drawdown {drawdown_pct:.2}% >= limit {:.2}%",
                    self.config.max_drawdown_pct
                ),
                json!({ "drawdownPct": drawdown_pct, "peak": peak, "equity": equity }),
            )
        } else {
            RiskCheck::pass(
                "drawdown",
                json!({ "drawdownPct": drawdown_pct, "peak": peak, "equity": equity }),
            )
        }
    }

    // -------------------------------------------------------------------------
    // Circuit breaker control
    // -------------------------------------------------------------------------

    async fn trip_breaker(&self, user_id: &str, reasons: Vec<String>) {
        let now = Utc::now().timestamp_millis();
        let duration_ms = self.config.circuit_breaker_duration_ms;
        {
            let mut users = self.users.write();
            let state = users.entry(user_id.to_string()).or_default();
            // An already-active breaker keeps its original window.
            if state
                .circuit_breaker
                .as_ref()
                .map(|cb| now - cb.triggered_at < cb.duration_ms)
                .unwrap_or(false)
            {
                return;
            }
            state.circuit_breaker = Some(CircuitBreaker {
                triggered_at: now,
                duration_ms,
                reasons: reasons.clone(),
            });
        }

        warn!(user_id, ?reasons, duration_ms, "circuit breaker tripped");
        self.bus
            .publish(
                "risk:circuitBreakerTriggered",
                json!({
                    "userId": user_id,
                    "reasons": reasons,
                    "duration": duration_ms,
                    "ts": now,
                }),
                PublishOpts::default(),
            )
            .await;
    }

    /// Operator override: clear the breaker immediately.
    pub async fn reset(&self, user_id: &str) {
        {
            let mut users = self.users.write();
            if let Some(state) = users.get_mut(user_id) {
                state.circuit_breaker = None;
            }
        }
        info!(user_id, "circuit breaker reset");
        self.bus
            .publish(
                "risk:circuitBreakerReset",
                json!({ "userId": user_id, "ts": Utc::now().timestamp_millis() }),
                PublishOpts::default(),
            )
            .await;
    }

    // -------------------------------------------------------------------------
    // Fill accounting
    // -------------------------------------------------------------------------

    /// Fold a completed fill into the user's daily stats and loss streak.
    pub fn record_fill(&self, user_id: &str, volume: f64, fee: f64, realized_pnl: f64) {
        self.maybe_reset_daily(user_id);
        let mut users = self.users.write();
        let state = users.entry(user_id.to_string()).or_default();

        state.daily.trade_count += 1;
        state.daily.volume += volume;
        state.daily.fees += fee;
        state.daily.realized_pnl += realized_pnl;
        state.last_trade_at = Some(Utc::now().timestamp_millis());

        if realized_pnl > 0.0 {
            state.consecutive_losses = 0;
        } else if realized_pnl < 0.0 {
            state.consecutive_losses += 1;
        }

        debug!(
            user_id,
            volume,
            fee,
            realized_pnl,
            trade_count = state.daily.trade_count,
            consecutive_losses = state.consecutive_losses,
            "fill recorded"
        );
    }

    /// Fold a realized trade result (from the position ledger) into the
    /// daily P&L and the loss streak.
    pub fn record_result(&self, user_id: &str, realized_pnl: f64) {
        self.maybe_reset_daily(user_id);
        let mut users = self.users.write();
        let state = users.entry(user_id.to_string()).or_default();
        state.daily.realized_pnl += realized_pnl;
        if realized_pnl > 0.0 {
            state.consecutive_losses = 0;
        } else if realized_pnl < 0.0 {
            state.consecutive_losses += 1;
        }
    }

    /// Subscribe the trade observer. `trading:orderFilled` drives the daily
    /// counters (count, volume, fees, plus realized P&L when the payload
    /// carries it); `trading:orderCompleted` folds in the realized result
    /// computed by the position ledger.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) {
        let manager = self.clone();
        bus.subscribe(
            "trading:orderFilled",
            EventBus::handler(move |data| {
                let manager = manager.clone();
                async move {
                    let user_id = data["userId"]
                        .as_str()
                        .ok_or_else(|| anyhow::anyhow!("orderFilled missing userId"))?
                        .to_string();
                    let volume = data["volume"].as_f64().unwrap_or(0.0);
                    let fee = data["fee"].as_f64().unwrap_or(0.0);
                    let realized = data["realizedPnl"].as_f64().unwrap_or(0.0);
                    manager.record_fill(&user_id, volume, fee, realized);
                    Ok(())
                }
            }),
            SubscribeOpts {
                // Accounting runs before any lower-priority reactions.
                priority: 10,
                once: false,
            },
        );

        let manager = self.clone();
        bus.subscribe(
            "trading:orderCompleted",
            EventBus::handler(move |data| {
                let manager = manager.clone();
                async move {
                    let user_id = data["userId"]
                        .as_str()
                        .ok_or_else(|| anyhow::anyhow!("orderCompleted missing userId"))?
                        .to_string();
                    let realized = data["realizedPnl"].as_f64().unwrap_or(0.0);
                    if realized != 0.0 {
                        manager.record_result(&user_id, realized);
                    }
                    Ok(())
                }
            }),
            SubscribeOpts {
                priority: 10,
                once: false,
            },
        );
    }

    // -------------------------------------------------------------------------
    // Snapshots & rollover
    // -------------------------------------------------------------------------

    pub fn state_snapshot(&self, user_id: &str) -> RiskStateSnapshot {
        self.maybe_reset_daily(user_id);
        let users = self.users.read();
        match users.get(user_id) {
            Some(state) => RiskStateSnapshot {
                daily: state.daily.clone(),
                last_trade_at: state.last_trade_at,
                peak_equity: state.peak_equity,
                consecutive_losses: state.consecutive_losses,
                circuit_breaker: state.circuit_breaker.clone(),
            },
            None => RiskStateSnapshot {
                daily: DailyStats {
                    date: local_date(),
                    ..Default::default()
                },
                last_trade_at: None,
                peak_equity: 0.0,
                consecutive_losses: 0,
                circuit_breaker: None,
            },
        }
    }

    /// Reset daily counters when the local date has rolled since last access.
    fn maybe_reset_daily(&self, user_id: &str) {
        let today = local_date();
        {
            let users = self.users.read();
            match users.get(user_id) {
                Some(state) if state.daily.date == today => return,
                None => {}
                Some(_) => {}
            }
        }
        let mut users = self.users.write();
        let state = users.entry(user_id.to_string()).or_default();
        // Double-check under the write lock.
        if state.daily.date != today {
            info!(user_id, date = %today, "daily risk counters reset");
            state.daily = DailyStats {
                date: today,
                ..Default::default()
            };
        }
    }
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskManager")
            .field("users", &self.users.read().len())
            .finish()
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

fn local_date() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn trade(amount: f64, price: f64) -> TradeParams {
        TradeParams {
            pair: Pair::new("BTC", "USDT"),
            side: Side::Buy,
            amount,
            price,
            expected_price: None,
            executed_price: None,
            market_price: None,
        }
    }

    fn portfolio() -> PortfolioView {
        PortfolioView {
            total_value: 100_000.0,
            equity: 100_000.0,
            current_exposure: 10_000.0,
            asset_value: 5_000.0,
            initial_equity: 100_000.0,
        }
    }

    fn manager() -> (Arc<EventBus>, Arc<RiskManager>) {
        let bus = Arc::new(EventBus::new());
        let manager = RiskManager::new(RiskConfig::default(), bus.clone());
        (bus, manager)
    }

    #[tokio::test]
    async fn clean_state_allows_a_reasonable_trade() {
        let (_bus, risk) = manager();
        let decision = risk
            .check_trade("alice", &trade(0.1, 50_000.0), &portfolio())
            .await;
        assert!(decision.allowed, "failed: {:?}", decision.failed_checks);
        assert!(decision.failed_checks.is_empty());
        assert!(decision.checks.len() >= 9);
    }

    #[tokio::test]
    async fn daily_loss_denies_and_trips_breaker() {
        let (_bus, risk) = manager();

        // Scenario: initialEquity 100k, maxDailyLoss 5% => limit 5000.
        risk.record_fill("alice", 10_000.0, 10.0, -5_100.0);

        let decision = risk
            .check_trade("alice", &trade(0.01, 50_000.0), &portfolio())
            .await;
        assert!(!decision.allowed);
        assert!(decision.failed_checks.contains(&"dailyLimits".to_string()));

        // The breaker is now armed: the next check fails on it directly.
        let second = risk
            .check_trade("alice", &trade(0.01, 50_000.0), &portfolio())
            .await;
        assert!(second
            .failed_checks
            .contains(&"circuitBreaker".to_string()));

        // Manual reset clears it (cooldown from record_fill has elapsed
        // logically, so only the loss check remains failing).
        risk.reset("alice").await;
        let snapshot = risk.state_snapshot("alice");
        assert!(snapshot.circuit_breaker.is_none());
    }

    #[tokio::test]
    async fn position_size_limit_denies_oversized_trades() {
        let (_bus, risk) = manager();
        // 30k on a 100k portfolio exceeds the 20% cap.
        let decision = risk
            .check_trade("bob", &trade(0.6, 50_000.0), &portfolio())
            .await;
        assert!(!decision.allowed);
        assert!(decision.failed_checks.contains(&"positionSize".to_string()));
    }

    #[tokio::test]
    async fn exposure_and_concentration_limits() {
        let (_bus, risk) = manager();
        let mut view = portfolio();
        view.current_exposure = 75_000.0;
        // 10k more would push exposure to 85% > 80%.
        let decision = risk.check_trade("bob", &trade(0.2, 50_000.0), &view).await;
        assert!(decision.failed_checks.contains(&"totalExposure".to_string()));

        let mut view = portfolio();
        view.asset_value = 35_000.0;
        // 10k more in BTC would be 45% > 40%.
        let decision = risk.check_trade("bob", &trade(0.2, 50_000.0), &view).await;
        assert!(decision.failed_checks.contains(&"concentration".to_string()));
    }

    #[tokio::test]
    async fn cooldown_applies_right_after_a_fill() {
        let (_bus, risk) = manager();
        risk.record_fill("carol", 100.0, 0.1, 1.0);

        let decision = risk
            .check_trade("carol", &trade(0.001, 50_000.0), &portfolio())
            .await;
        assert!(decision.failed_checks.contains(&"cooldown".to_string()));
    }

    #[tokio::test]
    async fn consecutive_losses_trip_after_limit() {
        let (_bus, risk) = manager();
        let mut view = portfolio();
        view.initial_equity = 10_000_000.0; // keep dailyLimits out of the way

        for _ in 0..5 {
            risk.record_fill("dave", 100.0, 0.1, -1.0);
        }
        // Cooldown would also fail here; look specifically for the streak.
        let decision = risk.check_trade("dave", &trade(0.001, 50_000.0), &view).await;
        assert!(decision
            .failed_checks
            .contains(&"consecutiveLosses".to_string()));

        // A win resets the streak.
        risk.reset("dave").await;
        risk.record_fill("dave", 100.0, 0.1, 5.0);
        assert_eq!(risk.state_snapshot("dave").consecutive_losses, 0);
    }

    #[tokio::test]
    async fn drawdown_tracks_peak_and_denies() {
        let (_bus, risk) = manager();

        // Establish a peak at 100k.
        risk.check_trade("erin", &trade(0.001, 50_000.0), &portfolio())
            .await;

        // Equity falls 12% from peak: beyond the 10% limit.
        let mut view = portfolio();
        view.equity = 88_000.0;
        let decision = risk.check_trade("erin", &trade(0.001, 50_000.0), &view).await;
        assert!(decision.failed_checks.contains(&"drawdown".to_string()));
    }

    #[tokio::test]
    async fn slippage_and_deviation_checks() {
        let (_bus, risk) = manager();

        let mut t = trade(0.001, 50_000.0);
        t.expected_price = Some(100.0);
        t.executed_price = Some(103.0); // 3% > 2% limit
        let decision = risk.check_trade("frank", &t, &portfolio()).await;
        assert!(decision.failed_checks.contains(&"slippage".to_string()));

        let mut t = trade(0.001, 106.0);
        t.market_price = Some(100.0); // 6% > 5% limit
        let decision = risk.check_trade("frank", &t, &portfolio()).await;
        assert!(decision
            .failed_checks
            .contains(&"priceDeviation".to_string()));
    }

    #[tokio::test]
    async fn check_is_idempotent_with_unchanged_state() {
        let (_bus, risk) = manager();
        let t = trade(0.1, 50_000.0);
        let view = portfolio();

        let first = risk.check_trade("gina", &t, &view).await;
        let second = risk.check_trade("gina", &t, &view).await;

        assert_eq!(first.allowed, second.allowed);
        assert_eq!(first.failed_checks, second.failed_checks);
        let names: Vec<_> = first.checks.iter().map(|c| c.name).collect();
        let names2: Vec<_> = second.checks.iter().map(|c| c.name).collect();
        assert_eq!(names, names2);
    }

    #[tokio::test]
    async fn fill_observer_updates_daily_stats_via_bus() {
        let (bus, risk) = manager();
        risk.attach(&bus);

        bus.publish(
            "trading:orderFilled",
            json!({
                "userId": "hank",
                "volume": 2_500.0,
                "fee": 2.5,
                "realizedPnl": -40.0,
            }),
            PublishOpts::default(),
        )
        .await;

        let snapshot = risk.state_snapshot("hank");
        assert_eq!(snapshot.daily.trade_count, 1);
        assert!((snapshot.daily.volume - 2_500.0).abs() < 1e-9);
        assert!((snapshot.daily.realized_pnl + 40.0).abs() < 1e-9);
        assert_eq!(snapshot.consecutive_losses, 1);
    }
}
