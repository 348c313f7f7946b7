// =============================================================================
// Trading Coordinator — signal → risk → orders → positions, over the bus
// =============================================================================
//
// The coordinator holds capability handles to its siblings and wires them
// together with bus subscriptions; no component holds a reference back to it.
//
//   trading:strategySignal        -> risk gate -> order creation
//   trading:orderFilled           -> position ledger + strategy performance
//                                    -> trading:orderCompleted
//   risk:circuitBreakerTriggered  -> halt the user's strategies and orders
//
// Signals are only routed into live order creation when the engine trading
// mode is Live; the engine boots Paused.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::event_bus::{EventBus, PublishOpts, SubscribeOpts};
use crate::market_data::MarketAggregator;
use crate::orders::{NewOrderRequest, OrderManager, OrderType, TimeInForce};
use crate::positions::{Fill, PositionManager};
use crate::risk::{PortfolioView, RiskManager, TradeParams};
use crate::strategy::StrategyScheduler;
use crate::types::{Pair, Side, SignalAction, TradingMode};

pub struct TradingCoordinator {
    bus: Arc<EventBus>,
    config: Arc<RwLock<EngineConfig>>,
    risk: Arc<RiskManager>,
    orders: Arc<OrderManager>,
    positions: Arc<PositionManager>,
    strategies: Arc<StrategyScheduler>,
    aggregator: Arc<MarketAggregator>,
    /// Per-order count of fills already folded into positions, so repeated
    /// fill events never double-book.
    processed_fills: Mutex<HashMap<String, usize>>,
}

impl TradingCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<EventBus>,
        config: Arc<RwLock<EngineConfig>>,
        risk: Arc<RiskManager>,
        orders: Arc<OrderManager>,
        positions: Arc<PositionManager>,
        strategies: Arc<StrategyScheduler>,
        aggregator: Arc<MarketAggregator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            config,
            risk,
            orders,
            positions,
            strategies,
            aggregator,
            processed_fills: Mutex::new(HashMap::new()),
        })
    }

    /// Wire all subscriptions. Call once at startup.
    pub fn attach(self: &Arc<Self>) {
        let coordinator = self.clone();
        self.bus.subscribe(
            "trading:strategySignal",
            EventBus::handler(move |data| {
                let coordinator = coordinator.clone();
                async move { coordinator.on_strategy_signal(data).await }
            }),
            SubscribeOpts::default(),
        );

        let coordinator = self.clone();
        self.bus.subscribe(
            "trading:orderFilled",
            EventBus::handler(move |data| {
                let coordinator = coordinator.clone();
                async move { coordinator.on_order_filled(data).await }
            }),
            SubscribeOpts::default(),
        );

        let coordinator = self.clone();
        self.bus.subscribe(
            "risk:circuitBreakerTriggered",
            EventBus::handler(move |data| {
                let coordinator = coordinator.clone();
                async move { coordinator.on_circuit_breaker(data).await }
            }),
            SubscribeOpts::default(),
        );

        info!("trading coordinator attached to bus");
    }

    // -------------------------------------------------------------------------
    // Signal routing
    // -------------------------------------------------------------------------

    async fn on_strategy_signal(&self, data: Value) -> anyhow::Result<()> {
        let user_id = data["userId"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("strategySignal missing userId"))?
            .to_string();
        let strategy_id = data["strategyId"].as_str().unwrap_or_default().to_string();
        let signal = &data["signal"];

        let action = match signal["action"].as_str() {
            Some("buy") => SignalAction::Buy,
            Some("sell") => SignalAction::Sell,
            _ => return Ok(()),
        };
        let price = signal["price"].as_f64().unwrap_or(0.0);
        let amount = signal["amount"].as_f64().unwrap_or(0.0);
        if price <= 0.0 || amount <= 0.0 {
            return Ok(());
        }

        if self.config.read().trading_mode != TradingMode::Live {
            self.block_signal(signal, "trading paused").await;
            return Ok(());
        }

        let record = self.strategies.get(&strategy_id).await?;
        let pair = record.pair.clone();
        let exchange = record.exchange.clone();
        let side = match action {
            SignalAction::Buy => Side::Buy,
            SignalAction::Sell => Side::Sell,
            SignalAction::Hold => unreachable!(),
        };

        // Fractional amounts size off current equity, like the backtester.
        let view = self.portfolio_view(&user_id, pair.asset());
        let shares = if amount <= 1.0 {
            view.equity * amount / price
        } else {
            amount
        };

        let market_price = self.aggregator.last_aggregated(&pair).map(|a| a.vwap);
        let trade = TradeParams {
            pair: pair.clone(),
            side,
            amount: shares,
            price,
            expected_price: Some(price),
            executed_price: None,
            market_price,
        };

        let decision = self.risk.check_trade(&user_id, &trade, &view).await;
        if !decision.allowed {
            self.block_signal(
                signal,
                &format!("risk denied: {}", decision.failed_checks.join(", ")),
            )
            .await;
            return Ok(());
        }

        let request = NewOrderRequest {
            user_id: user_id.clone(),
            exchange,
            pair: pair.to_string(),
            order_type: OrderType::Limit,
            side,
            amount: round_amount(shares),
            price: Some(price),
            stop_price: None,
            tif: TimeInForce::Gtc,
            strategy_id: Some(strategy_id.clone()),
            reference_price: market_price.or(Some(price)),
        };

        match self.orders.create_order(&request).await {
            Ok(ack) => {
                info!(
                    order_id = %ack.order.id,
                    strategy_id = %strategy_id,
                    user_id = %user_id,
                    side = %side,
                    "signal routed to order"
                );
            }
            Err(e) => {
                warn!(strategy_id = %strategy_id, error = %e, "order creation failed");
                self.block_signal(signal, &format!("order rejected: {e}")).await;
            }
        }
        Ok(())
    }

    async fn block_signal(&self, signal: &Value, reason: &str) {
        self.bus
            .publish(
                "trading:signalBlocked",
                json!({ "signal": signal, "reason": reason }),
                PublishOpts::default(),
            )
            .await;
    }

    // -------------------------------------------------------------------------
    // Fill routing
    // -------------------------------------------------------------------------

    async fn on_order_filled(&self, data: Value) -> anyhow::Result<()> {
        let order = &data["order"];
        let order_id = order["id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("orderFilled missing order.id"))?
            .to_string();
        let user_id = order["user_id"].as_str().unwrap_or_default().to_string();
        let exchange = order["exchange"].as_str().unwrap_or_default().to_string();
        let side = match order["side"].as_str() {
            Some("sell") => Side::Sell,
            _ => Side::Buy,
        };
        let pair: Pair = match order["pair"]["base"].as_str() {
            Some(base) => Pair::new(
                base,
                order["pair"]["quote"].as_str().unwrap_or("USDT"),
            ),
            None => return Ok(()),
        };
        let trades = order["trades"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        // Only fold in fills not seen on earlier partial-fill events.
        let start = {
            let mut processed = self.processed_fills.lock();
            let seen = processed.entry(order_id.clone()).or_insert(0);
            let start = *seen;
            *seen = trades.len();
            start
        };

        let mut realized_total = 0.0;
        for trade in &trades[start..] {
            let fill = Fill {
                trade_id: trade["trade_id"].as_str().unwrap_or_default().to_string(),
                asset: pair.asset().to_string(),
                side,
                amount: trade["amount"].as_f64().unwrap_or(0.0),
                price: trade["price"].as_f64().unwrap_or(0.0),
                fee: trade["fee"].as_f64().unwrap_or(0.0),
                ts: trade["ts"].as_i64().unwrap_or(0),
            };
            match self.positions.update_from_trade(&user_id, &exchange, &fill) {
                Ok(realized) => realized_total += realized,
                Err(e) => warn!(order_id = %order_id, error = %e, "position update failed"),
            }
        }

        if let Some(strategy_id) = order["strategy_id"].as_str() {
            if let Err(e) = self.strategies.record_trade(strategy_id, realized_total).await {
                warn!(strategy_id, error = %e, "strategy performance update failed");
            }
        }

        self.bus
            .publish(
                "trading:orderCompleted",
                json!({
                    "orderId": order_id,
                    "userId": user_id,
                    "realizedPnl": realized_total,
                    "strategyId": order["strategy_id"],
                }),
                PublishOpts::default(),
            )
            .await;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Circuit breaker response
    // -------------------------------------------------------------------------

    async fn on_circuit_breaker(&self, data: Value) -> anyhow::Result<()> {
        let user_id = data["userId"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("circuitBreakerTriggered missing userId"))?
            .to_string();

        let active = self.strategies.active_ids_for_user(&user_id).await;
        for id in &active {
            if let Err(e) = self.strategies.deactivate(id).await {
                warn!(strategy_id = %id, error = %e, "deactivation failed");
            }
        }
        let cancelled = self.orders.cancel_all_for_user(&user_id).await;

        warn!(
            user_id = %user_id,
            strategies_halted = active.len(),
            orders_cancelled = cancelled.len(),
            "circuit breaker response complete"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Portfolio view
    // -------------------------------------------------------------------------

    /// Value the user's book at aggregated marks. Equity is the configured
    /// baseline plus realized and unrealized P&L.
    fn portfolio_view(&self, user_id: &str, asset: &str) -> PortfolioView {
        let baseline = self.config.read().backtest.initial_balance;
        let positions = self.positions.user_positions(user_id);

        let mut exposure = 0.0;
        let mut realized = 0.0;
        let mut unrealized = 0.0;
        let mut by_asset: HashMap<String, f64> = HashMap::new();

        for pos in &positions {
            let mark = self
                .aggregator
                .last_aggregated(&Pair::new(pos.asset.clone(), "USDT"))
                .map(|a| a.vwap)
                .unwrap_or(pos.average_entry_price);
            let value = pos.total_amount * mark;
            exposure += value;
            realized += pos.realized_pnl;
            if pos.total_amount > 0.0 {
                unrealized += value - pos.total_cost;
            }
            *by_asset.entry(pos.asset.clone()).or_insert(0.0) += value;
        }

        let equity = baseline + realized + unrealized;
        PortfolioView {
            total_value: equity.max(0.0),
            equity,
            current_exposure: exposure,
            asset_value: by_asset.get(asset).copied().unwrap_or(0.0),
            initial_equity: baseline,
        }
    }
}

impl std::fmt::Debug for TradingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingCoordinator").finish()
    }
}

fn round_amount(amount: f64) -> f64 {
    (amount * 1e8).round() / 1e8
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use crate::config::RiskConfig;
    use crate::exchange::SimulatedVenue;
    use crate::orders::OrderValidator;
    use crate::strategy::StrategyKind;
    use std::time::Duration;

    struct Harness {
        bus: Arc<EventBus>,
        config: Arc<RwLock<EngineConfig>>,
        coordinator: Arc<TradingCoordinator>,
        strategies: Arc<StrategyScheduler>,
        orders: Arc<OrderManager>,
        positions: Arc<PositionManager>,
    }

    async fn harness() -> Harness {
        let bus = Arc::new(EventBus::new());
        let cache = Arc::new(TtlCache::new());
        let mut engine_config = EngineConfig::default();
        engine_config.trading_mode = TradingMode::Live;
        // Keep cooldown out of the way for the happy-path tests.
        engine_config.risk = RiskConfig {
            trade_cooldown_ms: 0,
            ..RiskConfig::default()
        };
        let config = Arc::new(RwLock::new(engine_config));

        let aggregator = MarketAggregator::new(bus.clone(), cache.clone());
        let risk = RiskManager::new(config.read().risk.clone(), bus.clone());
        risk.attach(&bus);
        let (orders, queue_rx) = OrderManager::new(
            OrderValidator::default(),
            Arc::new(SimulatedVenue::new(0.001)),
            cache.clone(),
            bus.clone(),
        );
        tokio::spawn(orders.clone().run_worker(queue_rx));
        let positions = PositionManager::new();
        let strategies = StrategyScheduler::new(bus.clone(), aggregator.clone(), 100);

        let coordinator = TradingCoordinator::new(
            bus.clone(),
            config.clone(),
            risk,
            orders.clone(),
            positions.clone(),
            strategies.clone(),
            aggregator,
        );
        coordinator.attach();

        Harness {
            bus,
            config,
            coordinator,
            strategies,
            orders,
            positions,
        }
    }

    fn signal_payload(strategy_id: &str, action: &str, price: f64, amount: f64) -> Value {
        json!({
            "strategyId": strategy_id,
            "userId": "alice",
            "signal": {
                "action": action,
                "confidence": 0.8,
                "price": price,
                "amount": amount,
                "reason": "test",
            },
            "ts": 1_700_000_000_000i64,
        })
    }

    #[tokio::test]
    async fn signal_flows_to_order_and_position() {
        let h = harness().await;
        let record = h
            .strategies
            .create(
                "alice",
                StrategyKind::Momentum,
                Pair::new("BTC", "USDT"),
                "binance",
                json!({}),
            )
            .unwrap();

        let completed = {
            let bus = h.bus.clone();
            tokio::spawn(async move {
                bus.wait_for("trading:orderCompleted", Duration::from_secs(2), None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Buy 2% of a 10k equity at 100: 2 units.
        h.bus
            .publish(
                "trading:strategySignal",
                signal_payload(&record.id, "buy", 100.0, 0.02),
                PublishOpts::default(),
            )
            .await;

        let done = completed.await.unwrap().expect("orderCompleted expected");
        assert_eq!(done["userId"], "alice");

        let position = h
            .positions
            .get_position("alice", "binance", "BTC")
            .expect("position opened");
        assert!((position.total_amount - 2.0).abs() < 1e-9);

        // Strategy performance recorded the trade.
        let updated = h.strategies.get(&record.id).await.unwrap();
        assert_eq!(updated.performance.trades, 1);
    }

    #[tokio::test]
    async fn paused_engine_blocks_signals() {
        let h = harness().await;
        h.config.write().trading_mode = TradingMode::Paused;
        let record = h
            .strategies
            .create(
                "alice",
                StrategyKind::Grid,
                Pair::new("BTC", "USDT"),
                "binance",
                json!({}),
            )
            .unwrap();

        let blocked = {
            let bus = h.bus.clone();
            tokio::spawn(async move {
                bus.wait_for("trading:signalBlocked", Duration::from_secs(2), None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.bus
            .publish(
                "trading:strategySignal",
                signal_payload(&record.id, "buy", 100.0, 0.05),
                PublishOpts::default(),
            )
            .await;

        let event = blocked.await.unwrap().expect("signalBlocked expected");
        assert_eq!(event["reason"], "trading paused");
        assert!(h.orders.user_orders("alice", &Default::default()).is_empty());
    }

    #[tokio::test]
    async fn oversized_signal_is_risk_blocked() {
        let h = harness().await;
        let record = h
            .strategies
            .create(
                "alice",
                StrategyKind::Momentum,
                Pair::new("BTC", "USDT"),
                "binance",
                json!({}),
            )
            .unwrap();

        let blocked = {
            let bus = h.bus.clone();
            tokio::spawn(async move {
                bus.wait_for("trading:signalBlocked", Duration::from_secs(2), None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The full balance in one trade breaches maxPositionSize (20%).
        h.bus
            .publish(
                "trading:strategySignal",
                signal_payload(&record.id, "buy", 100.0, 1.0),
                PublishOpts::default(),
            )
            .await;

        let event = blocked.await.unwrap().expect("signalBlocked expected");
        let reason = event["reason"].as_str().unwrap();
        assert!(reason.contains("positionSize"), "reason: {reason}");
    }

    #[tokio::test]
    async fn breaker_halts_strategies_and_cancels_orders() {
        let h = harness().await;
        let record = h
            .strategies
            .create(
                "alice",
                StrategyKind::Grid,
                Pair::new("BTC", "USDT"),
                "binance",
                json!({}),
            )
            .unwrap();
        h.strategies.activate(&record.id).await.unwrap();

        // Park an open order for alice (never processed: no worker poke
        // needed since cancel hits it while pending).
        let ack = h
            .orders
            .create_order(&NewOrderRequest {
                user_id: "alice".into(),
                exchange: "binance".into(),
                pair: "ETH/USDT".into(),
                order_type: OrderType::Limit,
                side: Side::Buy,
                amount: 1.0,
                price: Some(10.0),
                stop_price: None,
                tif: TimeInForce::Gtc,
                strategy_id: None,
                reference_price: None,
            })
            .await
            .unwrap();

        h.bus
            .publish(
                "risk:circuitBreakerTriggered",
                json!({ "userId": "alice", "reasons": ["dailyLimits"], "duration": 3_600_000, "ts": 0 }),
                PublishOpts::default(),
            )
            .await;

        let strategy = h.strategies.get(&record.id).await.unwrap();
        assert_eq!(
            strategy.status,
            crate::strategy::StrategyStatus::Inactive
        );

        let order = h.orders.get_order(&ack.order.id, "alice").unwrap();
        // Either already cancelled, or (rare) the worker filled it first;
        // the breaker path must have attempted cancellation of cancellables.
        assert!(
            order.status == crate::orders::OrderStatus::Cancelled
                || order.status.is_terminal()
        );
    }
}
