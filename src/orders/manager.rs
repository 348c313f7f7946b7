// =============================================================================
// Order Manager — create/track/cancel with a single-worker processor
// =============================================================================
//
// Create validates, persists a snapshot in the TTL cache, enqueues the order,
// and emits `trading:orderCreated`. One worker drains the queue in series
// (never two concurrent submits), marks orders open, submits to the execution
// venue, and applies fills. Every lifecycle edge emits its bus event.
//
// Order records live behind per-order locks; locks are never held across an
// await.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::validator::OrderValidator;
use super::{Order, OrderStatus, OrderTrade, OrderType, TimeInForce};
use crate::cache::{TtlCache, DEFAULT_TTL};
use crate::error::{CoreError, CoreResult};
use crate::event_bus::{EventBus, PublishOpts};
use crate::exchange::{ExecutionVenue, OrderTicket};
use crate::types::{Pair, Side};

// ---------------------------------------------------------------------------
// Requests & reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderRequest {
    /// Filled from the transport's identity header when absent.
    #[serde(default)]
    pub user_id: String,
    pub exchange: String,
    /// Raw pair text; validated against the `BASE/QUOTE` shape.
    pub pair: String,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub side: Side,
    pub amount: f64,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub stop_price: Option<f64>,
    #[serde(default)]
    pub tif: TimeInForce,
    #[serde(default)]
    pub strategy_id: Option<String>,
    /// Mark price used to fill market orders in simulation.
    #[serde(default)]
    pub reference_price: Option<f64>,
}

/// Result of a successful create: the order plus advisory warnings.
#[derive(Debug, Clone, Serialize)]
pub struct OrderAck {
    pub order: Order,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderFilters {
    pub status: Option<OrderStatus>,
    pub pair: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderStats {
    pub total: usize,
    pub open: usize,
    pub filled: usize,
    pub cancelled: usize,
    pub rejected: usize,
    pub total_filled_value: f64,
    pub total_fees: f64,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct OrderManager {
    orders: RwLock<HashMap<String, Arc<Mutex<Order>>>>,
    validator: OrderValidator,
    venue: Arc<dyn ExecutionVenue>,
    cache: Arc<TtlCache>,
    bus: Arc<EventBus>,
    queue_tx: mpsc::UnboundedSender<String>,
}

impl OrderManager {
    /// Build the manager and its processing queue. The returned receiver must
    /// be passed to [`OrderManager::run_worker`].
    pub fn new(
        validator: OrderValidator,
        venue: Arc<dyn ExecutionVenue>,
        cache: Arc<TtlCache>,
        bus: Arc<EventBus>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                orders: RwLock::new(HashMap::new()),
                validator,
                venue,
                cache,
                bus,
                queue_tx,
            }),
            queue_rx,
        )
    }

    // -------------------------------------------------------------------------
    // Create
    // -------------------------------------------------------------------------

    /// Validate, persist, enqueue, announce.
    pub async fn create_order(&self, req: &NewOrderRequest) -> CoreResult<OrderAck> {
        let report = self.validator.validate(req);
        if !report.valid {
            return Err(CoreError::validation(report.errors.join("; ")));
        }

        let pair = Pair::parse(&req.pair)?;
        let order = Order::new(
            &req.user_id,
            &req.exchange,
            pair,
            req.order_type,
            req.side,
            req.amount,
            req.price,
            req.stop_price,
            req.tif,
            req.strategy_id.clone(),
        );
        let snapshot = order.clone();

        self.orders
            .write()
            .insert(order.id.clone(), Arc::new(Mutex::new(order)));
        self.persist(&snapshot);

        // Remember the simulation mark for the worker.
        if let Some(mark) = req.reference_price {
            self.cache.set(
                format!("order-mark:{}", snapshot.id),
                json!(mark),
                DEFAULT_TTL,
            );
        }

        self.queue_tx
            .send(snapshot.id.clone())
            .map_err(|_| CoreError::transient("order queue closed"))?;

        info!(
            order_id = %snapshot.id,
            user_id = %snapshot.user_id,
            pair = %snapshot.pair,
            side = %snapshot.side,
            order_type = %snapshot.order_type,
            amount = snapshot.amount,
            "order created"
        );

        self.bus
            .publish(
                "trading:orderCreated",
                json!({ "order": snapshot }),
                PublishOpts::default(),
            )
            .await;

        Ok(OrderAck {
            order: snapshot,
            warnings: report.warnings,
        })
    }

    // -------------------------------------------------------------------------
    // Worker
    // -------------------------------------------------------------------------

    /// Drain the queue in series. One submit at a time, ever.
    pub async fn run_worker(self: Arc<Self>, mut queue_rx: mpsc::UnboundedReceiver<String>) {
        while let Some(order_id) = queue_rx.recv().await {
            if let Err(e) = self.process_order(&order_id).await {
                warn!(order_id = %order_id, error = %e, "order processing failed");
            }
        }
        info!("order queue closed — worker exiting");
    }

    /// Process one queued order end-to-end.
    pub async fn process_order(&self, order_id: &str) -> CoreResult<()> {
        let entry = self.entry(order_id)?;

        // Mark open.
        let (ticket, open_snapshot) = {
            let mut order = entry.lock();
            if order.status != OrderStatus::Pending {
                return Ok(());
            }
            order.transition(OrderStatus::Open)?;
            let mark = self
                .cache
                .get(&format!("order-mark:{}", order.id))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            let ticket = OrderTicket {
                pair: order.pair.clone(),
                side: order.side,
                order_type: order.order_type.to_string(),
                amount: order.amount,
                price: order.price,
                reference_price: mark,
            };
            (ticket, order.clone())
        };
        self.persist(&open_snapshot);
        self.bus
            .publish(
                "trading:orderOpened",
                json!({ "order": open_snapshot }),
                PublishOpts::default(),
            )
            .await;

        // Submit outside any lock.
        match self.venue.submit(&ticket).await {
            Ok(ack) => {
                let snapshot = {
                    let mut order = entry.lock();
                    order.external_id = ack.external_id.clone();
                    let side = order.side;
                    for fill in &ack.fills {
                        order.apply_fill(OrderTrade {
                            trade_id: fill.trade_id.clone(),
                            price: fill.price,
                            amount: fill.amount,
                            fee: fill.fee,
                            side,
                            ts: fill.ts,
                        })?;
                    }
                    order.clone()
                };
                self.persist(&snapshot);

                match snapshot.status {
                    OrderStatus::Filled => {
                        self.bus
                            .publish(
                                "trading:orderFilled",
                                json!({
                                    "order": snapshot,
                                    "userId": snapshot.user_id,
                                    "volume": snapshot.filled_value(),
                                    "fee": snapshot.fee,
                                }),
                                PublishOpts::default(),
                            )
                            .await;
                    }
                    OrderStatus::Partial => {
                        self.bus
                            .publish(
                                "trading:orderPartiallyFilled",
                                json!({ "order": snapshot, "userId": snapshot.user_id }),
                                PublishOpts::default(),
                            )
                            .await;
                    }
                    _ => {}
                }
                Ok(())
            }
            Err(e) => {
                let snapshot = {
                    let mut order = entry.lock();
                    order.transition(OrderStatus::Rejected)?;
                    order.clone()
                };
                self.persist(&snapshot);
                warn!(order_id = %snapshot.id, error = %e, "venue rejected order");
                self.bus
                    .publish(
                        "trading:orderRejected",
                        json!({ "order": snapshot, "reason": e.to_string() }),
                        PublishOpts::default(),
                    )
                    .await;
                Ok(())
            }
        }
    }

    /// Apply an asynchronous fill reported by the venue stream.
    pub async fn apply_external_fill(
        &self,
        order_id: &str,
        trade: OrderTrade,
    ) -> CoreResult<Order> {
        let entry = self.entry(order_id)?;
        let snapshot = {
            let mut order = entry.lock();
            order.apply_fill(trade)?;
            order.clone()
        };
        self.persist(&snapshot);

        let event = match snapshot.status {
            OrderStatus::Filled => "trading:orderFilled",
            _ => "trading:orderPartiallyFilled",
        };
        self.bus
            .publish(
                event,
                json!({
                    "order": snapshot,
                    "userId": snapshot.user_id,
                    "volume": snapshot.filled_value(),
                    "fee": snapshot.fee,
                }),
                PublishOpts::default(),
            )
            .await;
        Ok(snapshot)
    }

    // -------------------------------------------------------------------------
    // Queries & mutations
    // -------------------------------------------------------------------------

    pub fn get_order(&self, order_id: &str, user_id: &str) -> CoreResult<Order> {
        let entry = self.entry(order_id)?;
        let order = entry.lock();
        if order.user_id != user_id {
            return Err(CoreError::Forbidden(format!(
                "order {order_id} belongs to another user"
            )));
        }
        Ok(order.clone())
    }

    pub fn user_orders(&self, user_id: &str, filters: &OrderFilters) -> Vec<Order> {
        let orders = self.orders.read();
        let mut out: Vec<Order> = orders
            .values()
            .map(|entry| entry.lock().clone())
            .filter(|o| o.user_id == user_id)
            .filter(|o| filters.status.map_or(true, |s| o.status == s))
            .filter(|o| {
                filters
                    .pair
                    .as_ref()
                    .map_or(true, |p| o.pair.to_string() == *p)
            })
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(filters.limit.unwrap_or(100));
        out
    }

    /// Shrink an order's amount (the only permitted update).
    pub async fn update_order(
        &self,
        order_id: &str,
        user_id: &str,
        new_amount: f64,
    ) -> CoreResult<Order> {
        let entry = self.entry(order_id)?;
        let snapshot = {
            let mut order = entry.lock();
            if order.user_id != user_id {
                return Err(CoreError::Forbidden(format!(
                    "order {order_id} belongs to another user"
                )));
            }
            let report = self.validator.validate_update(&order, new_amount);
            if !report.valid {
                return Err(CoreError::validation(report.errors.join("; ")));
            }
            order.amount = new_amount;
            order.remaining_amount = (new_amount - order.filled_amount).max(0.0);
            order.updated_at = chrono::Utc::now().to_rfc3339();
            order.clone()
        };
        self.persist(&snapshot);
        info!(order_id, new_amount, "order amount reduced");
        Ok(snapshot)
    }

    pub async fn cancel_order(&self, order_id: &str, user_id: &str) -> CoreResult<Order> {
        let entry = self.entry(order_id)?;

        let (external, pair, cancellable) = {
            let order = entry.lock();
            if order.user_id != user_id {
                return Err(CoreError::Forbidden(format!(
                    "order {order_id} belongs to another user"
                )));
            }
            (order.external_id.clone(), order.pair.clone(), order.can_cancel())
        };
        if !cancellable {
            return Err(CoreError::conflict(format!(
                "order {order_id} is not cancellable"
            )));
        }

        // Best-effort venue cancel before the local transition.
        if let Some(external_id) = &external {
            if let Err(e) = self.venue.cancel(external_id, &pair).await {
                warn!(order_id, error = %e, "venue cancel failed — cancelling locally");
            }
        }

        let snapshot = {
            let mut order = entry.lock();
            order.transition(OrderStatus::Cancelled)?;
            order.clone()
        };
        self.persist(&snapshot);

        info!(order_id, "order cancelled");
        self.bus
            .publish(
                "trading:orderCancelled",
                json!({ "order": snapshot, "userId": snapshot.user_id }),
                PublishOpts::default(),
            )
            .await;
        Ok(snapshot)
    }

    /// Cancel every open/pending/partial order for one user. Returns the ids
    /// cancelled.
    pub async fn cancel_all_for_user(&self, user_id: &str) -> Vec<String> {
        let candidates: Vec<String> = {
            let orders = self.orders.read();
            orders
                .values()
                .filter_map(|entry| {
                    let order = entry.lock();
                    (order.user_id == user_id && order.can_cancel()).then(|| order.id.clone())
                })
                .collect()
        };

        let mut cancelled = Vec::new();
        for id in candidates {
            if self.cancel_order(&id, user_id).await.is_ok() {
                cancelled.push(id);
            }
        }
        cancelled
    }

    pub fn order_stats(&self, user_id: &str) -> OrderStats {
        let orders = self.orders.read();
        let mut stats = OrderStats {
            total: 0,
            open: 0,
            filled: 0,
            cancelled: 0,
            rejected: 0,
            total_filled_value: 0.0,
            total_fees: 0.0,
        };
        for entry in orders.values() {
            let order = entry.lock();
            if order.user_id != user_id {
                continue;
            }
            stats.total += 1;
            match order.status {
                OrderStatus::Open | OrderStatus::Partial | OrderStatus::Pending => {
                    stats.open += 1
                }
                OrderStatus::Filled => stats.filled += 1,
                OrderStatus::Cancelled => stats.cancelled += 1,
                OrderStatus::Rejected | OrderStatus::Expired => stats.rejected += 1,
            }
            stats.total_filled_value += order.filled_value();
            stats.total_fees += order.fee;
        }
        stats
    }

    fn entry(&self, order_id: &str) -> CoreResult<Arc<Mutex<Order>>> {
        self.orders
            .read()
            .get(order_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("order", order_id))
    }

    fn persist(&self, order: &Order) {
        if let Ok(value) = serde_json::to_value(order) {
            self.cache
                .set(format!("order:{}", order.id), value, DEFAULT_TTL);
        }
    }
}

impl std::fmt::Debug for OrderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderManager")
            .field("orders", &self.orders.read().len())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::SubscribeOpts;
    use crate::exchange::SimulatedVenue;

    fn request() -> NewOrderRequest {
        NewOrderRequest {
            user_id: "alice".into(),
            exchange: "binance".into(),
            pair: "BTC/USDT".into(),
            order_type: OrderType::Limit,
            side: Side::Buy,
            amount: 0.5,
            price: Some(40_000.0),
            stop_price: None,
            tif: TimeInForce::Gtc,
            strategy_id: None,
            reference_price: None,
        }
    }

    // The queue receiver must stay alive or create_order sees a closed
    // channel; tests drive process_order directly instead of the worker.
    fn harness() -> (
        Arc<EventBus>,
        Arc<TtlCache>,
        Arc<OrderManager>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let bus = Arc::new(EventBus::new());
        let cache = Arc::new(TtlCache::new());
        let (manager, rx) = OrderManager::new(
            OrderValidator::default(),
            Arc::new(SimulatedVenue::new(0.002)),
            cache.clone(),
            bus.clone(),
        );
        (bus, cache, manager, rx)
    }

    fn event_log(bus: &EventBus) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        for event in [
            "trading:orderCreated",
            "trading:orderOpened",
            "trading:orderPartiallyFilled",
            "trading:orderFilled",
            "trading:orderCancelled",
            "trading:orderRejected",
        ] {
            let sink = log.clone();
            let name = event.to_string();
            bus.subscribe(
                event,
                EventBus::handler(move |_| {
                    let sink = sink.clone();
                    let name = name.clone();
                    async move {
                        sink.lock().push(name);
                        Ok(())
                    }
                }),
                SubscribeOpts::default(),
            );
        }
        log
    }

    #[tokio::test]
    async fn create_and_process_fills_through_the_simulator() {
        let (bus, cache, manager, _rx) = harness();
        let log = event_log(&bus);

        let ack = manager.create_order(&request()).await.unwrap();
        assert_eq!(ack.order.status, OrderStatus::Pending);

        manager.process_order(&ack.order.id).await.unwrap();

        let order = manager.get_order(&ack.order.id, "alice").unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert!((order.filled_amount - 0.5).abs() < 1e-12);
        assert_eq!(order.remaining_amount, 0.0);
        assert!((order.average_price.unwrap() - 40_000.0).abs() < 1e-9);
        // taker fee: 0.5 * 40000 * 0.002 = 40.
        assert!((order.fee - 40.0).abs() < 1e-9);
        assert!(order.external_id.is_some());

        assert_eq!(
            *log.lock(),
            vec![
                "trading:orderCreated",
                "trading:orderOpened",
                "trading:orderFilled"
            ]
        );

        // Snapshot persisted in the TTL cache.
        let cached = cache.get(&format!("order:{}", order.id)).unwrap();
        assert_eq!(cached["status"], "filled");
    }

    #[tokio::test]
    async fn invalid_request_is_a_structured_validation_error() {
        let (_bus, _cache, manager, _rx) = harness();
        let mut req = request();
        req.pair = "btcusdt".into();
        req.amount = -1.0;

        let err = manager.create_order(&req).await.unwrap_err();
        let CoreError::Validation(msg) = err else {
            panic!("expected validation error");
        };
        assert!(msg.contains("pair"));
        assert!(msg.contains("amount"));
    }

    #[tokio::test]
    async fn cancel_pending_order_before_processing() {
        let (bus, _cache, manager, _rx) = harness();
        let log = event_log(&bus);

        let ack = manager.create_order(&request()).await.unwrap();
        let cancelled = manager.cancel_order(&ack.order.id, "alice").await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());

        // Processing a cancelled order is a no-op.
        manager.process_order(&ack.order.id).await.unwrap();
        let order = manager.get_order(&ack.order.id, "alice").unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);

        assert!(log.lock().contains(&"trading:orderCancelled".to_string()));
        assert!(!log.lock().contains(&"trading:orderFilled".to_string()));
    }

    #[tokio::test]
    async fn filled_orders_cannot_be_cancelled_or_updated() {
        let (_bus, _cache, manager, _rx) = harness();
        let ack = manager.create_order(&request()).await.unwrap();
        manager.process_order(&ack.order.id).await.unwrap();

        let err = manager.cancel_order(&ack.order.id, "alice").await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));

        let err = manager
            .update_order(&ack.order.id, "alice", 0.4)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn ownership_is_enforced() {
        let (_bus, _cache, manager, _rx) = harness();
        let ack = manager.create_order(&request()).await.unwrap();

        assert!(matches!(
            manager.get_order(&ack.order.id, "mallory").unwrap_err(),
            CoreError::Forbidden(_)
        ));
        assert!(matches!(
            manager.cancel_order(&ack.order.id, "mallory").await.unwrap_err(),
            CoreError::Forbidden(_)
        ));
    }

    #[tokio::test]
    async fn update_shrinks_amount_only() {
        let (_bus, _cache, manager, _rx) = harness();
        let ack = manager.create_order(&request()).await.unwrap();

        let updated = manager.update_order(&ack.order.id, "alice", 0.3).await.unwrap();
        assert!((updated.amount - 0.3).abs() < 1e-12);
        assert!((updated.remaining_amount - 0.3).abs() < 1e-12);

        let err = manager.update_order(&ack.order.id, "alice", 0.9).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn cancel_all_for_user_skips_filled() {
        let (_bus, _cache, manager, _rx) = harness();

        let a = manager.create_order(&request()).await.unwrap();
        let b = manager.create_order(&request()).await.unwrap();
        manager.process_order(&a.order.id).await.unwrap(); // filled

        let cancelled = manager.cancel_all_for_user("alice").await;
        assert_eq!(cancelled, vec![b.order.id.clone()]);
    }

    #[tokio::test]
    async fn stats_aggregate_by_status() {
        let (_bus, _cache, manager, _rx) = harness();

        let a = manager.create_order(&request()).await.unwrap();
        manager.process_order(&a.order.id).await.unwrap();
        let b = manager.create_order(&request()).await.unwrap();
        manager.cancel_order(&b.order.id, "alice").await.unwrap();
        manager.create_order(&request()).await.unwrap(); // stays pending

        let stats = manager.order_stats("alice");
        assert_eq!(stats.total, 3);
        assert_eq!(stats.filled, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.open, 1);
        assert!((stats.total_filled_value - 20_000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn market_order_uses_reference_mark() {
        let (_bus, _cache, manager, _rx) = harness();
        let mut req = request();
        req.order_type = OrderType::Market;
        req.price = None;
        req.reference_price = Some(41_000.0);

        let ack = manager.create_order(&req).await.unwrap();
        manager.process_order(&ack.order.id).await.unwrap();

        let order = manager.get_order(&ack.order.id, "alice").unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert!((order.average_price.unwrap() - 41_000.0).abs() < 1e-9);
    }
}
