// =============================================================================
// Central Application State — the Vela engine component graph
// =============================================================================
//
// The single source of truth for the engine. Every subsystem manages its own
// interior mutability; AppState ties them together and provides a unified
// snapshot for the API.
//
// Thread safety:
//   - atomic counter for lock-free version tracking;
//   - parking_lot::RwLock around the hot-reloadable config;
//   - Arc wrappers for subsystem engines.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::cache::TtlCache;
use crate::config::EngineConfig;
use crate::coordinator::TradingCoordinator;
use crate::error::CoreResult;
use crate::event_bus::{BusMetrics, EventBus, SubscribeOpts};
use crate::exchange::RestClient;
use crate::ingest::Ingestor;
use crate::market_data::MarketAggregator;
use crate::orders::{OrderManager, OrderValidator};
use crate::positions::PositionManager;
use crate::risk::{RiskManager, RiskStateSnapshot};
use crate::store::{CandleStore, MetaStore};
use crate::strategy::scheduler::StrategyRecord;
use crate::strategy::StrategyScheduler;
use crate::types::TradingMode;

/// Maximum number of recent errors retained for the API.
const MAX_RECENT_ERRORS: usize = 50;
/// Maximum number of recent strategy signals retained for the API.
const MAX_RECENT_SIGNALS: usize = 100;

/// A recorded error event for the API error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// Component the error came from (e.g. `venue:binance`, `orders`).
    pub source: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// A recorded strategy signal for the API signal log.
#[derive(Debug, Clone, Serialize)]
pub struct SignalEntry {
    pub strategy_id: String,
    pub user_id: String,
    pub action: String,
    pub price: f64,
    pub reason: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

fn push_bounded<T>(ring: &RwLock<Vec<T>>, item: T, cap: usize) {
    let mut items = ring.write();
    items.push(item);
    while items.len() > cap {
        items.remove(0);
    }
}

pub struct AppState {
    pub config: Arc<RwLock<EngineConfig>>,
    pub config_path: String,

    pub bus: Arc<EventBus>,
    pub cache: Arc<TtlCache>,
    pub candles: Arc<CandleStore>,
    pub meta: Arc<MetaStore>,
    pub aggregator: Arc<MarketAggregator>,
    pub risk: Arc<RiskManager>,
    pub positions: Arc<PositionManager>,
    pub orders: Arc<OrderManager>,
    pub scheduler: Arc<StrategyScheduler>,
    pub coordinator: Arc<TradingCoordinator>,
    pub ingestor: Arc<Ingestor>,

    /// Bounded log of recent errors (venue failures, order rejections).
    pub recent_errors: Arc<RwLock<Vec<ErrorRecord>>>,
    /// Bounded log of recent strategy signals, all users.
    pub recent_signals: Arc<RwLock<Vec<SignalEntry>>>,

    /// Monotonically increasing version counter, bumped on every meaningful
    /// state mutation the API should notice. Shared with the bus observers
    /// that feed the rings above.
    pub state_version: Arc<AtomicU64>,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Build the full component graph from `config`. Returns the state plus
    /// the order queue receiver that must be handed to the order worker.
    pub fn new(
        config: EngineConfig,
        config_path: &str,
    ) -> CoreResult<(Arc<Self>, mpsc::UnboundedReceiver<String>)> {
        let bus = Arc::new(EventBus::new());
        let cache = Arc::new(TtlCache::new());
        let candles = Arc::new(CandleStore::new(config.data_dir.clone()));
        let meta = Arc::new(MetaStore::open(&config.meta_db)?);
        let aggregator = MarketAggregator::new(bus.clone(), cache.clone());

        let risk = RiskManager::new(config.risk.clone(), bus.clone());
        risk.attach(&bus);

        let positions = PositionManager::new();

        // All order flow goes through the simulator until an operator wires
        // real venue credentials and flips to live submission.
        let venue: Arc<dyn crate::exchange::ExecutionVenue> = Arc::new(
            crate::exchange::SimulatedVenue::new(config.backtest.taker_fee),
        );
        let (orders, order_queue_rx) =
            OrderManager::new(OrderValidator::default(), venue, cache.clone(), bus.clone());

        let scheduler =
            StrategyScheduler::new(bus.clone(), aggregator.clone(), config.risk.max_daily_trades);

        let rest = RestClient::new(
            &config.ingestor.exchange,
            std::env::var("VELA_API_KEY").unwrap_or_default(),
            std::env::var("VELA_API_SECRET").unwrap_or_default(),
            "https://api.binance.com",
        );
        let ingestor = Arc::new(Ingestor::new(
            config.ingestor.clone(),
            Arc::new(rest),
            candles.clone(),
            meta.clone(),
        ));

        let config = Arc::new(RwLock::new(config));
        let coordinator = TradingCoordinator::new(
            bus.clone(),
            config.clone(),
            risk.clone(),
            orders.clone(),
            positions.clone(),
            scheduler.clone(),
            aggregator.clone(),
        );
        coordinator.attach();

        let recent_errors: Arc<RwLock<Vec<ErrorRecord>>> = Arc::new(RwLock::new(Vec::new()));
        let recent_signals: Arc<RwLock<Vec<SignalEntry>>> = Arc::new(RwLock::new(Vec::new()));
        let state_version = Arc::new(AtomicU64::new(1));
        Self::attach_observers(&bus, &recent_errors, &recent_signals, &state_version);

        let state = Arc::new(Self {
            config,
            config_path: config_path.to_string(),
            bus,
            cache,
            candles,
            meta,
            aggregator,
            risk,
            positions,
            orders,
            scheduler,
            coordinator,
            ingestor,
            recent_errors,
            recent_signals,
            state_version,
            start_time: std::time::Instant::now(),
        });
        Ok((state, order_queue_rx))
    }

    /// Subscribe the ring-buffer observers: venue errors and order rejections
    /// land in the error log, strategy signals in the signal log. Each entry
    /// bumps the state version so pollers notice.
    fn attach_observers(
        bus: &EventBus,
        recent_errors: &Arc<RwLock<Vec<ErrorRecord>>>,
        recent_signals: &Arc<RwLock<Vec<SignalEntry>>>,
        state_version: &Arc<AtomicU64>,
    ) {
        let ring = recent_errors.clone();
        let version = state_version.clone();
        bus.subscribe(
            "market:venueError",
            EventBus::handler(move |data| {
                let ring = ring.clone();
                let version = version.clone();
                async move {
                    let exchange = data["exchange"].as_str().unwrap_or("unknown");
                    push_bounded(
                        &ring,
                        ErrorRecord {
                            message: data["message"].as_str().unwrap_or_default().to_string(),
                            source: format!("venue:{exchange}"),
                            at: Utc::now().to_rfc3339(),
                        },
                        MAX_RECENT_ERRORS,
                    );
                    version.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            SubscribeOpts::default(),
        );

        let ring = recent_errors.clone();
        let version = state_version.clone();
        bus.subscribe(
            "trading:orderRejected",
            EventBus::handler(move |data| {
                let ring = ring.clone();
                let version = version.clone();
                async move {
                    let order_id = data["order"]["id"].as_str().unwrap_or_default();
                    let reason = data["reason"].as_str().unwrap_or("order rejected");
                    push_bounded(
                        &ring,
                        ErrorRecord {
                            message: format!("order {order_id} rejected: {reason}"),
                            source: "orders".to_string(),
                            at: Utc::now().to_rfc3339(),
                        },
                        MAX_RECENT_ERRORS,
                    );
                    version.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            SubscribeOpts::default(),
        );

        let ring = recent_signals.clone();
        let version = state_version.clone();
        bus.subscribe(
            "trading:strategySignal",
            EventBus::handler(move |data| {
                let ring = ring.clone();
                let version = version.clone();
                async move {
                    let signal = &data["signal"];
                    push_bounded(
                        &ring,
                        SignalEntry {
                            strategy_id: data["strategyId"]
                                .as_str()
                                .unwrap_or_default()
                                .to_string(),
                            user_id: data["userId"].as_str().unwrap_or_default().to_string(),
                            action: signal["action"].as_str().unwrap_or("hold").to_string(),
                            price: signal["price"].as_f64().unwrap_or(0.0),
                            reason: signal["reason"].as_str().unwrap_or_default().to_string(),
                            at: Utc::now().to_rfc3339(),
                        },
                        MAX_RECENT_SIGNALS,
                    );
                    version.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            SubscribeOpts::default(),
        );
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn trading_mode(&self) -> TradingMode {
        self.config.read().trading_mode
    }

    /// Flip the trading mode, persisting the config.
    pub fn set_trading_mode(&self, mode: TradingMode) {
        {
            let mut config = self.config.write();
            config.trading_mode = mode;
            let _ = config.save(&self.config_path);
        }
        self.increment_version();
    }

    /// Serializable engine snapshot for one user.
    pub async fn build_snapshot(&self, user_id: &str) -> StateSnapshot {
        let config = self.config.read().clone();
        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            trading_mode: config.trading_mode.to_string(),
            pairs: config.pairs,
            exchanges: config.exchanges,
            bus: self.bus.metrics(),
            risk: self.risk.state_snapshot(user_id),
            strategies: self.scheduler.list(Some(user_id)).await,
            positions: self
                .positions
                .user_positions(user_id)
                .into_iter()
                .map(|p| serde_json::to_value(&p).unwrap_or_default())
                .collect(),
            recent_errors: self.recent_errors.read().clone(),
            recent_signals: self
                .recent_signals
                .read()
                .iter()
                .filter(|s| s.user_id == user_id)
                .cloned()
                .collect(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("state_version", &self.current_state_version())
            .finish()
    }
}

/// Full engine state snapshot for the API.
#[derive(Debug, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub trading_mode: String,
    pub pairs: Vec<String>,
    pub exchanges: Vec<String>,
    pub bus: BusMetrics,
    pub risk: RiskStateSnapshot,
    pub strategies: Vec<StrategyRecord>,
    pub positions: Vec<serde_json::Value>,
    /// Bounded log of recent errors, engine-wide.
    pub recent_errors: Vec<ErrorRecord>,
    /// Bounded log of this user's recent strategy signals.
    pub recent_signals: Vec<SignalEntry>,
}
