// =============================================================================
// Market-Data Aggregator — fan-in, caching, and cross-venue VWAP
// =============================================================================
//
// Owns one WebSocket client per configured venue and funnels every normalized
// event through `handle_event`, which:
//   - refreshes the latest ticker / order book per (exchange, pair);
//   - appends trades to a bounded rolling list (last 1000 per pair);
//   - synthesizes one-minute candles from trade prints for strategy context;
//   - rebroadcasts on the event bus and to direct `type:pair` subscribers.
//
// A periodic aggregation pass blends per-venue tickers into a VWAP snapshot
// with best bid/ask and spread, published as `market:aggregatedPrice`.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::venue::{Channel, VenueClient, VenueEvent};
use super::{DataKind, MarketEvent, MarketPayload};
use crate::cache::{TtlCache, TICKER_TTL};
use crate::config::VenueConfig;
use crate::error::CoreResult;
use crate::event_bus::{EventBus, PublishOpts};
use crate::types::{Candle, MarketTrade, OrderBook, Pair, Ticker};

/// Rolling trade list bound per pair.
const MAX_TRADES_PER_PAIR: usize = 1000;

/// Synthesized candle ring bound per pair.
const MAX_CANDLES_PER_PAIR: usize = 500;

/// Bucket width for candles synthesized from trade prints.
const CANDLE_BUCKET_MS: i64 = 60_000;

/// Tickers older than this are excluded from aggregation.
const STALE_TICKER_MS: i64 = TICKER_TTL.as_millis() as i64;

/// Cross-venue blended price snapshot for one pair.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedPrice {
    pub pair: Pair,
    pub vwap: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub spread: f64,
    pub spread_pct: f64,
    pub total_volume: f64,
    pub exchange_count: usize,
    pub exchanges: Vec<String>,
    pub ts: i64,
}

pub struct MarketAggregator {
    bus: Arc<EventBus>,
    cache: Arc<TtlCache>,
    tickers: RwLock<HashMap<(String, Pair), Ticker>>,
    books: RwLock<HashMap<(String, Pair), OrderBook>>,
    trades: RwLock<HashMap<Pair, VecDeque<MarketTrade>>>,
    candles: RwLock<HashMap<Pair, VecDeque<Candle>>>,
    aggregated: RwLock<HashMap<Pair, AggregatedPrice>>,
    direct: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<MarketEvent>>>>,
    clients: RwLock<Vec<Arc<VenueClient>>>,
}

impl MarketAggregator {
    pub fn new(bus: Arc<EventBus>, cache: Arc<TtlCache>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            cache,
            tickers: RwLock::new(HashMap::new()),
            books: RwLock::new(HashMap::new()),
            trades: RwLock::new(HashMap::new()),
            candles: RwLock::new(HashMap::new()),
            aggregated: RwLock::new(HashMap::new()),
            direct: RwLock::new(HashMap::new()),
            clients: RwLock::new(Vec::new()),
        })
    }

    // -------------------------------------------------------------------------
    // Startup / shutdown
    // -------------------------------------------------------------------------

    /// Connect one client per venue, subscribe every channel for every pair,
    /// and spawn the fan-in plus aggregation loops.
    pub fn start(
        self: &Arc<Self>,
        exchanges: &[String],
        pairs: &[Pair],
        venue_config: &VenueConfig,
        aggregation_interval: Duration,
    ) -> CoreResult<()> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<VenueEvent>();

        for exchange in exchanges {
            let client = VenueClient::new(exchange, venue_config.clone(), events_tx.clone())?;
            for pair in pairs {
                client.subscribe(Channel::Ticker, pair);
                client.subscribe(Channel::Orderbook, pair);
                client.subscribe(Channel::Trades, pair);
            }
            self.clients.write().push(client.clone());
            tokio::spawn(client.run());
        }

        info!(
            venues = exchanges.len(),
            pairs = pairs.len(),
            "market data clients launched"
        );

        // Fan-in loop.
        let aggregator = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                aggregator.handle_venue_event(event).await;
            }
            warn!("venue event channel closed — fan-in loop exiting");
        });

        // Aggregation loop.
        let aggregator = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(aggregation_interval);
            loop {
                interval.tick().await;
                aggregator.aggregate_once().await;
            }
        });

        Ok(())
    }

    /// Disconnect every venue client.
    pub fn shutdown(&self) {
        for client in self.clients.read().iter() {
            client.disconnect();
        }
    }

    // -------------------------------------------------------------------------
    // Event handling
    // -------------------------------------------------------------------------

    async fn handle_venue_event(&self, event: VenueEvent) {
        match event {
            VenueEvent::Connected { exchange } => {
                info!(exchange = %exchange, "venue connected");
                self.bus
                    .publish(
                        "market:venueConnected",
                        json!({ "exchange": exchange }),
                        PublishOpts::default(),
                    )
                    .await;
            }
            VenueEvent::Disconnected {
                exchange,
                code,
                reason,
            } => {
                warn!(exchange = %exchange, ?code, reason = %reason, "venue disconnected");
                self.bus
                    .publish(
                        "market:venueDisconnected",
                        json!({ "exchange": exchange, "code": code, "reason": reason }),
                        PublishOpts::default(),
                    )
                    .await;
            }
            VenueEvent::Error {
                exchange,
                message,
                terminal,
            } => {
                warn!(exchange = %exchange, terminal, error = %message, "venue error");
                self.bus
                    .publish(
                        "market:venueError",
                        json!({
                            "exchange": exchange,
                            "message": message,
                            "terminal": terminal,
                        }),
                        PublishOpts::default(),
                    )
                    .await;
            }
            VenueEvent::Data(event) => self.handle_event(event).await,
        }
    }

    /// Ingest one normalized market event.
    pub async fn handle_event(&self, event: MarketEvent) {
        match &event.payload {
            MarketPayload::Ticker(ticker) => {
                let key = (event.exchange.clone(), event.pair.clone());
                self.tickers.write().insert(key, ticker.clone());

                // Write-through snapshot for the API surface.
                if let Ok(value) = serde_json::to_value(ticker) {
                    self.cache.set(
                        format!("ticker:{}:{}", event.exchange, event.pair),
                        value,
                        TICKER_TTL,
                    );
                }

                self.bus
                    .publish(
                        "market:priceUpdate",
                        json!({
                            "pair": event.pair.to_string(),
                            "exchange": event.exchange,
                            "price": ticker.price,
                            "bid": ticker.bid,
                            "ask": ticker.ask,
                            "ts": ticker.ts,
                        }),
                        PublishOpts::default(),
                    )
                    .await;
            }
            MarketPayload::Book(book) => {
                let key = (event.exchange.clone(), event.pair.clone());
                self.books.write().insert(key, book.clone());
            }
            MarketPayload::Trade(trade) => {
                {
                    let mut trades = self.trades.write();
                    let ring = trades.entry(event.pair.clone()).or_default();
                    ring.push_back(trade.clone());
                    while ring.len() > MAX_TRADES_PER_PAIR {
                        ring.pop_front();
                    }
                }
                self.update_candles(trade);
            }
        }

        self.dispatch_direct(&event);
    }

    /// Fold a trade print into the synthesized one-minute candle ring.
    fn update_candles(&self, trade: &MarketTrade) {
        let bucket = trade.ts - trade.ts.rem_euclid(CANDLE_BUCKET_MS);
        let mut candles = self.candles.write();
        let ring = candles.entry(trade.pair.clone()).or_default();

        match ring.back_mut() {
            Some(last) if last.timestamp == bucket => {
                last.high = last.high.max(trade.price);
                last.low = last.low.min(trade.price);
                last.close = trade.price;
                last.volume += trade.amount;
            }
            _ => {
                ring.push_back(Candle {
                    timestamp: bucket,
                    open: trade.price,
                    high: trade.price,
                    low: trade.price,
                    close: trade.price,
                    volume: trade.amount,
                });
                while ring.len() > MAX_CANDLES_PER_PAIR {
                    ring.pop_front();
                }
            }
        }
    }

    fn dispatch_direct(&self, event: &MarketEvent) {
        let key = direct_key(event.kind, &event.pair);
        let mut direct = self.direct.write();
        if let Some(senders) = direct.get_mut(&key) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
            if senders.is_empty() {
                direct.remove(&key);
            }
        }
    }

    /// Receive raw normalized events for one `(kind, pair)` directly,
    /// bypassing the bus.
    pub fn subscribe_direct(
        &self,
        kind: DataKind,
        pair: &Pair,
    ) -> mpsc::UnboundedReceiver<MarketEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.direct
            .write()
            .entry(direct_key(kind, pair))
            .or_default()
            .push(tx);
        rx
    }

    // -------------------------------------------------------------------------
    // Aggregation
    // -------------------------------------------------------------------------

    /// One aggregation pass over every pair with at least one fresh ticker.
    pub async fn aggregate_once(&self) -> Vec<AggregatedPrice> {
        let now = Utc::now().timestamp_millis();

        // Group fresh tickers by pair.
        let mut by_pair: HashMap<Pair, Vec<Ticker>> = HashMap::new();
        {
            let tickers = self.tickers.read();
            for ((_, pair), ticker) in tickers.iter() {
                if now - ticker.ts <= STALE_TICKER_MS {
                    by_pair.entry(pair.clone()).or_default().push(ticker.clone());
                }
            }
        }

        let mut out = Vec::with_capacity(by_pair.len());
        for (pair, tickers) in by_pair {
            let Some(snapshot) = blend(&pair, &tickers, now) else {
                continue;
            };

            self.aggregated
                .write()
                .insert(pair.clone(), snapshot.clone());

            self.bus
                .publish(
                    "market:aggregatedPrice",
                    serde_json::to_value(&snapshot).unwrap_or_default(),
                    PublishOpts::default(),
                )
                .await;

            debug!(
                pair = %snapshot.pair,
                vwap = snapshot.vwap,
                exchanges = snapshot.exchange_count,
                "aggregated price"
            );
            out.push(snapshot);
        }
        out
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Latest ticker per venue for `pair`.
    pub fn latest_tickers(&self, pair: &Pair) -> Vec<Ticker> {
        self.tickers
            .read()
            .iter()
            .filter(|((_, p), _)| p == pair)
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub fn latest_book(&self, exchange: &str, pair: &Pair) -> Option<OrderBook> {
        self.books
            .read()
            .get(&(exchange.to_string(), pair.clone()))
            .cloned()
    }

    /// Most recent `count` trades for `pair`, oldest first.
    pub fn recent_trades(&self, pair: &Pair, count: usize) -> Vec<MarketTrade> {
        let trades = self.trades.read();
        match trades.get(pair) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Most recent `count` synthesized candles for `pair`, oldest first.
    pub fn recent_candles(&self, pair: &Pair, count: usize) -> Vec<Candle> {
        let candles = self.candles.read();
        match candles.get(pair) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).copied().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn last_aggregated(&self, pair: &Pair) -> Option<AggregatedPrice> {
        self.aggregated.read().get(pair).cloned()
    }
}

impl std::fmt::Debug for MarketAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketAggregator")
            .field("tickers", &self.tickers.read().len())
            .field("books", &self.books.read().len())
            .finish()
    }
}

fn direct_key(kind: DataKind, pair: &Pair) -> String {
    format!("{kind}:{pair}")
}

/// Blend per-venue tickers into one snapshot. Returns `None` when the inputs
/// cannot produce finite numbers (e.g. zero total volume with zero prices).
fn blend(pair: &Pair, tickers: &[Ticker], ts: i64) -> Option<AggregatedPrice> {
    if tickers.is_empty() {
        return None;
    }

    let total_volume: f64 = tickers.iter().map(|t| t.volume).sum();
    let vwap = if total_volume > 0.0 {
        tickers.iter().map(|t| t.price * t.volume).sum::<f64>() / total_volume
    } else {
        // No volume anywhere: fall back to the plain mean.
        tickers.iter().map(|t| t.price).sum::<f64>() / tickers.len() as f64
    };

    let best_bid = tickers.iter().map(|t| t.bid).fold(f64::MIN, f64::max);
    let best_ask = tickers.iter().map(|t| t.ask).fold(f64::MAX, f64::min);
    let spread = best_ask - best_bid;
    let spread_pct = if best_bid > 0.0 { spread / best_bid } else { 0.0 };

    if !vwap.is_finite() {
        return None;
    }

    let mut exchanges: Vec<String> = tickers.iter().map(|t| t.exchange.clone()).collect();
    exchanges.sort();

    Some(AggregatedPrice {
        pair: pair.clone(),
        vwap,
        best_bid,
        best_ask,
        spread,
        spread_pct,
        total_volume,
        exchange_count: exchanges.len(),
        exchanges,
        ts,
    })
}
