// =============================================================================
// Exchange Access — signed REST client, candle source, execution venue
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests send
// the API key as a header and include a recvWindow to tolerate minor clock
// drift against the venue.
//
// Two seams are defined as traits so the ingestor and order manager can be
// driven by mocks in tests and by the simulator in paused/demo operation:
//   - `CandleSource`   — historical kline pagination
//   - `ExecutionVenue` — order submission and cancellation
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::types::{Candle, Pair, Side, Timeframe};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

// ---------------------------------------------------------------------------
// Symbol normalization
// ---------------------------------------------------------------------------

/// Per-venue symbol rules: asset substitutions plus the venue's symbol shape.
///
/// `BTC/USD` becomes `XBTUSD`-style on kraken, `BTCUSDT`-style on binance,
/// and `BTC-USD` on coinbase. The substitution table is loaded at
/// construction and can be extended from config.
#[derive(Debug, Clone)]
pub struct SymbolNormalizer {
    exchange: String,
    substitutions: HashMap<String, String>,
}

impl SymbolNormalizer {
    pub fn for_exchange(exchange: &str) -> Self {
        let mut substitutions = HashMap::new();
        if exchange.eq_ignore_ascii_case("kraken") {
            substitutions.insert("BTC".to_string(), "XBT".to_string());
            substitutions.insert("DOGE".to_string(), "XDG".to_string());
        }
        Self {
            exchange: exchange.to_lowercase(),
            substitutions,
        }
    }

    /// Add or override a substitution (asset → venue asset).
    pub fn with_substitution(mut self, from: &str, to: &str) -> Self {
        self.substitutions
            .insert(from.to_uppercase(), to.to_uppercase());
        self
    }

    fn asset(&self, asset: &str) -> String {
        self.substitutions
            .get(asset)
            .cloned()
            .unwrap_or_else(|| asset.to_string())
    }

    /// Venue-native symbol for `pair`.
    pub fn symbol(&self, pair: &Pair) -> String {
        let base = self.asset(&pair.base);
        let quote = self.asset(&pair.quote);
        match self.exchange.as_str() {
            "coinbase" => format!("{base}-{quote}"),
            "kraken" => format!("{base}/{quote}"),
            // binance and the default: joined uppercase.
            _ => format!("{base}{quote}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Paginated historical candle fetch.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Fetch up to `limit` candles starting at `start_ms`, ascending.
    async fn fetch_candles(
        &self,
        pair: &Pair,
        timeframe: Timeframe,
        start_ms: i64,
        limit: usize,
    ) -> CoreResult<Vec<Candle>>;
}

/// A submit ticket: everything the venue needs, nothing it does not.
#[derive(Debug, Clone)]
pub struct OrderTicket {
    pub pair: Pair,
    pub side: Side,
    /// Venue order type string ("market", "limit", ...).
    pub order_type: String,
    pub amount: f64,
    pub price: Option<f64>,
    /// Mark price at submit time; the simulator fills market orders here.
    pub reference_price: f64,
}

/// One fill reported back by the venue.
#[derive(Debug, Clone)]
pub struct FillReport {
    pub trade_id: String,
    pub price: f64,
    pub amount: f64,
    pub fee: f64,
    pub ts: i64,
}

/// Venue acknowledgement of a submitted order.
#[derive(Debug, Clone)]
pub struct SubmitAck {
    pub external_id: Option<String>,
    pub fills: Vec<FillReport>,
}

/// Order submission seam.
#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    async fn submit(&self, ticket: &OrderTicket) -> CoreResult<SubmitAck>;
    async fn cancel(&self, external_id: &str, pair: &Pair) -> CoreResult<()>;
}

// ---------------------------------------------------------------------------
// Signed REST client
// ---------------------------------------------------------------------------

/// REST client for a Binance-shaped venue API with HMAC-SHA256 signing.
#[derive(Clone)]
pub struct RestClient {
    exchange: String,
    secret: String,
    base_url: String,
    normalizer: SymbolNormalizer,
    client: reqwest::Client,
}

impl RestClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `exchange` — venue name used for symbol normalization and labels.
    /// * `api_key`  — sent as a header, never in query params.
    /// * `secret`   — used exclusively for HMAC signing.
    /// * `base_url` — e.g. `https://api.binance.com`.
    pub fn new(
        exchange: &str,
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            exchange: exchange.to_lowercase(),
            secret: secret.into(),
            base_url: base_url.into(),
            normalizer: SymbolNormalizer::for_exchange(exchange),
            client,
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn get_json(&self, url: &str) -> CoreResult<serde_json::Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CoreError::transient(format!("GET {url} failed: {e}")))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CoreError::transient(format!("bad JSON from {url}: {e}")))?;

        if !status.is_success() {
            return Err(CoreError::transient(format!(
                "{} returned {status}: {body}",
                self.exchange
            )));
        }
        Ok(body)
    }
}

#[async_trait]
impl CandleSource for RestClient {
    /// GET /api/v3/klines — public, unsigned.
    async fn fetch_candles(
        &self,
        pair: &Pair,
        timeframe: Timeframe,
        start_ms: i64,
        limit: usize,
    ) -> CoreResult<Vec<Candle>> {
        let symbol = self.normalizer.symbol(pair);
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&startTime={}&limit={}",
            self.base_url, symbol, timeframe, start_ms, limit
        );

        let body = self.get_json(&url).await?;
        let rows = body
            .as_array()
            .ok_or_else(|| CoreError::transient("klines response is not an array"))?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            // Kline rows are arrays: [openTime, open, high, low, close, volume, ...].
            let ts = row[0]
                .as_i64()
                .ok_or_else(|| CoreError::transient("kline missing open time"))?;
            candles.push(Candle {
                timestamp: ts,
                open: string_f64(&row[1])?,
                high: string_f64(&row[2])?,
                low: string_f64(&row[3])?,
                close: string_f64(&row[4])?,
                volume: string_f64(&row[5])?,
            });
        }

        debug!(
            exchange = %self.exchange,
            pair = %pair,
            timeframe = %timeframe,
            count = candles.len(),
            "candles fetched"
        );
        Ok(candles)
    }
}

#[async_trait]
impl ExecutionVenue for RestClient {
    /// POST /api/v3/order (signed).
    async fn submit(&self, ticket: &OrderTicket) -> CoreResult<SubmitAck> {
        let symbol = self.normalizer.symbol(&ticket.pair);
        let side = ticket.side.to_string().to_uppercase();
        let order_type = ticket.order_type.to_uppercase();

        let mut params = format!(
            "symbol={symbol}&side={side}&type={order_type}&quantity={}",
            ticket.amount
        );
        if let Some(price) = ticket.price {
            params.push_str(&format!("&price={price}&timeInForce=GTC"));
        }

        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| CoreError::transient(format!("order submit failed: {e}")))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CoreError::transient(format!("bad order response: {e}")))?;

        if !status.is_success() {
            warn!(exchange = %self.exchange, %status, %body, "order rejected by venue");
            return Err(CoreError::transient(format!(
                "order submit returned {status}: {body}"
            )));
        }

        let external_id = body["orderId"]
            .as_u64()
            .map(|id| id.to_string())
            .or_else(|| body["orderId"].as_str().map(str::to_string));

        let mut fills = Vec::new();
        if let Some(rows) = body["fills"].as_array() {
            for (i, row) in rows.iter().enumerate() {
                fills.push(FillReport {
                    trade_id: row["tradeId"]
                        .as_u64()
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| format!("fill-{i}")),
                    price: string_f64(&row["price"])?,
                    amount: string_f64(&row["qty"])?,
                    fee: string_f64(&row["commission"]).unwrap_or(0.0),
                    ts: chrono::Utc::now().timestamp_millis(),
                });
            }
        }

        Ok(SubmitAck { external_id, fills })
    }

    /// DELETE /api/v3/order (signed).
    async fn cancel(&self, external_id: &str, pair: &Pair) -> CoreResult<()> {
        let symbol = self.normalizer.symbol(pair);
        let params = format!("symbol={symbol}&orderId={external_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| CoreError::transient(format!("order cancel failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(CoreError::transient(format!(
                "cancel returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("exchange", &self.exchange)
            .field("base_url", &self.base_url)
            .finish()
    }
}

fn string_f64(val: &serde_json::Value) -> CoreResult<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| CoreError::transient(format!("cannot parse f64 from {s:?}"))),
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| CoreError::transient("non-f64 number")),
        other => Err(CoreError::transient(format!(
            "unexpected JSON type: {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Simulated venue
// ---------------------------------------------------------------------------

/// Fully fills every order at its limit price (or the reference mark for
/// market orders), charging the configured taker fee. Used while the engine
/// is paused and in tests.
pub struct SimulatedVenue {
    taker_fee: f64,
    next_trade_id: AtomicU64,
}

impl SimulatedVenue {
    pub fn new(taker_fee: f64) -> Self {
        Self {
            taker_fee,
            next_trade_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl ExecutionVenue for SimulatedVenue {
    async fn submit(&self, ticket: &OrderTicket) -> CoreResult<SubmitAck> {
        let price = ticket.price.unwrap_or(ticket.reference_price);
        if price <= 0.0 {
            return Err(CoreError::validation("simulated fill needs a positive price"));
        }
        let id = self.next_trade_id.fetch_add(1, Ordering::Relaxed);
        let fill = FillReport {
            trade_id: format!("sim-{id}"),
            price,
            amount: ticket.amount,
            fee: ticket.amount * price * self.taker_fee,
            ts: chrono::Utc::now().timestamp_millis(),
        };
        Ok(SubmitAck {
            external_id: Some(format!("sim-order-{id}")),
            fills: vec![fill],
        })
    }

    async fn cancel(&self, _external_id: &str, _pair: &Pair) -> CoreResult<()> {
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kraken_substitutes_xbt() {
        let norm = SymbolNormalizer::for_exchange("kraken");
        assert_eq!(norm.symbol(&Pair::new("BTC", "USD")), "XBT/USD");
        assert_eq!(norm.symbol(&Pair::new("ETH", "USD")), "ETH/USD");
    }

    #[test]
    fn binance_joins_symbols() {
        let norm = SymbolNormalizer::for_exchange("binance");
        assert_eq!(norm.symbol(&Pair::new("BTC", "USDT")), "BTCUSDT");
    }

    #[test]
    fn coinbase_uses_dash_form() {
        let norm = SymbolNormalizer::for_exchange("coinbase");
        assert_eq!(norm.symbol(&Pair::new("BTC", "USD")), "BTC-USD");
    }

    #[test]
    fn substitution_overrides_extend_the_table() {
        let norm = SymbolNormalizer::for_exchange("binance").with_substitution("IOTA", "MIOTA");
        assert_eq!(norm.symbol(&Pair::new("IOTA", "USDT")), "MIOTAUSDT");
    }

    #[tokio::test]
    async fn simulated_venue_fills_at_limit_price() {
        let venue = SimulatedVenue::new(0.002);
        let ticket = OrderTicket {
            pair: Pair::new("BTC", "USDT"),
            side: Side::Buy,
            order_type: "limit".into(),
            amount: 2.0,
            price: Some(100.0),
            reference_price: 101.0,
        };
        let ack = venue.submit(&ticket).await.unwrap();
        assert_eq!(ack.fills.len(), 1);
        let fill = &ack.fills[0];
        assert_eq!(fill.price, 100.0);
        assert_eq!(fill.amount, 2.0);
        assert!((fill.fee - 0.4).abs() < 1e-12);
    }

    #[tokio::test]
    async fn simulated_venue_market_orders_use_reference_price() {
        let venue = SimulatedVenue::new(0.0);
        let ticket = OrderTicket {
            pair: Pair::new("ETH", "USDT"),
            side: Side::Sell,
            order_type: "market".into(),
            amount: 1.0,
            price: None,
            reference_price: 2_000.0,
        };
        let ack = venue.submit(&ticket).await.unwrap();
        assert_eq!(ack.fills[0].price, 2_000.0);
    }
}
