// =============================================================================
// Venue Wire Parsers — translate per-venue frames to normalized events
// =============================================================================
//
// Each venue speaks its own JSON dialect; a `WireParser` turns raw text frames
// into `MarketEvent`s and renders subscribe/unsubscribe frames. Parsers are
// deliberately forgiving: an unrecognised frame yields no events rather than
// an error, since every venue interleaves heartbeats and acks with data.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use super::venue::Channel;
use super::{DataKind, MarketEvent, MarketPayload};
use crate::types::{MarketTrade, OrderBook, Pair, Side, Ticker};

/// Renders subscription frames and parses inbound text for one venue.
pub trait WireParser: Send + Sync {
    fn ws_url(&self) -> String;
    fn subscribe_frame(&self, channel: Channel, pair: &Pair) -> String;
    fn unsubscribe_frame(&self, channel: Channel, pair: &Pair) -> String;
    fn parse(&self, text: &str) -> Vec<MarketEvent>;
}

/// Parser registry keyed by venue name.
pub fn parser_for(exchange: &str) -> Option<Arc<dyn WireParser>> {
    match exchange.to_lowercase().as_str() {
        "binance" => Some(Arc::new(BinanceParser::default())),
        "coinbase" => Some(Arc::new(CoinbaseParser)),
        "kraken" => Some(Arc::new(KrakenParser)),
        _ => None,
    }
}

fn num(v: &Value) -> f64 {
    match v {
        Value::String(s) => s.parse().unwrap_or(0.0),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn ladder(rows: Option<&Vec<Value>>) -> Vec<(f64, f64)> {
    rows.map(|rows| {
        rows.iter()
            .filter_map(|row| {
                let level = row.as_array()?;
                Some((num(level.first()?), num(level.get(1)?)))
            })
            .collect()
    })
    .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Binance
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct BinanceParser {
    next_id: AtomicU64,
}

impl BinanceParser {
    fn stream_name(channel: Channel, pair: &Pair) -> String {
        let sym = pair.joined().to_lowercase();
        match channel {
            Channel::Ticker => format!("{sym}@ticker"),
            Channel::Orderbook => format!("{sym}@depth20@100ms"),
            Channel::Trades => format!("{sym}@trade"),
        }
    }

    fn frame(&self, method: &str, channel: Channel, pair: &Pair) -> String {
        json!({
            "method": method,
            "params": [Self::stream_name(channel, pair)],
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
        })
        .to_string()
    }
}

impl WireParser for BinanceParser {
    fn ws_url(&self) -> String {
        "wss://stream.binance.com:9443/ws".to_string()
    }

    fn subscribe_frame(&self, channel: Channel, pair: &Pair) -> String {
        self.frame("SUBSCRIBE", channel, pair)
    }

    fn unsubscribe_frame(&self, channel: Channel, pair: &Pair) -> String {
        self.frame("UNSUBSCRIBE", channel, pair)
    }

    fn parse(&self, text: &str) -> Vec<MarketEvent> {
        let Ok(root) = serde_json::from_str::<Value>(text) else {
            return Vec::new();
        };
        // Combined-stream envelopes wrap the payload under "data".
        let data = root.get("data").unwrap_or(&root);

        let Some(pair) = data["s"].as_str().and_then(|s| Pair::parse(s).ok()) else {
            return Vec::new();
        };
        let ts = data["E"].as_i64().unwrap_or_else(|| Utc::now().timestamp_millis());

        match data["e"].as_str() {
            Some("24hrTicker") => {
                let ticker = Ticker {
                    exchange: "binance".into(),
                    pair: pair.clone(),
                    price: num(&data["c"]),
                    bid: num(&data["b"]),
                    ask: num(&data["a"]),
                    high_24h: num(&data["h"]),
                    low_24h: num(&data["l"]),
                    volume: num(&data["v"]),
                    ts,
                };
                vec![MarketEvent {
                    kind: DataKind::Ticker,
                    exchange: "binance".into(),
                    pair,
                    payload: MarketPayload::Ticker(ticker),
                    ts,
                }]
            }
            Some("trade") => {
                // "m" = buyer is the maker, i.e. the aggressor sold.
                let side = if data["m"].as_bool().unwrap_or(false) {
                    Side::Sell
                } else {
                    Side::Buy
                };
                let trade = MarketTrade {
                    exchange: "binance".into(),
                    pair: pair.clone(),
                    price: num(&data["p"]),
                    amount: num(&data["q"]),
                    side,
                    ts: data["T"].as_i64().unwrap_or(ts),
                };
                vec![MarketEvent {
                    kind: DataKind::Trade,
                    exchange: "binance".into(),
                    pair,
                    payload: MarketPayload::Trade(trade),
                    ts,
                }]
            }
            Some("depthUpdate") => {
                let book = OrderBook {
                    exchange: "binance".into(),
                    pair: pair.clone(),
                    bids: ladder(data["b"].as_array()),
                    asks: ladder(data["a"].as_array()),
                    ts,
                };
                vec![MarketEvent {
                    kind: DataKind::OrderbookUpdate,
                    exchange: "binance".into(),
                    pair,
                    payload: MarketPayload::Book(book),
                    ts,
                }]
            }
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Coinbase
// ---------------------------------------------------------------------------

pub struct CoinbaseParser;

impl CoinbaseParser {
    fn channel_name(channel: Channel) -> &'static str {
        match channel {
            Channel::Ticker => "ticker",
            Channel::Orderbook => "level2",
            Channel::Trades => "matches",
        }
    }
}

impl WireParser for CoinbaseParser {
    fn ws_url(&self) -> String {
        "wss://ws-feed.exchange.coinbase.com".to_string()
    }

    fn subscribe_frame(&self, channel: Channel, pair: &Pair) -> String {
        json!({
            "type": "subscribe",
            "product_ids": [pair.file_form()],
            "channels": [Self::channel_name(channel)],
        })
        .to_string()
    }

    fn unsubscribe_frame(&self, channel: Channel, pair: &Pair) -> String {
        json!({
            "type": "unsubscribe",
            "product_ids": [pair.file_form()],
            "channels": [Self::channel_name(channel)],
        })
        .to_string()
    }

    fn parse(&self, text: &str) -> Vec<MarketEvent> {
        let Ok(root) = serde_json::from_str::<Value>(text) else {
            return Vec::new();
        };
        let Some(pair) = root["product_id"].as_str().and_then(|s| Pair::parse(s).ok()) else {
            return Vec::new();
        };
        let ts = root["time"]
            .as_str()
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .map(|dt| dt.timestamp_millis())
            .unwrap_or_else(|| Utc::now().timestamp_millis());

        match root["type"].as_str() {
            Some("ticker") => {
                let ticker = Ticker {
                    exchange: "coinbase".into(),
                    pair: pair.clone(),
                    price: num(&root["price"]),
                    bid: num(&root["best_bid"]),
                    ask: num(&root["best_ask"]),
                    high_24h: num(&root["high_24h"]),
                    low_24h: num(&root["low_24h"]),
                    volume: num(&root["volume_24h"]),
                    ts,
                };
                vec![MarketEvent {
                    kind: DataKind::Ticker,
                    exchange: "coinbase".into(),
                    pair,
                    payload: MarketPayload::Ticker(ticker),
                    ts,
                }]
            }
            Some("snapshot") => {
                let book = OrderBook {
                    exchange: "coinbase".into(),
                    pair: pair.clone(),
                    bids: ladder(root["bids"].as_array()),
                    asks: ladder(root["asks"].as_array()),
                    ts,
                };
                vec![MarketEvent {
                    kind: DataKind::Orderbook,
                    exchange: "coinbase".into(),
                    pair,
                    payload: MarketPayload::Book(book),
                    ts,
                }]
            }
            Some("l2update") => {
                let mut bids = Vec::new();
                let mut asks = Vec::new();
                if let Some(changes) = root["changes"].as_array() {
                    for change in changes {
                        let Some(row) = change.as_array() else { continue };
                        let side = row.first().and_then(Value::as_str);
                        let level = (num(row.get(1).unwrap_or(&Value::Null)),
                                     num(row.get(2).unwrap_or(&Value::Null)));
                        match side {
                            Some("buy") => bids.push(level),
                            Some("sell") => asks.push(level),
                            _ => {}
                        }
                    }
                }
                let book = OrderBook {
                    exchange: "coinbase".into(),
                    pair: pair.clone(),
                    bids,
                    asks,
                    ts,
                };
                vec![MarketEvent {
                    kind: DataKind::OrderbookUpdate,
                    exchange: "coinbase".into(),
                    pair,
                    payload: MarketPayload::Book(book),
                    ts,
                }]
            }
            Some("match") => {
                let side = if root["side"].as_str() == Some("sell") {
                    Side::Sell
                } else {
                    Side::Buy
                };
                let trade = MarketTrade {
                    exchange: "coinbase".into(),
                    pair: pair.clone(),
                    price: num(&root["price"]),
                    amount: num(&root["size"]),
                    side,
                    ts,
                };
                vec![MarketEvent {
                    kind: DataKind::Trade,
                    exchange: "coinbase".into(),
                    pair,
                    payload: MarketPayload::Trade(trade),
                    ts,
                }]
            }
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Kraken
// ---------------------------------------------------------------------------

pub struct KrakenParser;

impl KrakenParser {
    fn channel_name(channel: Channel) -> &'static str {
        match channel {
            Channel::Ticker => "ticker",
            Channel::Orderbook => "book",
            Channel::Trades => "trade",
        }
    }

    /// Kraken reports `XBT/USD`; map venue assets back to canonical form.
    fn canonical_pair(s: &str) -> Option<Pair> {
        let pair = Pair::parse(s).ok()?;
        let unmap = |asset: &str| match asset {
            "XBT" => "BTC".to_string(),
            "XDG" => "DOGE".to_string(),
            other => other.to_string(),
        };
        Some(Pair::new(unmap(&pair.base), unmap(&pair.quote)))
    }
}

impl WireParser for KrakenParser {
    fn ws_url(&self) -> String {
        "wss://ws.kraken.com".to_string()
    }

    fn subscribe_frame(&self, channel: Channel, pair: &Pair) -> String {
        let norm = crate::exchange::SymbolNormalizer::for_exchange("kraken");
        json!({
            "event": "subscribe",
            "pair": [norm.symbol(pair)],
            "subscription": { "name": Self::channel_name(channel) },
        })
        .to_string()
    }

    fn unsubscribe_frame(&self, channel: Channel, pair: &Pair) -> String {
        let norm = crate::exchange::SymbolNormalizer::for_exchange("kraken");
        json!({
            "event": "unsubscribe",
            "pair": [norm.symbol(pair)],
            "subscription": { "name": Self::channel_name(channel) },
        })
        .to_string()
    }

    fn parse(&self, text: &str) -> Vec<MarketEvent> {
        // Data frames are arrays: [channelID, payload, channelName, pair].
        let Ok(Value::Array(frame)) = serde_json::from_str::<Value>(text) else {
            return Vec::new();
        };
        if frame.len() < 4 {
            return Vec::new();
        }
        let Some(name) = frame[frame.len() - 2].as_str() else {
            return Vec::new();
        };
        let Some(pair) = frame[frame.len() - 1]
            .as_str()
            .and_then(Self::canonical_pair)
        else {
            return Vec::new();
        };
        let payload = &frame[1];
        let ts = Utc::now().timestamp_millis();

        if name == "ticker" {
            let ticker = Ticker {
                exchange: "kraken".into(),
                pair: pair.clone(),
                price: num(&payload["c"][0]),
                bid: num(&payload["b"][0]),
                ask: num(&payload["a"][0]),
                high_24h: num(&payload["h"][1]),
                low_24h: num(&payload["l"][1]),
                volume: num(&payload["v"][1]),
                ts,
            };
            return vec![MarketEvent {
                kind: DataKind::Ticker,
                exchange: "kraken".into(),
                pair,
                payload: MarketPayload::Ticker(ticker),
                ts,
            }];
        }

        if name == "trade" {
            let Some(rows) = payload.as_array() else {
                return Vec::new();
            };
            return rows
                .iter()
                .filter_map(|row| {
                    let row = row.as_array()?;
                    let side = if row.get(3)?.as_str() == Some("s") {
                        Side::Sell
                    } else {
                        Side::Buy
                    };
                    let trade_ts = (num(row.get(2)?) * 1000.0) as i64;
                    let trade = MarketTrade {
                        exchange: "kraken".into(),
                        pair: pair.clone(),
                        price: num(row.first()?),
                        amount: num(row.get(1)?),
                        side,
                        ts: trade_ts,
                    };
                    Some(MarketEvent {
                        kind: DataKind::Trade,
                        exchange: "kraken".into(),
                        pair: pair.clone(),
                        payload: MarketPayload::Trade(trade),
                        ts: trade_ts,
                    })
                })
                .collect();
        }

        if name.starts_with("book") {
            // Snapshots carry "bs"/"as"; incremental updates carry "b"/"a".
            let snapshot = payload.get("bs").is_some() || payload.get("as").is_some();
            let (bids, asks) = if snapshot {
                (ladder(payload["bs"].as_array()), ladder(payload["as"].as_array()))
            } else {
                (ladder(payload["b"].as_array()), ladder(payload["a"].as_array()))
            };
            let book = OrderBook {
                exchange: "kraken".into(),
                pair: pair.clone(),
                bids,
                asks,
                ts,
            };
            return vec![MarketEvent {
                kind: if snapshot {
                    DataKind::Orderbook
                } else {
                    DataKind::OrderbookUpdate
                },
                exchange: "kraken".into(),
                pair,
                payload: MarketPayload::Book(book),
                ts,
            }];
        }

        Vec::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binance_ticker_frame_parses() {
        let parser = BinanceParser::default();
        let text = r#"{
            "e": "24hrTicker", "E": 1700000000000, "s": "BTCUSDT",
            "c": "37020.00", "b": "37019.50", "a": "37020.50",
            "h": "37500.00", "l": "36500.00", "v": "12345.678"
        }"#;
        let events = parser.parse(text);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, DataKind::Ticker);
        assert_eq!(events[0].pair, Pair::new("BTC", "USDT"));
        let MarketPayload::Ticker(t) = &events[0].payload else {
            panic!("expected ticker payload");
        };
        assert!((t.price - 37020.0).abs() < f64::EPSILON);
        assert!((t.bid - 37019.5).abs() < f64::EPSILON);
    }

    #[test]
    fn binance_trade_maker_flag_sets_side() {
        let parser = BinanceParser::default();
        let text = r#"{
            "e": "trade", "E": 1700000000000, "T": 1700000000001,
            "s": "ETHUSDT", "p": "2000.5", "q": "1.25", "m": true
        }"#;
        let events = parser.parse(text);
        let MarketPayload::Trade(t) = &events[0].payload else {
            panic!("expected trade payload");
        };
        assert_eq!(t.side, Side::Sell);
        assert_eq!(t.ts, 1700000000001);
    }

    #[test]
    fn binance_subscribe_frame_shape() {
        let parser = BinanceParser::default();
        let frame = parser.subscribe_frame(Channel::Ticker, &Pair::new("BTC", "USDT"));
        let v: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["method"], "SUBSCRIBE");
        assert_eq!(v["params"][0], "btcusdt@ticker");
    }

    #[test]
    fn binance_garbage_and_acks_yield_nothing() {
        let parser = BinanceParser::default();
        assert!(parser.parse("not json").is_empty());
        assert!(parser.parse(r#"{"result": null, "id": 1}"#).is_empty());
    }

    #[test]
    fn coinbase_ticker_and_match_parse() {
        let parser = CoinbaseParser;
        let ticker = r#"{
            "type": "ticker", "product_id": "BTC-USD",
            "price": "37000.1", "best_bid": "36999.9", "best_ask": "37000.3",
            "high_24h": "37500", "low_24h": "36000", "volume_24h": "8000",
            "time": "2023-11-14T22:13:20.000000Z"
        }"#;
        let events = parser.parse(ticker);
        assert_eq!(events[0].kind, DataKind::Ticker);
        assert_eq!(events[0].pair, Pair::new("BTC", "USD"));

        let m = r#"{
            "type": "match", "product_id": "BTC-USD",
            "price": "37000.0", "size": "0.5", "side": "sell",
            "time": "2023-11-14T22:13:21.000000Z"
        }"#;
        let events = parser.parse(m);
        assert_eq!(events[0].kind, DataKind::Trade);
    }

    #[test]
    fn coinbase_l2update_splits_sides() {
        let parser = CoinbaseParser;
        let text = r#"{
            "type": "l2update", "product_id": "ETH-USD",
            "changes": [["buy", "2000.0", "1.5"], ["sell", "2001.0", "0.7"]],
            "time": "2023-11-14T22:13:20.000000Z"
        }"#;
        let events = parser.parse(text);
        let MarketPayload::Book(book) = &events[0].payload else {
            panic!("expected book payload");
        };
        assert_eq!(book.bids, vec![(2000.0, 1.5)]);
        assert_eq!(book.asks, vec![(2001.0, 0.7)]);
    }

    #[test]
    fn kraken_ticker_maps_xbt_back_to_btc() {
        let parser = KrakenParser;
        let text = r#"[42, {
            "c": ["37000.5", "0.1"], "b": ["36999.0", "1"], "a": ["37001.0", "1"],
            "h": ["37100.0", "37500.0"], "l": ["36400.0", "36000.0"],
            "v": ["120.5", "800.25"]
        }, "ticker", "XBT/USD"]"#;
        let events = parser.parse(text);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pair, Pair::new("BTC", "USD"));
        let MarketPayload::Ticker(t) = &events[0].payload else {
            panic!("expected ticker payload");
        };
        assert!((t.volume - 800.25).abs() < f64::EPSILON);
    }

    #[test]
    fn kraken_trade_batch_yields_one_event_per_print() {
        let parser = KrakenParser;
        let text = r#"[0, [
            ["37000.1", "0.2", "1700000000.1234", "b", "l", ""],
            ["37000.2", "0.3", "1700000001.5678", "s", "m", ""]
        ], "trade", "XBT/USD"]"#;
        let events = parser.parse(text);
        assert_eq!(events.len(), 2);
        let MarketPayload::Trade(second) = &events[1].payload else {
            panic!("expected trade payload");
        };
        assert_eq!(second.side, Side::Sell);
    }

    #[test]
    fn kraken_subscribe_frame_uses_venue_symbol() {
        let parser = KrakenParser;
        let frame = parser.subscribe_frame(Channel::Trades, &Pair::new("BTC", "USD"));
        let v: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["pair"][0], "XBT/USD");
        assert_eq!(v["subscription"]["name"], "trade");
    }
}
