// =============================================================================
// Market Data — venue WebSocket clients and the cross-venue aggregator
// =============================================================================

pub mod aggregator;
pub mod parsers;
pub mod venue;

pub use aggregator::{AggregatedPrice, MarketAggregator};
pub use venue::{Channel, VenueClient, VenueEvent, VenueStatus};

use serde::{Deserialize, Serialize};

use crate::types::{MarketTrade, OrderBook, Pair, Ticker};

/// Kinds of normalized market data fanned out by venue clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Ticker,
    Orderbook,
    OrderbookUpdate,
    Trade,
    AggregatedTrade,
}

impl std::fmt::Display for DataKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ticker => "ticker",
            Self::Orderbook => "orderbook",
            Self::OrderbookUpdate => "orderbook_update",
            Self::Trade => "trade",
            Self::AggregatedTrade => "aggregated_trade",
        };
        write!(f, "{s}")
    }
}

/// Typed payload carried by a [`MarketEvent`].
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MarketPayload {
    Ticker(Ticker),
    Book(OrderBook),
    Trade(MarketTrade),
}

/// A normalized data event: venue wire formats are translated into this shape
/// before anything downstream sees them.
#[derive(Debug, Clone, Serialize)]
pub struct MarketEvent {
    pub kind: DataKind,
    pub exchange: String,
    pub pair: Pair,
    pub payload: MarketPayload,
    pub ts: i64,
}
