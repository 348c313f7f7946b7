// =============================================================================
// Shared types used across the Vela trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Trading pair
// ---------------------------------------------------------------------------

/// Quote currencies recognised when splitting a joined symbol like `BTCUSDT`.
/// Longest-suffix match wins, so `USDT` is tried before `USD`.
const KNOWN_QUOTES: &[&str] = &[
    "USDT", "USDC", "BUSD", "TUSD", "USD", "EUR", "GBP", "BTC", "ETH", "BNB",
];

/// A trading pair in canonical `BASE/QUOTE` uppercase form.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pair {
    pub base: String,
    pub quote: String,
}

impl Pair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().to_uppercase(),
            quote: quote.into().to_uppercase(),
        }
    }

    /// Parse any of the accepted ingress forms: `BASE/QUOTE`, `BASE-QUOTE`,
    /// or a joined `BASEQUOTE` symbol whose quote is a known currency.
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let s = input.trim().to_uppercase();
        if s.is_empty() {
            return Err(CoreError::validation("pair must not be empty"));
        }

        for sep in ['/', '-'] {
            if let Some((base, quote)) = s.split_once(sep) {
                if base.is_empty() || quote.is_empty() {
                    return Err(CoreError::validation(format!("malformed pair: {input}")));
                }
                return Ok(Self::new(base, quote));
            }
        }

        // Joined form: match the longest known quote suffix.
        for quote in KNOWN_QUOTES {
            if let Some(base) = s.strip_suffix(quote) {
                if !base.is_empty() {
                    return Ok(Self::new(base, *quote));
                }
            }
        }

        Err(CoreError::validation(format!(
            "cannot normalise pair: {input}"
        )))
    }

    /// The asset acquired or disposed of by a trade on this pair.
    pub fn asset(&self) -> &str {
        &self.base
    }

    /// Filesystem-safe form used for on-disk directory names (`BTC-USDT`).
    pub fn file_form(&self) -> String {
        format!("{}-{}", self.base, self.quote)
    }

    /// Joined exchange-symbol form (`BTCUSDT`).
    pub fn joined(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

impl std::fmt::Display for Pair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl std::str::FromStr for Pair {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Timeframe
// ---------------------------------------------------------------------------

/// Candle duration with the grammar `{integer}{m|h|d|w|M}`.
///
/// The month unit is approximated as 30 days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timeframe {
    pub qty: u32,
    pub unit: TimeframeUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeframeUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl Timeframe {
    pub const fn minutes(qty: u32) -> Self {
        Self {
            qty,
            unit: TimeframeUnit::Minute,
        }
    }

    pub const fn hours(qty: u32) -> Self {
        Self {
            qty,
            unit: TimeframeUnit::Hour,
        }
    }

    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let s = input.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| CoreError::validation(format!("timeframe missing unit: {input}")))?;
        let (digits, unit) = s.split_at(split);
        let qty: u32 = digits
            .parse()
            .map_err(|_| CoreError::validation(format!("bad timeframe quantity: {input}")))?;
        if qty == 0 {
            return Err(CoreError::validation("timeframe quantity must be positive"));
        }
        let unit = match unit {
            "m" => TimeframeUnit::Minute,
            "h" => TimeframeUnit::Hour,
            "d" => TimeframeUnit::Day,
            "w" => TimeframeUnit::Week,
            "M" => TimeframeUnit::Month,
            other => {
                return Err(CoreError::validation(format!(
                    "unknown timeframe unit: {other}"
                )))
            }
        };
        Ok(Self { qty, unit })
    }

    /// Duration of one candle in milliseconds.
    pub fn as_millis(&self) -> i64 {
        let unit_ms: i64 = match self.unit {
            TimeframeUnit::Minute => 60_000,
            TimeframeUnit::Hour => 3_600_000,
            TimeframeUnit::Day => 86_400_000,
            TimeframeUnit::Week => 7 * 86_400_000,
            TimeframeUnit::Month => 30 * 86_400_000,
        };
        self.qty as i64 * unit_ms
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let unit = match self.unit {
            TimeframeUnit::Minute => "m",
            TimeframeUnit::Hour => "h",
            TimeframeUnit::Day => "d",
            TimeframeUnit::Week => "w",
            TimeframeUnit::Month => "M",
        };
        write!(f, "{}{}", self.qty, unit)
    }
}

impl std::str::FromStr for Timeframe {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Timeframe {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Timeframe {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// A single OHLCV candle. Timestamps are milliseconds since the UNIX epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Structural validity: finite fields, `high >= low`, positive open and
    /// close, non-negative volume.
    pub fn is_valid(&self) -> bool {
        self.timestamp > 0
            && self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.volume.is_finite()
            && self.high >= self.low
            && self.open > 0.0
            && self.close > 0.0
            && self.volume >= 0.0
    }
}

// ---------------------------------------------------------------------------
// Live market data shapes
// ---------------------------------------------------------------------------

/// Normalized 24h ticker from a single venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub exchange: String,
    pub pair: Pair,
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub volume: f64,
    pub ts: i64,
}

/// One side of an order book: `(price, quantity)` ladder, best first.
pub type BookSide = Vec<(f64, f64)>;

/// Normalized order book snapshot or incremental update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub exchange: String,
    pub pair: Pair,
    pub bids: BookSide,
    pub asks: BookSide,
    pub ts: i64,
}

/// Normalized public trade print.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketTrade {
    pub exchange: String,
    pub pair: Pair,
    pub price: f64,
    pub amount: f64,
    pub side: Side,
    pub ts: i64,
}

// ---------------------------------------------------------------------------
// Sides and signals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn flipped(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// What a strategy wants done right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

/// A strategy's intent for one evaluation instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub action: SignalAction,
    /// Conviction in `[0, 1]`.
    pub confidence: f64,
    pub price: f64,
    pub amount: f64,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing_stop: Option<f64>,
}

impl Signal {
    /// A no-op signal with the given commentary.
    pub fn hold(price: f64, reason: impl Into<String>) -> Self {
        Self {
            action: SignalAction::Hold,
            confidence: 0.0,
            price,
            amount: 0.0,
            reason: reason.into(),
            stop_loss: None,
            take_profit: None,
            trailing_stop: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine mode
// ---------------------------------------------------------------------------

/// Whether the engine routes strategy signals into live order creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    // ---- Pair --------------------------------------------------------------

    #[test]
    fn pair_parses_slash_form() {
        let p = Pair::parse("btc/usdt").unwrap();
        assert_eq!(p, Pair::new("BTC", "USDT"));
        assert_eq!(p.to_string(), "BTC/USDT");
    }

    #[test]
    fn pair_parses_dash_form() {
        assert_eq!(Pair::parse("ETH-USD").unwrap(), Pair::new("ETH", "USD"));
    }

    #[test]
    fn pair_parses_joined_form_longest_quote_wins() {
        // USDT must win over USD for BTCUSDT.
        assert_eq!(Pair::parse("BTCUSDT").unwrap(), Pair::new("BTC", "USDT"));
        assert_eq!(Pair::parse("SOLUSD").unwrap(), Pair::new("SOL", "USD"));
    }

    #[test]
    fn pair_rejects_garbage() {
        assert!(Pair::parse("").is_err());
        assert!(Pair::parse("/USDT").is_err());
        assert!(Pair::parse("QQQQQQ").is_err());
    }

    #[test]
    fn pair_file_form_is_dash_separated() {
        assert_eq!(Pair::new("BTC", "USDT").file_form(), "BTC-USDT");
    }

    // ---- Timeframe ---------------------------------------------------------

    #[test]
    fn timeframe_parse_and_millis() {
        assert_eq!(Timeframe::parse("1m").unwrap().as_millis(), 60_000);
        assert_eq!(Timeframe::parse("4h").unwrap().as_millis(), 4 * 3_600_000);
        assert_eq!(Timeframe::parse("1d").unwrap().as_millis(), 86_400_000);
        assert_eq!(Timeframe::parse("2w").unwrap().as_millis(), 14 * 86_400_000);
        // Month approximated as 30 days.
        assert_eq!(Timeframe::parse("1M").unwrap().as_millis(), 30 * 86_400_000);
    }

    #[test]
    fn timeframe_round_trips_display() {
        for s in ["1m", "5m", "1h", "3d", "1w", "1M"] {
            assert_eq!(Timeframe::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn timeframe_rejects_bad_input() {
        assert!(Timeframe::parse("").is_err());
        assert!(Timeframe::parse("0m").is_err());
        assert!(Timeframe::parse("15").is_err());
        assert!(Timeframe::parse("x5m").is_err());
        assert!(Timeframe::parse("5s").is_err());
    }

    // ---- Candle ------------------------------------------------------------

    #[test]
    fn candle_validity() {
        let good = Candle {
            timestamp: 1_700_000_000_000,
            open: 100.0,
            high: 105.0,
            low: 95.0,
            close: 101.0,
            volume: 12.5,
        };
        assert!(good.is_valid());

        let inverted = Candle { high: 90.0, ..good };
        assert!(!inverted.is_valid());

        let negative_volume = Candle {
            volume: -1.0,
            ..good
        };
        assert!(!negative_volume.is_valid());

        let zero_close = Candle { close: 0.0, ..good };
        assert!(!zero_close.is_valid());
    }
}
