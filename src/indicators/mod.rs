// =============================================================================
// Technical Indicators
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators exposed through the
// strategy market context. Every public function handles insufficient-data and
// numerical edge cases explicitly (empty series / `None`), so callers never
// see NaN.

pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod rsi;
pub mod sma;

pub use bollinger::{bollinger, BollingerBands};
pub use ema::{ema_series, last_ema};
pub use macd::{macd, Macd};
pub use rsi::{last_rsi, rsi_series};
pub use sma::{sma, stddev};
