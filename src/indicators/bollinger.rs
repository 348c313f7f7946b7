// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band = SMA over `period`; upper/lower = middle ± `num_std` * σ where
// σ is the population standard deviation of the same window.
// =============================================================================

use super::sma::{sma, stddev};

/// Upper / middle / lower band triplet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Calculate Bollinger Bands over the trailing `period` values.
///
/// Returns `None` on insufficient data or a degenerate (zero-mean) window.
pub fn bollinger(values: &[f64], period: usize, num_std: f64) -> Option<BollingerBands> {
    let middle = sma(values, period)?;
    if middle == 0.0 {
        return None;
    }
    let sd = stddev(values, period)?;

    let upper = middle + num_std * sd;
    let lower = middle - num_std * sd;

    (upper.is_finite() && lower.is_finite()).then_some(BollingerBands {
        upper,
        middle,
        lower,
    })
}
