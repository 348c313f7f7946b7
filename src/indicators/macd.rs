// =============================================================================
// MACD — Moving Average Convergence/Divergence
// =============================================================================
//
// MACD line = EMA(fast) - EMA(slow). The signal line here is the flat
// approximation `SIGNAL_FACTOR * macd_line` rather than the textbook 9-period
// EMA of the MACD line: the momentum strategy's histogram thresholds were
// tuned against this form, so the constant is part of its contract.
// =============================================================================

use super::ema::last_ema;

/// Signal line approximation factor.
pub const SIGNAL_FACTOR: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute MACD from the trailing closes with the given fast/slow periods.
///
/// Returns `None` when either EMA cannot be computed.
pub fn macd(values: &[f64], fast: usize, slow: usize) -> Option<Macd> {
    let ema_fast = last_ema(values, fast)?;
    let ema_slow = last_ema(values, slow)?;

    let line = ema_fast - ema_slow;
    let signal = SIGNAL_FACTOR * line;
    let histogram = line - signal;

    (line.is_finite() && histogram.is_finite()).then_some(Macd {
        line,
        signal,
        histogram,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_positive_in_uptrend() {
        let values: Vec<f64> = (1..=60).map(|x| 100.0 + x as f64).collect();
        let m = macd(&values, 12, 26).unwrap();
        assert!(m.line > 0.0);
        // Histogram keeps the line's sign under the flat-factor signal.
        assert!(m.histogram > 0.0);
        assert!((m.histogram - m.line * (1.0 - SIGNAL_FACTOR)).abs() < 1e-10);
    }

    #[test]
    fn macd_negative_in_downtrend() {
        let values: Vec<f64> = (1..=60).map(|x| 200.0 - x as f64).collect();
        let m = macd(&values, 12, 26).unwrap();
        assert!(m.line < 0.0);
        assert!(m.histogram < 0.0);
    }

    #[test]
    fn macd_insufficient_data() {
        let values = vec![1.0; 20];
        assert!(macd(&values, 12, 26).is_none());
    }
}
