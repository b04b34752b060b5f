pub mod ma;
pub mod macd;
pub mod rsi;

use common::{Error, IndicatorSpec, Result};

/// Compute the full series for `spec` over `closes` (oldest first).
///
/// The returned series is aligned to the end of `closes`: its last element
/// corresponds to the latest candle. Too little history is an
/// `Evaluation` error.
pub fn compute(spec: &IndicatorSpec, closes: &[f64]) -> Result<Vec<f64>> {
    let series = match *spec {
        IndicatorSpec::Price => Some(closes.to_vec()),
        IndicatorSpec::Rsi { period } => rsi::rsi_series(closes, period as usize),
        IndicatorSpec::Sma { period } => ma::sma_series(closes, period as usize),
        IndicatorSpec::Ema { period } => ma::ema_series(closes, period as usize),
        IndicatorSpec::Macd { fast, slow, signal } => {
            macd::histogram_series(closes, fast as usize, slow as usize, signal as usize)
        }
    };

    match series {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(Error::Evaluation(format!(
            "insufficient history for {spec}: {} candles, need {}",
            closes.len(),
            min_history(spec)
        ))),
    }
}

/// Minimum number of closes needed for one value of `spec`.
pub fn min_history(spec: &IndicatorSpec) -> usize {
    match *spec {
        IndicatorSpec::Price => 1,
        IndicatorSpec::Rsi { period } => (period as usize).saturating_add(1),
        IndicatorSpec::Sma { period } | IndicatorSpec::Ema { period } => period as usize,
        IndicatorSpec::Macd { slow, signal, .. } => {
            (slow as usize).saturating_add(signal as usize).saturating_sub(1)
        }
    }
}
