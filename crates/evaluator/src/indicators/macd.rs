use super::ma::ema_series;

/// MACD histogram series: (EMA(fast) − EMA(slow)) − EMA(macd_line, signal).
///
/// Positive while the MACD line is above its signal line, so a crossing of
/// zero is a MACD/signal crossover. Needs `slow + signal - 1` closes.
pub fn histogram_series(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<Vec<f64>> {
    if fast == 0 || fast >= slow || signal == 0 {
        return None;
    }
    let fast_ema = ema_series(closes, fast)?;
    let slow_ema = ema_series(closes, slow)?;

    // Align the fast series to the (shorter) slow one.
    let offset = fast_ema.len() - slow_ema.len();
    let macd_line: Vec<f64> = slow_ema
        .iter()
        .enumerate()
        .map(|(i, s)| fast_ema[i + offset] - s)
        .collect();

    let signal_line = ema_series(&macd_line, signal)?;
    let offset = macd_line.len() - signal_line.len();
    Some(
        signal_line
            .iter()
            .enumerate()
            .map(|(i, sig)| macd_line[i + offset] - sig)
            .collect(),
    )
}
