/// Simple moving average, one value per full window.
pub fn sma_series(closes: &[f64], period: usize) -> Option<Vec<f64>> {
    if period == 0 || closes.len() < period {
        return None;
    }
    Some(
        closes
            .windows(period)
            .map(|w| w.iter().sum::<f64>() / period as f64)
            .collect(),
    )
}

/// Exponential moving average seeded with the SMA of the first `period` values.
pub fn ema_series(data: &[f64], period: usize) -> Option<Vec<f64>> {
    if period == 0 || data.len() < period {
        return None;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut ema = data[..period].iter().sum::<f64>() / period as f64;

    let mut out = Vec::with_capacity(data.len() - period + 1);
    out.push(ema);
    for &price in &data[period..] {
        ema = price * k + ema * (1.0 - k);
        out.push(ema);
    }
    Some(out)
}
