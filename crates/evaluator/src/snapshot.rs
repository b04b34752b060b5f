use std::collections::BTreeMap;

use common::{Candle, Error, IndicatorSpec, Pair, Result};

use crate::indicators;

/// One cycle's shared view of a (symbol, timeframe) pair: the candle
/// window plus every indicator series referenced by any condition on it.
///
/// Built once per pair per cycle and read-only afterwards.
#[derive(Debug)]
pub struct Snapshot {
    pair: Pair,
    sequence: u64,
    candles: Vec<Candle>,
    /// Indicator key -> series, or the reason it could not be computed.
    series: BTreeMap<String, std::result::Result<Vec<f64>, String>>,
}

impl Snapshot {
    /// Compute each distinct indicator exactly once, however many
    /// conditions reference it.
    pub fn build<'a>(
        pair: Pair,
        sequence: u64,
        candles: Vec<Candle>,
        specs: impl IntoIterator<Item = &'a IndicatorSpec>,
    ) -> Self {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let mut series = BTreeMap::new();
        for spec in specs {
            series
                .entry(spec.key())
                .or_insert_with(|| indicators::compute(spec, &closes).map_err(|e| e.to_string()));
        }
        Self {
            pair,
            sequence,
            candles,
            series,
        }
    }

    pub fn pair(&self) -> &Pair {
        &self.pair
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    /// Number of distinct indicator series computed for this snapshot.
    pub fn computed_indicators(&self) -> usize {
        self.series.len()
    }

    pub fn series(&self, spec: &IndicatorSpec) -> Option<&[f64]> {
        match self.series.get(&spec.key()) {
            Some(Ok(s)) => Some(s.as_slice()),
            _ => None,
        }
    }

    /// Latest value of `spec`. Fails with `Evaluation` if the series was
    /// not computed, could not be computed, or ends in a non-finite value.
    pub fn latest(&self, spec: &IndicatorSpec) -> Result<f64> {
        let series = match self.series.get(&spec.key()) {
            Some(Ok(s)) => s,
            Some(Err(reason)) => return Err(Error::Evaluation(reason.clone())),
            None => {
                return Err(Error::Evaluation(format!(
                    "{spec} not computed for {}",
                    self.pair
                )))
            }
        };
        match series.last() {
            Some(v) if v.is_finite() => Ok(*v),
            Some(v) => Err(Error::Evaluation(format!("{spec} produced non-finite value {v}"))),
            None => Err(Error::Evaluation(format!("{spec} series is empty"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::Timeframe;

    fn candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .map(|&c| Candle {
                open_time: Utc::now(),
                open: c,
                high: c,
                low: c,
                close: c,
                volume: 1.0,
            })
            .collect()
    }

    fn pair() -> Pair {
        Pair {
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::H1,
        }
    }

    #[test]
    fn shared_indicators_are_computed_once() {
        let rsi = IndicatorSpec::Rsi { period: 3 };
        let refs = vec![&rsi, &rsi, &IndicatorSpec::Price, &rsi];
        let snap = Snapshot::build(pair(), 1, candles(&[1.0, 2.0, 3.0, 4.0, 5.0]), refs);
        assert_eq!(snap.computed_indicators(), 2);
        assert_eq!(snap.latest(&IndicatorSpec::Price).unwrap(), 5.0);
        assert!((snap.latest(&rsi).unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn failed_series_reports_evaluation_error_without_poisoning_others() {
        let rsi = IndicatorSpec::Rsi { period: 14 };
        let snap = Snapshot::build(pair(), 1, candles(&[1.0, 2.0]), [&rsi, &IndicatorSpec::Price]);
        assert!(matches!(snap.latest(&rsi), Err(Error::Evaluation(_))));
        assert_eq!(snap.latest(&IndicatorSpec::Price).unwrap(), 2.0);
    }

    #[test]
    fn unreferenced_indicator_is_an_evaluation_error() {
        let snap = Snapshot::build(pair(), 1, candles(&[1.0]), [&IndicatorSpec::Price]);
        assert!(snap.latest(&IndicatorSpec::Sma { period: 2 }).is_err());
        assert!(snap.series(&IndicatorSpec::Sma { period: 2 }).is_none());
    }
}
