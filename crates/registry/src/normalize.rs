//! Canonicalization of user-supplied conditions into a deterministic form
//! and its SHA-256 fingerprint.
//!
//! Pure functions only. Casing, key order, aliases and omitted defaults
//! never change the fingerprint of semantically equal inputs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use common::{
    ConditionDef, ConditionKind, ConditionValues, Error, Fingerprint, IndicatorSpec, Operator,
    Result, Timeframe,
};

const CANONICAL_VERSION: &str = "v1";
/// Decimal places used for every numeric value in the canonical form.
const VALUE_DECIMALS: usize = 8;

pub const DEFAULT_RSI_PERIOD: u32 = 14;
pub const DEFAULT_MA_PERIOD: u32 = 20;
pub const DEFAULT_MACD: (u32, u32, u32) = (12, 26, 9);
/// Longest indicator period accepted. A single klines request returns at
/// most this many candles, so longer lookbacks could never be computed.
pub const MAX_INDICATOR_PERIOD: u32 = 1000;

/// A condition as submitted by a client, before validation.
///
/// ```json
/// { "type": "threshold", "symbol": "btc/usdt", "timeframe": "1H",
///   "indicator": "RSI", "operator": "<", "value": 30 }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub symbol: String,
    pub timeframe: String,
    #[serde(default)]
    pub indicator: Option<String>,
    #[serde(default)]
    pub period: Option<u32>,
    /// Extra indicator parameters (`fast`, `slow`, `signal` for MACD).
    #[serde(default)]
    pub params: BTreeMap<String, u32>,
    pub operator: String,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub lower_bound: Option<f64>,
    #[serde(default)]
    pub upper_bound: Option<f64>,
}

/// Validate and canonicalize a raw condition.
pub fn normalize(raw: &RawCondition) -> Result<ConditionDef> {
    let kind: ConditionKind = raw.kind.parse()?;
    let operator: Operator = raw.operator.parse()?;
    if operator.kind() != kind {
        return Err(Error::Validation(format!(
            "operator '{operator}' is not valid for a {kind} condition"
        )));
    }

    let symbol = normalize_symbol(&raw.symbol)?;
    let timeframe: Timeframe = raw.timeframe.parse()?;
    let indicator = normalize_indicator(raw)?;
    let values = normalize_values(kind, raw)?;

    Ok(ConditionDef {
        kind,
        symbol,
        timeframe,
        indicator,
        operator,
        values,
    })
}

/// The exact string that gets hashed. Field order is fixed.
pub fn canonical_form(def: &ConditionDef) -> String {
    let params = indicator_params(&def.indicator)
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    let values = match def.values {
        ConditionValues::Single(v) => fixed(v),
        ConditionValues::Range { lower, upper } => format!("{},{}", fixed(lower), fixed(upper)),
    };
    format!(
        "{CANONICAL_VERSION}|kind={}|symbol={}|timeframe={}|indicator={}|params={}|operator={}|values={}",
        def.kind,
        def.symbol,
        def.timeframe,
        def.indicator.name(),
        params,
        def.operator,
        values,
    )
}

/// SHA-256 of the canonical form, hex encoded.
pub fn fingerprint(def: &ConditionDef) -> Fingerprint {
    let digest = Sha256::digest(canonical_form(def).as_bytes());
    Fingerprint::new(hex::encode(digest))
}

pub fn normalize_and_hash(raw: &RawCondition) -> Result<(ConditionDef, Fingerprint)> {
    let def = normalize(raw)?;
    let fp = fingerprint(&def);
    Ok((def, fp))
}

// ─── Field normalizers ────────────────────────────────────────────────────────

fn normalize_symbol(raw: &str) -> Result<String> {
    let symbol: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '/' | '-' | '_'))
        .collect::<String>()
        .to_uppercase();
    if symbol.is_empty() {
        return Err(Error::Validation("symbol must not be empty".into()));
    }
    if !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::Validation(format!("invalid symbol '{raw}'")));
    }
    Ok(symbol)
}

fn normalize_indicator(raw: &RawCondition) -> Result<IndicatorSpec> {
    let params: BTreeMap<String, u32> = raw
        .params
        .iter()
        .map(|(k, v)| (k.trim().to_lowercase(), *v))
        .collect();
    let period = raw.period.or_else(|| params.get("period").copied());

    let name = raw
        .indicator
        .as_deref()
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_default();

    let spec = match name.as_str() {
        "" | "price" | "close" => IndicatorSpec::Price,
        "rsi" => IndicatorSpec::Rsi {
            period: period.unwrap_or(DEFAULT_RSI_PERIOD),
        },
        "sma" => IndicatorSpec::Sma {
            period: period.unwrap_or(DEFAULT_MA_PERIOD),
        },
        "ema" => IndicatorSpec::Ema {
            period: period.unwrap_or(DEFAULT_MA_PERIOD),
        },
        "macd" => {
            let (fast, slow, signal) = DEFAULT_MACD;
            let fast = params.get("fast").copied().unwrap_or(fast);
            let slow = params.get("slow").copied().unwrap_or(slow);
            let signal = params.get("signal").copied().unwrap_or(signal);
            if fast >= slow {
                return Err(Error::Validation(format!(
                    "macd fast period ({fast}) must be less than slow period ({slow})"
                )));
            }
            IndicatorSpec::Macd { fast, slow, signal }
        }
        other => return Err(Error::Validation(format!("unknown indicator '{other}'"))),
    };

    if indicator_params(&spec).values().any(|&p| p == 0) {
        return Err(Error::Validation(format!(
            "indicator '{}' periods must be positive",
            spec.name()
        )));
    }
    if let Some((name, p)) = indicator_params(&spec)
        .into_iter()
        .find(|&(_, p)| p > MAX_INDICATOR_PERIOD)
    {
        return Err(Error::Validation(format!(
            "indicator '{}' {name} period {p} exceeds the maximum of {MAX_INDICATOR_PERIOD}",
            spec.name()
        )));
    }
    if matches!(spec, IndicatorSpec::Rsi { period } if period < 2) {
        return Err(Error::Validation("rsi period must be at least 2".into()));
    }
    Ok(spec)
}

fn normalize_values(kind: ConditionKind, raw: &RawCondition) -> Result<ConditionValues> {
    match kind {
        ConditionKind::Threshold | ConditionKind::Crossing => {
            let value = raw
                .value
                .ok_or_else(|| Error::Validation(format!("{kind} condition requires 'value'")))?;
            Ok(ConditionValues::Single(canonical_number(value, "value")?))
        }
        ConditionKind::Range => {
            let (lower, upper) = match (raw.lower_bound, raw.upper_bound) {
                (Some(l), Some(u)) => (canonical_number(l, "lowerBound")?, canonical_number(u, "upperBound")?),
                _ => {
                    return Err(Error::Validation(
                        "range condition requires 'lowerBound' and 'upperBound'".into(),
                    ))
                }
            };
            if lower > upper {
                return Err(Error::Validation(format!(
                    "lowerBound ({lower}) must not exceed upperBound ({upper})"
                )));
            }
            Ok(ConditionValues::Range { lower, upper })
        }
    }
}

fn indicator_params(spec: &IndicatorSpec) -> BTreeMap<&'static str, u32> {
    match *spec {
        IndicatorSpec::Price => BTreeMap::new(),
        IndicatorSpec::Rsi { period } | IndicatorSpec::Sma { period } | IndicatorSpec::Ema { period } => {
            BTreeMap::from([("period", period)])
        }
        IndicatorSpec::Macd { fast, slow, signal } => {
            BTreeMap::from([("fast", fast), ("signal", signal), ("slow", slow)])
        }
    }
}

/// Round to the canonical precision so the stored value equals what was hashed.
fn canonical_number(v: f64, field: &str) -> Result<f64> {
    if !v.is_finite() {
        return Err(Error::Validation(format!("{field} must be a finite number")));
    }
    fixed(v)
        .parse()
        .map_err(|_| Error::Validation(format!("{field} is out of range")))
}

fn fixed(v: f64) -> String {
    // -0.0 and 0.0 are the same threshold
    let v = if v == 0.0 { 0.0 } else { v };
    format!("{:.*}", VALUE_DECIMALS, v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsi_below(symbol: &str, timeframe: &str) -> RawCondition {
        RawCondition {
            kind: "threshold".into(),
            symbol: symbol.into(),
            timeframe: timeframe.into(),
            indicator: Some("rsi".into()),
            operator: "<".into(),
            value: Some(30.0),
            ..Default::default()
        }
    }

    #[test]
    fn casing_and_separators_do_not_change_fingerprint() {
        let (_, a) = normalize_and_hash(&rsi_below("btc/usdt", "1H")).unwrap();
        let (_, b) = normalize_and_hash(&rsi_below("BTCUSDT", "60m")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn omitted_default_period_equals_explicit_default() {
        let implicit = rsi_below("BTCUSDT", "1h");
        let explicit = RawCondition {
            period: Some(14),
            ..implicit.clone()
        };
        assert_eq!(
            normalize_and_hash(&implicit).unwrap().1,
            normalize_and_hash(&explicit).unwrap().1
        );
    }

    #[test]
    fn different_threshold_changes_fingerprint() {
        let a = rsi_below("BTCUSDT", "1h");
        let b = RawCondition {
            value: Some(31.0),
            ..a.clone()
        };
        assert_ne!(
            normalize_and_hash(&a).unwrap().1,
            normalize_and_hash(&b).unwrap().1
        );
    }

    #[test]
    fn numeric_representation_is_fixed() {
        let a = rsi_below("BTCUSDT", "1h");
        let b = RawCondition {
            value: Some(30.000000001),
            ..a.clone()
        };
        assert_eq!(
            normalize_and_hash(&a).unwrap().1,
            normalize_and_hash(&b).unwrap().1
        );
    }

    #[test]
    fn canonical_form_is_stable() {
        let def = normalize(&rsi_below("ethusdt", "4h")).unwrap();
        assert_eq!(
            canonical_form(&def),
            "v1|kind=threshold|symbol=ETHUSDT|timeframe=4h|indicator=rsi|params=period=14|operator=<|values=30.00000000"
        );
        assert_eq!(fingerprint(&def).as_str().len(), 64);
    }

    #[test]
    fn macd_params_are_sorted_and_defaulted() {
        let raw = RawCondition {
            kind: "crossing".into(),
            symbol: "BTCUSDT".into(),
            timeframe: "1h".into(),
            indicator: Some("MACD".into()),
            params: BTreeMap::from([("Slow".into(), 26)]),
            operator: "cross_above".into(),
            value: Some(0.0),
            ..Default::default()
        };
        let def = normalize(&raw).unwrap();
        assert_eq!(def.indicator, IndicatorSpec::Macd { fast: 12, slow: 26, signal: 9 });
        assert!(canonical_form(&def).contains("params=fast=12,signal=9,slow=26"));
    }

    #[test]
    fn operator_must_match_kind() {
        let raw = RawCondition {
            operator: "crosses_above".into(),
            ..rsi_below("BTCUSDT", "1h")
        };
        assert!(matches!(normalize(&raw), Err(Error::Validation(_))));
    }

    #[test]
    fn range_requires_ordered_bounds() {
        let raw = RawCondition {
            kind: "range".into(),
            symbol: "BTCUSDT".into(),
            timeframe: "1h".into(),
            operator: "between".into(),
            lower_bound: Some(35.0),
            upper_bound: Some(25.0),
            ..Default::default()
        };
        assert!(matches!(normalize(&raw), Err(Error::Validation(_))));

        let missing = RawCondition {
            upper_bound: None,
            ..raw
        };
        assert!(matches!(normalize(&missing), Err(Error::Validation(_))));
    }

    #[test]
    fn rejects_malformed_inputs() {
        let mut raw = rsi_below("", "1h");
        assert!(normalize(&raw).is_err());

        raw = rsi_below("BTCUSDT", "7m");
        assert!(normalize(&raw).is_err());

        raw = RawCondition {
            value: Some(f64::NAN),
            ..rsi_below("BTCUSDT", "1h")
        };
        assert!(normalize(&raw).is_err());

        raw = RawCondition {
            indicator: Some("vwap".into()),
            ..rsi_below("BTCUSDT", "1h")
        };
        assert!(normalize(&raw).is_err());

        raw = RawCondition {
            period: Some(0),
            ..rsi_below("BTCUSDT", "1h")
        };
        assert!(normalize(&raw).is_err());

        raw = RawCondition {
            value: None,
            ..rsi_below("BTCUSDT", "1h")
        };
        assert!(normalize(&raw).is_err());
    }

    #[test]
    fn missing_indicator_means_price() {
        let raw = RawCondition {
            indicator: None,
            ..rsi_below("BTCUSDT", "1h")
        };
        assert_eq!(normalize(&raw).unwrap().indicator, IndicatorSpec::Price);
    }

    #[test]
    fn periods_above_the_lookback_cap_are_rejected() {
        let at_cap = RawCondition {
            period: Some(MAX_INDICATOR_PERIOD),
            ..rsi_below("BTCUSDT", "1h")
        };
        assert!(normalize(&at_cap).is_ok());

        let over = RawCondition {
            period: Some(MAX_INDICATOR_PERIOD + 1),
            ..rsi_below("BTCUSDT", "1h")
        };
        assert!(matches!(normalize(&over), Err(Error::Validation(_))));

        let huge_macd = RawCondition {
            indicator: Some("macd".into()),
            params: BTreeMap::from([
                ("fast".to_string(), 1),
                ("slow".to_string(), u32::MAX),
                ("signal".to_string(), 1),
            ]),
            ..rsi_below("BTCUSDT", "1h")
        };
        assert!(matches!(normalize(&huge_macd), Err(Error::Validation(_))));
    }
}
