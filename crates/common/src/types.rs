use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Bus channel prefix for per-condition trigger channels.
pub const CONDITION_CHANNEL_PREFIX: &str = "condition:";

/// A single OHLCV candle from the market-data provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

// ─── Timeframe ────────────────────────────────────────────────────────────────

/// Candle interval. Each variant has exactly one canonical token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1m" | "1min" => Ok(Timeframe::M1),
            "5m" | "5min" => Ok(Timeframe::M5),
            "15m" | "15min" => Ok(Timeframe::M15),
            "30m" | "30min" => Ok(Timeframe::M30),
            "1h" | "60m" | "60min" => Ok(Timeframe::H1),
            "4h" | "240m" | "240min" => Ok(Timeframe::H4),
            "1d" | "24h" | "1440m" | "1440min" => Ok(Timeframe::D1),
            other => Err(Error::Validation(format!("unknown timeframe '{other}'"))),
        }
    }
}

// ─── Condition vocabulary ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionKind {
    Threshold,
    Crossing,
    Range,
}

impl ConditionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionKind::Threshold => "threshold",
            ConditionKind::Crossing => "crossing",
            ConditionKind::Range => "range",
        }
    }
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConditionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "threshold" => Ok(ConditionKind::Threshold),
            "crossing" | "cross" => Ok(ConditionKind::Crossing),
            "range" => Ok(ConditionKind::Range),
            other => Err(Error::Validation(format!("unknown condition type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "crosses_above")]
    CrossesAbove,
    #[serde(rename = "crosses_below")]
    CrossesBelow,
    #[serde(rename = "between")]
    Between,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::LessThan => "<",
            Operator::GreaterThan => ">",
            Operator::CrossesAbove => "crosses_above",
            Operator::CrossesBelow => "crosses_below",
            Operator::Between => "between",
        }
    }

    /// The condition type this operator belongs to.
    pub fn kind(&self) -> ConditionKind {
        match self {
            Operator::LessThan | Operator::GreaterThan => ConditionKind::Threshold,
            Operator::CrossesAbove | Operator::CrossesBelow => ConditionKind::Crossing,
            Operator::Between => ConditionKind::Range,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "<" | "lt" | "below" | "less_than" => Ok(Operator::LessThan),
            ">" | "gt" | "above" | "greater_than" => Ok(Operator::GreaterThan),
            "crosses_above" | "cross_above" => Ok(Operator::CrossesAbove),
            "crosses_below" | "cross_below" => Ok(Operator::CrossesBelow),
            "between" | "range" => Ok(Operator::Between),
            other => Err(Error::Validation(format!("unknown operator '{other}'"))),
        }
    }
}

/// An indicator with every parameter filled in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum IndicatorSpec {
    /// Raw close price.
    Price,
    Rsi { period: u32 },
    Sma { period: u32 },
    Ema { period: u32 },
    /// MACD histogram (MACD line minus signal line).
    Macd { fast: u32, slow: u32, signal: u32 },
}

impl IndicatorSpec {
    pub fn name(&self) -> &'static str {
        match self {
            IndicatorSpec::Price => "price",
            IndicatorSpec::Rsi { .. } => "rsi",
            IndicatorSpec::Sma { .. } => "sma",
            IndicatorSpec::Ema { .. } => "ema",
            IndicatorSpec::Macd { .. } => "macd",
        }
    }

    /// Canonical cache key, e.g. `rsi(14)` or `macd(12,26,9)`.
    /// Two conditions referencing the same key share one computed series.
    pub fn key(&self) -> String {
        match self {
            IndicatorSpec::Price => "price".to_string(),
            IndicatorSpec::Rsi { period } => format!("rsi({period})"),
            IndicatorSpec::Sma { period } => format!("sma({period})"),
            IndicatorSpec::Ema { period } => format!("ema({period})"),
            IndicatorSpec::Macd { fast, slow, signal } => format!("macd({fast},{slow},{signal})"),
        }
    }
}

impl fmt::Display for IndicatorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionValues {
    Single(f64),
    Range { lower: f64, upper: f64 },
}

/// A fully normalized condition. Equal definitions hash to equal fingerprints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionDef {
    pub kind: ConditionKind,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub indicator: IndicatorSpec,
    pub operator: Operator,
    pub values: ConditionValues,
}

impl ConditionDef {
    pub fn pair(&self) -> Pair {
        Pair {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
        }
    }
}

/// Stable hex digest of a normalized condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bus channel carrying this condition's triggers.
    pub fn channel(&self) -> String {
        format!("{CONDITION_CHANNEL_PREFIX}{}", self.0)
    }

    /// Inverse of [`Fingerprint::channel`].
    pub fn from_channel(channel: &str) -> Option<Self> {
        channel
            .strip_prefix(CONDITION_CHANNEL_PREFIX)
            .filter(|s| !s.is_empty())
            .map(Self::new)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A (symbol, timeframe) pair: the unit of fetching and evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pair {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

/// A registered condition row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub fingerprint: Fingerprint,
    #[serde(flatten)]
    pub def: ConditionDef,
    pub trigger_count: i64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ─── Subscriptions ────────────────────────────────────────────────────────────

/// Bot family. Selects the action handler a trigger is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotKind {
    Dca,
    Grid,
    Trend,
}

impl BotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotKind::Dca => "dca",
            BotKind::Grid => "grid",
            BotKind::Trend => "trend",
        }
    }
}

impl fmt::Display for BotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BotKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dca" => Ok(BotKind::Dca),
            "grid" => Ok(BotKind::Grid),
            "trend" => Ok(BotKind::Trend),
            other => Err(Error::Validation(format!("unknown bot type '{other}'"))),
        }
    }
}

/// A bot's interest in one condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub bot_id: String,
    pub owner_id: String,
    pub condition_fingerprint: Fingerprint,
    pub bot_kind: BotKind,
    /// Opaque to the core; forwarded verbatim to the action handler.
    pub bot_config: serde_json::Value,
    pub active: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─── Triggers ─────────────────────────────────────────────────────────────────

/// What the evaluator observed when a condition fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerPayload {
    pub indicator: String,
    pub operator: Operator,
    pub value: f64,
    /// Snapshot sequence number of the cycle that fired.
    pub sequence: u64,
}

/// Published on the condition's bus channel when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub fingerprint: Fingerprint,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub triggered_at: DateTime<Utc>,
    pub payload: TriggerPayload,
    pub subscriber_count: u64,
}
