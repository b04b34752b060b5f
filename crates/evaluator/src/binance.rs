use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;

use common::{Candle, Error, MarketDataClient, Result, Timeframe};

/// Binance caps a single klines request at this many rows.
const MAX_KLINES: usize = 1000;

/// Public klines client for Binance spot. No credentials required.
pub struct BinanceMarketData {
    base_url: String,
    http: Client,
}

impl BinanceMarketData {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .use_rustls_tls()
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl MarketDataClient for BinanceMarketData {
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let limit = limit.clamp(1, MAX_KLINES);
        let url = format!(
            "{}/api/v3/klines?symbol={symbol}&interval={}&limit={limit}",
            self.base_url,
            timeframe.as_str()
        );

        debug!(%symbol, %timeframe, limit, "Fetching klines");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::ServiceUnavailable(format!("market data request failed: {e}")))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(Error::ServiceUnavailable(format!("market data HTTP {status}: {body}")));
        }
        if !status.is_success() {
            return Err(Error::Other(format!("market data HTTP {status}: {body}")));
        }

        parse_klines(&body)
    }
}

// ─── Binance klines JSON parsing ─────────────────────────────────────────────

/// Rows are `[openTime, "open", "high", "low", "close", "volume", closeTime, ...]`.
fn parse_klines(body: &str) -> Result<Vec<Candle>> {
    let rows: Vec<Vec<Value>> = serde_json::from_str(body)?;
    rows.iter().map(|row| parse_kline_row(row)).collect()
}

fn parse_kline_row(row: &[Value]) -> Result<Candle> {
    if row.len() < 6 {
        return Err(Error::Other(format!("kline row has {} fields, expected >= 6", row.len())));
    }
    let open_time_ms = row[0]
        .as_i64()
        .ok_or_else(|| Error::Other("kline open time is not an integer".into()))?;
    let open_time: DateTime<Utc> = Utc
        .timestamp_millis_opt(open_time_ms)
        .single()
        .ok_or_else(|| Error::Other(format!("kline open time out of range: {open_time_ms}")))?;

    Ok(Candle {
        open_time,
        open: decimal(&row[1], "open")?,
        high: decimal(&row[2], "high")?,
        low: decimal(&row[3], "low")?,
        close: decimal(&row[4], "close")?,
        volume: decimal(&row[5], "volume")?,
    })
}

/// Binance sends prices as strings; accept bare numbers too.
fn decimal(v: &Value, field: &str) -> Result<f64> {
    match v {
        Value::String(s) => s
            .parse()
            .map_err(|_| Error::Other(format!("kline {field} is not a number: '{s}'"))),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| Error::Other(format!("kline {field} out of range"))),
        other => Err(Error::Other(format!("kline {field} has unexpected type: {other}"))),
    }
}
