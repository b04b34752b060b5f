use async_trait::async_trait;

use crate::{Candle, Result, Timeframe};

/// Abstraction over the market-data provider.
///
/// `BinanceMarketData` implements this against the public klines endpoint.
/// Tests substitute a scripted client. Only the evaluator calls this, once
/// per (symbol, timeframe) pair per cycle.
#[async_trait]
pub trait MarketDataClient: Send + Sync {
    /// Fetch the most recent `limit` candles, oldest first.
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>>;
}
