use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Candle, Result, Timeframe};

/// Abstraction over a historical candle provider.
///
/// `BinanceClient` in `crates/data` implements this against the public REST
/// API. Tests substitute an in-memory source.
///
/// Only the candle loader talks to a `KlineSource`; the backtest engine
/// receives already validated series and never performs I/O.
#[async_trait]
pub trait KlineSource: Send + Sync {
    /// Fetch every candle whose open time lies in `[start, end)`, oldest
    /// first, without duplicates.
    async fn fetch_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>>;
}
