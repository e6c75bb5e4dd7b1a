use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{info, warn};

use common::{CandleSeries, KlineSource, Result, Timeframe};

use crate::store::KlineStore;

/// Serves validated candle series, preferring the local cache and topping
/// it up from the exchange.
pub struct CandleLoader {
    source: Arc<dyn KlineSource>,
    store: KlineStore,
    expiry: TimeDelta,
}

impl CandleLoader {
    pub fn new(source: Arc<dyn KlineSource>, store: KlineStore, expiry: TimeDelta) -> Self {
        Self { source, store, expiry }
    }

    pub fn store(&self) -> &KlineStore {
        &self.store
    }

    /// The last `days_back` days of closed candles for the pair.
    pub async fn load_series(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        days_back: u32,
        force_refresh: bool,
    ) -> Result<CandleSeries> {
        self.load_series_at(symbol, timeframe, days_back, force_refresh, Utc::now())
            .await
    }

    /// [`load_series`](Self::load_series) with an explicit clock.
    ///
    /// A fresh cache that already reaches back to the start of the window is
    /// extended with whatever closed since its last candle. Anything else
    /// triggers a full download that replaces the cached pair.
    pub async fn load_series_at(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        days_back: u32,
        force_refresh: bool,
        now: DateTime<Utc>,
    ) -> Result<CandleSeries> {
        let since = now - TimeDelta::days(i64::from(days_back));

        if !force_refresh && self.covers(symbol, timeframe, since, now).await? {
            if let Some(last) = self.store.last_open_time(symbol, timeframe).await? {
                // Re-fetch the last cached candle too; the upsert keeps the newer copy.
                let fresh = self.source.fetch_klines(symbol, timeframe, last, now).await?;
                if !fresh.is_empty() {
                    self.store.upsert(symbol, timeframe, &fresh, now).await?;
                }
                self.store.prune_before(symbol, timeframe, since).await?;
                let candles = self.store.load_range(symbol, timeframe, since).await?;
                info!(
                    symbol,
                    timeframe = %timeframe,
                    new = fresh.len(),
                    total = candles.len(),
                    "Loaded candles from cache"
                );
                return CandleSeries::new(symbol, timeframe, candles);
            }
        }

        info!(symbol, timeframe = %timeframe, days_back, "Downloading candles");
        let candles = self.source.fetch_klines(symbol, timeframe, since, now).await?;
        if candles.is_empty() {
            warn!(symbol, timeframe = %timeframe, "No candles received");
        }
        self.store.replace(symbol, timeframe, &candles, now).await?;
        info!(symbol, timeframe = %timeframe, count = candles.len(), "Fetched candles");

        let candles = candles.into_iter().filter(|c| c.open_time >= since).collect();
        CandleSeries::new(symbol, timeframe, candles)
    }

    async fn covers(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !self.store.is_fresh(symbol, timeframe, self.expiry, now).await? {
            return Ok(false);
        }
        let meta = self.store.meta(symbol, timeframe).await?;
        Ok(meta
            .and_then(|m| m.first_candle)
            .is_some_and(|first| first <= since + timeframe.step()))
    }
}
