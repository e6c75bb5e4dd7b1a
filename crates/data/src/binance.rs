use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::de::IgnoredAny;
use serde::Deserialize;
use tracing::{debug, warn};

use common::{Candle, Config, Error, KlineSource, Result, Timeframe};

const KLINES_PATH: &str = "/api/v3/klines";
const MAX_ATTEMPTS: u32 = 5;
const BASE_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Public market-data client for Binance spot klines. No API key needed.
pub struct BinanceClient {
    base_url: String,
    http: Client,
    limit: u16,
    rate_limit_delay: Duration,
}

impl BinanceClient {
    pub fn new(base_url: impl Into<String>, limit: u16, rate_limit_delay: Duration) -> Result<Self> {
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            limit: limit.clamp(1, 1000),
            rate_limit_delay,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(&cfg.binance_base_url, cfg.klines_limit, cfg.rate_limit_delay)
    }

    /// One page, retried with exponential backoff on transport errors,
    /// throttling and server errors.
    async fn fetch_page(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<KlineRow>> {
        let mut attempt = 1;
        loop {
            match self.request_page(symbol, timeframe, start_ms, end_ms).await {
                Ok(rows) => {
                    tokio::time::sleep(self.rate_limit_delay).await;
                    return Ok(rows);
                }
                Err(Error::Http(reason)) if attempt < MAX_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        symbol,
                        timeframe = %timeframe,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Kline request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn request_page(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<KlineRow>> {
        let url = format!("{}{KLINES_PATH}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("symbol", symbol.to_string()),
                ("interval", timeframe.as_str().to_string()),
                ("startTime", start_ms.to_string()),
                ("endTime", end_ms.to_string()),
                ("limit", self.limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(Error::Http(format!("HTTP {status}: {body}")));
        }
        if !status.is_success() {
            return Err(Error::Exchange(format!("HTTP {status}: {body}")));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl KlineSource for BinanceClient {
    async fn fetch_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let start_ms = start.timestamp_millis();
        let end_ms = end.timestamp_millis();
        debug!(symbol, timeframe = %timeframe, %start, %end, "Fetching klines");

        let rows = collect_pages(start_ms, end_ms, usize::from(self.limit), |cursor| {
            self.fetch_page(symbol, timeframe, cursor, end_ms)
        })
        .await?;

        // A candle is only usable once it has closed.
        let candles = rows
            .iter()
            .filter(|row| row.close_time() < end_ms)
            .map(KlineRow::to_candle)
            .collect::<Result<Vec<_>>>()?;
        debug!(symbol, timeframe = %timeframe, count = candles.len(), "Klines fetched");
        Ok(candles)
    }
}

/// Walk pages forward from `start_ms`, advancing past the close time of the
/// last row, until a short page or `end_ms`. Rows are returned sorted by open
/// time with duplicates removed (first occurrence kept).
pub(crate) async fn collect_pages<F, Fut>(
    start_ms: i64,
    end_ms: i64,
    limit: usize,
    mut fetch_page: F,
) -> Result<Vec<KlineRow>>
where
    F: FnMut(i64) -> Fut,
    Fut: Future<Output = Result<Vec<KlineRow>>>,
{
    let mut rows: Vec<KlineRow> = Vec::new();
    let mut cursor = start_ms;

    while cursor < end_ms {
        let page = fetch_page(cursor).await?;
        let Some(last) = page.last() else { break };
        let next = last.close_time() + 1;
        let short = page.len() < limit;
        rows.extend(page);
        if short || next <= cursor {
            break;
        }
        cursor = next;
    }

    rows.sort_by_key(KlineRow::open_time);
    rows.dedup_by_key(|row| row.open_time());
    Ok(rows)
}

/// 2 s, 4 s, 8 s, then capped at 10 s.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    BASE_BACKOFF.saturating_mul(factor).min(MAX_BACKOFF)
}

/// Raw kline array as returned by `/api/v3/klines`:
/// `[open_time, open, high, low, close, volume, close_time, quote_volume,
///   trades, taker_base, taker_quote, ignore]`.
#[derive(Debug, Deserialize)]
pub(crate) struct KlineRow(
    i64,
    Decimal,
    Decimal,
    Decimal,
    Decimal,
    Decimal,
    i64,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
);

impl KlineRow {
    pub(crate) fn open_time(&self) -> i64 {
        self.0
    }

    pub(crate) fn close_time(&self) -> i64 {
        self.6
    }

    fn to_candle(&self) -> Result<Candle> {
        let open_time = DateTime::from_timestamp_millis(self.0)
            .ok_or_else(|| Error::Exchange(format!("kline open time out of range: {}", self.0)))?;
        Ok(Candle::new(open_time, self.1, self.2, self.3, self.4, self.5))
    }
}
