use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};

use common::{Candle, Error, Result, Timeframe};

/// Bookkeeping for one cached (symbol, timeframe).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMeta {
    pub cached_at: DateTime<Utc>,
    pub count: i64,
    pub first_candle: Option<DateTime<Utc>>,
    pub last_candle: Option<DateTime<Utc>>,
}

/// Sqlite-backed kline cache.
///
/// Rows are keyed by (symbol, timeframe, open_time); writing a candle that
/// already exists replaces it, so the most recent fetch always wins.
#[derive(Clone)]
pub struct KlineStore {
    db: SqlitePool,
}

impl KlineStore {
    /// Open (creating if needed) the database at `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        if let Some(dir) = sqlite_parent_dir(url) {
            std::fs::create_dir_all(dir)?;
        }
        // sqlite allows a single writer; runs queue on the pool.
        let db = SqlitePoolOptions::new().max_connections(1).connect(url).await?;
        Self::from_pool(db).await
    }

    pub async fn from_pool(db: SqlitePool) -> Result<Self> {
        sqlx::migrate!("../../migrations")
            .run(&db)
            .await
            .map_err(|e| Error::Database(e.into()))?;
        Ok(Self { db })
    }

    pub async fn meta(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<CacheMeta>> {
        let row = sqlx::query(
            "SELECT cached_at, candle_count, first_candle, last_candle
             FROM cache_meta WHERE symbol = ?1 AND timeframe = ?2",
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .fetch_optional(&self.db)
        .await?;

        row.map(|r| -> Result<CacheMeta> {
            Ok(CacheMeta {
                cached_at: from_millis(r.try_get("cached_at")?)?,
                count: r.try_get("candle_count")?,
                first_candle: r.try_get::<Option<i64>, _>("first_candle")?.map(from_millis).transpose()?,
                last_candle: r.try_get::<Option<i64>, _>("last_candle")?.map(from_millis).transpose()?,
            })
        })
        .transpose()
    }

    /// True when the entry exists, holds candles and was written less than
    /// `expiry` before `now`.
    pub async fn is_fresh(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        expiry: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self
            .meta(symbol, timeframe)
            .await?
            .is_some_and(|m| m.count > 0 && now < m.cached_at + expiry))
    }

    pub async fn last_open_time(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<DateTime<Utc>>> {
        let last: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(open_time) FROM klines WHERE symbol = ?1 AND timeframe = ?2",
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .fetch_one(&self.db)
        .await?;
        last.map(from_millis).transpose()
    }

    /// Insert or overwrite `candles`, then refresh the metadata.
    pub async fn upsert(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        candles: &[Candle],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.db.begin().await?;
        for c in candles {
            insert_candle(&mut tx, symbol, timeframe, c).await?;
        }
        tx.commit().await?;
        self.refresh_meta(symbol, timeframe, now).await?;
        debug!(symbol, timeframe = %timeframe, count = candles.len(), "Cache upserted");
        Ok(())
    }

    /// Drop everything cached for the pair and store `candles` instead.
    pub async fn replace(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        candles: &[Candle],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM klines WHERE symbol = ?1 AND timeframe = ?2")
            .bind(symbol)
            .bind(timeframe.as_str())
            .execute(&mut *tx)
            .await?;
        for c in candles {
            insert_candle(&mut tx, symbol, timeframe, c).await?;
        }
        tx.commit().await?;
        self.refresh_meta(symbol, timeframe, now).await?;
        debug!(symbol, timeframe = %timeframe, count = candles.len(), "Cache replaced");
        Ok(())
    }

    /// Delete candles that opened before `cutoff`. The metadata range and
    /// count follow the remaining rows; `cached_at` is left alone so the
    /// freshness clock is not reset.
    pub async fn prune_before(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let mut tx = self.db.begin().await?;
        let done = sqlx::query(
            "DELETE FROM klines WHERE symbol = ?1 AND timeframe = ?2 AND open_time < ?3",
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .bind(cutoff.timestamp_millis())
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE cache_meta SET
                candle_count = (SELECT COUNT(*) FROM klines WHERE symbol = ?1 AND timeframe = ?2),
                first_candle = (SELECT MIN(open_time) FROM klines WHERE symbol = ?1 AND timeframe = ?2),
                last_candle = (SELECT MAX(open_time) FROM klines WHERE symbol = ?1 AND timeframe = ?2)
             WHERE symbol = ?1 AND timeframe = ?2",
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(done.rows_affected())
    }

    /// Cached candles opening at or after `since`, oldest first.
    pub async fn load_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            "SELECT open_time, open, high, low, close, volume FROM klines
             WHERE symbol = ?1 AND timeframe = ?2 AND open_time >= ?3
             ORDER BY open_time",
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .bind(since.timestamp_millis())
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(candle_from_row).collect()
    }

    pub async fn clear(&self) -> Result<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM klines").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM cache_meta").execute(&mut *tx).await?;
        tx.commit().await?;
        info!("Kline cache cleared");
        Ok(())
    }

    async fn refresh_meta(&self, symbol: &str, timeframe: Timeframe, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO cache_meta (symbol, timeframe, cached_at, candle_count, first_candle, last_candle)
             SELECT ?1, ?2, ?3, COUNT(*), MIN(open_time), MAX(open_time)
             FROM klines WHERE symbol = ?1 AND timeframe = ?2
             ON CONFLICT(symbol, timeframe) DO UPDATE SET
                cached_at = excluded.cached_at,
                candle_count = excluded.candle_count,
                first_candle = excluded.first_candle,
                last_candle = excluded.last_candle",
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .bind(now.timestamp_millis())
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

async fn insert_candle(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    symbol: &str,
    timeframe: Timeframe,
    c: &Candle,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO klines (symbol, timeframe, open_time, open, high, low, close, volume)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(symbol, timeframe, open_time) DO UPDATE SET
            open = excluded.open,
            high = excluded.high,
            low = excluded.low,
            close = excluded.close,
            volume = excluded.volume",
    )
    .bind(symbol)
    .bind(timeframe.as_str())
    .bind(c.open_time.timestamp_millis())
    .bind(c.open.to_string())
    .bind(c.high.to_string())
    .bind(c.low.to_string())
    .bind(c.close.to_string())
    .bind(c.volume.to_string())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn candle_from_row(row: &SqliteRow) -> Result<Candle> {
    let decimal = |col: &str| -> Result<Decimal> {
        let raw: String = row.try_get(col)?;
        Decimal::from_str(&raw).map_err(|e| Error::Other(format!("cached {col} {raw:?}: {e}")))
    };
    Ok(Candle::new(
        from_millis(row.try_get("open_time")?)?,
        decimal("open")?,
        decimal("high")?,
        decimal("low")?,
        decimal("close")?,
        decimal("volume")?,
    ))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Other(format!("timestamp out of range: {ms}")))
}

/// Directory holding a file-backed sqlite URL such as
/// `sqlite://data_cache/klines.db?mode=rwc`. None for in-memory databases.
fn sqlite_parent_dir(url: &str) -> Option<&Path> {
    let path = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path.starts_with(":memory:") {
        return None;
    }
    Path::new(path).parent().filter(|p| !p.as_os_str().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    async fn store() -> KlineStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        KlineStore::from_pool(pool).await.unwrap()
    }

    fn t(h: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + TimeDelta::hours(h)
    }

    fn candle(h: i64, close: Decimal) -> Candle {
        Candle::new(t(h), close, close, close, close, dec!(3.5))
    }

    #[tokio::test]
    async fn upsert_then_load_round_trips_exact_decimals() {
        let store = store().await;
        let candles = vec![candle(0, dec!(64123.45)), candle(1, dec!(0.00001234))];
        store.upsert("BTCUSDC", Timeframe::H1, &candles, t(2)).await.unwrap();

        let loaded = store.load_range("BTCUSDC", Timeframe::H1, t(0)).await.unwrap();
        assert_eq!(loaded, candles);
        assert_eq!(store.last_open_time("BTCUSDC", Timeframe::H1).await.unwrap(), Some(t(1)));
    }

    #[tokio::test]
    async fn later_write_wins_on_duplicate_open_time() {
        let store = store().await;
        store
            .upsert("ETHUSDC", Timeframe::H1, &[candle(0, dec!(10)), candle(1, dec!(11))], t(2))
            .await
            .unwrap();
        store
            .upsert("ETHUSDC", Timeframe::H1, &[candle(1, dec!(12)), candle(2, dec!(13))], t(3))
            .await
            .unwrap();

        let closes: Vec<Decimal> = store
            .load_range("ETHUSDC", Timeframe::H1, t(0))
            .await
            .unwrap()
            .iter()
            .map(|c| c.close)
            .collect();
        assert_eq!(closes, vec![dec!(10), dec!(12), dec!(13)]);

        let meta = store.meta("ETHUSDC", Timeframe::H1).await.unwrap().unwrap();
        assert_eq!(meta.count, 3);
        assert_eq!(meta.first_candle, Some(t(0)));
        assert_eq!(meta.last_candle, Some(t(2)));
        assert_eq!(meta.cached_at, t(3));
    }

    #[tokio::test]
    async fn pairs_are_isolated() {
        let store = store().await;
        store.upsert("AUSDC", Timeframe::H1, &[candle(0, dec!(1))], t(1)).await.unwrap();
        store.upsert("AUSDC", Timeframe::M15, &[candle(0, dec!(2))], t(1)).await.unwrap();
        store.replace("AUSDC", Timeframe::H1, &[candle(5, dec!(3))], t(6)).await.unwrap();

        let h1 = store.load_range("AUSDC", Timeframe::H1, t(0)).await.unwrap();
        let m15 = store.load_range("AUSDC", Timeframe::M15, t(0)).await.unwrap();
        assert_eq!(h1, vec![candle(5, dec!(3))]);
        assert_eq!(m15, vec![candle(0, dec!(2))]);
        assert!(store.load_range("BUSDC", Timeframe::H1, t(0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn freshness_follows_expiry() {
        let store = store().await;
        let expiry = TimeDelta::hours(24);
        assert!(!store.is_fresh("XUSDC", Timeframe::H1, expiry, t(0)).await.unwrap());

        store.upsert("XUSDC", Timeframe::H1, &[candle(0, dec!(1))], t(1)).await.unwrap();
        assert!(store.is_fresh("XUSDC", Timeframe::H1, expiry, t(24)).await.unwrap());
        assert!(!store.is_fresh("XUSDC", Timeframe::H1, expiry, t(25)).await.unwrap());
    }

    #[tokio::test]
    async fn prune_and_clear() {
        let store = store().await;
        let candles: Vec<Candle> = (0..5).map(|h| candle(h, dec!(1))).collect();
        store.upsert("XUSDC", Timeframe::H1, &candles, t(5)).await.unwrap();

        assert_eq!(store.prune_before("XUSDC", Timeframe::H1, t(3)).await.unwrap(), 3);
        assert_eq!(store.load_range("XUSDC", Timeframe::H1, t(0)).await.unwrap().len(), 2);

        let meta = store.meta("XUSDC", Timeframe::H1).await.unwrap().unwrap();
        assert_eq!(meta.count, 2);
        assert_eq!(meta.first_candle, Some(t(3)));
        assert_eq!(meta.last_candle, Some(t(4)));
        assert_eq!(meta.cached_at, t(5));

        store.clear().await.unwrap();
        assert!(store.meta("XUSDC", Timeframe::H1).await.unwrap().is_none());
        assert_eq!(store.last_open_time("XUSDC", Timeframe::H1).await.unwrap(), None);
    }

    #[test]
    fn parent_dir_of_sqlite_urls() {
        assert_eq!(
            sqlite_parent_dir("sqlite://data_cache/klines.db?mode=rwc"),
            Some(Path::new("data_cache"))
        );
        assert_eq!(sqlite_parent_dir("sqlite::memory:"), None);
        assert_eq!(sqlite_parent_dir("sqlite://klines.db"), None);
    }
}
