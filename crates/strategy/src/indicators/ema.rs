use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use common::{Candle, CandleSeries};

/// Fast and slow EMA values at one candle index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorPoint {
    pub index: usize,
    pub ema_fast: Decimal,
    pub ema_slow: Decimal,
}

impl IndicatorPoint {
    pub fn is_bullish(&self) -> bool {
        self.ema_fast > self.ema_slow
    }

    pub fn is_bearish(&self) -> bool {
        self.ema_fast < self.ema_slow
    }
}

/// Incremental EMA for one period.
///
/// The first value is the simple average of the first `period` closes; after
/// that `ema = close * k + prev * (1 - k)` with `k = 2 / (period + 1)`.
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    k: Decimal,
    seed_sum: Decimal,
    seen: usize,
    value: Option<Decimal>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        assert!(period >= 1, "EMA period must be >= 1");
        Self {
            period,
            k: Decimal::TWO / Decimal::from(period + 1),
            seed_sum: Decimal::ZERO,
            seen: 0,
            value: None,
        }
    }

    /// Feed the next close. Returns the EMA once `period` closes were seen.
    pub fn update(&mut self, close: Decimal) -> Option<Decimal> {
        self.seen += 1;
        self.value = match self.value {
            Some(prev) => Some(close * self.k + prev * (Decimal::ONE - self.k)),
            None => {
                self.seed_sum += close;
                (self.seen == self.period).then(|| self.seed_sum / Decimal::from(self.period))
            }
        };
        self.value
    }

    pub fn value(&self) -> Option<Decimal> {
        self.value
    }
}

/// Fast/slow EMA pair used as the trend filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrendIndicator {
    pub fast_period: usize,
    pub slow_period: usize,
}

impl TrendIndicator {
    pub fn new(fast_period: usize, slow_period: usize) -> Self {
        assert!(
            fast_period >= 1 && slow_period >= 1,
            "EMA periods must be >= 1"
        );
        Self { fast_period, slow_period }
    }

    /// Number of candles needed before the first point exists.
    pub fn warm_up(&self) -> usize {
        self.fast_period.max(self.slow_period)
    }

    /// Lazily walk `series`, yielding one point per index from
    /// `warm_up() - 1` onwards. Each point depends only on closes up to its
    /// own index.
    pub fn points<'a>(&self, series: &'a CandleSeries) -> TrendPoints<'a> {
        TrendPoints {
            candles: series.candles().iter(),
            index: 0,
            fast: Ema::new(self.fast_period),
            slow: Ema::new(self.slow_period),
        }
    }

    pub fn compute(&self, series: &CandleSeries) -> Vec<IndicatorPoint> {
        self.points(series).collect()
    }

    /// Re-index a trend computed on `trend_series` (usually a higher
    /// timeframe) onto `trading`.
    ///
    /// Trading index `i` receives the latest trend point whose candle had
    /// closed by the time candle `i` closed, so no trend candle that is still
    /// forming is ever visible.
    pub fn align(
        trading: &CandleSeries,
        trend_series: &CandleSeries,
        trend_points: &[IndicatorPoint],
    ) -> Vec<IndicatorPoint> {
        let mut aligned = Vec::with_capacity(trading.len());
        let mut cursor = 0usize;
        let mut current: Option<&IndicatorPoint> = None;

        for i in 0..trading.len() {
            let Some(trading_close) = trading.close_time(i) else { break };
            while let Some(point) = trend_points.get(cursor) {
                match trend_series.close_time(point.index) {
                    Some(t) if t <= trading_close => {
                        current = Some(point);
                        cursor += 1;
                    }
                    _ => break,
                }
            }
            if let Some(point) = current {
                aligned.push(IndicatorPoint { index: i, ..*point });
            }
        }
        aligned
    }
}

impl Default for TrendIndicator {
    fn default() -> Self {
        Self::new(1, 99)
    }
}

/// Iterator returned by [`TrendIndicator::points`].
pub struct TrendPoints<'a> {
    candles: std::slice::Iter<'a, Candle>,
    index: usize,
    fast: Ema,
    slow: Ema,
}

impl Iterator for TrendPoints<'_> {
    type Item = IndicatorPoint;

    fn next(&mut self) -> Option<Self::Item> {
        for candle in self.candles.by_ref() {
            let close = candle.close;
            let index = self.index;
            self.index += 1;
            let fast = self.fast.update(close);
            let slow = self.slow.update(close);
            if let (Some(ema_fast), Some(ema_slow)) = (fast, slow) {
                return Some(IndicatorPoint { index, ema_fast, ema_slow });
            }
        }
        None
    }
}

/// Sorted trend points with "latest at or before index" lookup.
#[derive(Debug, Clone, Default)]
pub struct TrendTrack {
    points: Vec<IndicatorPoint>,
}

impl TrendTrack {
    pub fn new(points: Vec<IndicatorPoint>) -> Self {
        debug_assert!(points.windows(2).all(|w| w[0].index < w[1].index));
        Self { points }
    }

    /// Most recent point with `index <= i`.
    pub fn latest_at(&self, i: usize) -> Option<&IndicatorPoint> {
        let upto = self.points.partition_point(|p| p.index <= i);
        upto.checked_sub(1).map(|k| &self.points[k])
    }

    pub fn points(&self) -> &[IndicatorPoint] {
        &self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use common::Timeframe;
    use rust_decimal_macros::dec;

    fn series_from_closes(tf: Timeframe, closes: &[Decimal]) -> CandleSeries {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let candles = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle::new(start + tf.step() * i as i32, c, c, c, c, dec!(1)))
            .collect();
        CandleSeries::new("TESTUSDC", tf, candles).unwrap()
    }

    #[test]
    fn ema_seeds_with_simple_average() {
        let mut ema = Ema::new(3);
        assert_eq!(ema.update(dec!(1)), None);
        assert_eq!(ema.update(dec!(2)), None);
        assert_eq!(ema.update(dec!(3)), Some(dec!(2)));
        // k = 0.5
        assert_eq!(ema.update(dec!(6)), Some(dec!(4)));
    }

    #[test]
    fn period_one_tracks_close() {
        let mut ema = Ema::new(1);
        assert_eq!(ema.update(dec!(7.5)), Some(dec!(7.5)));
        assert_eq!(ema.update(dec!(8.25)), Some(dec!(8.25)));
    }

    #[test]
    fn first_point_appears_after_warm_up() {
        let closes: Vec<Decimal> = (1..=10).map(Decimal::from).collect();
        let series = series_from_closes(Timeframe::H1, &closes);
        let points = TrendIndicator::new(1, 4).compute(&series);
        assert_eq!(points.len(), 7);
        assert_eq!(points[0].index, 3);
        assert_eq!(points[0].ema_slow, dec!(2.5));
        assert_eq!(points[0].ema_fast, dec!(4));
        assert!(points.iter().all(IndicatorPoint::is_bullish));
    }

    #[test]
    fn too_short_series_yields_nothing() {
        let closes = vec![dec!(100); 10];
        let series = series_from_closes(Timeframe::H1, &closes);
        assert!(TrendIndicator::default().compute(&series).is_empty());
    }

    #[test]
    fn track_returns_latest_point_at_or_before() {
        let track = TrendTrack::new(vec![
            IndicatorPoint { index: 2, ema_fast: dec!(1), ema_slow: dec!(1) },
            IndicatorPoint { index: 5, ema_fast: dec!(2), ema_slow: dec!(1) },
        ]);
        assert!(track.latest_at(1).is_none());
        assert_eq!(track.latest_at(2).unwrap().index, 2);
        assert_eq!(track.latest_at(4).unwrap().index, 2);
        assert_eq!(track.latest_at(9).unwrap().index, 5);
    }

    #[test]
    fn alignment_only_sees_closed_trend_candles() {
        // 4h trend candles at 00:00 and 04:00, hourly trading candles 00:00..07:00.
        let trend_series = series_from_closes(Timeframe::H4, &[dec!(10), dec!(20)]);
        let trend_points = TrendIndicator::new(1, 1).compute(&trend_series);
        let trading = series_from_closes(Timeframe::H1, &[dec!(1); 8]);

        let aligned = TrendIndicator::align(&trading, &trend_series, &trend_points);
        // First 4h candle closes at 04:00, i.e. with hourly candle 3 (03:00-04:00).
        assert_eq!(aligned.first().unwrap().index, 3);
        assert_eq!(aligned[0].ema_fast, dec!(10));
        // Second closes at 08:00, with hourly candle 7.
        let last = aligned.last().unwrap();
        assert_eq!(last.index, 7);
        assert_eq!(last.ema_fast, dec!(20));
        assert_eq!(aligned.iter().filter(|p| p.ema_fast == dec!(10)).count(), 4);
    }
}
