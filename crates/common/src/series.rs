use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::{Candle, Error, Result, Timeframe};

/// Ordered, gap-free candles for one (symbol, timeframe) pair.
///
/// Construction validates every candle and every step between consecutive
/// open times; after that the series is read-only.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleSeries {
    symbol: String,
    timeframe: Timeframe,
    candles: Vec<Candle>,
}

impl CandleSeries {
    /// Validate and wrap `candles`.
    ///
    /// Fails with [`Error::DataIntegrity`] when a candle has a non-positive
    /// price or negative volume or breaks the OHLC invariant. Duplicated or
    /// out-of-order open times fail too, as do neighbours that are not
    /// exactly one timeframe step apart.
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe, candles: Vec<Candle>) -> Result<Self> {
        let symbol = symbol.into();
        let integrity = |reason: String| Error::DataIntegrity {
            symbol: symbol.clone(),
            timeframe,
            reason,
        };

        for (i, candle) in candles.iter().enumerate() {
            let prices = [candle.open, candle.high, candle.low, candle.close];
            if prices.iter().any(|p| *p <= Decimal::ZERO) {
                return Err(integrity(format!(
                    "candle {i} at {} has a non-positive price",
                    candle.open_time
                )));
            }
            if candle.volume < Decimal::ZERO {
                return Err(integrity(format!(
                    "candle {i} at {} has negative volume",
                    candle.open_time
                )));
            }
            if !candle.is_well_formed() {
                return Err(integrity(format!(
                    "candle {i} at {} violates low <= open/close <= high",
                    candle.open_time
                )));
            }
        }

        let step = timeframe.step();
        for (i, pair) in candles.windows(2).enumerate() {
            let delta = pair[1].open_time - pair[0].open_time;
            if delta <= chrono::TimeDelta::zero() {
                return Err(integrity(format!(
                    "open time {} at index {} is not after {}",
                    pair[1].open_time,
                    i + 1,
                    pair[0].open_time
                )));
            }
            if delta != step {
                return Err(integrity(format!(
                    "gap of {}s between index {i} and {} (expected {}s)",
                    delta.num_seconds(),
                    i + 1,
                    step.num_seconds()
                )));
            }
        }

        Ok(Self { symbol, timeframe, candles })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Candle> {
        self.candles.get(index)
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn first(&self) -> Option<&Candle> {
        self.candles.first()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn closes(&self) -> impl Iterator<Item = Decimal> + '_ {
        self.candles.iter().map(|c| c.close)
    }

    /// Moment candle `index` is finalised (its open time plus one step).
    pub fn close_time(&self, index: usize) -> Option<DateTime<Utc>> {
        self.candles
            .get(index)
            .map(|c| c.open_time + self.timeframe.step())
    }

    /// Hand the candles back, e.g. to extend them and re-validate.
    pub fn into_candles(self) -> Vec<Candle> {
        self.candles
    }
}

impl std::ops::Index<usize> for CandleSeries {
    type Output = Candle;

    fn index(&self, index: usize) -> &Self::Output {
        &self.candles[index]
    }
}
