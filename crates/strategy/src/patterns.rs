//! Candlestick shape classification.
//!
//! Every predicate looks at the signalling candle and at most the two
//! candles before it. Thresholds are fixed constants so identical input
//! always classifies identically.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use common::{Candle, CandleSeries, Direction, PatternKind};

/// Largest body, as a fraction of the range, for hammer-like candles.
const MAX_BODY_TO_RANGE: Decimal = dec!(0.3);
/// Minimum ratio of the long wick to the body for hammer-like candles.
const MIN_WICK_TO_BODY: Decimal = dec!(2);
/// Largest opposite wick, as a fraction of the range, for hammer-like candles.
const MAX_SHORT_WICK_TO_RANGE: Decimal = dec!(0.1);
/// Largest body, as a fraction of the range, for a doji.
const DOJI_BODY_TO_RANGE: Decimal = dec!(0.1);
/// Star body must be smaller than this fraction of the first candle's body.
const STAR_BODY_TO_FIRST_BODY: Decimal = dec!(0.5);

/// One detected pattern at one candle index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSignal {
    pub index: usize,
    pub kind: PatternKind,
    pub direction: Direction,
}

/// All pattern kinds matched at a single index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PatternSet(u8);

impl PatternSet {
    fn bit(kind: PatternKind) -> u8 {
        1 << (kind as u8)
    }

    pub fn insert(&mut self, kind: PatternKind) {
        self.0 |= Self::bit(kind);
    }

    pub fn contains(&self, kind: PatternKind) -> bool {
        self.0 & Self::bit(kind) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Matched kinds in detector order.
    pub fn iter(&self) -> impl Iterator<Item = PatternKind> + '_ {
        PatternKind::ALL.into_iter().filter(|k| self.contains(*k))
    }

    /// First entry-eligible kind, if any.
    pub fn entry_kind(&self) -> Option<PatternKind> {
        self.iter().find(PatternKind::is_entry_eligible)
    }
}

impl FromIterator<PatternKind> for PatternSet {
    fn from_iter<I: IntoIterator<Item = PatternKind>>(iter: I) -> Self {
        let mut set = PatternSet::default();
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}

/// Stateless candlestick pattern detector.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternDetector;

impl PatternDetector {
    pub fn new() -> Self {
        Self
    }

    /// Classify candle `index` using `candles[index-2..=index]` only.
    /// Indices past the end yield an empty set.
    pub fn detect_at(&self, candles: &[Candle], index: usize) -> PatternSet {
        let Some(current) = candles.get(index) else {
            return PatternSet::default();
        };
        let prev = index.checked_sub(1).map(|i| &candles[i]);
        let first = index.checked_sub(2).map(|i| &candles[i]);

        PatternKind::ALL
            .into_iter()
            .filter(|kind| match kind {
                PatternKind::Hammer => is_hammer(current),
                PatternKind::ShootingStar => is_shooting_star(current),
                PatternKind::Doji => is_doji(current),
                PatternKind::BullishEngulfing => prev.is_some_and(|p| is_bullish_engulfing(p, current)),
                PatternKind::BearishEngulfing => prev.is_some_and(|p| is_bearish_engulfing(p, current)),
                PatternKind::MorningStar => match (first, prev) {
                    (Some(f), Some(m)) => is_morning_star(f, m, current),
                    _ => false,
                },
                PatternKind::EveningStar => match (first, prev) {
                    (Some(f), Some(m)) => is_evening_star(f, m, current),
                    _ => false,
                },
            })
            .collect()
    }

    /// Pattern set for every index of `series`.
    pub fn scan(&self, series: &CandleSeries) -> Vec<PatternSet> {
        let candles = series.candles();
        (0..candles.len()).map(|i| self.detect_at(candles, i)).collect()
    }

    /// Tagged signals at one index, in detector order.
    pub fn signals_at(&self, candles: &[Candle], index: usize) -> Vec<PatternSignal> {
        let set = self.detect_at(candles, index);
        set.iter()
            .map(|kind| PatternSignal {
                index,
                kind,
                direction: direction_of(kind, &candles[index]),
            })
            .collect()
    }

    /// Every signal in `series`, ordered by index then detector order.
    pub fn signals(&self, series: &CandleSeries) -> Vec<PatternSignal> {
        let candles = series.candles();
        (0..candles.len())
            .flat_map(|i| self.signals_at(candles, i))
            .collect()
    }
}

/// Doji carries the colour of its own candle; the rest are fixed.
pub fn direction_of(kind: PatternKind, candle: &Candle) -> Direction {
    match kind {
        PatternKind::Hammer | PatternKind::BullishEngulfing | PatternKind::MorningStar => {
            Direction::Bullish
        }
        PatternKind::ShootingStar | PatternKind::BearishEngulfing | PatternKind::EveningStar => {
            Direction::Bearish
        }
        PatternKind::Doji if candle.close >= candle.open => Direction::Bullish,
        PatternKind::Doji => Direction::Bearish,
    }
}

fn is_hammer(c: &Candle) -> bool {
    let range = c.range();
    if range.is_zero() {
        return false;
    }
    let body = c.body();
    body <= MAX_BODY_TO_RANGE * range
        && c.lower_wick() >= MIN_WICK_TO_BODY * body
        && c.upper_wick() <= MAX_SHORT_WICK_TO_RANGE * range
}

fn is_shooting_star(c: &Candle) -> bool {
    let range = c.range();
    if range.is_zero() {
        return false;
    }
    let body = c.body();
    body <= MAX_BODY_TO_RANGE * range
        && c.upper_wick() >= MIN_WICK_TO_BODY * body
        && c.lower_wick() <= MAX_SHORT_WICK_TO_RANGE * range
}

fn is_doji(c: &Candle) -> bool {
    let range = c.range();
    !range.is_zero() && c.body() <= DOJI_BODY_TO_RANGE * range
}

fn is_bullish_engulfing(prev: &Candle, curr: &Candle) -> bool {
    prev.is_bearish() && curr.is_bullish() && curr.open < prev.close && curr.close > prev.open
}

fn is_bearish_engulfing(prev: &Candle, curr: &Candle) -> bool {
    prev.is_bullish() && curr.is_bearish() && curr.open > prev.close && curr.close < prev.open
}

fn is_morning_star(first: &Candle, middle: &Candle, third: &Candle) -> bool {
    first.is_bearish()
        && third.is_bullish()
        && middle.body() < STAR_BODY_TO_FIRST_BODY * first.body()
        && middle.body_top() <= first.close
        && third.close > first.body_midpoint()
}

fn is_evening_star(first: &Candle, middle: &Candle, third: &Candle) -> bool {
    first.is_bullish()
        && third.is_bearish()
        && middle.body() < STAR_BODY_TO_FIRST_BODY * first.body()
        && middle.body_bottom() >= first.close
        && third.close < first.body_midpoint()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candle(open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Candle::new(t, open, high, low, close, dec!(1))
    }

    fn detect(candles: &[Candle]) -> PatternSet {
        PatternDetector::new().detect_at(candles, candles.len() - 1)
    }

    #[test]
    fn hammer_has_long_lower_wick() {
        let c = candle(dec!(100), dec!(100.2), dec!(99), dec!(100.2));
        let set = detect(&[c]);
        assert!(set.contains(PatternKind::Hammer));
        assert!(!set.contains(PatternKind::ShootingStar));
        assert_eq!(set.entry_kind(), Some(PatternKind::Hammer));
    }

    #[test]
    fn hammer_rejects_tall_upper_wick() {
        let c = candle(dec!(100), dec!(100.6), dec!(99), dec!(100.2));
        assert!(!detect(&[c]).contains(PatternKind::Hammer));
    }

    #[test]
    fn shooting_star_mirrors_hammer() {
        let c = candle(dec!(100.2), dec!(101.2), dec!(100), dec!(100));
        let set = detect(&[c]);
        assert!(set.contains(PatternKind::ShootingStar));
        assert!(!set.contains(PatternKind::Hammer));
        assert_eq!(set.entry_kind(), None);
    }

    #[test]
    fn doji_and_hammer_can_coexist() {
        // Body 0.05 of a 1.0 range sitting at the top.
        let c = candle(dec!(99.95), dec!(100), dec!(99), dec!(100));
        let set = detect(&[c]);
        assert!(set.contains(PatternKind::Doji));
        assert!(set.contains(PatternKind::Hammer));
        assert_eq!(set.len(), 2);
        let signals = PatternDetector::new().signals_at(&[c], 0);
        assert_eq!(signals[0].kind, PatternKind::Hammer);
        assert_eq!(signals[1].kind, PatternKind::Doji);
        assert_eq!(signals[1].direction, Direction::Bullish);
    }

    #[test]
    fn flat_candle_matches_nothing() {
        let c = candle(dec!(5), dec!(5), dec!(5), dec!(5));
        assert!(detect(&[c]).is_empty());
    }

    #[test]
    fn bullish_engulfing_requires_opposite_colours_and_containment() {
        let prev = candle(dec!(101), dec!(101.5), dec!(99.5), dec!(100));
        let curr = candle(dec!(99.8), dec!(101.8), dec!(99.5), dec!(101.5));
        assert!(detect(&[prev, curr]).contains(PatternKind::BullishEngulfing));

        let not_contained = candle(dec!(100.2), dec!(101.8), dec!(99.5), dec!(101.5));
        assert!(!detect(&[prev, not_contained]).contains(PatternKind::BullishEngulfing));

        let same_colour = candle(dec!(100.5), dec!(101), dec!(99), dec!(99.5));
        assert!(!detect(&[prev, same_colour]).contains(PatternKind::BullishEngulfing));
    }

    #[test]
    fn bearish_engulfing() {
        let prev = candle(dec!(100), dec!(101.2), dec!(99.8), dec!(101));
        let curr = candle(dec!(101.3), dec!(101.5), dec!(99.2), dec!(99.5));
        let set = detect(&[prev, curr]);
        assert!(set.contains(PatternKind::BearishEngulfing));
        assert_eq!(set.entry_kind(), None);
    }

    #[test]
    fn morning_star_three_candle_reversal() {
        let first = candle(dec!(110), dec!(110.5), dec!(99.5), dec!(100));
        let middle = candle(dec!(99), dec!(99.8), dec!(97.5), dec!(98));
        let third = candle(dec!(99), dec!(107), dec!(98.5), dec!(106));
        let set = detect(&[first, middle, third]);
        assert!(set.contains(PatternKind::MorningStar));
        assert_eq!(set.entry_kind(), Some(PatternKind::MorningStar));

        // Third candle failing to reach the first body's midpoint.
        let weak = candle(dec!(99), dec!(104), dec!(98.5), dec!(103));
        assert!(!detect(&[first, middle, weak]).contains(PatternKind::MorningStar));

        // Middle body overlapping the first body is not a gap.
        let overlapping = candle(dec!(101), dec!(101.5), dec!(99.5), dec!(100.5));
        assert!(!detect(&[first, overlapping, third]).contains(PatternKind::MorningStar));
    }

    #[test]
    fn evening_star_three_candle_reversal() {
        let first = candle(dec!(100), dec!(110.5), dec!(99.5), dec!(110));
        let middle = candle(dec!(111), dec!(112.5), dec!(110.2), dec!(112));
        let third = candle(dec!(111), dec!(111.5), dec!(103), dec!(104));
        let set = detect(&[first, middle, third]);
        assert!(set.contains(PatternKind::EveningStar));
    }

    #[test]
    fn multi_candle_patterns_need_history() {
        let third = candle(dec!(99), dec!(107), dec!(98.5), dec!(106));
        let set = detect(&[third]);
        assert!(!set.contains(PatternKind::MorningStar));
        assert!(!set.contains(PatternKind::BullishEngulfing));
    }

    #[test]
    fn out_of_range_index_is_empty() {
        let c = candle(dec!(100), dec!(100.2), dec!(99), dec!(100.2));
        assert!(PatternDetector::new().detect_at(&[c], 4).is_empty());
    }
}
