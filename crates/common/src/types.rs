use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Width of one candle bucket.
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
    pub const ALL: [Timeframe; 7] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    /// Binance interval string, also used in cache keys and reports.
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

    /// Distance between the open times of two consecutive candles.
    pub fn step(&self) -> TimeDelta {
        match self {
            Timeframe::M1 => TimeDelta::minutes(1),
            Timeframe::M5 => TimeDelta::minutes(5),
            Timeframe::M15 => TimeDelta::minutes(15),
            Timeframe::M30 => TimeDelta::minutes(30),
            Timeframe::H1 => TimeDelta::hours(1),
            Timeframe::H4 => TimeDelta::hours(4),
            Timeframe::D1 => TimeDelta::days(1),
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .into_iter()
            .find(|tf| tf.as_str() == s.trim())
            .ok_or_else(|| Error::Config(format!("unknown timeframe '{s}'")))
    }
}

/// One OHLCV bar. Validation happens when candles are assembled into a
/// [`CandleSeries`](crate::CandleSeries).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn new(
        open_time: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self { open_time, open, high, low, close, volume }
    }

    /// `low ≤ min(open, close) ≤ max(open, close) ≤ high`
    pub fn is_well_formed(&self) -> bool {
        self.low <= self.body_bottom() && self.body_top() <= self.high
    }

    pub fn body(&self) -> Decimal {
        (self.close - self.open).abs()
    }

    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    pub fn body_top(&self) -> Decimal {
        self.open.max(self.close)
    }

    pub fn body_bottom(&self) -> Decimal {
        self.open.min(self.close)
    }

    pub fn upper_wick(&self) -> Decimal {
        self.high - self.body_top()
    }

    pub fn lower_wick(&self) -> Decimal {
        self.body_bottom() - self.low
    }

    pub fn body_midpoint(&self) -> Decimal {
        (self.open + self.close) / Decimal::TWO
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

/// Candlestick shapes recognised by the pattern detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PatternKind {
    Hammer,
    ShootingStar,
    Doji,
    BullishEngulfing,
    BearishEngulfing,
    MorningStar,
    EveningStar,
}

impl PatternKind {
    /// Evaluation order of the detector.
    pub const ALL: [PatternKind; 7] = [
        PatternKind::Hammer,
        PatternKind::ShootingStar,
        PatternKind::Doji,
        PatternKind::BullishEngulfing,
        PatternKind::BearishEngulfing,
        PatternKind::MorningStar,
        PatternKind::EveningStar,
    ];

    /// Only these kinds may open a position.
    pub fn is_entry_eligible(&self) -> bool {
        matches!(
            self,
            PatternKind::Hammer | PatternKind::BullishEngulfing | PatternKind::MorningStar
        )
    }

    /// Number of candles the shape spans, ending at the signalling candle.
    pub fn window(&self) -> usize {
        match self {
            PatternKind::Hammer | PatternKind::ShootingStar | PatternKind::Doji => 1,
            PatternKind::BullishEngulfing | PatternKind::BearishEngulfing => 2,
            PatternKind::MorningStar | PatternKind::EveningStar => 3,
        }
    }
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PatternKind::Hammer => "Hammer",
            PatternKind::ShootingStar => "Shooting Star",
            PatternKind::Doji => "Doji",
            PatternKind::BullishEngulfing => "Bullish Engulfing",
            PatternKind::BearishEngulfing => "Bearish Engulfing",
            PatternKind::MorningStar => "Morning Star",
            PatternKind::EveningStar => "Evening Star",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Bullish,
    Bearish,
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    EmaBearishExit,
    ForcedClose,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::TakeProfit => write!(f, "take profit"),
            ExitReason::StopLoss => write!(f, "stop loss"),
            ExitReason::EmaBearishExit => write!(f, "EMA bearish exit"),
            ExitReason::ForcedClose => write!(f, "forced close"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// A long position opened by the backtest engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub pattern: PatternKind,
    pub entry_index: usize,
    pub entry_time: DateTime<Utc>,
    pub entry_price: Decimal,
    /// Base-asset quantity: `trade_notional / entry_price`.
    pub size: Decimal,
    pub entry_ema_fast: Decimal,
    pub entry_ema_slow: Decimal,
    pub status: PositionStatus,
}

impl Position {
    /// Fractional price change from entry, e.g. `0.01` for +1 %.
    pub fn return_at(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) / self.entry_price
    }

    /// Consume the position into its closing trade record.
    ///
    /// Fees are charged on both legs at `fee_rate`, whatever the outcome.
    pub fn close(self, exit: ExitFill, fee_rate: Decimal) -> Trade {
        let entry_notional = self.size * self.entry_price;
        let exit_notional = self.size * exit.price;
        let gross_pnl = self.size * (exit.price - self.entry_price);
        let fees = entry_notional * fee_rate + exit_notional * fee_rate;
        let return_pct = self.return_at(exit.price);

        Trade {
            symbol: self.symbol,
            timeframe: self.timeframe,
            pattern: self.pattern,
            entry_index: self.entry_index,
            entry_time: self.entry_time,
            entry_price: self.entry_price,
            size: self.size,
            entry_ema_fast: self.entry_ema_fast,
            entry_ema_slow: self.entry_ema_slow,
            exit_index: exit.index,
            exit_time: exit.time,
            exit_price: exit.price,
            exit_reason: exit.reason,
            exit_ema_fast: exit.ema_fast,
            exit_ema_slow: exit.ema_slow,
            entry_notional,
            exit_notional,
            return_pct,
            gross_pnl,
            fees,
            net_pnl: gross_pnl - fees,
        }
    }
}

/// Where and why a position is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitFill {
    pub index: usize,
    pub time: DateTime<Utc>,
    pub price: Decimal,
    pub reason: ExitReason,
    pub ema_fast: Option<Decimal>,
    pub ema_slow: Option<Decimal>,
}

/// Immutable record of a closed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub pattern: PatternKind,
    pub entry_index: usize,
    pub entry_time: DateTime<Utc>,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub entry_ema_fast: Decimal,
    pub entry_ema_slow: Decimal,
    pub exit_index: usize,
    pub exit_time: DateTime<Utc>,
    pub exit_price: Decimal,
    pub exit_reason: ExitReason,
    pub exit_ema_fast: Option<Decimal>,
    pub exit_ema_slow: Option<Decimal>,
    pub entry_notional: Decimal,
    pub exit_notional: Decimal,
    pub return_pct: Decimal,
    pub gross_pnl: Decimal,
    pub fees: Decimal,
    pub net_pnl: Decimal,
}

impl Trade {
    pub fn is_win(&self) -> bool {
        self.net_pnl > Decimal::ZERO
    }
}

/// Counters and benchmark inputs collected while a run walks its series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub candles: usize,
    /// Candles with at least one pattern match of any kind.
    pub patterns_detected: usize,
    /// Entry-eligible signals rejected by the trend filter.
    pub entries_blocked_by_trend: usize,
    pub first_close: Option<Decimal>,
    pub last_close: Option<Decimal>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Output of one (symbol, timeframe) backtest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub trades: Vec<Trade>,
    pub stats: RunStats,
}

impl BacktestResult {
    pub fn empty(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            trades: Vec::new(),
            stats: RunStats::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn position(entry_price: Decimal, notional: Decimal) -> Position {
        Position {
            symbol: "BTCUSDC".into(),
            timeframe: Timeframe::H1,
            pattern: PatternKind::Hammer,
            entry_index: 3,
            entry_time: Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap(),
            entry_price,
            size: notional / entry_price,
            entry_ema_fast: dec!(100.5),
            entry_ema_slow: dec!(99.5),
            status: PositionStatus::Open,
        }
    }

    fn fill(price: Decimal, reason: ExitReason) -> ExitFill {
        ExitFill {
            index: 9,
            time: Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap(),
            price,
            reason,
            ema_fast: None,
            ema_slow: None,
        }
    }

    #[test]
    fn winning_trade_pnl_includes_both_fee_legs() {
        let trade = position(dec!(100), dec!(100)).close(fill(dec!(100.9), ExitReason::TakeProfit), dec!(0.001));
        assert_eq!(trade.gross_pnl, dec!(0.9));
        assert_eq!(trade.fees, dec!(0.2009));
        assert_eq!(trade.net_pnl, dec!(0.6991));
        assert_eq!(trade.return_pct, dec!(0.009));
        assert!(trade.is_win());
    }

    #[test]
    fn losing_trade_still_pays_fees() {
        let trade = position(dec!(100), dec!(100)).close(fill(dec!(80), ExitReason::StopLoss), dec!(0.001));
        assert_eq!(trade.gross_pnl, dec!(-20));
        assert_eq!(trade.fees, dec!(0.18));
        assert_eq!(trade.net_pnl, dec!(-20.18));
        assert!(!trade.is_win());
    }

    #[test]
    fn timeframe_parses_binance_intervals() {
        assert_eq!("4h".parse::<Timeframe>().unwrap(), Timeframe::H4);
        assert_eq!(" 15m ".parse::<Timeframe>().unwrap(), Timeframe::M15);
        assert!("2h".parse::<Timeframe>().is_err());
        assert_eq!(Timeframe::M5.step(), TimeDelta::minutes(5));
    }

    #[test]
    fn candle_geometry() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let c = Candle::new(t, dec!(100), dec!(100.2), dec!(99), dec!(100.1), dec!(5));
        assert!(c.is_well_formed());
        assert_eq!(c.body(), dec!(0.1));
        assert_eq!(c.range(), dec!(1.2));
        assert_eq!(c.upper_wick(), dec!(0.1));
        assert_eq!(c.lower_wick(), dec!(1));

        let broken = Candle::new(t, dec!(100), dec!(99), dec!(98), dec!(100.1), dec!(5));
        assert!(!broken.is_well_formed());
    }
}
