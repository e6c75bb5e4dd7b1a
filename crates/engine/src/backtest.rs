use rust_decimal::Decimal;
use tracing::{debug, info};

use common::{
    BacktestResult, Candle, CandleSeries, Error, ExitFill, ExitReason, PatternKind, Position,
    PositionStatus, Result, RunStats, Trade,
};
use risk::{ExitContext, ExitPolicy};
use strategy::{EngineConfig, IndicatorPoint, PatternDetector, TrendIndicator, TrendTrack};

/// Position state of a single run. At most one position is ever open.
#[derive(Debug)]
enum EngineState {
    NoPosition,
    PositionOpen(Position),
}

/// Replays one candle series through the pattern entry / exit-policy
/// strategy and returns the closed trades.
///
/// The engine is immutable once built and can be shared across runs.
#[derive(Debug, Clone)]
pub struct BacktestEngine {
    config: EngineConfig,
    trend: TrendIndicator,
    detector: PatternDetector,
    exits: ExitPolicy,
}

impl BacktestEngine {
    /// Validates `config` up front so a bad parameter fails before any
    /// candle is processed.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            trend: TrendIndicator::new(config.fast_ema_period, config.slow_ema_period),
            detector: PatternDetector::new(),
            exits: ExitPolicy::from_config(&config),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn exit_policy(&self) -> &ExitPolicy {
        &self.exits
    }

    /// Backtest with the trend computed on `series` itself.
    pub fn run(&self, series: &CandleSeries) -> BacktestResult {
        if series.len() < self.trend.warm_up() {
            debug!(
                symbol = %series.symbol(),
                timeframe = %series.timeframe(),
                candles = series.len(),
                warm_up = self.trend.warm_up(),
                "Not enough candles for the trend filter"
            );
            return BacktestResult {
                stats: base_stats(series),
                ..BacktestResult::empty(series.symbol(), series.timeframe())
            };
        }
        let track = TrendTrack::new(self.trend.compute(series));
        self.replay(series, &track)
    }

    /// Backtest `series` with the trend taken from `trend_series`, typically
    /// a higher timeframe of the same symbol. Trend candles only become
    /// visible once they have closed.
    pub fn run_with_trend(
        &self,
        series: &CandleSeries,
        trend_series: &CandleSeries,
    ) -> Result<BacktestResult> {
        if trend_series.symbol() != series.symbol() {
            return Err(Error::DataIntegrity {
                symbol: series.symbol().to_string(),
                timeframe: trend_series.timeframe(),
                reason: format!("trend series belongs to {}", trend_series.symbol()),
            });
        }
        let points = self.trend.compute(trend_series);
        let track = TrendTrack::new(TrendIndicator::align(series, trend_series, &points));
        Ok(self.replay(series, &track))
    }

    fn replay(&self, series: &CandleSeries, track: &TrendTrack) -> BacktestResult {
        let candles = series.candles();
        let mut stats = base_stats(series);
        let mut trades = Vec::new();
        let mut state = EngineState::NoPosition;

        for (i, candle) in candles.iter().enumerate() {
            let matched = self.detector.detect_at(candles, i);
            if !matched.is_empty() {
                stats.patterns_detected += 1;
            }
            let trend = track.latest_at(i).copied();

            state = match state {
                EngineState::NoPosition => match (matched.entry_kind(), trend) {
                    (Some(kind), Some(point)) if point.is_bullish() => {
                        EngineState::PositionOpen(self.open(series, i, candle, kind, point))
                    }
                    // Only a warmed-up bearish trend counts as a block.
                    (Some(_), Some(_)) => {
                        stats.entries_blocked_by_trend += 1;
                        EngineState::NoPosition
                    }
                    _ => EngineState::NoPosition,
                },
                EngineState::PositionOpen(position) => {
                    let ctx = ExitContext {
                        entry_price: position.entry_price,
                        close: candle.close,
                        trend,
                    };
                    match self.exits.evaluate(&ctx) {
                        Some(reason) => {
                            trades.push(self.close(position, i, candle, reason, trend));
                            EngineState::NoPosition
                        }
                        None => EngineState::PositionOpen(position),
                    }
                }
            };
        }

        if let EngineState::PositionOpen(position) = state {
            if let Some(last) = candles.last() {
                let i = candles.len() - 1;
                let trend = track.latest_at(i).copied();
                trades.push(self.close(position, i, last, ExitReason::ForcedClose, trend));
            }
        }

        let net: Decimal = trades.iter().map(|t| t.net_pnl).sum();
        info!(
            symbol = %series.symbol(),
            timeframe = %series.timeframe(),
            candles = stats.candles,
            patterns = stats.patterns_detected,
            blocked = stats.entries_blocked_by_trend,
            trades = trades.len(),
            net_pnl = %net.round_dp(4),
            "Backtest finished"
        );

        BacktestResult {
            symbol: series.symbol().to_string(),
            timeframe: series.timeframe(),
            trades,
            stats,
        }
    }

    fn open(
        &self,
        series: &CandleSeries,
        index: usize,
        candle: &Candle,
        pattern: PatternKind,
        trend: IndicatorPoint,
    ) -> Position {
        let position = Position {
            symbol: series.symbol().to_string(),
            timeframe: series.timeframe(),
            pattern,
            entry_index: index,
            entry_time: candle.open_time,
            entry_price: candle.close,
            size: self.config.trade_notional / candle.close,
            entry_ema_fast: trend.ema_fast,
            entry_ema_slow: trend.ema_slow,
            status: PositionStatus::Open,
        };
        debug!(
            symbol = %position.symbol,
            timeframe = %position.timeframe,
            index,
            pattern = %pattern,
            price = %position.entry_price,
            "Position opened"
        );
        position
    }

    fn close(
        &self,
        position: Position,
        index: usize,
        candle: &Candle,
        reason: ExitReason,
        trend: Option<IndicatorPoint>,
    ) -> Trade {
        let fill = ExitFill {
            index,
            time: candle.open_time,
            price: candle.close,
            reason,
            ema_fast: trend.map(|p| p.ema_fast),
            ema_slow: trend.map(|p| p.ema_slow),
        };
        let trade = position.close(fill, self.config.fee_rate);
        debug!(
            symbol = %trade.symbol,
            timeframe = %trade.timeframe,
            entry = trade.entry_index,
            exit = index,
            reason = %reason,
            net_pnl = %trade.net_pnl.round_dp(6),
            "Position closed"
        );
        trade
    }
}

fn base_stats(series: &CandleSeries) -> RunStats {
    RunStats {
        candles: series.len(),
        first_close: series.first().map(|c| c.close),
        last_close: series.last().map(|c| c.close),
        start: series.first().map(|c| c.open_time),
        end: series.last().map(|c| c.open_time),
        ..RunStats::default()
    }
}
