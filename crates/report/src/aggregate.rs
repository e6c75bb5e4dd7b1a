use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use common::{BacktestResult, Timeframe, Trade};
use engine::RunOutcome;
use strategy::EngineConfig;

/// Statistics for one (symbol, timeframe) run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: Decimal,
    pub total_pnl: Decimal,
    pub total_fees: Decimal,
    pub net_pnl: Decimal,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    /// Largest peak-to-trough fall of the cumulative net P&L, as a
    /// positive amount.
    pub max_drawdown: Decimal,
    pub hodl_return: Decimal,
    pub hodl_pnl: Decimal,
    pub first_price: Option<Decimal>,
    pub last_price: Option<Decimal>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub candles: usize,
    pub patterns_detected: usize,
    pub entries_blocked_by_trend: usize,
    pub trades: Vec<Trade>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeframeSummary {
    pub timeframe: Timeframe,
    pub total_trades: usize,
    pub total_pnl: Decimal,
    pub net_pnl: Decimal,
    /// Mean win rate over the symbols that traded on this timeframe.
    pub avg_win_rate: Decimal,
    pub symbols_traded: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OverallStats {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: Decimal,
    pub total_pnl: Decimal,
    pub total_fees: Decimal,
    pub net_pnl: Decimal,
    pub patterns_detected: usize,
    pub entries_blocked_by_trend: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRun {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub error: String,
}

/// Parameters echoed into the report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportConfig {
    pub engine: EngineConfig,
    pub days_back: u32,
    pub symbols: Vec<String>,
    pub timeframes: Vec<Timeframe>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub generated_at: DateTime<Utc>,
    pub configuration: ReportConfig,
    pub overall: OverallStats,
    /// Timeframe with the highest net P&L.
    pub best_timeframe: Option<Timeframe>,
    /// Sorted by net P&L, best first.
    pub timeframe_summaries: Vec<TimeframeSummary>,
    pub results: Vec<RunSummary>,
    pub failures: Vec<FailedRun>,
}

/// Folds backtest outcomes into a [`Report`].
#[derive(Debug, Clone, Copy)]
pub struct PerformanceAggregator {
    trade_notional: Decimal,
}

impl PerformanceAggregator {
    /// `trade_notional` sizes the buy-and-hold benchmark.
    pub fn new(trade_notional: Decimal) -> Self {
        Self { trade_notional }
    }

    pub fn summarize(&self, result: &BacktestResult) -> RunSummary {
        let trades = &result.trades;
        let wins: Vec<Decimal> = trades.iter().filter(|t| t.is_win()).map(|t| t.net_pnl).collect();
        let losses: Vec<Decimal> = trades.iter().filter(|t| !t.is_win()).map(|t| t.net_pnl).collect();

        let hodl_return = match (result.stats.first_close, result.stats.last_close) {
            (Some(first), Some(last)) if !first.is_zero() => (last - first) / first,
            _ => Decimal::ZERO,
        };

        RunSummary {
            symbol: result.symbol.clone(),
            timeframe: result.timeframe,
            total_trades: trades.len(),
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate: ratio(wins.len(), trades.len()),
            total_pnl: trades.iter().map(|t| t.gross_pnl).sum(),
            total_fees: trades.iter().map(|t| t.fees).sum(),
            net_pnl: trades.iter().map(|t| t.net_pnl).sum(),
            avg_win: mean(&wins),
            avg_loss: mean(&losses),
            max_drawdown: max_drawdown(trades),
            hodl_return,
            hodl_pnl: self.trade_notional * hodl_return,
            first_price: result.stats.first_close,
            last_price: result.stats.last_close,
            start: result.stats.start,
            end: result.stats.end,
            candles: result.stats.candles,
            patterns_detected: result.stats.patterns_detected,
            entries_blocked_by_trend: result.stats.entries_blocked_by_trend,
            trades: trades.clone(),
        }
    }

    pub fn build(
        &self,
        outcomes: Vec<RunOutcome>,
        configuration: ReportConfig,
        generated_at: DateTime<Utc>,
    ) -> Report {
        let mut results = Vec::new();
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(result) => results.push(self.summarize(&result)),
                Err(e) => failures.push(FailedRun {
                    symbol: outcome.symbol,
                    timeframe: outcome.timeframe,
                    error: e.to_string(),
                }),
            }
        }

        let timeframe_summaries = timeframe_summaries(&results);
        Report {
            generated_at,
            configuration,
            overall: overall(&results),
            best_timeframe: timeframe_summaries.first().map(|s| s.timeframe),
            timeframe_summaries,
            results,
            failures,
        }
    }
}

fn timeframe_summaries(results: &[RunSummary]) -> Vec<TimeframeSummary> {
    #[derive(Default)]
    struct Acc {
        trades: usize,
        total_pnl: Decimal,
        net_pnl: Decimal,
        win_rates: Vec<Decimal>,
        symbols: BTreeSet<String>,
    }

    let mut by_tf: BTreeMap<Timeframe, Acc> = BTreeMap::new();
    for r in results {
        let acc = by_tf.entry(r.timeframe).or_default();
        acc.trades += r.total_trades;
        acc.total_pnl += r.total_pnl;
        acc.net_pnl += r.net_pnl;
        if r.total_trades > 0 {
            acc.win_rates.push(r.win_rate);
            acc.symbols.insert(r.symbol.clone());
        }
    }

    let mut summaries: Vec<TimeframeSummary> = by_tf
        .into_iter()
        .map(|(timeframe, acc)| TimeframeSummary {
            timeframe,
            total_trades: acc.trades,
            total_pnl: acc.total_pnl,
            net_pnl: acc.net_pnl,
            avg_win_rate: mean(&acc.win_rates),
            symbols_traded: acc.symbols.len(),
        })
        .collect();
    summaries.sort_by(|a, b| b.net_pnl.cmp(&a.net_pnl));
    summaries
}

fn overall(results: &[RunSummary]) -> OverallStats {
    let mut stats = results.iter().fold(OverallStats::default(), |mut acc, r| {
        acc.total_trades += r.total_trades;
        acc.winning_trades += r.winning_trades;
        acc.losing_trades += r.losing_trades;
        acc.total_pnl += r.total_pnl;
        acc.total_fees += r.total_fees;
        acc.net_pnl += r.net_pnl;
        acc.patterns_detected += r.patterns_detected;
        acc.entries_blocked_by_trend += r.entries_blocked_by_trend;
        acc
    });
    stats.win_rate = ratio(stats.winning_trades, stats.total_trades);
    stats
}

fn max_drawdown(trades: &[Trade]) -> Decimal {
    let mut equity = Decimal::ZERO;
    let mut peak = Decimal::ZERO;
    let mut worst = Decimal::ZERO;
    for t in trades {
        equity += t.net_pnl;
        peak = peak.max(equity);
        worst = worst.max(peak - equity);
    }
    worst
}

fn ratio(part: usize, whole: usize) -> Decimal {
    if whole == 0 {
        Decimal::ZERO
    } else {
        Decimal::from(part) / Decimal::from(whole)
    }
}

fn mean(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        Decimal::ZERO
    } else {
        values.iter().sum::<Decimal>() / Decimal::from(values.len())
    }
}
