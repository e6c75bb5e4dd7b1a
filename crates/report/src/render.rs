use std::io::{self, Write};
use std::path::Path;

use rust_decimal::{Decimal, RoundingStrategy};
use tracing::info;

use common::Result;

use crate::aggregate::Report;

const TOP_PERFORMERS: usize = 5;

/// Print the console summary to stdout.
pub fn print_summary(report: &Report) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    write_summary(report, &mut out)
}

pub fn write_summary<W: Write>(report: &Report, out: &mut W) -> io::Result<()> {
    let o = &report.overall;
    writeln!(out, "\n=== BACKTEST SUMMARY ===\n")?;
    writeln!(out, "{:<22}{}", "Total trades:", o.total_trades)?;
    writeln!(out, "{:<22}{}", "Winning trades:", o.winning_trades)?;
    writeln!(out, "{:<22}{}", "Losing trades:", o.losing_trades)?;
    writeln!(out, "{:<22}{}", "Win rate:", pct(o.win_rate))?;
    writeln!(out, "{:<22}{}", "Net P&L:", money(o.net_pnl))?;
    writeln!(out, "{:<22}{}", "Total fees:", money(o.total_fees))?;
    writeln!(out, "{:<22}{}", "Patterns detected:", o.patterns_detected)?;
    writeln!(out, "{:<22}{}", "Blocked by trend:", o.entries_blocked_by_trend)?;

    match report.best_timeframe {
        Some(tf) => writeln!(out, "\nBest timeframe: {tf}")?,
        None => writeln!(out, "\nBest timeframe: -")?,
    }

    if !report.timeframe_summaries.is_empty() {
        writeln!(out, "\n=== TIMEFRAME PERFORMANCE ===\n")?;
        writeln!(
            out,
            "{:<10} {:>7} {:>9} {:>12} {:>8}",
            "Timeframe", "Trades", "Win rate", "Net P&L", "Symbols"
        )?;
        for s in &report.timeframe_summaries {
            writeln!(
                out,
                "{:<10} {:>7} {:>9} {:>12} {:>8}",
                s.timeframe.as_str(),
                s.total_trades,
                pct(s.avg_win_rate),
                money(s.net_pnl),
                s.symbols_traded
            )?;
        }
    }

    if !report.results.is_empty() {
        writeln!(out, "\n=== TOP PERFORMERS ===\n")?;
        writeln!(
            out,
            "{:<12} {:<10} {:>7} {:>9} {:>12} {:>12}",
            "Symbol", "Timeframe", "Trades", "Win rate", "Net P&L", "HODL P&L"
        )?;
        let mut ranked: Vec<_> = report.results.iter().collect();
        ranked.sort_by(|a, b| b.net_pnl.cmp(&a.net_pnl));
        for r in ranked.into_iter().take(TOP_PERFORMERS) {
            writeln!(
                out,
                "{:<12} {:<10} {:>7} {:>9} {:>12} {:>12}",
                r.symbol,
                r.timeframe.as_str(),
                r.total_trades,
                pct(r.win_rate),
                money(r.net_pnl),
                money(r.hodl_pnl)
            )?;
        }
    }

    if !report.failures.is_empty() {
        writeln!(out, "\n=== FAILED RUNS ===\n")?;
        for f in &report.failures {
            writeln!(out, "{:<12} {:<10} {}", f.symbol, f.timeframe.as_str(), f.error)?;
        }
    }
    Ok(())
}

/// Write the full report as pretty-printed JSON.
pub fn save_json(report: &Report, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)?;
    info!(path = %path.display(), "Report saved");
    Ok(())
}

fn pct(v: Decimal) -> String {
    format!("{:.2}%", two_dp(v * Decimal::ONE_HUNDRED))
}

fn money(v: Decimal) -> String {
    let v = two_dp(v);
    if v.is_sign_negative() && !v.is_zero() {
        format!("-${:.2}", v.abs())
    } else {
        format!("${:.2}", v.abs())
    }
}

fn two_dp(v: Decimal) -> Decimal {
    v.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{FailedRun, OverallStats, ReportConfig, RunSummary, TimeframeSummary};
    use chrono::{TimeZone, Utc};
    use common::Timeframe;
    use rust_decimal_macros::dec;
    use strategy::EngineConfig;

    fn summary(symbol: &str, net: Decimal) -> RunSummary {
        RunSummary {
            symbol: symbol.into(),
            timeframe: Timeframe::H4,
            total_trades: 2,
            winning_trades: 1,
            losing_trades: 1,
            win_rate: dec!(0.5),
            total_pnl: net,
            total_fees: dec!(0.4),
            net_pnl: net,
            avg_win: Decimal::ZERO,
            avg_loss: Decimal::ZERO,
            max_drawdown: Decimal::ZERO,
            hodl_return: dec!(0.05),
            hodl_pnl: dec!(5),
            first_price: None,
            last_price: None,
            start: None,
            end: None,
            candles: 0,
            patterns_detected: 0,
            entries_blocked_by_trend: 0,
            trades: vec![],
        }
    }

    fn report() -> Report {
        Report {
            generated_at: Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap(),
            configuration: ReportConfig {
                engine: EngineConfig::default(),
                days_back: 30,
                symbols: vec!["BTCUSDC".into(), "ETHUSDC".into()],
                timeframes: vec![Timeframe::H4],
            },
            overall: OverallStats { total_trades: 4, net_pnl: dec!(1.5), ..Default::default() },
            best_timeframe: Some(Timeframe::H4),
            timeframe_summaries: vec![TimeframeSummary {
                timeframe: Timeframe::H4,
                total_trades: 4,
                total_pnl: dec!(1.5),
                net_pnl: dec!(1.5),
                avg_win_rate: dec!(0.5),
                symbols_traded: 2,
            }],
            results: vec![summary("ETHUSDC", dec!(-1.25)), summary("BTCUSDC", dec!(2.75))],
            failures: vec![FailedRun {
                symbol: "DOGEUSDC".into(),
                timeframe: Timeframe::H4,
                error: "Data integrity error".into(),
            }],
        }
    }

    #[test]
    fn formats_money_and_percent() {
        assert_eq!(money(dec!(2.345)), "$2.35");
        assert_eq!(money(dec!(-0.001)), "$0.00");
        assert_eq!(money(dec!(-1.2)), "-$1.20");
        assert_eq!(pct(dec!(0.1234)), "12.34%");
    }

    #[test]
    fn summary_lists_sections_and_ranks_results() {
        let mut buf = Vec::new();
        write_summary(&report(), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();

        assert!(text.contains("Best timeframe: 4h"));
        assert!(text.contains("TIMEFRAME PERFORMANCE"));
        assert!(text.contains("DOGEUSDC"));
        let btc = text.find("BTCUSDC").unwrap();
        let eth = text.find("ETHUSDC").unwrap();
        assert!(btc < eth, "results should be ranked by net P&L");
        assert!(text.contains("-$1.25"));
    }

    #[test]
    fn json_report_is_written() {
        let dir = std::env::temp_dir().join(format!("report-test-{}", std::process::id()));
        let path = dir.join("nested").join("results.json");
        save_json(&report(), &path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["best_timeframe"], "4h");
        assert_eq!(value["overall"]["net_pnl"], "1.5");
        assert_eq!(value["results"].as_array().unwrap().len(), 2);
        assert_eq!(value["configuration"]["engine"]["take_profit_pct"], "0.009");
        std::fs::remove_dir_all(dir).unwrap();
    }
}
