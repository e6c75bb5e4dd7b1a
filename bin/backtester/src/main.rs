use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{TimeDelta, Utc};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use common::{Config, Timeframe};
use data::{BinanceClient, CandleLoader, KlineStore};
use engine::{BacktestEngine, BacktestRunner, RunInput};
use report::{print_summary, save_json, PerformanceAggregator, ReportConfig};
use strategy::StrategyFileConfig;

/// Backtest candlestick reversal patterns with an EMA trend filter on
/// Binance spot pairs.
#[derive(Debug, Parser)]
#[command(name = "backtester", version)]
struct Cli {
    /// Days of history to test (overrides BACKTEST_DAYS).
    #[arg(long)]
    days: Option<u32>,

    /// Ignore the cache and download everything again.
    #[arg(long)]
    refresh: bool,

    /// Empty the candle cache before running.
    #[arg(long)]
    clear_cache: bool,

    /// Symbols to test, e.g. `--symbols BTCUSDC,ETHUSDC`.
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    symbols: Vec<String>,

    /// Timeframes to test, e.g. `--timeframes 15m,1h`.
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    timeframes: Vec<Timeframe>,

    /// Strategy TOML file (overrides STRATEGY_CONFIG_PATH).
    #[arg(long)]
    strategy: Option<PathBuf>,

    /// JSON report path (overrides REPORT_PATH).
    #[arg(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────────
    // Logs go to stderr so the summary tables on stdout stay readable.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // ── Config ────────────────────────────────────────────────────────────────
    let mut cfg = Config::from_env().context("invalid environment configuration")?;
    if let Some(days) = cli.days {
        cfg.days_back = days;
    }
    if !cli.symbols.is_empty() {
        cfg.symbols = cli.symbols.iter().map(|s| s.trim().to_uppercase()).collect();
    }
    if !cli.timeframes.is_empty() {
        cfg.timeframes = cli.timeframes.clone();
    }
    if let Some(path) = &cli.strategy {
        cfg.strategy_config_path = path.display().to_string();
    }
    let report_path = cli
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(&cfg.report_path));

    let strategy = StrategyFileConfig::load(&cfg.strategy_config_path)
        .with_context(|| format!("loading strategy config {}", cfg.strategy_config_path))?;
    let engine_cfg = strategy.engine;
    let engine = BacktestEngine::new(engine_cfg.clone()).context("invalid strategy parameters")?;

    info!(
        symbols = cfg.symbols.len(),
        timeframes = ?cfg.timeframes,
        days = cfg.days_back,
        take_profit = %engine_cfg.take_profit_pct,
        stop_loss = %engine_cfg.stop_loss_pct,
        trend_timeframe = ?engine_cfg.trend_timeframe,
        "Backtester starting"
    );

    // ── Candle cache ──────────────────────────────────────────────────────────
    let store = KlineStore::connect(&cfg.cache_database_url)
        .await
        .with_context(|| format!("opening candle cache {}", cfg.cache_database_url))?;
    if cli.clear_cache {
        store.clear().await.context("clearing candle cache")?;
    }

    let client = BinanceClient::from_config(&cfg).context("building Binance client")?;
    let loader = Arc::new(CandleLoader::new(
        Arc::new(client),
        store,
        TimeDelta::hours(cfg.cache_expiry_hours),
    ));

    // ── Runs ──────────────────────────────────────────────────────────────────
    let runner = BacktestRunner::new(engine, cfg.max_concurrent_runs);
    let days = cfg.days_back;
    let refresh = cli.refresh;
    let trend_timeframe = engine_cfg.trend_timeframe;

    let outcomes = runner
        .run_all(&cfg.symbols, &cfg.timeframes, move |symbol, timeframe| {
            let loader = loader.clone();
            async move {
                let series = loader.load_series(&symbol, timeframe, days, refresh).await?;
                let trend = match trend_timeframe {
                    Some(tf) if tf != timeframe => {
                        Some(loader.load_series(&symbol, tf, days, refresh).await?)
                    }
                    _ => None,
                };
                Ok(RunInput { series, trend })
            }
        })
        .await;

    // ── Report ────────────────────────────────────────────────────────────────
    let configuration = ReportConfig {
        engine: engine_cfg.clone(),
        days_back: cfg.days_back,
        symbols: cfg.symbols.clone(),
        timeframes: cfg.timeframes.clone(),
    };
    let report = PerformanceAggregator::new(engine_cfg.trade_notional).build(
        outcomes,
        configuration,
        Utc::now(),
    );

    print_summary(&report).context("writing summary")?;
    save_json(&report, &report_path)
        .with_context(|| format!("saving report to {}", report_path.display()))?;

    if !report.failures.is_empty() {
        warn!(failed = report.failures.len(), "Some runs failed; see the report for details");
    }
    info!(path = %report_path.display(), "Backtest complete");
    Ok(())
}
