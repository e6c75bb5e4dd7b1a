use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use common::{BacktestResult, CandleSeries, Error, Result, Timeframe};

use crate::backtest::BacktestEngine;

/// Candles handed to one run: the trading series and, when a separate
/// trend timeframe is configured, the series the trend is computed on.
#[derive(Debug, Clone)]
pub struct RunInput {
    pub series: CandleSeries,
    pub trend: Option<CandleSeries>,
}

impl From<CandleSeries> for RunInput {
    fn from(series: CandleSeries) -> Self {
        Self { series, trend: None }
    }
}

/// Result of one (symbol, timeframe) run. A failure here never affects
/// other runs.
#[derive(Debug)]
pub struct RunOutcome {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub result: Result<BacktestResult>,
}

/// Runs the symbol × timeframe cross product concurrently.
///
/// Loading happens on the async runtime; the backtest itself is CPU-bound
/// and goes to the blocking pool. At most `max_concurrent` runs are in
/// flight at once.
pub struct BacktestRunner {
    engine: Arc<BacktestEngine>,
    permits: Arc<Semaphore>,
}

impl BacktestRunner {
    pub fn new(engine: BacktestEngine, max_concurrent: usize) -> Self {
        Self {
            engine: Arc::new(engine),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn engine(&self) -> &BacktestEngine {
        &self.engine
    }

    /// Run every (symbol, timeframe) pair. `load` fetches the input of one
    /// run. Outcomes come back in symbol-major, timeframe-minor order
    /// regardless of completion order.
    pub async fn run_all<F, Fut>(
        &self,
        symbols: &[String],
        timeframes: &[Timeframe],
        load: F,
    ) -> Vec<RunOutcome>
    where
        F: Fn(String, Timeframe) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RunInput>> + Send + 'static,
    {
        let load = Arc::new(load);
        let mut tasks = JoinSet::new();

        let jobs = symbols
            .iter()
            .flat_map(|s| timeframes.iter().map(move |tf| (s.clone(), *tf)));
        for (slot, (symbol, timeframe)) in jobs.enumerate() {
            let engine = self.engine.clone();
            let permits = self.permits.clone();
            let load = load.clone();

            tasks.spawn(async move {
                let task_symbol = symbol.clone();
                // Inner task so a panicking loader still reports under its own key.
                let run = tokio::spawn(async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|e| Error::Other(format!("runner closed: {e}")))?;
                    let input = load(task_symbol, timeframe).await?;
                    run_blocking(engine, input).await
                });
                let result = match run.await {
                    Ok(result) => result,
                    Err(e) => Err(join_error(e)),
                };
                (slot, RunOutcome { symbol, timeframe, result })
            });
        }

        info!(runs = tasks.len(), "Backtest runs scheduled");

        let mut outcomes: Vec<(usize, RunOutcome)> = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, outcome)) => {
                    if let Err(e) = &outcome.result {
                        error!(
                            symbol = %outcome.symbol,
                            timeframe = %outcome.timeframe,
                            error = %e,
                            "Backtest run failed"
                        );
                    }
                    outcomes.push((slot, outcome));
                }
                Err(e) => warn!(error = %e, "Backtest task aborted"),
            }
        }

        outcomes.sort_by_key(|(slot, _)| *slot);
        outcomes.into_iter().map(|(_, o)| o).collect()
    }
}

async fn run_blocking(engine: Arc<BacktestEngine>, input: RunInput) -> Result<BacktestResult> {
    tokio::task::spawn_blocking(move || match &input.trend {
        Some(trend) => engine.run_with_trend(&input.series, trend),
        None => Ok(engine.run(&input.series)),
    })
    .await
    .map_err(join_error)?
}

fn join_error(e: tokio::task::JoinError) -> Error {
    if e.is_panic() {
        Error::Other(format!("backtest run panicked: {e}"))
    } else {
        Error::Other(format!("backtest run cancelled: {e}"))
    }
}
