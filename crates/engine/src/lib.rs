pub mod backtest;
pub mod runner;

pub use backtest::BacktestEngine;
pub use runner::{BacktestRunner, RunInput, RunOutcome};
