use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result, Timeframe};

const DEFAULT_SYMBOLS: [&str; 12] = [
    "BTCUSDC", "ETHUSDC", "BNBUSDC", "ADAUSDC", "XRPUSDC", "DOGEUSDC", "SOLUSDC", "PEPEUSDC",
    "SHIBUSDC", "XLMUSDC", "LINKUSDC", "IOTAUSDC",
];

const DEFAULT_TIMEFRAMES: [Timeframe; 6] = [
    Timeframe::M1,
    Timeframe::M5,
    Timeframe::M15,
    Timeframe::M30,
    Timeframe::H1,
    Timeframe::H4,
];

/// Process-wide settings loaded from the environment at startup.
///
/// Strategy parameters live in the TOML file at `strategy_config_path`, not
/// here, so variants can be swapped without touching the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    // Universe
    pub symbols: Vec<String>,
    pub timeframes: Vec<Timeframe>,
    pub days_back: u32,

    // Candle cache
    pub cache_database_url: String,
    pub cache_expiry_hours: i64,

    // Exchange
    pub binance_base_url: String,
    pub klines_limit: u16,
    pub rate_limit_delay: Duration,

    // Runner
    pub max_concurrent_runs: usize,

    // Paths
    pub report_path: String,
    pub strategy_config_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect(),
            timeframes: DEFAULT_TIMEFRAMES.to_vec(),
            days_back: 100,
            cache_database_url: "sqlite://data_cache/klines.db?mode=rwc".to_string(),
            cache_expiry_hours: 24,
            binance_base_url: "https://api.binance.com".to_string(),
            klines_limit: 1000,
            rate_limit_delay: Duration::from_millis(100),
            max_concurrent_runs: 8,
            report_path: "backtest_results.json".to_string(),
            strategy_config_path: "config/strategy.toml".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, reading `.env` first
    /// if present. Unset variables fall back to defaults; malformed ones are
    /// a [`Error::Config`].
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv(); // ignore error if .env not present
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let symbols = match lookup("BACKTEST_SYMBOLS") {
            Some(raw) => split_list(&raw)
                .map(|s| s.to_uppercase())
                .collect::<Vec<_>>(),
            None => defaults.symbols,
        };
        if symbols.is_empty() {
            return Err(Error::Config("BACKTEST_SYMBOLS is empty".into()));
        }

        let timeframes = match lookup("BACKTEST_TIMEFRAMES") {
            Some(raw) => split_list(&raw)
                .map(Timeframe::from_str)
                .collect::<Result<Vec<_>>>()?,
            None => defaults.timeframes,
        };
        if timeframes.is_empty() {
            return Err(Error::Config("BACKTEST_TIMEFRAMES is empty".into()));
        }

        Ok(Config {
            symbols,
            timeframes,
            days_back: parsed(&lookup, "BACKTEST_DAYS")?.unwrap_or(defaults.days_back),
            cache_database_url: lookup("CACHE_DATABASE_URL").unwrap_or(defaults.cache_database_url),
            cache_expiry_hours: parsed(&lookup, "CACHE_EXPIRY_HOURS")?
                .unwrap_or(defaults.cache_expiry_hours),
            binance_base_url: lookup("BINANCE_BASE_URL").unwrap_or(defaults.binance_base_url),
            klines_limit: parsed(&lookup, "KLINES_LIMIT")?.unwrap_or(defaults.klines_limit),
            rate_limit_delay: parsed::<u64, _>(&lookup, "RATE_LIMIT_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.rate_limit_delay),
            max_concurrent_runs: parsed(&lookup, "MAX_CONCURRENT_RUNS")?
                .unwrap_or(defaults.max_concurrent_runs)
                .max(1),
            report_path: lookup("REPORT_PATH").unwrap_or(defaults.report_path),
            strategy_config_path: lookup("STRATEGY_CONFIG_PATH")
                .unwrap_or(defaults.strategy_config_path),
        })
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parsed<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| Error::Config(format!("{key}='{raw}': {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let cfg = Config::from_lookup(|_| None).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.symbols.len(), 12);
        assert_eq!(cfg.timeframes.len(), 6);
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("BACKTEST_SYMBOLS", "btcusdc, ethusdc"),
            ("BACKTEST_TIMEFRAMES", "1h,4h"),
            ("BACKTEST_DAYS", "30"),
            ("RATE_LIMIT_DELAY_MS", "250"),
            ("MAX_CONCURRENT_RUNS", "0"),
        ]))
        .unwrap();
        assert_eq!(cfg.symbols, vec!["BTCUSDC", "ETHUSDC"]);
        assert_eq!(cfg.timeframes, vec![Timeframe::H1, Timeframe::H4]);
        assert_eq!(cfg.days_back, 30);
        assert_eq!(cfg.rate_limit_delay, Duration::from_millis(250));
        assert_eq!(cfg.max_concurrent_runs, 1);
    }

    #[test]
    fn malformed_values_are_config_errors() {
        let err = Config::from_lookup(lookup_from(&[("BACKTEST_DAYS", "ten")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("BACKTEST_DAYS"));

        let err = Config::from_lookup(lookup_from(&[("BACKTEST_TIMEFRAMES", "1h,2h")])).unwrap_err();
        assert!(err.to_string().contains("2h"));
    }
}
