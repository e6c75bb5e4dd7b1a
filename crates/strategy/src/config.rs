use std::path::Path;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::info;

use common::{Error, Result, Timeframe};

/// Strategy config file (TOML).
///
/// Example `config/strategy.toml`:
/// ```toml
/// [engine]
/// trade_notional = "100"
/// take_profit_pct = "0.009"
/// stop_loss_pct = "-0.20"
/// fee_rate = "0.001"
/// ema_bearish_exit_enabled = true
/// fast_ema_period = 1
/// slow_ema_period = 99
/// trend_timeframe = "4h"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct StrategyFileConfig {
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Parameters of one strategy variant.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Quote-currency amount committed to every position.
    pub trade_notional: Decimal,
    /// Close when the return reaches this fraction (e.g. 0.009 = 0.9%).
    pub take_profit_pct: Decimal,
    /// Close when the return falls to this fraction; must be negative.
    pub stop_loss_pct: Decimal,
    /// Close a losing position once the fast EMA drops below the slow one.
    pub ema_bearish_exit_enabled: bool,
    /// Fee charged on each leg as a fraction of its notional.
    pub fee_rate: Decimal,
    pub fast_ema_period: usize,
    pub slow_ema_period: usize,
    /// Compute the trend on this timeframe instead of the trading one.
    pub trend_timeframe: Option<Timeframe>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trade_notional: dec!(100),
            take_profit_pct: dec!(0.009),
            stop_loss_pct: dec!(-0.20),
            ema_bearish_exit_enabled: true,
            fee_rate: dec!(0.001),
            fast_ema_period: 1,
            slow_ema_period: 99,
            trend_timeframe: None,
        }
    }
}

impl EngineConfig {
    /// Reject values that would make every result meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.trade_notional <= Decimal::ZERO {
            return Err(Error::Config(format!(
                "trade_notional must be positive, got {}",
                self.trade_notional
            )));
        }
        if self.take_profit_pct <= Decimal::ZERO {
            return Err(Error::Config(format!(
                "take_profit_pct must be positive, got {}",
                self.take_profit_pct
            )));
        }
        if self.stop_loss_pct >= Decimal::ZERO {
            return Err(Error::Config(format!(
                "stop_loss_pct must be negative, got {}",
                self.stop_loss_pct
            )));
        }
        if self.stop_loss_pct <= Decimal::NEGATIVE_ONE {
            return Err(Error::Config(format!(
                "stop_loss_pct must be above -1, got {}",
                self.stop_loss_pct
            )));
        }
        if self.fee_rate < Decimal::ZERO {
            return Err(Error::Config(format!(
                "fee_rate must not be negative, got {}",
                self.fee_rate
            )));
        }
        if self.fast_ema_period == 0 || self.slow_ema_period == 0 {
            return Err(Error::Config("EMA periods must be at least 1".into()));
        }
        Ok(())
    }
}

impl StrategyFileConfig {
    /// Load from a TOML file. A missing file means "use the defaults";
    /// an unreadable or malformed one is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "Strategy config not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        cfg.engine.validate()?;
        Ok(cfg)
    }
}
