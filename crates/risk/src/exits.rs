use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::trace;

use common::ExitReason;
use strategy::{EngineConfig, IndicatorPoint};

/// What an exit rule may look at on the candle being evaluated.
#[derive(Debug, Clone, Copy)]
pub struct ExitContext {
    pub entry_price: Decimal,
    pub close: Decimal,
    /// Latest trend point at or before the candle, if warmed up.
    pub trend: Option<IndicatorPoint>,
}

impl ExitContext {
    /// Fractional change from entry to the candle close.
    pub fn return_pct(&self) -> Decimal {
        (self.close - self.entry_price) / self.entry_price
    }
}

/// A single exit condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitRule {
    /// Return at or above `pct`.
    TakeProfit { pct: Decimal },
    /// Return at or below `pct` (negative).
    StopLoss { pct: Decimal },
    /// Losing position while the fast EMA is below the slow one.
    EmaBearish,
}

impl ExitRule {
    pub fn reason(&self) -> ExitReason {
        match self {
            ExitRule::TakeProfit { .. } => ExitReason::TakeProfit,
            ExitRule::StopLoss { .. } => ExitReason::StopLoss,
            ExitRule::EmaBearish => ExitReason::EmaBearishExit,
        }
    }

    pub fn triggers(&self, ctx: &ExitContext) -> bool {
        match self {
            ExitRule::TakeProfit { pct } => ctx.return_pct() >= *pct,
            ExitRule::StopLoss { pct } => ctx.return_pct() <= *pct,
            ExitRule::EmaBearish => {
                ctx.close < ctx.entry_price && ctx.trend.is_some_and(|p| p.is_bearish())
            }
        }
    }
}

/// Ordered exit rules. The first rule that triggers decides the exit
/// reason; later rules are not evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitPolicy {
    rules: Vec<ExitRule>,
}

impl ExitPolicy {
    /// TakeProfit, then StopLoss, then (optionally) EmaBearish.
    pub fn new(take_profit_pct: Decimal, stop_loss_pct: Decimal, ema_bearish_exit: bool) -> Self {
        let mut rules = vec![
            ExitRule::TakeProfit { pct: take_profit_pct },
            ExitRule::StopLoss { pct: stop_loss_pct },
        ];
        if ema_bearish_exit {
            rules.push(ExitRule::EmaBearish);
        }
        Self { rules }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::new(cfg.take_profit_pct, cfg.stop_loss_pct, cfg.ema_bearish_exit_enabled)
    }

    /// Policy with an explicit rule order.
    pub fn with_rules(rules: Vec<ExitRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[ExitRule] {
        &self.rules
    }

    pub fn evaluate(&self, ctx: &ExitContext) -> Option<ExitReason> {
        let hit = self.rules.iter().find(|rule| rule.triggers(ctx))?;
        trace!(rule = ?hit, return_pct = %ctx.return_pct(), "Exit rule triggered");
        Some(hit.reason())
    }
}
