//! Risk policy configuration.

use anyhow::{ensure, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Hard ceiling for `max_position_percent`.
pub const MAX_POSITION_PERCENT_CAP: Decimal = dec!(0.20);

/// Longest pause, cooldown or rebalance interval accepted (30 days).
pub const MAX_TIMER_SECS: i64 = 30 * 24 * 60 * 60;

/// What the circuit breaker does when a drawdown level fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawdownAction {
    /// Suspend new entries for the level's duration
    Pause,
    /// Pause, switch to the conservative strategy and shrink position sizes
    PauseAndReset,
    /// Stop trading for the rest of the run
    Stop,
}

impl DrawdownAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrawdownAction::Pause => "pause",
            DrawdownAction::PauseAndReset => "pause_and_reset",
            DrawdownAction::Stop => "stop",
        }
    }
}

/// One take-profit tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitLevelConfig {
    /// Gain over entry that triggers the tier (0.10 = +10%)
    pub percent: Decimal,
    /// Fraction of the original position to sell
    pub amount: Decimal,
}

/// One circuit-breaker tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrawdownLevelConfig {
    /// Drawdown from peak that fires the tier (negative, -0.05 = -5%)
    pub percent: Decimal,
    pub action: DrawdownAction,
    /// Pause length in seconds (pausing actions only)
    #[serde(default)]
    pub duration_secs: Option<u64>,
}

/// Configuration for sizing, exits and the circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Fraction of available capital committed per position (max 0.20)
    pub max_position_percent: Decimal,

    /// Trailing stop distance below the highest price (0.03 = 3%)
    pub stop_loss_trailing: Decimal,

    /// Take-profit tiers, amounts summing to 1.0
    pub take_profit_levels: Vec<TakeProfitLevelConfig>,

    /// Overall drawdown tolerance; the deepest circuit-breaker tier must not exceed it
    pub max_drawdown: Decimal,

    /// Circuit-breaker tiers in ascending severity
    pub drawdown_levels: Vec<DrawdownLevelConfig>,

    /// Maximum gas cost as a fraction of the trade amount
    pub max_gas_percent: Decimal,

    /// Available capital below which no new position is opened
    pub min_position_capital: Decimal,

    /// Position size multiplier applied after a `pause_and_reset`
    pub reset_size_scale: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_percent: dec!(0.10),   // 10% of available capital
            stop_loss_trailing: dec!(0.03),     // 3% trailing stop
            take_profit_levels: vec![
                TakeProfitLevelConfig { percent: dec!(0.10), amount: dec!(0.25) },
                TakeProfitLevelConfig { percent: dec!(0.20), amount: dec!(0.50) },
                TakeProfitLevelConfig { percent: dec!(0.30), amount: dec!(0.25) },
            ],
            max_drawdown: dec!(0.15),           // Stop at 15% drawdown
            drawdown_levels: vec![
                DrawdownLevelConfig {
                    percent: dec!(-0.05),
                    action: DrawdownAction::Pause,
                    duration_secs: Some(1800),  // 30 minutes
                },
                DrawdownLevelConfig {
                    percent: dec!(-0.10),
                    action: DrawdownAction::PauseAndReset,
                    duration_secs: Some(7200),  // 2 hours
                },
                DrawdownLevelConfig {
                    percent: dec!(-0.15),
                    action: DrawdownAction::Stop,
                    duration_secs: None,
                },
            ],
            max_gas_percent: dec!(0.02),        // 2% of trade amount
            min_position_capital: dec!(10),     // $10
            reset_size_scale: dec!(0.5),        // Half size after reset
        }
    }
}

impl RiskConfig {
    /// Check policy values before any cycle runs.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_position_percent > Decimal::ZERO
                && self.max_position_percent <= MAX_POSITION_PERCENT_CAP,
            "max_position_percent must be in (0, {}], got {}",
            MAX_POSITION_PERCENT_CAP,
            self.max_position_percent
        );
        ensure!(
            self.stop_loss_trailing > Decimal::ZERO && self.stop_loss_trailing < Decimal::ONE,
            "stop_loss_trailing must be in (0, 1), got {}",
            self.stop_loss_trailing
        );

        ensure!(
            self.take_profit_levels.len() == 3,
            "expected 3 take_profit_levels, got {}",
            self.take_profit_levels.len()
        );
        for level in &self.take_profit_levels {
            ensure!(
                level.percent > Decimal::ZERO,
                "take-profit percent must be positive, got {}",
                level.percent
            );
            ensure!(
                level.amount > Decimal::ZERO && level.amount <= Decimal::ONE,
                "take-profit amount must be in (0, 1], got {}",
                level.amount
            );
        }
        let total: Decimal = self.take_profit_levels.iter().map(|l| l.amount).sum();
        ensure!(
            total == Decimal::ONE,
            "take-profit amounts must sum to 1.0, got {}",
            total
        );

        ensure!(
            self.max_drawdown > Decimal::ZERO && self.max_drawdown < Decimal::ONE,
            "max_drawdown must be in (0, 1), got {}",
            self.max_drawdown
        );
        ensure!(
            self.drawdown_levels.len() == 3,
            "expected 3 drawdown_levels, got {}",
            self.drawdown_levels.len()
        );
        for (i, level) in self.drawdown_levels.iter().enumerate() {
            ensure!(
                level.percent < Decimal::ZERO && level.percent > -Decimal::ONE,
                "drawdown level {} percent must be in (-1, 0), got {}",
                i + 1,
                level.percent
            );
            if let Some(prev) = i.checked_sub(1).map(|j| &self.drawdown_levels[j]) {
                ensure!(
                    level.percent < prev.percent,
                    "drawdown levels must be strictly increasing in severity"
                );
            }
            if matches!(level.action, DrawdownAction::Pause | DrawdownAction::PauseAndReset) {
                ensure!(
                    level.duration_secs.map_or(false, |d| d > 0),
                    "drawdown level {} ({}) needs a positive duration",
                    i + 1,
                    level.action.as_str()
                );
                ensure!(
                    level.duration_secs.map_or(true, |d| d <= MAX_TIMER_SECS as u64),
                    "drawdown level {} duration must be at most {}s",
                    i + 1,
                    MAX_TIMER_SECS
                );
            }
        }
        let actions: Vec<_> = self.drawdown_levels.iter().map(|l| l.action).collect();
        ensure!(
            actions
                == [
                    DrawdownAction::Pause,
                    DrawdownAction::PauseAndReset,
                    DrawdownAction::Stop
                ],
            "drawdown actions must be pause, pause_and_reset, stop"
        );
        if let Some(deepest) = self.drawdown_levels.last() {
            ensure!(
                -deepest.percent <= self.max_drawdown,
                "deepest drawdown level {} exceeds max_drawdown {}",
                deepest.percent,
                self.max_drawdown
            );
        }

        ensure!(
            self.max_gas_percent >= Decimal::ZERO && self.max_gas_percent < Decimal::ONE,
            "max_gas_percent must be in [0, 1), got {}",
            self.max_gas_percent
        );
        ensure!(
            self.min_position_capital >= Decimal::ZERO,
            "min_position_capital must not be negative"
        );
        ensure!(
            self.reset_size_scale > Decimal::ZERO && self.reset_size_scale <= Decimal::ONE,
            "reset_size_scale must be in (0, 1], got {}",
            self.reset_size_scale
        );

        Ok(())
    }
}
