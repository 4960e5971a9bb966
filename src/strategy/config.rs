//! Strategy parameters.

use anyhow::{ensure, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::indicators::RSI_PERIOD;
use crate::risk::MAX_TIMER_SECS;
use crate::models::StrategyKind;

/// Grid trading parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub enabled: bool,

    /// Number of evenly spaced levels across the range
    pub levels: usize,

    /// Lower edge of the range relative to base (-0.05 = 5% below)
    pub range_min: Decimal,

    /// Upper edge of the range relative to base
    pub range_max: Decimal,

    /// Minimum time between rebalances (seconds)
    pub rebalance_interval_secs: i64,

    /// Move away from base that justifies a rebalance
    pub rebalance_threshold: Decimal,

    /// Distance to a level that counts as touching it
    pub trigger_tolerance: Decimal,

    /// Volatility above which the grid stands aside
    pub max_volatility: f64,

    /// Pool liquidity below which the grid stands aside (USD)
    pub min_liquidity: Decimal,

    /// Prices required before the first signal
    pub min_history: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            levels: 10,
            range_min: dec!(-0.05),
            range_max: dec!(0.05),
            rebalance_interval_secs: 3600, // 1 hour
            rebalance_threshold: dec!(0.05),
            trigger_tolerance: dec!(0.005), // 0.5%
            max_volatility: 0.30,
            min_liquidity: dec!(10000), // $10k pool
            min_history: 5,
        }
    }
}

impl GridConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.levels >= 2, "grid needs at least 2 levels, got {}", self.levels);
        ensure!(
            self.range_min < Decimal::ZERO && self.range_max > Decimal::ZERO,
            "grid range must straddle the base price, got [{}, {}]",
            self.range_min,
            self.range_max
        );
        ensure!(self.range_min > -Decimal::ONE, "grid range_min must be above -1");
        ensure!(
            (0..=MAX_TIMER_SECS).contains(&self.rebalance_interval_secs),
            "grid rebalance_interval_secs must be in [0, {}]",
            MAX_TIMER_SECS
        );
        ensure!(
            self.trigger_tolerance > Decimal::ZERO,
            "grid trigger_tolerance must be positive"
        );
        ensure!(
            self.rebalance_threshold > Decimal::ZERO,
            "grid rebalance_threshold must be positive"
        );
        ensure!(self.max_volatility > 0.0, "grid max_volatility must be positive");
        Ok(())
    }
}

/// Momentum parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MomentumConfig {
    pub enabled: bool,

    /// Prices over which the entry move is measured
    pub lookback_period: usize,

    /// Minimum price change over the lookback to enter (0.02 = 2%)
    pub entry_threshold: f64,

    /// Drawdown from the post-entry peak that exits (0.03 = 3%)
    pub exit_threshold: f64,

    /// Volume must exceed this multiple of average volume to enter
    pub volume_multiplier: f64,

    pub rsi_period: usize,

    /// Oversold bound; entries require RSI below `rsi_entry + 40`
    pub rsi_entry: f64,

    /// Overbought bound that forces an exit
    pub rsi_exit: f64,

    /// Volatility below which momentum stands aside
    pub min_volatility: f64,

    /// Snapshot volume below which momentum stands aside (USD)
    pub min_volume: Decimal,
}

impl Default for MomentumConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lookback_period: 20,
            entry_threshold: 0.02,    // 2% move
            exit_threshold: 0.03,     // 3% off the peak
            volume_multiplier: 1.5,
            rsi_period: RSI_PERIOD,
            rsi_entry: 30.0,
            rsi_exit: 70.0,
            min_volatility: 0.02,
            min_volume: dec!(1000),   // $1000
        }
    }
}

impl MomentumConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.rsi_period > 0, "momentum rsi_period must be positive");
        ensure!(
            self.lookback_period >= self.rsi_period + 1,
            "momentum lookback_period ({}) must be at least rsi_period + 1 ({})",
            self.lookback_period,
            self.rsi_period + 1
        );
        ensure!(self.entry_threshold > 0.0, "momentum entry_threshold must be positive");
        ensure!(
            self.exit_threshold > 0.0 && self.exit_threshold < 1.0,
            "momentum exit_threshold must be in (0, 1)"
        );
        ensure!(self.volume_multiplier > 0.0, "momentum volume_multiplier must be positive");
        ensure!(
            0.0 <= self.rsi_entry && self.rsi_entry < self.rsi_exit && self.rsi_exit <= 100.0,
            "momentum RSI bounds must satisfy 0 <= rsi_entry < rsi_exit <= 100"
        );
        ensure!(self.min_volatility >= 0.0, "momentum min_volatility must not be negative");
        Ok(())
    }
}

/// How the active strategy is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    /// Pick from market conditions every cycle
    Auto,
    /// Always grid
    Grid,
    /// Always momentum
    Momentum,
}

impl SelectionMode {
    pub fn fixed_kind(&self) -> Option<StrategyKind> {
        match self {
            SelectionMode::Auto => None,
            SelectionMode::Grid => Some(StrategyKind::Grid),
            SelectionMode::Momentum => Some(StrategyKind::Momentum),
        }
    }
}

/// Strategy selection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub mode: SelectionMode,

    /// Volatility above which momentum is favored
    pub momentum_min_volatility: f64,

    /// Volume ratio above which momentum is favored
    pub momentum_min_volume_ratio: f64,

    /// Minimum time between strategy switches (seconds)
    pub switch_cooldown_secs: i64,

    /// Strategy used by default and after a circuit-breaker reset
    pub conservative: StrategyKind,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            mode: SelectionMode::Auto,
            momentum_min_volatility: 0.15,
            momentum_min_volume_ratio: 1.5,
            switch_cooldown_secs: 300, // 5 minutes
            conservative: StrategyKind::Grid,
        }
    }
}

/// Everything the strategy layer needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub grid: GridConfig,
    pub momentum: MomentumConfig,
    pub selection: SelectionConfig,
}

impl StrategyConfig {
    pub fn is_enabled(&self, kind: StrategyKind) -> bool {
        match kind {
            StrategyKind::Grid => self.grid.enabled,
            StrategyKind::Momentum => self.momentum.enabled,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.grid.validate()?;
        self.momentum.validate()?;
        ensure!(
            self.grid.enabled || self.momentum.enabled,
            "at least one strategy must be enabled"
        );
        ensure!(
            (0..=MAX_TIMER_SECS).contains(&self.selection.switch_cooldown_secs),
            "switch_cooldown_secs must be in [0, {}]",
            MAX_TIMER_SECS
        );
        if let Some(kind) = self.selection.mode.fixed_kind() {
            ensure!(self.is_enabled(kind), "selected strategy {} is disabled", kind);
        }
        Ok(())
    }
}
