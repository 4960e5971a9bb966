//! Capital protection: sizing, exits and the drawdown circuit breaker.

mod config;
mod drawdown;
mod exit_manager;
mod position_manager;

pub use config::{
    DrawdownAction, DrawdownLevelConfig, RiskConfig, TakeProfitLevelConfig, MAX_TIMER_SECS,
};
pub use drawdown::{DrawdownManager, DrawdownStatus, FiredLevel};
pub use exit_manager::{ExitDecision, ExitManager, PartialExit, TakeProfitLevels, TrailingStopLoss};
pub use position_manager::{PositionManager, PositionSize};
