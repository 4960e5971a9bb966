//! Signal-generating strategies and the per-pair selector that routes to them.

mod config;
mod grid;
mod manager;
mod momentum;

pub use config::{GridConfig, MomentumConfig, SelectionConfig, SelectionMode, StrategyConfig};
pub use grid::GridTrading;
pub use manager::StrategyManager;
pub use momentum::Momentum;

use crate::models::{MarketData, Signal, StrategyKind};

/// A stateful signal generator for one trading pair.
///
/// Strategies keep their own rolling history. Insufficient history yields
/// `None` from `analyze`, never an error.
pub trait Strategy: Send {
    fn kind(&self) -> StrategyKind;

    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Whether market conditions suit this strategy right now.
    fn can_trade(&self, data: &MarketData) -> bool;

    /// Record the snapshot and return a signal if one fires.
    fn analyze(&mut self, data: &MarketData) -> Option<Signal>;

    /// Record the snapshot without signaling.
    fn observe(&mut self, data: &MarketData);

    fn is_active(&self) -> bool;

    fn set_active(&mut self, active: bool);

    /// The pair holds no position any more, whatever the strategy assumed.
    fn on_position_closed(&mut self) {}

    /// Drop all history and internal state.
    fn reset(&mut self);

    /// Diagnostic snapshot of internal state.
    fn state(&self) -> serde_json::Value;
}
