//! Data models for market snapshots, positions, trades, and signals.

mod market;
mod position;
mod signal;
mod trade;

pub use market::MarketData;
pub use position::Position;
pub use signal::{Signal, SignalAction, SignalDetails, StrategyKind};
pub use trade::{ExitReason, TradeRecord, TradeSide};
