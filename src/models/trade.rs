//! Completed (fully or partially) closed trades.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

/// Why a position (or part of it) was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Trailing stop-loss hit
    StopLoss,
    /// Some take-profit levels hit (partial sell)
    TakeProfit,
    /// Every take-profit level hit
    AllTakeProfitLevels,
    /// Active strategy emitted a sell
    StrategySignal,
    /// Circuit breaker stopped the run
    CircuitBreaker,
    /// Closed by the operator or at shutdown
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::AllTakeProfitLevels => "all_take_profit_levels",
            ExitReason::StrategySignal => "strategy_signal",
            ExitReason::CircuitBreaker => "circuit_breaker",
            ExitReason::Manual => "manual",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record produced when a position is closed or reduced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Unique record id
    pub id: String,

    /// Trading pair
    pub pair: String,

    /// Entry fill price
    pub entry_price: Decimal,

    /// Exit fill price
    pub exit_price: Decimal,

    /// When the position was opened
    pub entry_time: DateTime<Utc>,

    /// When this exit happened
    pub exit_time: DateTime<Utc>,

    /// USD cost basis of the closed part
    pub invested_amount: Decimal,

    /// Tokens sold
    pub token_amount: Decimal,

    /// USD received for the tokens
    pub exit_value: Decimal,

    /// Realized P&L in USD
    pub pnl: Decimal,

    /// Realized P&L as a fraction of the cost basis
    pub pnl_pct: Decimal,

    /// Why the exit happened
    pub exit_reason: ExitReason,

    /// Whether the position stays open after this record
    pub partial: bool,
}

impl TradeRecord {
    /// Check if the trade made money.
    pub fn is_win(&self) -> bool {
        self.pnl > Decimal::ZERO
    }

    /// Holding duration in hours.
    pub fn holding_hours(&self) -> f64 {
        (self.exit_time - self.entry_time).num_seconds() as f64 / 3600.0
    }
}
