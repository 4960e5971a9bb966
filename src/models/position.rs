//! Open position held in a single trading pair.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Current holdings in a DEX pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Trading pair (unique key among open positions)
    pub pair: String,

    /// Fill price at entry
    pub entry_price: Decimal,

    /// When the position was opened
    pub entry_time: DateTime<Utc>,

    /// USD committed to the position
    pub invested_amount: Decimal,

    /// Tokens held
    pub token_amount: Decimal,

    /// Latest marked price
    pub current_price: Decimal,

    /// Unrealized P&L in USD
    pub unrealized_pnl: Decimal,

    /// Unrealized P&L as a fraction of the invested amount
    pub unrealized_pnl_pct: Decimal,

    /// Last time this position was marked
    pub last_updated: DateTime<Utc>,
}

impl Position {
    /// Create a new position from an entry fill.
    pub fn new(
        pair: String,
        entry_price: Decimal,
        invested_amount: Decimal,
        token_amount: Decimal,
        entry_time: DateTime<Utc>,
    ) -> Self {
        let mut position = Self {
            pair,
            entry_price,
            entry_time,
            invested_amount,
            token_amount,
            current_price: entry_price,
            unrealized_pnl: Decimal::ZERO,
            unrealized_pnl_pct: Decimal::ZERO,
            last_updated: entry_time,
        };
        position.update_price(entry_price, entry_time);
        position
    }

    /// Mark the position at a new price.
    pub fn update_price(&mut self, current_price: Decimal, at: DateTime<Utc>) {
        self.current_price = current_price;
        self.unrealized_pnl = self.current_value() - self.invested_amount;

        self.unrealized_pnl_pct = if self.invested_amount.is_zero() {
            Decimal::ZERO
        } else {
            self.unrealized_pnl / self.invested_amount
        };

        self.last_updated = at;
    }

    /// Market value at the last marked price.
    pub fn current_value(&self) -> Decimal {
        self.token_amount * self.current_price
    }

    /// P&L if the whole position were sold at `price`.
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        self.token_amount * price - self.invested_amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_pnl() {
        let now = Utc::now();
        let mut pos = Position::new("WETH/USDC".to_string(), dec!(2000), dec!(100), dec!(0.05), now);

        assert_eq!(pos.unrealized_pnl, dec!(0));

        pos.update_price(dec!(2200), now);
        assert_eq!(pos.current_value(), dec!(110));
        assert_eq!(pos.unrealized_pnl, dec!(10));
        assert_eq!(pos.unrealized_pnl_pct, dec!(0.1));

        pos.update_price(dec!(1800), now);
        assert_eq!(pos.unrealized_pnl, dec!(-10));
        assert_eq!(pos.pnl_at(dec!(2400)), dec!(20));
    }
}
