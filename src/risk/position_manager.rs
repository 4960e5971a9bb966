//! Capital accounting, position sizing and the open-position book.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use crate::events::{BotEvent, EventBus};
use crate::models::{ExitReason, Position, TradeRecord};

use super::RiskConfig;

/// Volatility at which the size reduction bottoms out.
const VOLATILITY_CEILING: Decimal = dec!(0.5);

/// Smallest volatility multiplier applied to a position size.
const MIN_VOLATILITY_FACTOR: Decimal = dec!(0.5);

/// Result of a sizing calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionSize {
    /// USD to commit
    pub amount_usd: Decimal,
    /// Tokens that amount buys at the quoted price
    pub amount_token: Decimal,
    /// Effective fraction of available capital
    pub percent: Decimal,
}

impl PositionSize {
    fn zero() -> Self {
        Self {
            amount_usd: Decimal::ZERO,
            amount_token: Decimal::ZERO,
            percent: Decimal::ZERO,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.amount_usd <= Decimal::ZERO
    }
}

/// Owns run capital and the open positions, one per pair.
///
/// `available_capital = current_capital - sum(invested_amount)` holds after
/// every public call.
pub struct PositionManager {
    config: RiskConfig,
    current_capital: Decimal,
    positions: HashMap<String, Position>,
    size_scale: Decimal,
    events: Option<EventBus>,
}

impl PositionManager {
    /// Create a manager holding `initial_capital` and no positions.
    pub fn new(config: RiskConfig, initial_capital: Decimal) -> Self {
        Self {
            config,
            current_capital: initial_capital,
            positions: HashMap::new(),
            size_scale: Decimal::ONE,
            events: None,
        }
    }

    /// Publish position and capital events on `bus`.
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn current_capital(&self) -> Decimal {
        self.current_capital
    }

    /// Capital not tied up in open positions.
    pub fn available_capital(&self) -> Decimal {
        self.current_capital - self.total_invested()
    }

    pub fn total_invested(&self) -> Decimal {
        self.positions.values().map(|p| p.invested_amount).sum()
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.positions.values().map(|p| p.unrealized_pnl).sum()
    }

    /// Capital plus the marked value of open positions over their cost.
    pub fn equity(&self) -> Decimal {
        self.current_capital + self.unrealized_pnl()
    }

    pub fn size_scale(&self) -> Decimal {
        self.size_scale
    }

    /// Scale every subsequent sizing result by `scale`, clamped to (0, 1].
    pub fn set_size_scale(&mut self, scale: Decimal) {
        let clamped = scale.max(dec!(0.01)).min(Decimal::ONE);
        if clamped != self.size_scale {
            info!(from = %self.size_scale, to = %clamped, "Position size scale changed");
        }
        self.size_scale = clamped;
    }

    // ==================== Sizing ====================

    /// Size a new position at `current_price`.
    ///
    /// Base size is `available * max_position_percent`, scaled by the size
    /// scale and, when `volatility` is known, by `max(0.5, 1 - volatility / 0.5)`.
    pub fn calculate_position_size(
        &self,
        current_price: Decimal,
        volatility: Option<f64>,
    ) -> PositionSize {
        let available = self.available_capital().max(Decimal::ZERO);
        if current_price <= Decimal::ZERO || available.is_zero() {
            return PositionSize::zero();
        }

        let volatility_factor = match volatility.filter(|v| v.is_finite() && *v >= 0.0) {
            Some(v) => {
                let v = Decimal::try_from(v).unwrap_or(VOLATILITY_CEILING);
                (Decimal::ONE - v / VOLATILITY_CEILING)
                    .max(MIN_VOLATILITY_FACTOR)
                    .min(Decimal::ONE)
            }
            None => Decimal::ONE,
        };

        let percent = self.config.max_position_percent * self.size_scale * volatility_factor;
        let amount_usd = available * percent;
        let amount_token = amount_usd / current_price;

        debug!(
            price = %current_price,
            available = %available,
            volatility_factor = %volatility_factor,
            amount_usd = %amount_usd,
            "Calculated position size"
        );

        PositionSize {
            amount_usd,
            amount_token,
            percent,
        }
    }

    /// Whether enough capital is free to open another position.
    pub fn can_open_position(&self) -> bool {
        self.available_capital() >= self.config.min_position_capital
    }

    // ==================== Positions ====================

    pub fn has_position(&self, pair: &str) -> bool {
        self.positions.contains_key(pair)
    }

    pub fn get_position(&self, pair: &str) -> Option<&Position> {
        self.positions.get(pair)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    /// Record a filled entry. Returns false without side effects if the pair
    /// is already open or the amounts are unusable.
    pub fn open_position(
        &mut self,
        pair: &str,
        entry_price: Decimal,
        amount_usd: Decimal,
        amount_token: Decimal,
        at: DateTime<Utc>,
    ) -> bool {
        if self.positions.contains_key(pair) {
            warn!(pair = %pair, "Position already open, not averaging in");
            return false;
        }
        if entry_price <= Decimal::ZERO || amount_usd <= Decimal::ZERO || amount_token <= Decimal::ZERO {
            warn!(
                pair = %pair,
                price = %entry_price,
                amount_usd = %amount_usd,
                amount_token = %amount_token,
                "Rejected position with non-positive amounts"
            );
            return false;
        }
        let available = self.available_capital();
        if amount_usd > available {
            warn!(
                pair = %pair,
                amount_usd = %amount_usd,
                available = %available,
                "Rejected position larger than available capital"
            );
            return false;
        }

        let position = Position::new(pair.to_string(), entry_price, amount_usd, amount_token, at);
        info!(
            pair = %pair,
            price = %entry_price,
            invested = %amount_usd,
            tokens = %amount_token,
            available = %(available - amount_usd),
            "Opened position"
        );

        self.publish(at, BotEvent::PositionOpened { position: position.clone() });
        self.positions.insert(pair.to_string(), position);
        true
    }

    /// Mark an open position at `current_price`.
    pub fn update_position(
        &mut self,
        pair: &str,
        current_price: Decimal,
        at: DateTime<Utc>,
    ) -> Option<&Position> {
        match self.positions.get_mut(pair) {
            Some(position) => {
                position.update_price(current_price, at);
                Some(&*position)
            }
            None => {
                warn!(pair = %pair, "Cannot update price: no open position");
                None
            }
        }
    }

    /// Close the whole position at `exit_price` and fold the realized P&L
    /// into capital.
    pub fn close_position(
        &mut self,
        pair: &str,
        exit_price: Decimal,
        reason: ExitReason,
        at: DateTime<Utc>,
    ) -> Option<TradeRecord> {
        let Some(position) = self.positions.remove(pair) else {
            warn!(pair = %pair, "Cannot close: no open position");
            return None;
        };

        let record = Self::build_record(
            &position,
            position.token_amount,
            position.invested_amount,
            exit_price,
            reason,
            false,
            at,
        );

        info!(
            pair = %pair,
            exit_price = %exit_price,
            pnl = %record.pnl,
            reason = %reason,
            "Closed position"
        );

        self.update_capital(self.current_capital + record.pnl, at);
        self.publish(at, BotEvent::PositionClosed { trade: record.clone() });
        Some(record)
    }

    /// Sell `fraction` of the remaining position at `exit_price`.
    ///
    /// A fraction of one or more closes the position.
    pub fn reduce_position(
        &mut self,
        pair: &str,
        fraction: Decimal,
        exit_price: Decimal,
        reason: ExitReason,
        at: DateTime<Utc>,
    ) -> Option<TradeRecord> {
        if fraction >= Decimal::ONE {
            return self.close_position(pair, exit_price, reason, at);
        }
        if fraction <= Decimal::ZERO {
            warn!(pair = %pair, fraction = %fraction, "Ignoring non-positive reduction");
            return None;
        }

        let Some(position) = self.positions.get_mut(pair) else {
            warn!(pair = %pair, "Cannot reduce: no open position");
            return None;
        };

        let sold_tokens = position.token_amount * fraction;
        let cost_basis = position.invested_amount * fraction;
        let record = Self::build_record(
            position,
            sold_tokens,
            cost_basis,
            exit_price,
            reason,
            true,
            at,
        );

        position.token_amount -= sold_tokens;
        position.invested_amount -= cost_basis;
        position.update_price(exit_price, at);

        info!(
            pair = %pair,
            fraction = %fraction,
            exit_price = %exit_price,
            pnl = %record.pnl,
            remaining_tokens = %position.token_amount,
            "Reduced position"
        );

        self.update_capital(self.current_capital + record.pnl, at);
        self.publish(at, BotEvent::PositionClosed { trade: record.clone() });
        Some(record)
    }

    /// Set capital to `new_capital`, logging the delta.
    pub fn update_capital(&mut self, new_capital: Decimal, at: DateTime<Utc>) {
        let before = self.current_capital;
        self.current_capital = new_capital;

        info!(
            before = %before,
            after = %new_capital,
            delta = %(new_capital - before),
            "Capital updated"
        );

        self.publish(
            at,
            BotEvent::CapitalChanged {
                before,
                after: new_capital,
                available: self.available_capital(),
            },
        );
    }

    fn build_record(
        position: &Position,
        token_amount: Decimal,
        cost_basis: Decimal,
        exit_price: Decimal,
        reason: ExitReason,
        partial: bool,
        at: DateTime<Utc>,
    ) -> TradeRecord {
        let exit_value = token_amount * exit_price;
        let pnl = exit_value - cost_basis;
        let pnl_pct = if cost_basis.is_zero() {
            Decimal::ZERO
        } else {
            pnl / cost_basis
        };

        TradeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            pair: position.pair.clone(),
            entry_price: position.entry_price,
            exit_price,
            entry_time: position.entry_time,
            exit_time: at,
            invested_amount: cost_basis,
            token_amount,
            exit_value,
            pnl,
            pnl_pct,
            exit_reason: reason,
            partial,
        }
    }

    fn publish(&self, at: DateTime<Utc>, event: BotEvent) {
        if let Some(bus) = &self.events {
            bus.publish_at(at, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(capital: Decimal) -> PositionManager {
        PositionManager::new(RiskConfig::default(), capital)
    }

    #[test]
    fn test_available_capital_excludes_invested() {
        let mut pm = manager(dec!(50));
        assert!(pm.open_position("WETH/USDC", dec!(100), dec!(25), dec!(0.25), Utc::now()));

        assert_eq!(pm.current_capital(), dec!(50));
        assert_eq!(pm.available_capital(), dec!(25));
    }

    #[test]
    fn test_open_existing_pair_is_noop() {
        let mut pm = manager(dec!(1000));
        let now = Utc::now();
        assert!(pm.open_position("WETH/USDC", dec!(100), dec!(50), dec!(0.5), now));
        assert!(!pm.open_position("WETH/USDC", dec!(90), dec!(60), dec!(0.6), now));

        assert_eq!(pm.position_count(), 1);
        assert_eq!(pm.current_capital(), dec!(1000));
        assert_eq!(pm.available_capital(), dec!(950));
        assert_eq!(pm.get_position("WETH/USDC").unwrap().entry_price, dec!(100));
    }

    #[test]
    fn test_open_rejects_more_than_available() {
        let mut pm = manager(dec!(100));
        assert!(!pm.open_position("WETH/USDC", dec!(100), dec!(150), dec!(1.5), Utc::now()));
        assert_eq!(pm.position_count(), 0);
    }

    #[test]
    fn test_position_size_base() {
        let pm = manager(dec!(1000));
        let size = pm.calculate_position_size(dec!(50), None);

        assert_eq!(size.amount_usd, dec!(100));
        assert_eq!(size.amount_token, dec!(2));
        assert_eq!(size.percent, dec!(0.10));
    }

    #[test]
    fn test_position_size_volatility_scaling() {
        let pm = manager(dec!(1000));

        let calm = pm.calculate_position_size(dec!(10), Some(0.0));
        assert_eq!(calm.amount_usd, dec!(100));

        let moderate = pm.calculate_position_size(dec!(10), Some(0.1));
        assert_eq!(moderate.amount_usd, dec!(80));

        let wild = pm.calculate_position_size(dec!(10), Some(0.9));
        assert_eq!(wild.amount_usd, dec!(50));
    }

    #[test]
    fn test_position_size_invalid_price() {
        let pm = manager(dec!(1000));
        assert!(pm.calculate_position_size(dec!(0), Some(0.1)).is_zero());
        assert!(pm.calculate_position_size(dec!(-1), None).is_zero());
    }

    #[test]
    fn test_size_scale() {
        let mut pm = manager(dec!(1000));
        pm.set_size_scale(dec!(0.5));
        assert_eq!(pm.calculate_position_size(dec!(10), None).amount_usd, dec!(50));
    }

    #[test]
    fn test_can_open_position_threshold() {
        let mut pm = manager(dec!(30));
        assert!(pm.can_open_position());

        assert!(pm.open_position("WETH/USDC", dec!(1), dec!(21), dec!(21), Utc::now()));
        assert_eq!(pm.available_capital(), dec!(9));
        assert!(!pm.can_open_position());
    }

    #[test]
    fn test_update_and_close_position() {
        let mut pm = manager(dec!(1000));
        let now = Utc::now();
        pm.open_position("WETH/USDC", dec!(100), dec!(100), dec!(1), now);

        let pos = pm.update_position("WETH/USDC", dec!(120), now).unwrap();
        assert_eq!(pos.unrealized_pnl, dec!(20));
        assert_eq!(pm.equity(), dec!(1020));

        let record = pm
            .close_position("WETH/USDC", dec!(110), ExitReason::StrategySignal, now)
            .unwrap();
        assert_eq!(record.pnl, dec!(10));
        assert_eq!(record.pnl_pct, dec!(0.1));
        assert!(!record.partial);
        assert_eq!(pm.current_capital(), dec!(1010));
        assert_eq!(pm.available_capital(), dec!(1010));
        assert_eq!(pm.position_count(), 0);
    }

    #[test]
    fn test_missing_position_is_non_fatal() {
        let mut pm = manager(dec!(1000));
        let now = Utc::now();
        assert!(pm.update_position("NOPE", dec!(1), now).is_none());
        assert!(pm.close_position("NOPE", dec!(1), ExitReason::Manual, now).is_none());
        assert!(pm.reduce_position("NOPE", dec!(0.5), dec!(1), ExitReason::TakeProfit, now).is_none());
        assert_eq!(pm.current_capital(), dec!(1000));
    }

    #[test]
    fn test_reduce_position() {
        let mut pm = manager(dec!(1000));
        let now = Utc::now();
        pm.open_position("WETH/USDC", dec!(100), dec!(200), dec!(2), now);

        let record = pm
            .reduce_position("WETH/USDC", dec!(0.25), dec!(110), ExitReason::TakeProfit, now)
            .unwrap();
        assert!(record.partial);
        assert_eq!(record.token_amount, dec!(0.5));
        assert_eq!(record.invested_amount, dec!(50));
        assert_eq!(record.pnl, dec!(5));

        let pos = pm.get_position("WETH/USDC").unwrap();
        assert_eq!(pos.token_amount, dec!(1.5));
        assert_eq!(pos.invested_amount, dec!(150));
        assert_eq!(pm.current_capital(), dec!(1005));
        assert_eq!(pm.available_capital(), dec!(855));
    }

    #[tokio::test]
    async fn test_events_published() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let mut pm = manager(dec!(1000)).with_events(bus);
        let now = Utc::now();

        pm.open_position("WETH/USDC", dec!(100), dec!(100), dec!(1), now);
        pm.close_position("WETH/USDC", dec!(90), ExitReason::StopLoss, now);

        assert_eq!(rx.recv().await.unwrap().event.name(), "position_opened");
        assert_eq!(rx.recv().await.unwrap().event.name(), "capital_changed");
        assert_eq!(rx.recv().await.unwrap().event.name(), "position_closed");
    }
}
