//! Per-position exit tracking: trailing stop-loss and tiered take-profit.
//!
//! Stop-loss is evaluated before take-profit on every update. When both
//! would fire on the same price, the stop wins.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::events::{BotEvent, EventBus};
use crate::models::ExitReason;

use super::{RiskConfig, TakeProfitLevelConfig};

/// Stop price that trails the highest price seen since entry.
#[derive(Debug, Clone)]
pub struct TrailingStopLoss {
    entry_price: Decimal,
    trailing_percent: Decimal,
    highest_price: Decimal,
    stop_price: Decimal,
    triggered: bool,
}

/// Outcome of one stop-loss update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopCheck {
    pub triggered: bool,
    pub stop_price: Decimal,
    pub highest_price: Decimal,
    /// Gain or loss versus entry at the checked price
    pub pnl_pct: Decimal,
}

impl TrailingStopLoss {
    pub fn new(entry_price: Decimal, trailing_percent: Decimal) -> Self {
        Self {
            entry_price,
            trailing_percent,
            highest_price: entry_price,
            stop_price: entry_price * (Decimal::ONE - trailing_percent),
            triggered: false,
        }
    }

    /// Raise the trail on a new high and test the stop.
    ///
    /// Only the call that trips the stop reports `triggered`; later calls
    /// leave the state untouched and report false.
    pub fn update(&mut self, current_price: Decimal) -> StopCheck {
        let pnl_pct = if self.entry_price.is_zero() {
            Decimal::ZERO
        } else {
            (current_price - self.entry_price) / self.entry_price
        };

        if self.triggered {
            return StopCheck {
                triggered: false,
                stop_price: self.stop_price,
                highest_price: self.highest_price,
                pnl_pct,
            };
        }

        if current_price > self.highest_price {
            self.highest_price = current_price;
            self.stop_price = current_price * (Decimal::ONE - self.trailing_percent);
        }

        let triggered = current_price <= self.stop_price;
        if triggered {
            self.triggered = true;
        }

        StopCheck {
            triggered,
            stop_price: self.stop_price,
            highest_price: self.highest_price,
            pnl_pct,
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    pub fn stop_price(&self) -> Decimal {
        self.stop_price
    }

    pub fn highest_price(&self) -> Decimal {
        self.highest_price
    }

    pub fn entry_price(&self) -> Decimal {
        self.entry_price
    }
}

/// One take-profit tier bound to a position's entry price.
#[derive(Debug, Clone, PartialEq)]
pub struct TakeProfitLevel {
    /// 1-based, ascending by percent
    pub index: usize,
    pub percent: Decimal,
    pub amount: Decimal,
    pub target_price: Decimal,
    pub triggered: bool,
}

/// Ordered take-profit tiers for one position.
#[derive(Debug, Clone)]
pub struct TakeProfitLevels {
    levels: Vec<TakeProfitLevel>,
}

impl TakeProfitLevels {
    pub fn new(entry_price: Decimal, config: &[TakeProfitLevelConfig]) -> Self {
        let mut sorted = config.to_vec();
        sorted.sort_by(|a, b| a.percent.cmp(&b.percent));

        let levels = sorted
            .into_iter()
            .enumerate()
            .map(|(i, level)| TakeProfitLevel {
                index: i + 1,
                percent: level.percent,
                amount: level.amount,
                target_price: entry_price * (Decimal::ONE + level.percent),
                triggered: false,
            })
            .collect();

        Self { levels }
    }

    /// Latch every untriggered level whose target is at or below
    /// `current_price` and return the newly triggered ones.
    pub fn check(&mut self, current_price: Decimal) -> Vec<TakeProfitLevel> {
        self.levels
            .iter_mut()
            .filter(|level| !level.triggered && current_price >= level.target_price)
            .map(|level| {
                level.triggered = true;
                level.clone()
            })
            .collect()
    }

    pub fn all_levels_executed(&self) -> bool {
        self.levels.iter().all(|l| l.triggered)
    }

    pub fn levels(&self) -> &[TakeProfitLevel] {
        &self.levels
    }
}

/// Partial sale requested by newly triggered take-profit levels.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialExit {
    pub levels: Vec<usize>,
    /// Share of the position as originally opened
    pub fraction_of_original: Decimal,
    /// Share of what is still held; pass this to `reduce_position`
    pub fraction_of_remaining: Decimal,
    pub price: Decimal,
}

/// What the caller should do with a position after a price update.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitDecision {
    Hold,
    Exit {
        reason: ExitReason,
        exit_price: Decimal,
        pnl_pct: Decimal,
    },
    Partial(PartialExit),
}

struct ManagedExit {
    stop_loss: TrailingStopLoss,
    take_profit: TakeProfitLevels,
    /// Share of the original position sold by confirmed partial fills
    sold: Decimal,
}

/// Exit state for every managed position, keyed by pair.
pub struct ExitManager {
    stop_loss_trailing: Decimal,
    take_profit_levels: Vec<TakeProfitLevelConfig>,
    managed: HashMap<String, ManagedExit>,
    events: Option<EventBus>,
}

impl ExitManager {
    pub fn new(config: &RiskConfig) -> Self {
        Self {
            stop_loss_trailing: config.stop_loss_trailing,
            take_profit_levels: config.take_profit_levels.clone(),
            managed: HashMap::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Begin tracking a freshly opened position.
    pub fn start_managing(&mut self, pair: &str, entry_price: Decimal) {
        let managed = ManagedExit {
            stop_loss: TrailingStopLoss::new(entry_price, self.stop_loss_trailing),
            take_profit: TakeProfitLevels::new(entry_price, &self.take_profit_levels),
            sold: Decimal::ZERO,
        };

        debug!(
            pair = %pair,
            entry_price = %entry_price,
            stop_price = %managed.stop_loss.stop_price(),
            "Managing exits"
        );

        if self.managed.insert(pair.to_string(), managed).is_some() {
            warn!(pair = %pair, "Replaced existing exit state");
        }
    }

    /// Stop tracking `pair`. Returns whether anything was tracked.
    pub fn stop_managing(&mut self, pair: &str) -> bool {
        self.managed.remove(pair).is_some()
    }

    pub fn is_managing(&self, pair: &str) -> bool {
        self.managed.contains_key(pair)
    }

    pub fn stop_loss(&self, pair: &str) -> Option<&TrailingStopLoss> {
        self.managed.get(pair).map(|m| &m.stop_loss)
    }

    pub fn take_profit(&self, pair: &str) -> Option<&TakeProfitLevels> {
        self.managed.get(pair).map(|m| &m.take_profit)
    }

    /// Share of the original position sold so far by partial exits.
    pub fn sold_fraction(&self, pair: &str) -> Option<Decimal> {
        self.managed.get(pair).map(|m| m.sold)
    }

    /// Confirm that a partial exit filled. Only confirmed sales shrink the
    /// base later levels are sized against; a failed fill leaves it intact.
    pub fn record_partial_fill(&mut self, pair: &str, fraction_of_original: Decimal) {
        match self.managed.get_mut(pair) {
            Some(managed) => {
                managed.sold = (managed.sold + fraction_of_original).min(Decimal::ONE);
            }
            None => warn!(pair = %pair, "Partial fill for unmanaged pair"),
        }
    }

    /// Evaluate the exits for `pair` at `current_price`.
    pub fn update(&mut self, pair: &str, current_price: Decimal, at: DateTime<Utc>) -> ExitDecision {
        let Some(managed) = self.managed.get_mut(pair) else {
            warn!(pair = %pair, "Exit update for unmanaged pair");
            return ExitDecision::Hold;
        };

        let stop = managed.stop_loss.update(current_price);
        if stop.triggered {
            warn!(
                pair = %pair,
                price = %current_price,
                stop_price = %stop.stop_price,
                highest = %stop.highest_price,
                pnl_pct = %stop.pnl_pct,
                "Stop-loss triggered"
            );
            let event = BotEvent::StopLossTriggered {
                pair: pair.to_string(),
                stop_price: stop.stop_price,
                highest_price: stop.highest_price,
                exit_price: current_price,
                pnl_pct: stop.pnl_pct,
            };
            self.publish(at, event);
            return ExitDecision::Exit {
                reason: ExitReason::StopLoss,
                exit_price: current_price,
                pnl_pct: stop.pnl_pct,
            };
        }

        let remaining_before = Decimal::ONE - managed.sold;
        let hit = managed.take_profit.check(current_price);
        if hit.is_empty() {
            return ExitDecision::Hold;
        }

        let levels: Vec<usize> = hit.iter().map(|l| l.index).collect();
        let fraction: Decimal = hit.iter().map(|l| l.amount).sum();
        let all_levels = managed.take_profit.all_levels_executed();

        info!(
            pair = %pair,
            price = %current_price,
            levels = ?levels,
            fraction = %fraction,
            all_levels = all_levels,
            "Take-profit triggered"
        );
        self.publish(
            at,
            BotEvent::TakeProfitTriggered {
                pair: pair.to_string(),
                levels: levels.clone(),
                fraction,
                price: current_price,
                all_levels,
            },
        );

        if all_levels {
            return ExitDecision::Exit {
                reason: ExitReason::AllTakeProfitLevels,
                exit_price: current_price,
                pnl_pct: stop.pnl_pct,
            };
        }

        let fraction_of_remaining = if remaining_before > Decimal::ZERO {
            (fraction / remaining_before).min(Decimal::ONE)
        } else {
            Decimal::ONE
        };

        ExitDecision::Partial(PartialExit {
            levels,
            fraction_of_original: fraction,
            fraction_of_remaining,
            price: current_price,
        })
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
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_trailing_stop_example() {
        let mut stop = TrailingStopLoss::new(dec!(100), dec!(0.03));
        assert_eq!(stop.stop_price(), dec!(97));

        let check = stop.update(dec!(110));
        assert!(!check.triggered);
        assert_eq!(check.stop_price, dec!(106.7));

        let check = stop.update(dec!(106));
        assert!(check.triggered);
        assert_eq!(check.pnl_pct, dec!(0.06));
        assert!(stop.is_triggered());
    }

    #[test]
    fn test_trailing_stop_latches() {
        let mut stop = TrailingStopLoss::new(dec!(100), dec!(0.03));
        assert!(stop.update(dec!(96)).triggered);

        // Later updates do not signal again and do not move the trail
        let check = stop.update(dec!(150));
        assert!(!check.triggered);
        assert_eq!(check.highest_price, dec!(100));
        assert!(stop.is_triggered());
    }

    #[test]
    fn test_stop_does_not_drop_with_price() {
        let mut stop = TrailingStopLoss::new(dec!(100), dec!(0.10));
        stop.update(dec!(120));
        stop.update(dec!(115));
        assert_eq!(stop.stop_price(), dec!(108));
        assert_eq!(stop.highest_price(), dec!(120));
    }

    #[test]
    fn test_take_profit_jump_triggers_all() {
        let mut tp = TakeProfitLevels::new(dec!(100), &RiskConfig::default().take_profit_levels);
        let hit = tp.check(dec!(135));

        assert_eq!(hit.iter().map(|l| l.index).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(tp.all_levels_executed());
        assert!(tp.levels().iter().all(|l| l.triggered));
    }

    #[test]
    fn test_take_profit_levels_fire_once() {
        let mut tp = TakeProfitLevels::new(dec!(100), &RiskConfig::default().take_profit_levels);
        assert!(tp.check(dec!(109.99)).is_empty());
        assert_eq!(tp.check(dec!(110)).len(), 1);
        assert!(tp.check(dec!(112)).is_empty());
        assert!(!tp.all_levels_executed());
    }

    #[test]
    fn test_take_profit_sorted_by_percent() {
        let config = vec![
            TakeProfitLevelConfig { percent: dec!(0.30), amount: dec!(0.25) },
            TakeProfitLevelConfig { percent: dec!(0.10), amount: dec!(0.25) },
            TakeProfitLevelConfig { percent: dec!(0.20), amount: dec!(0.50) },
        ];
        let tp = TakeProfitLevels::new(dec!(100), &config);
        let targets: Vec<_> = tp.levels().iter().map(|l| l.target_price).collect();
        assert_eq!(targets, vec![dec!(110), dec!(120), dec!(130)]);
    }

    #[test]
    fn test_manager_partial_then_full() {
        let mut exits = ExitManager::new(&RiskConfig {
            stop_loss_trailing: dec!(0.20),
            ..Default::default()
        });
        let now = Utc::now();
        exits.start_managing("WETH/USDC", dec!(100));

        match exits.update("WETH/USDC", dec!(111), now) {
            ExitDecision::Partial(partial) => {
                assert_eq!(partial.levels, vec![1]);
                assert_eq!(partial.fraction_of_original, dec!(0.25));
                assert_eq!(partial.fraction_of_remaining, dec!(0.25));
            }
            other => panic!("expected partial exit, got {:?}", other),
        }
        exits.record_partial_fill("WETH/USDC", dec!(0.25));

        match exits.update("WETH/USDC", dec!(121), now) {
            ExitDecision::Partial(partial) => {
                assert_eq!(partial.levels, vec![2]);
                assert_eq!(partial.fraction_of_original, dec!(0.5));
                // Half of the original is two thirds of the remaining 75%
                assert_eq!(partial.fraction_of_remaining.round_dp(6), dec!(0.666667));
            }
            other => panic!("expected partial exit, got {:?}", other),
        }

        let decision = exits.update("WETH/USDC", dec!(131), now);
        assert_eq!(
            decision,
            ExitDecision::Exit {
                reason: ExitReason::AllTakeProfitLevels,
                exit_price: dec!(131),
                pnl_pct: dec!(0.31),
            }
        );
    }

    #[test]
    fn test_stop_loss_after_partial_take_profit() {
        let mut exits = ExitManager::new(&RiskConfig {
            stop_loss_trailing: dec!(0.05),
            ..Default::default()
        });
        let now = Utc::now();
        exits.start_managing("PEPE/WETH", dec!(100));

        match exits.update("PEPE/WETH", dec!(120), now) {
            ExitDecision::Partial(partial) => {
                assert_eq!(partial.levels, vec![1, 2]);
                exits.record_partial_fill("PEPE/WETH", partial.fraction_of_original);
            }
            other => panic!("expected partial exit, got {:?}", other),
        }

        // Trail sits at 114; the stop fires and the last level stays untouched
        let decision = exits.update("PEPE/WETH", dec!(112), now);
        assert_eq!(
            decision,
            ExitDecision::Exit {
                reason: ExitReason::StopLoss,
                exit_price: dec!(112),
                pnl_pct: dec!(0.12),
            }
        );
        assert_eq!(exits.sold_fraction("PEPE/WETH"), Some(dec!(0.75)));
        assert!(exits.stop_loss("PEPE/WETH").unwrap().is_triggered());
    }

    #[test]
    fn test_unconfirmed_partial_keeps_sizing_base() {
        let mut exits = ExitManager::new(&RiskConfig {
            stop_loss_trailing: dec!(0.20),
            ..Default::default()
        });
        let now = Utc::now();
        exits.start_managing("WETH/USDC", dec!(100));

        // Level 1 fires but its sale is never confirmed
        assert!(matches!(exits.update("WETH/USDC", dec!(111), now), ExitDecision::Partial(_)));

        match exits.update("WETH/USDC", dec!(121), now) {
            ExitDecision::Partial(partial) => {
                assert_eq!(partial.levels, vec![2]);
                assert_eq!(partial.fraction_of_remaining, dec!(0.5));
            }
            other => panic!("expected partial exit, got {:?}", other),
        }
        assert_eq!(exits.sold_fraction("WETH/USDC"), Some(Decimal::ZERO));
    }

    #[test]
    fn test_unmanaged_pair() {
        let mut exits = ExitManager::new(&RiskConfig::default());
        assert_eq!(exits.update("NOPE", dec!(1), Utc::now()), ExitDecision::Hold);
        assert!(!exits.stop_managing("NOPE"));
        assert!(!exits.stop_managing("NOPE"));
    }

    proptest! {
        #[test]
        fn prop_stop_price_never_decreases(prices in prop::collection::vec(1u32..100_000, 1..60)) {
            let mut stop = TrailingStopLoss::new(dec!(500), dec!(0.03));
            let mut last_stop = stop.stop_price();
            let mut was_triggered = false;

            for p in prices {
                stop.update(Decimal::from(p) / dec!(100));
                prop_assert!(stop.stop_price() >= last_stop);
                prop_assert!(!was_triggered || stop.is_triggered());
                last_stop = stop.stop_price();
                was_triggered = stop.is_triggered();
            }
        }
    }
}
