//! Three-level drawdown circuit breaker.
//!
//! Drawdown is measured from the running capital peak. Each level fires at
//! most once per run; a single large drop can fire several levels in one
//! update, in ascending order of severity.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::events::{BotEvent, EventBus};

use super::{DrawdownAction, DrawdownLevelConfig, RiskConfig};

/// A level that fired during `update_capital`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredLevel {
    /// 1-based
    pub level: usize,
    pub action: DrawdownAction,
    pub threshold: Decimal,
    pub drawdown: Decimal,
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, Serialize)]
pub struct DrawdownStatus {
    pub initial_capital: Decimal,
    pub peak_capital: Decimal,
    pub current_capital: Decimal,
    pub current_drawdown: Decimal,
    pub max_drawdown_reached: Decimal,
    pub triggered_levels: Vec<usize>,
    pub paused: bool,
    pub pause_until: Option<DateTime<Utc>>,
    pub stopped: bool,
}

pub struct DrawdownManager {
    levels: Vec<DrawdownLevelConfig>,
    max_drawdown: Decimal,
    initial_capital: Decimal,
    peak_capital: Decimal,
    current_capital: Decimal,
    current_drawdown: Decimal,
    max_drawdown_reached: Decimal,
    triggered_levels: BTreeSet<usize>,
    pause_until: Option<DateTime<Utc>>,
    stopped: bool,
    events: Option<EventBus>,
}

impl DrawdownManager {
    pub fn new(config: &RiskConfig, initial_capital: Decimal) -> Self {
        let mut levels = config.drawdown_levels.clone();
        // Least severe first
        levels.sort_by(|a, b| b.percent.cmp(&a.percent));

        Self {
            levels,
            max_drawdown: config.max_drawdown,
            initial_capital,
            peak_capital: initial_capital,
            current_capital: initial_capital,
            current_drawdown: Decimal::ZERO,
            max_drawdown_reached: Decimal::ZERO,
            triggered_levels: BTreeSet::new(),
            pause_until: None,
            stopped: false,
            events: None,
        }
    }

    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Record a new capital value and fire any newly crossed levels.
    pub fn update_capital(&mut self, new_capital: Decimal, now: DateTime<Utc>) -> Vec<FiredLevel> {
        self.current_capital = new_capital;
        if new_capital > self.peak_capital {
            self.peak_capital = new_capital;
        }

        self.current_drawdown = if self.peak_capital > Decimal::ZERO {
            ((self.current_capital - self.peak_capital) / self.peak_capital).min(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };
        if self.current_drawdown < self.max_drawdown_reached {
            self.max_drawdown_reached = self.current_drawdown;
        }

        let crossed: Vec<(usize, DrawdownLevelConfig)> = self
            .levels
            .iter()
            .enumerate()
            .map(|(i, level)| (i + 1, *level))
            .filter(|(index, level)| {
                self.current_drawdown <= level.percent && !self.triggered_levels.contains(index)
            })
            .collect();

        crossed
            .into_iter()
            .map(|(index, level)| self.fire(index, level, now))
            .collect()
    }

    fn fire(&mut self, index: usize, level: DrawdownLevelConfig, now: DateTime<Utc>) -> FiredLevel {
        self.triggered_levels.insert(index);

        warn!(
            level = index,
            action = level.action.as_str(),
            drawdown = %self.current_drawdown,
            capital = %self.current_capital,
            peak = %self.peak_capital,
            "Drawdown level triggered"
        );
        self.publish(
            now,
            BotEvent::DrawdownLevelTriggered {
                level: index,
                action: level.action,
                drawdown: self.current_drawdown,
                capital: self.current_capital,
                peak: self.peak_capital,
            },
        );

        match level.action {
            DrawdownAction::Pause | DrawdownAction::PauseAndReset => {
                let secs = level
                    .duration_secs
                    .map_or(0, |s| i64::try_from(s).unwrap_or(i64::MAX));
                // Unrepresentable deadlines pause until the end of time
                let until = Duration::try_seconds(secs)
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                // Overlapping pauses keep the later deadline
                let until = self.pause_until.map_or(until, |current| current.max(until));
                self.pause_until = Some(until);

                info!(level = index, until = %until, "Trading paused");
                self.publish(now, BotEvent::TradingPaused { level: index, until });
            }
            DrawdownAction::Stop => {
                self.stopped = true;
                error!(
                    drawdown = %self.current_drawdown,
                    capital = %self.current_capital,
                    "Circuit breaker stop: trading halted for this run"
                );
            }
        }

        FiredLevel {
            level: index,
            action: level.action,
            threshold: level.percent,
            drawdown: self.current_drawdown,
        }
    }

    /// Whether a pause is in force at `now`. An expired pause is cleared here.
    pub fn is_trading_paused(&mut self, now: DateTime<Utc>) -> bool {
        match self.pause_until {
            Some(until) if now >= until => {
                self.pause_until = None;
                info!("Trading pause expired, resuming");
                self.publish(now, BotEvent::TradingResumed);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// New entries allowed: not stopped and not paused.
    pub fn can_trade(&mut self, now: DateTime<Utc>) -> bool {
        !self.stopped && !self.is_trading_paused(now)
    }

    /// Drawdown at or beyond the overall `max_drawdown` tolerance.
    pub fn is_beyond_max_drawdown(&self) -> bool {
        self.current_drawdown <= -self.max_drawdown
    }

    /// Start a new run baseline at the current capital.
    pub fn reset(&mut self) {
        info!(capital = %self.current_capital, "Drawdown state reset");
        self.peak_capital = self.current_capital;
        self.current_drawdown = Decimal::ZERO;
        self.max_drawdown_reached = Decimal::ZERO;
        self.triggered_levels.clear();
        self.pause_until = None;
        self.stopped = false;
    }

    pub fn current_drawdown(&self) -> Decimal {
        self.current_drawdown
    }

    pub fn peak_capital(&self) -> Decimal {
        self.peak_capital
    }

    pub fn max_drawdown_reached(&self) -> Decimal {
        self.max_drawdown_reached
    }

    pub fn status(&self, now: DateTime<Utc>) -> DrawdownStatus {
        DrawdownStatus {
            initial_capital: self.initial_capital,
            peak_capital: self.peak_capital,
            current_capital: self.current_capital,
            current_drawdown: self.current_drawdown,
            max_drawdown_reached: self.max_drawdown_reached,
            triggered_levels: self.triggered_levels.iter().copied().collect(),
            paused: self.pause_until.map_or(false, |until| now < until),
            pause_until: self.pause_until,
            stopped: self.stopped,
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
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn manager() -> DrawdownManager {
        DrawdownManager::new(&RiskConfig::default(), dec!(100))
    }

    #[test]
    fn test_large_drop_fires_all_levels_in_order() {
        let mut dd = manager();
        let fired = dd.update_capital(dec!(84), Utc::now());

        assert_eq!(dd.current_drawdown(), dec!(-0.16));
        assert_eq!(fired.iter().map(|f| f.level).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(
            fired.iter().map(|f| f.action).collect::<Vec<_>>(),
            vec![DrawdownAction::Pause, DrawdownAction::PauseAndReset, DrawdownAction::Stop]
        );
        assert!(dd.is_stopped());
        assert!(dd.is_beyond_max_drawdown());
    }

    #[test]
    fn test_level_fires_once_under_oscillation() {
        let mut dd = manager();
        let now = Utc::now();

        assert_eq!(dd.update_capital(dec!(94), now).len(), 1);
        assert!(dd.update_capital(dec!(97), now).is_empty());
        assert!(dd.update_capital(dec!(94), now).is_empty());
        assert_eq!(dd.status(now).triggered_levels, vec![1]);
    }

    #[test]
    fn test_once_per_run_after_reset() {
        let mut dd = manager();
        let now = Utc::now();
        dd.update_capital(dec!(94), now);
        dd.reset();

        assert_eq!(dd.peak_capital(), dec!(94));
        assert!(!dd.is_trading_paused(now));

        // 94 -> 89 is -5.3% from the new peak
        assert_eq!(dd.update_capital(dec!(89), now).len(), 1);
        assert!(dd.update_capital(dec!(92), now).is_empty());
        assert!(dd.update_capital(dec!(89), now).is_empty());
    }

    #[test]
    fn test_peak_rises_with_capital() {
        let mut dd = manager();
        let now = Utc::now();
        dd.update_capital(dec!(120), now);
        dd.update_capital(dec!(114), now);

        assert_eq!(dd.peak_capital(), dec!(120));
        assert_eq!(dd.current_drawdown(), dec!(-0.05));
        assert_eq!(dd.max_drawdown_reached(), dec!(-0.05));
    }

    #[test]
    fn test_pause_expires_lazily() {
        let mut dd = manager();
        let start = Utc::now();
        dd.update_capital(dec!(95), start);

        assert!(dd.is_trading_paused(start));
        assert!(!dd.can_trade(start + Duration::seconds(1799)));
        assert!(!dd.is_trading_paused(start + Duration::seconds(1800)));
        assert!(dd.can_trade(start + Duration::seconds(1800)));
        assert!(dd.status(start).pause_until.is_none());
    }

    #[test]
    fn test_huge_pause_duration_saturates() {
        let mut config = RiskConfig::default();
        config.drawdown_levels[0].duration_secs = Some(1_000_000_000_000_000);
        let mut dd = DrawdownManager::new(&config, dec!(100));
        let now = Utc::now();

        assert_eq!(dd.update_capital(dec!(94), now).len(), 1);
        assert_eq!(dd.status(now).pause_until, Some(DateTime::<Utc>::MAX_UTC));
        assert!(!dd.can_trade(now + Duration::days(365)));
    }

    #[test]
    fn test_pause_keeps_later_deadline() {
        let mut dd = manager();
        let start = Utc::now();
        dd.update_capital(dec!(90), start);

        let until = dd.status(start).pause_until.unwrap();
        assert_eq!(until, start + Duration::seconds(7200));
        assert!(dd.is_trading_paused(start + Duration::seconds(3600)));
    }

    #[test]
    fn test_stop_survives_pause_expiry() {
        let mut dd = manager();
        let start = Utc::now();
        dd.update_capital(dec!(80), start);

        let later = start + Duration::hours(3);
        assert!(!dd.is_trading_paused(later));
        assert!(!dd.can_trade(later));
    }

    #[tokio::test]
    async fn test_events_published() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let mut dd = manager().with_events(bus);
        let start = Utc::now();

        dd.update_capital(dec!(95), start);
        dd.is_trading_paused(start + Duration::hours(1));

        assert_eq!(rx.recv().await.unwrap().event.name(), "drawdown_level_triggered");
        assert_eq!(rx.recv().await.unwrap().event.name(), "trading_paused");
        assert_eq!(rx.recv().await.unwrap().event.name(), "trading_resumed");
    }

    proptest! {
        #[test]
        fn prop_peak_monotonic_and_drawdown_non_positive(
            capitals in prop::collection::vec(1u32..1_000_000, 1..80)
        ) {
            let mut dd = manager();
            let now = Utc::now();
            let mut last_peak = dd.peak_capital();
            let mut fired_total = Vec::new();

            for c in capitals {
                let fired = dd.update_capital(Decimal::from(c) / dec!(100), now);
                fired_total.extend(fired.into_iter().map(|f| f.level));

                prop_assert!(dd.peak_capital() >= last_peak);
                prop_assert!(dd.current_drawdown() <= Decimal::ZERO);
                last_peak = dd.peak_capital();
            }

            let mut unique = fired_total.clone();
            unique.sort_unstable();
            unique.dedup();
            prop_assert_eq!(unique.len(), fired_total.len());
        }
    }
}
