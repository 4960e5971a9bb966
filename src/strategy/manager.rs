//! Per-pair strategy selection with a switch cooldown.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::events::{BotEvent, EventBus};
use crate::indicators::{calculate_volatility, detect_trend, Trend};
use crate::models::{MarketData, Signal, StrategyKind};

use super::{GridTrading, Momentum, Strategy, StrategyConfig};

const HISTORY_CAP: usize = 100;

/// Owns both strategies for one pair; exactly one is active at a time.
pub struct StrategyManager {
    pair: String,
    config: StrategyConfig,
    grid: Box<dyn Strategy>,
    momentum: Box<dyn Strategy>,
    active: StrategyKind,
    last_switch: Option<DateTime<Utc>>,
    /// Last market classification published
    last_selected: Option<StrategyKind>,
    prices: VecDeque<f64>,
    events: Option<EventBus>,
}

impl StrategyManager {
    pub fn new(pair: impl Into<String>, config: StrategyConfig) -> Self {
        let mut grid: Box<dyn Strategy> = Box::new(GridTrading::new(config.grid.clone()));
        let mut momentum: Box<dyn Strategy> = Box::new(Momentum::new(config.momentum.clone()));

        let preferred = config
            .selection
            .mode
            .fixed_kind()
            .unwrap_or(config.selection.conservative);
        let active = if config.is_enabled(preferred) {
            preferred
        } else {
            other(preferred)
        };

        match active {
            StrategyKind::Grid => grid.set_active(true),
            StrategyKind::Momentum => momentum.set_active(true),
        }

        Self {
            pair: pair.into(),
            config,
            grid,
            momentum,
            active,
            last_switch: None,
            last_selected: None,
            prices: VecDeque::with_capacity(HISTORY_CAP),
            events: None,
        }
    }

    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn pair(&self) -> &str {
        &self.pair
    }

    pub fn active_kind(&self) -> StrategyKind {
        self.active
    }

    pub fn active_strategy(&self) -> &dyn Strategy {
        self.strategy(self.active)
    }

    fn strategy(&self, kind: StrategyKind) -> &dyn Strategy {
        match kind {
            StrategyKind::Grid => self.grid.as_ref(),
            StrategyKind::Momentum => self.momentum.as_ref(),
        }
    }

    fn strategy_mut(&mut self, kind: StrategyKind) -> &mut Box<dyn Strategy> {
        match kind {
            StrategyKind::Grid => &mut self.grid,
            StrategyKind::Momentum => &mut self.momentum,
        }
    }

    /// Whether a non-forced switch at `now` would be rejected by the cooldown.
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.last_switch.map_or(false, |last| {
            Duration::try_seconds(self.config.selection.switch_cooldown_secs)
                .map_or(true, |cooldown| now - last < cooldown)
        })
    }

    /// Switch the active strategy, subject to the cooldown.
    ///
    /// Switching to the already active strategy succeeds without touching
    /// the cooldown.
    pub fn switch_strategy(&mut self, kind: StrategyKind, reason: &str, now: DateTime<Utc>) -> bool {
        if kind == self.active {
            return true;
        }
        if self.in_cooldown(now) {
            debug!(
                pair = %self.pair,
                from = %self.active,
                to = %kind,
                "Strategy switch rejected: cooldown"
            );
            return false;
        }
        self.apply_switch(kind, reason, now, false)
    }

    /// Switch regardless of the cooldown and restart the target strategy
    /// from a clean state. The previous cooldown timestamp is kept if the
    /// switch fails.
    pub fn force_switch(&mut self, kind: StrategyKind, reason: &str, now: DateTime<Utc>) -> bool {
        if kind != self.active {
            let saved = self.last_switch.take();
            if !self.apply_switch(kind, reason, now, true) {
                self.last_switch = saved;
                return false;
            }
        }
        self.strategy_mut(kind).reset();
        true
    }

    fn apply_switch(&mut self, kind: StrategyKind, reason: &str, now: DateTime<Utc>, forced: bool) -> bool {
        if !self.config.is_enabled(kind) {
            warn!(pair = %self.pair, strategy = %kind, "Cannot switch to disabled strategy");
            return false;
        }

        let from = self.active;
        self.strategy_mut(from).set_active(false);
        self.strategy_mut(kind).set_active(true);
        self.active = kind;
        self.last_switch = Some(now);

        info!(
            pair = %self.pair,
            from = %from,
            to = %kind,
            forced = forced,
            reason = %reason,
            "Strategy switched"
        );
        self.publish(
            now,
            BotEvent::StrategyChanged {
                pair: self.pair.clone(),
                from,
                to: kind,
                reason: reason.to_string(),
                forced,
            },
        );
        true
    }

    /// Classify the market and, in auto mode, switch to the favored strategy.
    ///
    /// Momentum is favored when volatility and volume ratio both exceed their
    /// thresholds in a trending market; grid otherwise.
    pub fn auto_select(&mut self, data: &MarketData) -> StrategyKind {
        let prices: Vec<f64> = self.prices.iter().copied().collect();
        let volatility = data
            .volatility
            .or_else(|| calculate_volatility(&prices))
            .unwrap_or(0.0);
        let volume_ratio = data.volume_ratio();
        let trend = detect_trend(&prices);

        let selection = &self.config.selection;
        let chosen = if volatility > selection.momentum_min_volatility
            && volume_ratio > selection.momentum_min_volume_ratio
            && trend != Trend::Sideways
        {
            StrategyKind::Momentum
        } else {
            selection.conservative
        };

        if self.last_selected != Some(chosen) {
            self.last_selected = Some(chosen);
            self.publish(
                data.timestamp,
                BotEvent::StrategySelected {
                    pair: self.pair.clone(),
                    strategy: chosen,
                    volatility,
                    volume_ratio,
                    trend,
                },
            );
        }

        if self.config.selection.mode.fixed_kind().is_none()
            && chosen != self.active
            && self.config.is_enabled(chosen)
        {
            let reason = format!(
                "volatility {:.3}, volume ratio {:.2}, trend {:?}",
                volatility, volume_ratio, trend
            );
            self.switch_strategy(chosen, &reason, data.timestamp);
        }
        chosen
    }

    /// Feed the snapshot to both strategies; only the active one may signal.
    pub fn analyze(&mut self, data: &MarketData) -> Option<Signal> {
        if let Some(price) = data.price.to_f64().filter(|_| data.is_valid()) {
            if self.prices.len() == HISTORY_CAP {
                self.prices.pop_front();
            }
            self.prices.push_back(price);
        }

        let inactive = other(self.active);
        self.strategy_mut(inactive).observe(data);

        let active = self.strategy_mut(self.active);
        if !active.can_trade(data) {
            active.observe(data);
            return None;
        }

        let signal = active.analyze(data)?;
        debug!(
            pair = %self.pair,
            strategy = %signal.strategy,
            action = ?signal.action,
            confidence = signal.confidence,
            "Signal"
        );
        self.publish(data.timestamp, BotEvent::TradeSignal { signal: signal.clone() });
        Some(signal)
    }

    /// The pair's position is gone; let every strategy drop its assumptions.
    pub fn on_position_closed(&mut self) {
        self.grid.on_position_closed();
        self.momentum.on_position_closed();
    }

    pub fn state(&self) -> serde_json::Value {
        json!({
            "pair": self.pair,
            "active": self.active,
            "mode": self.config.selection.mode,
            "lastSwitch": self.last_switch,
            "strategies": [self.grid.state(), self.momentum.state()],
        })
    }

    fn publish(&self, at: DateTime<Utc>, event: BotEvent) {
        if let Some(bus) = &self.events {
            bus.publish_at(at, event);
        }
    }
}

fn other(kind: StrategyKind) -> StrategyKind {
    match kind {
        StrategyKind::Grid => StrategyKind::Momentum,
        StrategyKind::Momentum => StrategyKind::Grid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::SelectionMode;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn snapshot(price: Decimal, secs: i64) -> MarketData {
        MarketData::new("WETH/USDC", price, dec!(50000), dec!(1000000), start() + Duration::seconds(secs))
    }

    #[test]
    fn test_starts_on_conservative_strategy() {
        let manager = StrategyManager::new("WETH/USDC", StrategyConfig::default());
        assert_eq!(manager.active_kind(), StrategyKind::Grid);
        assert!(manager.active_strategy().is_active());
        assert!(!manager.momentum.is_active());
    }

    #[test]
    fn test_fixed_mode_starts_on_selected() {
        let mut config = StrategyConfig::default();
        config.selection.mode = SelectionMode::Momentum;
        let manager = StrategyManager::new("WETH/USDC", config);
        assert_eq!(manager.active_kind(), StrategyKind::Momentum);
    }

    #[test]
    fn test_switch_cooldown() {
        let mut manager = StrategyManager::new("WETH/USDC", StrategyConfig::default());
        let now = start();

        assert!(manager.switch_strategy(StrategyKind::Momentum, "test", now));
        assert_eq!(manager.active_kind(), StrategyKind::Momentum);

        // Second request inside the cooldown is rejected without change
        assert!(!manager.switch_strategy(StrategyKind::Grid, "test", now + Duration::seconds(60)));
        assert_eq!(manager.active_kind(), StrategyKind::Momentum);
        assert!(manager.momentum.is_active());
        assert!(!manager.grid.is_active());

        assert!(manager.switch_strategy(StrategyKind::Grid, "test", now + Duration::seconds(300)));
        assert_eq!(manager.active_kind(), StrategyKind::Grid);
    }

    #[test]
    fn test_unbounded_cooldown_rejects_switch() {
        let mut config = StrategyConfig::default();
        config.selection.switch_cooldown_secs = i64::MAX;
        let mut manager = StrategyManager::new("WETH/USDC", config);
        let now = start();

        assert!(manager.switch_strategy(StrategyKind::Momentum, "test", now));
        assert!(!manager.switch_strategy(StrategyKind::Grid, "test", now + Duration::days(3650)));
        assert_eq!(manager.active_kind(), StrategyKind::Momentum);
    }

    #[test]
    fn test_force_switch_bypasses_cooldown() {
        let mut manager = StrategyManager::new("WETH/USDC", StrategyConfig::default());
        let now = start();

        manager.switch_strategy(StrategyKind::Momentum, "test", now);
        assert!(manager.force_switch(StrategyKind::Grid, "drawdown reset", now + Duration::seconds(10)));
        assert_eq!(manager.active_kind(), StrategyKind::Grid);
        assert_eq!(manager.last_switch, Some(now + Duration::seconds(10)));
    }

    #[test]
    fn test_failed_force_switch_restores_cooldown() {
        let mut config = StrategyConfig::default();
        config.grid.enabled = false;
        let mut manager = StrategyManager::new("WETH/USDC", config);
        assert_eq!(manager.active_kind(), StrategyKind::Momentum);

        let now = start();
        manager.last_switch = Some(now);

        assert!(!manager.force_switch(StrategyKind::Grid, "drawdown reset", now + Duration::seconds(10)));
        assert_eq!(manager.active_kind(), StrategyKind::Momentum);
        assert_eq!(manager.last_switch, Some(now));
    }

    #[test]
    fn test_same_strategy_switch_keeps_cooldown() {
        let mut manager = StrategyManager::new("WETH/USDC", StrategyConfig::default());
        assert!(manager.switch_strategy(StrategyKind::Grid, "noop", start()));
        assert!(manager.last_switch.is_none());
    }

    #[test]
    fn test_auto_select_favors_momentum_in_volatile_trend() {
        let mut manager = StrategyManager::new("WETH/USDC", StrategyConfig::default());
        for i in 0..10 {
            manager.analyze(&snapshot(dec!(100), i));
        }
        for i in 10..20 {
            manager.analyze(&snapshot(dec!(110), i));
        }

        let mut data = snapshot(dec!(112), 20);
        data.volatility = Some(0.2);
        data.avg_volume = Some(dec!(20000));

        assert_eq!(manager.auto_select(&data), StrategyKind::Momentum);
        assert_eq!(manager.active_kind(), StrategyKind::Momentum);
    }

    #[test]
    fn test_auto_select_defaults_to_grid() {
        let mut manager = StrategyManager::new("WETH/USDC", StrategyConfig::default());
        let mut data = snapshot(dec!(100), 0);
        data.volatility = Some(0.5);
        data.avg_volume = Some(dec!(10000));

        // No trend history: sideways
        assert_eq!(manager.auto_select(&data), StrategyKind::Grid);
    }

    #[test]
    fn test_fixed_mode_does_not_auto_switch() {
        let mut config = StrategyConfig::default();
        config.selection.mode = SelectionMode::Grid;
        let mut manager = StrategyManager::new("WETH/USDC", config);
        for i in 0..10 {
            manager.analyze(&snapshot(dec!(100), i));
        }
        for i in 10..20 {
            manager.analyze(&snapshot(dec!(110), i));
        }
        let mut data = snapshot(dec!(112), 20);
        data.volatility = Some(0.2);
        data.avg_volume = Some(dec!(20000));

        assert_eq!(manager.auto_select(&data), StrategyKind::Momentum);
        assert_eq!(manager.active_kind(), StrategyKind::Grid);
    }

    #[tokio::test]
    async fn test_switch_publishes_event() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let mut manager = StrategyManager::new("WETH/USDC", StrategyConfig::default()).with_events(bus);

        manager.force_switch(StrategyKind::Momentum, "test", start());
        let record = rx.recv().await.unwrap();
        assert!(matches!(
            record.event,
            BotEvent::StrategyChanged { forced: true, to: StrategyKind::Momentum, .. }
        ));
    }

    #[test]
    fn test_force_switch_restarts_strategy() {
        let mut manager = StrategyManager::new("WETH/USDC", StrategyConfig::default());
        for i in 0..6 {
            manager.analyze(&snapshot(dec!(100), i));
        }
        assert_eq!(manager.grid.state()["history"], 6);

        // Already on grid: no switch, but the grid starts over
        assert!(manager.force_switch(StrategyKind::Grid, "drawdown reset", start()));
        assert!(manager.last_switch.is_none());
        assert_eq!(manager.grid.state()["history"], 0);
        assert!(manager.grid.state()["basePrice"].is_null());
    }

    #[tokio::test]
    async fn test_selection_published_on_change_only() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let mut config = StrategyConfig::default();
        config.momentum.enabled = false;
        let mut manager = StrategyManager::new("WETH/USDC", config).with_events(bus);

        for i in 0..10 {
            manager.analyze(&snapshot(dec!(100), i));
        }
        for i in 10..20 {
            manager.analyze(&snapshot(dec!(110), i));
        }
        let mut data = snapshot(dec!(112), 20);
        data.volatility = Some(0.2);
        data.avg_volume = Some(dec!(20000));

        // Momentum is favored but disabled: no switch attempt
        assert_eq!(manager.auto_select(&data), StrategyKind::Momentum);
        assert_eq!(manager.auto_select(&data), StrategyKind::Momentum);
        assert_eq!(manager.active_kind(), StrategyKind::Grid);
        assert!(manager.last_switch.is_none());

        let mut names = Vec::new();
        while let Ok(record) = rx.try_recv() {
            names.push(record.event.name());
        }
        assert_eq!(names.iter().filter(|n| **n == "strategy_selected").count(), 1);
        assert!(!names.contains(&"strategy_changed"));
    }
}
