//! Grid trading: buy below and sell above a base price at fixed offsets.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::indicators::calculate_volatility;
use crate::models::{MarketData, Signal, SignalAction, SignalDetails, StrategyKind};

use super::{GridConfig, Strategy};

const HISTORY_CAP: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum LevelSide {
    Buy,
    Sell,
    Neutral,
}

#[derive(Debug, Clone, Serialize)]
struct GridLevel {
    index: usize,
    offset: Decimal,
    price: Decimal,
    side: LevelSide,
    triggered: bool,
}

pub struct GridTrading {
    config: GridConfig,
    active: bool,
    base_price: Option<Decimal>,
    levels: Vec<GridLevel>,
    last_rebalance: Option<DateTime<Utc>>,
    prices: VecDeque<f64>,
}

impl GridTrading {
    pub fn new(config: GridConfig) -> Self {
        Self {
            config,
            active: false,
            base_price: None,
            levels: Vec::new(),
            last_rebalance: None,
            prices: VecDeque::with_capacity(HISTORY_CAP),
        }
    }

    pub fn base_price(&self) -> Option<Decimal> {
        self.base_price
    }

    fn record(&mut self, data: &MarketData) {
        if let Some(price) = data.price.to_f64() {
            if self.prices.len() == HISTORY_CAP {
                self.prices.pop_front();
            }
            self.prices.push_back(price);
        }
    }

    fn volatility(&self, data: &MarketData) -> Option<f64> {
        data.volatility.or_else(|| {
            let prices: Vec<f64> = self.prices.iter().copied().collect();
            calculate_volatility(&prices)
        })
    }

    /// Recenter the grid on `base` and clear every trigger.
    fn rebuild(&mut self, base: Decimal, now: DateTime<Utc>) {
        let count = self.config.levels.max(2);
        let step = (self.config.range_max - self.config.range_min) / Decimal::from(count - 1);

        self.levels = (0..count)
            .map(|i| {
                let offset = self.config.range_min + step * Decimal::from(i);
                let side = if offset < Decimal::ZERO {
                    LevelSide::Buy
                } else if offset > Decimal::ZERO {
                    LevelSide::Sell
                } else {
                    LevelSide::Neutral
                };
                GridLevel {
                    index: i + 1,
                    offset,
                    price: base * (Decimal::ONE + offset),
                    side,
                    triggered: false,
                }
            })
            .collect();

        self.base_price = Some(base);
        self.last_rebalance = Some(now);

        info!(
            base = %base,
            levels = count,
            low = %self.levels.first().map(|l| l.price).unwrap_or(base),
            high = %self.levels.last().map(|l| l.price).unwrap_or(base),
            "Grid built"
        );
    }

    /// Rebalance only when the interval has elapsed and price left the band.
    fn should_rebalance(&self, base: Decimal, price: Decimal, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_rebalance else {
            return false;
        };
        let elapsed = Duration::try_seconds(self.config.rebalance_interval_secs)
            .map_or(false, |interval| now - last >= interval);
        let moved = ((price - base) / base).abs() > self.config.rebalance_threshold;
        elapsed && moved
    }
}

impl Strategy for GridTrading {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Grid
    }

    fn can_trade(&self, data: &MarketData) -> bool {
        if !data.is_valid() {
            return false;
        }
        if data.liquidity < self.config.min_liquidity {
            debug!(pair = %data.pair, liquidity = %data.liquidity, "Grid: liquidity too thin");
            return false;
        }
        match self.volatility(data) {
            Some(v) if v > self.config.max_volatility => {
                debug!(pair = %data.pair, volatility = v, "Grid: volatility too high");
                false
            }
            _ => true,
        }
    }

    fn analyze(&mut self, data: &MarketData) -> Option<Signal> {
        if !data.is_valid() {
            return None;
        }
        self.record(data);
        if self.prices.len() < self.config.min_history {
            return None;
        }

        let price = data.price;
        let Some(base) = self.base_price else {
            self.rebuild(price, data.timestamp);
            return None;
        };

        if self.should_rebalance(base, price, data.timestamp) {
            info!(pair = %data.pair, from = %base, to = %price, "Grid rebalance");
            self.rebuild(price, data.timestamp);
        }

        let tolerance = self.config.trigger_tolerance;
        let base = self.base_price.unwrap_or(price);
        let (distance, level) = self
            .levels
            .iter_mut()
            .filter(|l| !l.triggered && l.side != LevelSide::Neutral)
            .map(|l| (((price - l.price) / l.price).abs(), l))
            .filter(|(distance, _)| *distance <= tolerance)
            .min_by(|a, b| a.0.cmp(&b.0))?;

        level.triggered = true;

        let closeness = (Decimal::ONE - distance / tolerance).to_f64().unwrap_or(0.0);
        let confidence = (0.5 + 0.5 * closeness).clamp(0.0, 1.0);
        let action = match level.side {
            LevelSide::Sell => SignalAction::Sell,
            _ => SignalAction::Buy,
        };

        Some(Signal {
            pair: data.pair.clone(),
            action,
            confidence,
            reason: format!(
                "Price {} at grid level {} ({}% from base {})",
                price,
                level.index,
                (level.offset * Decimal::ONE_HUNDRED).round_dp(2),
                base
            ),
            price,
            strategy: StrategyKind::Grid,
            details: SignalDetails::Grid {
                level: level.index,
                level_price: level.price,
                base_price: base,
            },
            created_at: data.timestamp,
        })
    }

    fn observe(&mut self, data: &MarketData) {
        if data.is_valid() {
            self.record(data);
        }
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    fn reset(&mut self) {
        self.base_price = None;
        self.levels.clear();
        self.last_rebalance = None;
        self.prices.clear();
    }

    fn state(&self) -> serde_json::Value {
        json!({
            "strategy": self.name(),
            "active": self.active,
            "basePrice": self.base_price,
            "lastRebalance": self.last_rebalance,
            "history": self.prices.len(),
            "levels": self.levels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn snapshot(price: Decimal, secs: i64) -> MarketData {
        MarketData::new(
            "WETH/USDC",
            price,
            dec!(50000),
            dec!(1000000),
            start() + Duration::seconds(secs),
        )
    }

    /// Grid built around 100 after the minimum history.
    fn warmed_grid() -> GridTrading {
        let mut grid = GridTrading::new(GridConfig::default());
        for i in 0..5 {
            assert!(grid.analyze(&snapshot(dec!(100), i)).is_none());
        }
        assert_eq!(grid.base_price(), Some(dec!(100)));
        grid
    }

    #[test]
    fn test_needs_history_before_building() {
        let mut grid = GridTrading::new(GridConfig::default());
        for i in 0..4 {
            assert!(grid.analyze(&snapshot(dec!(100), i)).is_none());
        }
        assert!(grid.base_price().is_none());
    }

    #[test]
    fn test_levels_span_range() {
        let grid = warmed_grid();
        assert_eq!(grid.levels.len(), 10);
        assert_eq!(grid.levels[0].price, dec!(95));
        assert_eq!(grid.levels[9].price.round_dp(8), dec!(105));
        assert_eq!(grid.levels[0].side, LevelSide::Buy);
        assert_eq!(grid.levels[9].side, LevelSide::Sell);
    }

    #[test]
    fn test_buy_level_fires_once() {
        let mut grid = warmed_grid();

        let signal = grid.analyze(&snapshot(dec!(95.2), 10)).unwrap();
        assert_eq!(signal.action, SignalAction::Buy);
        assert_eq!(signal.strategy, StrategyKind::Grid);
        assert!(signal.confidence > 0.5 && signal.confidence <= 1.0);
        assert!(matches!(signal.details, SignalDetails::Grid { level: 1, .. }));

        assert!(grid.analyze(&snapshot(dec!(95.2), 20)).is_none());
    }

    #[test]
    fn test_sell_level_and_dead_zone() {
        let mut grid = warmed_grid();

        // Midway between levels: nothing within 0.5%
        assert!(grid.analyze(&snapshot(dec!(101.1), 10)).is_none());

        let signal = grid.analyze(&snapshot(dec!(104.9), 20)).unwrap();
        assert_eq!(signal.action, SignalAction::Sell);
        assert!(matches!(signal.details, SignalDetails::Grid { level: 10, .. }));
    }

    #[test]
    fn test_rebalance_needs_interval_and_move() {
        let mut grid = warmed_grid();

        // Large move but too soon
        grid.analyze(&snapshot(dec!(110), 600));
        assert_eq!(grid.base_price(), Some(dec!(100)));

        // Interval elapsed but price back inside the band
        grid.analyze(&snapshot(dec!(102), 4000));
        assert_eq!(grid.base_price(), Some(dec!(100)));

        grid.analyze(&snapshot(dec!(110), 4000));
        assert_eq!(grid.base_price(), Some(dec!(110)));
        assert!(grid.levels.iter().all(|l| !l.triggered));
    }

    #[test]
    fn test_unbounded_rebalance_interval_never_recenters() {
        let mut grid = GridTrading::new(GridConfig {
            rebalance_interval_secs: i64::MAX,
            ..Default::default()
        });
        for i in 0..5 {
            grid.analyze(&snapshot(dec!(100), i));
        }
        assert_eq!(grid.base_price(), Some(dec!(100)));

        grid.analyze(&snapshot(dec!(120), 86_400 * 365));
        assert_eq!(grid.base_price(), Some(dec!(100)));
    }

    #[test]
    fn test_can_trade_rejects_volatile_or_thin_markets() {
        let grid = GridTrading::new(GridConfig::default());

        let mut data = snapshot(dec!(100), 0);
        assert!(grid.can_trade(&data));

        data.volatility = Some(0.5);
        assert!(!grid.can_trade(&data));

        let mut data = snapshot(dec!(100), 0);
        data.liquidity = dec!(500);
        assert!(!grid.can_trade(&data));

        let data = snapshot(dec!(0), 0);
        assert!(!grid.can_trade(&data));
    }

    #[test]
    fn test_reset_clears_grid() {
        let mut grid = warmed_grid();
        grid.reset();
        assert!(grid.base_price().is_none());
        assert_eq!(grid.state()["history"], 0);
    }
}
