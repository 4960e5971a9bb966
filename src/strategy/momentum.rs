//! Momentum: ride strong moves confirmed by volume, leave on a pullback
//! from the post-entry peak or an overbought RSI.

use std::collections::VecDeque;

use rust_decimal::prelude::ToPrimitive;
use serde_json::json;
use tracing::debug;

use crate::indicators::{average, calculate_ema, calculate_rsi, calculate_volatility, price_change};
use crate::models::{MarketData, Signal, SignalAction, SignalDetails, StrategyKind};

use super::{MomentumConfig, Strategy};

/// Extra samples kept beyond the lookback.
const WINDOW_MARGIN: usize = 10;

/// Entries are refused when RSI is at or above `rsi_entry` plus this.
const RSI_ENTRY_HEADROOM: f64 = 40.0;

pub struct Momentum {
    config: MomentumConfig,
    active: bool,
    prices: VecDeque<f64>,
    volumes: VecDeque<f64>,
    in_position: bool,
    entry_price: Option<f64>,
    peak_price: Option<f64>,
}

impl Momentum {
    pub fn new(config: MomentumConfig) -> Self {
        let capacity = config.lookback_period + WINDOW_MARGIN;
        Self {
            config,
            active: false,
            prices: VecDeque::with_capacity(capacity),
            volumes: VecDeque::with_capacity(capacity),
            in_position: false,
            entry_price: None,
            peak_price: None,
        }
    }

    pub fn in_position(&self) -> bool {
        self.in_position
    }

    fn window_len(&self) -> usize {
        self.config.lookback_period + WINDOW_MARGIN
    }

    fn record(&mut self, data: &MarketData) {
        let (Some(price), Some(volume)) = (data.price.to_f64(), data.volume.to_f64()) else {
            return;
        };
        let cap = self.window_len();
        if self.prices.len() == cap {
            self.prices.pop_front();
        }
        if self.volumes.len() == cap {
            self.volumes.pop_front();
        }
        self.prices.push_back(price);
        self.volumes.push_back(volume);

        if self.in_position {
            self.peak_price = Some(self.peak_price.map_or(price, |peak| peak.max(price)));
        }
    }

    /// Current volume over the average of the preceding window, or over the
    /// feed's average when it supplied one.
    fn volume_ratio(&self, data: &MarketData) -> Option<f64> {
        let current = *self.volumes.back()?;
        let avg = match data.avg_volume.and_then(|v| v.to_f64()) {
            Some(avg) => avg,
            None => {
                let prior: Vec<f64> = self.volumes.iter().rev().skip(1).copied().collect();
                average(&prior)?
            }
        };
        if avg <= 0.0 {
            return None;
        }
        Some(current / avg)
    }

    fn signal(
        &self,
        data: &MarketData,
        action: SignalAction,
        confidence: f64,
        reason: String,
        details: SignalDetails,
    ) -> Signal {
        Signal {
            pair: data.pair.clone(),
            action,
            confidence: confidence.clamp(0.0, 1.0),
            reason,
            price: data.price,
            strategy: StrategyKind::Momentum,
            details,
            created_at: data.timestamp,
        }
    }
}

impl Strategy for Momentum {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Momentum
    }

    fn can_trade(&self, data: &MarketData) -> bool {
        if !data.is_valid() {
            return false;
        }
        if data.volume < self.config.min_volume {
            debug!(pair = %data.pair, volume = %data.volume, "Momentum: volume too low");
            return false;
        }

        let volatility = data.volatility.or_else(|| {
            let prices: Vec<f64> = self.prices.iter().copied().collect();
            calculate_volatility(&prices)
        });
        match volatility {
            Some(v) if v < self.config.min_volatility => {
                debug!(pair = %data.pair, volatility = v, "Momentum: volatility too low");
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

        let prices: Vec<f64> = self.prices.iter().copied().collect();
        let change = price_change(&prices, self.config.lookback_period)?;
        let rsi = calculate_rsi(&prices, self.config.rsi_period)?;
        let ema = calculate_ema(&prices, self.config.lookback_period);
        let volume_ratio = self.volume_ratio(data).unwrap_or(0.0);
        let price = *prices.last()?;

        if self.in_position {
            let peak = self.peak_price.unwrap_or(price);
            let drawdown = if peak > 0.0 { (price - peak) / peak } else { 0.0 };

            let pulled_back = -drawdown > self.config.exit_threshold;
            let overbought = rsi > self.config.rsi_exit;
            if !pulled_back && !overbought {
                return None;
            }

            self.in_position = false;
            self.entry_price = None;
            self.peak_price = None;

            let (confidence, reason) = if pulled_back {
                (
                    0.8,
                    format!("Pulled back {:.2}% from peak {:.6}", -drawdown * 100.0, peak),
                )
            } else {
                (0.7, format!("RSI {:.1} above exit bound {:.1}", rsi, self.config.rsi_exit))
            };

            return Some(self.signal(
                data,
                SignalAction::Sell,
                confidence,
                reason,
                SignalDetails::Momentum {
                    price_change: change,
                    volume_ratio,
                    rsi,
                    ema,
                    drawdown_from_peak: Some(drawdown),
                },
            ));
        }

        let strong_move = change > self.config.entry_threshold;
        let volume_surge = volume_ratio > self.config.volume_multiplier;
        let not_overbought = rsi < self.config.rsi_entry + RSI_ENTRY_HEADROOM;
        if !(strong_move && volume_surge && not_overbought) {
            return None;
        }

        self.in_position = true;
        self.entry_price = Some(price);
        self.peak_price = Some(price);

        let move_score = (change / (self.config.entry_threshold * 2.0)).min(1.0);
        let volume_score = (volume_ratio / (self.config.volume_multiplier * 2.0)).min(1.0);
        let confidence = 0.4 + 0.3 * move_score + 0.3 * volume_score;

        Some(self.signal(
            data,
            SignalAction::Buy,
            confidence,
            format!(
                "Up {:.2}% over {} samples on {:.2}x volume, RSI {:.1}",
                change * 100.0,
                self.config.lookback_period,
                volume_ratio,
                rsi
            ),
            SignalDetails::Momentum {
                price_change: change,
                volume_ratio,
                rsi,
                ema,
                drawdown_from_peak: None,
            },
        ))
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

    fn on_position_closed(&mut self) {
        self.in_position = false;
        self.entry_price = None;
        self.peak_price = None;
    }

    fn reset(&mut self) {
        self.prices.clear();
        self.volumes.clear();
        self.on_position_closed();
    }

    fn state(&self) -> serde_json::Value {
        json!({
            "strategy": self.name(),
            "active": self.active,
            "inPosition": self.in_position,
            "entryPrice": self.entry_price,
            "peakPrice": self.peak_price,
            "history": self.prices.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn snapshot(price: f64, volume: f64, step: i64) -> MarketData {
        MarketData::new(
            "PEPE/WETH",
            Decimal::try_from(price).unwrap(),
            Decimal::try_from(volume).unwrap(),
            dec!(500000),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(step),
        )
    }

    /// Choppy flat market: alternating small moves keep RSI near 50.
    fn warm_up(strategy: &mut Momentum, samples: usize) -> i64 {
        for i in 0..samples {
            let price = if i % 2 == 0 { 100.0 } else { 100.5 };
            assert!(strategy.analyze(&snapshot(price, 1000.0, i as i64)).is_none());
        }
        samples as i64
    }

    #[test]
    fn test_no_signal_without_history() {
        let mut strategy = Momentum::new(MomentumConfig::default());
        for i in 0..20 {
            assert!(strategy.analyze(&snapshot(100.0 + i as f64, 5000.0, i)).is_none());
        }
    }

    #[test]
    fn test_entry_on_move_with_volume() {
        let mut strategy = Momentum::new(MomentumConfig::default());
        let step = warm_up(&mut strategy, 21);

        let signal = strategy.analyze(&snapshot(103.0, 3000.0, step)).unwrap();
        assert_eq!(signal.action, SignalAction::Buy);
        assert!(signal.confidence >= 0.4 && signal.confidence <= 1.0);
        assert!(strategy.in_position());

        match signal.details {
            SignalDetails::Momentum { price_change, volume_ratio, .. } => {
                assert!(price_change > 0.02);
                assert!(volume_ratio > 1.5);
            }
            other => panic!("unexpected details {:?}", other),
        }
    }

    #[test]
    fn test_no_entry_without_volume() {
        let mut strategy = Momentum::new(MomentumConfig::default());
        let step = warm_up(&mut strategy, 21);
        assert!(strategy.analyze(&snapshot(103.0, 1000.0, step)).is_none());
    }

    #[test]
    fn test_exit_on_pullback_from_peak() {
        let mut strategy = Momentum::new(MomentumConfig::default());
        let step = warm_up(&mut strategy, 21);
        strategy.analyze(&snapshot(103.0, 3000.0, step)).unwrap();

        // New peak, then a 4% pullback
        strategy.observe(&snapshot(104.0, 1000.0, step + 1));
        let signal = strategy.analyze(&snapshot(99.8, 1000.0, step + 2)).unwrap();

        assert_eq!(signal.action, SignalAction::Sell);
        match signal.details {
            SignalDetails::Momentum { drawdown_from_peak: Some(dd), .. } => {
                assert!((dd + 0.0404).abs() < 1e-3);
            }
            other => panic!("unexpected details {:?}", other),
        }
        assert!(!strategy.in_position());
    }

    #[test]
    fn test_position_closed_resets_peak() {
        let mut strategy = Momentum::new(MomentumConfig::default());
        let step = warm_up(&mut strategy, 21);
        strategy.analyze(&snapshot(103.0, 3000.0, step)).unwrap();

        strategy.on_position_closed();
        assert!(!strategy.in_position());
        assert_eq!(strategy.state()["peakPrice"], serde_json::Value::Null);
    }

    #[test]
    fn test_can_trade_gates() {
        let strategy = Momentum::new(MomentumConfig::default());

        let mut data = snapshot(100.0, 5000.0, 0);
        assert!(strategy.can_trade(&data));

        data.volatility = Some(0.001);
        assert!(!strategy.can_trade(&data));

        let data = snapshot(100.0, 10.0, 0);
        assert!(!strategy.can_trade(&data));
    }
}
