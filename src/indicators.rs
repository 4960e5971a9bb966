//! Technical indicators over price/volume series.
//!
//! Every function is pure and returns `None` when the series is too short,
//! so callers can treat missing data as "no signal" rather than an error.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// Default RSI period.
pub const RSI_PERIOD: usize = 14;

/// Number of prices per half-window used by trend detection.
pub const TREND_WINDOW: usize = 10;

/// Relative move between the two half-windows that counts as a trend.
pub const TREND_THRESHOLD: f64 = 0.05;

/// Direction of recent price action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Sideways,
}

/// Relative Strength Index over the last `period` price changes.
///
/// Needs at least `period + 1` prices. Uses simple averages of gains and
/// losses; a window with no losses reads 100.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }

    let window = &prices[prices.len() - period - 1..];
    let (gains, losses) = window.windows(2).fold((0.0, 0.0), |(g, l), w| {
        let change = w[1] - w[0];
        if change > 0.0 {
            (g + change, l)
        } else {
            (g, l - change)
        }
    });

    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;

    if avg_loss == 0.0 {
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }

    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Exponential moving average seeded with the SMA of the first `period` prices.
pub fn calculate_ema(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let seed = prices[..period].iter().mean();

    Some(
        prices[period..]
            .iter()
            .fold(seed, |ema, price| (price - ema) * multiplier + ema),
    )
}

/// Simple period-over-period returns.
pub fn returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

/// Realized volatility of the series: sample standard deviation of returns
/// scaled by the square root of the number of returns.
pub fn calculate_volatility(prices: &[f64]) -> Option<f64> {
    let returns = returns(prices);
    if returns.len() < 2 {
        return None;
    }

    let std_dev = returns.iter().std_dev();
    if !std_dev.is_finite() {
        return None;
    }

    Some(std_dev * (returns.len() as f64).sqrt())
}

/// Arithmetic mean, `None` for an empty slice.
pub fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().mean())
}

/// Relative change from the price `lookback` steps ago to the last price.
pub fn price_change(prices: &[f64], lookback: usize) -> Option<f64> {
    if lookback == 0 || prices.len() < lookback + 1 {
        return None;
    }

    let last = *prices.last()?;
    let start = prices[prices.len() - lookback - 1];
    if start <= 0.0 {
        return None;
    }
    Some((last - start) / start)
}

/// Compare the last `TREND_WINDOW` prices against the `TREND_WINDOW` before.
///
/// Short series read as sideways.
pub fn detect_trend(prices: &[f64]) -> Trend {
    if prices.len() < TREND_WINDOW * 2 {
        return Trend::Sideways;
    }

    let n = prices.len();
    let recent = prices[n - TREND_WINDOW..].iter().mean();
    let prior = prices[n - TREND_WINDOW * 2..n - TREND_WINDOW].iter().mean();

    if prior <= 0.0 {
        return Trend::Sideways;
    }

    let change = (recent - prior) / prior;
    if change > TREND_THRESHOLD {
        Trend::Up
    } else if change < -TREND_THRESHOLD {
        Trend::Down
    } else {
        Trend::Sideways
    }
}
