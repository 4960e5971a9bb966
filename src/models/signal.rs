//! Trade intents produced by strategies.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which strategy produced a signal or governs a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Grid,
    Momentum,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Grid => "grid",
            StrategyKind::Momentum => "momentum",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "grid" | "grid_trading" => Ok(Self::Grid),
            "momentum" => Ok(Self::Momentum),
            other => anyhow::bail!("Unknown strategy: {}", other),
        }
    }
}

/// Buy or sell intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Buy,
    Sell,
}

/// Strategy-specific context attached to a signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalDetails {
    Grid {
        /// 1-based grid level index
        level: usize,
        level_price: Decimal,
        base_price: Decimal,
    },
    Momentum {
        price_change: f64,
        volume_ratio: f64,
        rsi: f64,
        /// EMA over the lookback window
        ema: Option<f64>,
        /// Drawdown from the post-entry peak (exit signals only)
        drawdown_from_peak: Option<f64>,
    },
}

/// A buy/sell intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub pair: String,
    pub action: SignalAction,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub reason: String,
    pub price: Decimal,
    pub strategy: StrategyKind,
    pub details: SignalDetails,
    pub created_at: DateTime<Utc>,
}

