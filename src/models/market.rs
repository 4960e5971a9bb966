//! Market snapshot consumed once per cycle per trading pair.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Price/volume/liquidity snapshot for a single DEX pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketData {
    /// Pair identifier (e.g. "WETH/USDC")
    pub pair: String,

    /// Last traded price in USD
    pub price: Decimal,

    /// Trading volume in USD over the feed's window
    pub volume: Decimal,

    /// Pool liquidity in USD
    pub liquidity: Decimal,

    /// Realized volatility over recent history, if the feed computed one
    #[serde(default)]
    pub volatility: Option<f64>,

    /// Rolling average volume, if known
    #[serde(default)]
    pub avg_volume: Option<Decimal>,

    /// Recent prices, oldest first
    #[serde(default)]
    pub price_history: Vec<Decimal>,

    /// Snapshot time
    pub timestamp: DateTime<Utc>,
}

impl MarketData {
    /// Create a bare snapshot with no derived fields.
    pub fn new(
        pair: impl Into<String>,
        price: Decimal,
        volume: Decimal,
        liquidity: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            pair: pair.into(),
            price,
            volume,
            liquidity,
            volatility: None,
            avg_volume: None,
            price_history: Vec::new(),
            timestamp,
        }
    }

    /// Required fields are usable: positive price, non-negative volume and liquidity.
    pub fn is_valid(&self) -> bool {
        !self.pair.is_empty()
            && self.price > Decimal::ZERO
            && self.volume >= Decimal::ZERO
            && self.liquidity >= Decimal::ZERO
            && self.volatility.map_or(true, |v| v.is_finite() && v >= 0.0)
    }

    /// Current volume relative to the rolling average (1.0 when unknown).
    pub fn volume_ratio(&self) -> f64 {
        match self.avg_volume {
            Some(avg) if avg > Decimal::ZERO => (self.volume / avg).to_f64().unwrap_or(1.0),
            _ => 1.0,
        }
    }
}
