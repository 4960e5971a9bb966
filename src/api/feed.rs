//! Live market feed with per-pair rolling history.

use std::collections::{HashMap, VecDeque};

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::warn;

use crate::config::{FeedConfig, PairConfig};
use crate::indicators::calculate_volatility;
use crate::models::MarketData;

use super::DexClient;

/// Rolling price/volume history that fills in a snapshot's derived fields.
pub struct SnapshotHistory {
    capacity: usize,
    prices: HashMap<String, VecDeque<Decimal>>,
    volumes: HashMap<String, VecDeque<Decimal>>,
}

impl SnapshotHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            prices: HashMap::new(),
            volumes: HashMap::new(),
        }
    }

    /// Record `data` and fill `price_history`, `avg_volume` and `volatility`
    /// where the source left them empty.
    pub fn enrich(&mut self, mut data: MarketData) -> MarketData {
        if !data.is_valid() {
            return data;
        }

        let prior_avg_volume = self.volumes.get(&data.pair).and_then(|volumes| {
            if volumes.is_empty() {
                return None;
            }
            let total: Decimal = volumes.iter().sum();
            Some(total / Decimal::from(volumes.len()))
        });

        let capacity = self.capacity;
        let prices = self.prices.entry(data.pair.clone()).or_default();
        push_bounded(prices, data.price, capacity);
        let volumes = self.volumes.entry(data.pair.clone()).or_default();
        push_bounded(volumes, data.volume, capacity);

        if data.price_history.is_empty() {
            data.price_history = prices.iter().copied().collect();
        }
        if data.avg_volume.is_none() {
            data.avg_volume = prior_avg_volume;
        }
        if data.volatility.is_none() {
            let series: Vec<f64> = prices.iter().filter_map(|p| p.to_f64()).collect();
            data.volatility = calculate_volatility(&series);
        }
        data
    }

    pub fn len(&self, pair: &str) -> usize {
        self.prices.get(pair).map_or(0, |p| p.len())
    }
}

fn push_bounded(buffer: &mut VecDeque<Decimal>, value: Decimal, capacity: usize) {
    if buffer.len() == capacity {
        buffer.pop_front();
    }
    buffer.push_back(value);
}

/// Polls every configured pair and enriches the snapshots.
pub struct MarketFeed {
    client: DexClient,
    pairs: Vec<PairConfig>,
    history: SnapshotHistory,
}

impl MarketFeed {
    pub fn new(config: &FeedConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: DexClient::new(config)?,
            pairs: config.pairs.clone(),
            history: SnapshotHistory::new(config.history_len),
        })
    }

    pub fn pairs(&self) -> &[PairConfig] {
        &self.pairs
    }

    /// One snapshot per pair that could be fetched. Failures are logged and
    /// the pair is skipped for this cycle.
    pub async fn poll(&mut self) -> Vec<MarketData> {
        let mut snapshots = Vec::with_capacity(self.pairs.len());
        for pair in &self.pairs {
            match self.client.get_snapshot(pair).await {
                Ok(data) => snapshots.push(self.history.enrich(data)),
                Err(e) => warn!(pair = %pair.symbol, error = %e, "Market data unavailable"),
            }
        }
        snapshots
    }
}
