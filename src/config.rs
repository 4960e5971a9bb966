//! Bot configuration: defaults, optional JSON file, then `DEX_*` environment
//! overrides (a `.env` file is honored).

use std::path::Path;
use std::str::FromStr;

use anyhow::{ensure, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::risk::RiskConfig;
use crate::strategy::{SelectionMode, StrategyConfig};

/// A pair the live feed polls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairConfig {
    /// Display symbol, used as the pair key everywhere (e.g. "WETH/USDC")
    pub symbol: String,
    /// Pool address on the feed's chain
    pub address: String,
}

/// Market-data feed settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub base_url: String,
    /// Chain id as the API names it (ethereum, base, arbitrum, ...)
    pub chain: String,
    pub pairs: Vec<PairConfig>,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
    /// Attempts per request before giving up
    pub max_retries: u32,
    /// Prices kept per pair for derived fields
    pub history_len: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.dexscreener.com".to_string(),
            chain: "ethereum".to_string(),
            pairs: Vec::new(),
            poll_interval_secs: 30,
            timeout_secs: 10,
            max_retries: 3,
            history_len: 50,
        }
    }
}

/// Simulated execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Paper fills only
    pub dry_run: bool,
    /// Price impact applied against every fill (0.003 = 0.3%)
    pub slippage: Decimal,
    /// Swap fee charged on notional
    pub fee_rate: Decimal,
    /// Flat gas cost per transaction (USD)
    pub gas_usd: Decimal,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            slippage: dec!(0.003),  // 0.3%
            fee_rate: dec!(0.003),  // 0.3% pool fee
            gas_usd: dec!(0.50),
        }
    }
}

/// Complete bot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub initial_capital: Decimal,
    pub risk: RiskConfig,
    pub strategy: StrategyConfig,
    pub execution: ExecutionConfig,
    pub feed: FeedConfig,
    /// Buffered events per subscriber
    pub event_capacity: usize,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            initial_capital: dec!(1000),
            risk: RiskConfig::default(),
            strategy: StrategyConfig::default(),
            execution: ExecutionConfig::default(),
            feed: FeedConfig::default(),
            event_capacity: 1024,
        }
    }
}

impl BotConfig {
    /// Load defaults, overlay `path` if given, then the environment, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?
            }
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `DEX_*` overrides from `lookup`.
    ///
    /// `DEX_PAIRS` format: "SYMBOL|address,SYMBOL2|address2".
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = parse_var::<Decimal>(&lookup, "DEX_INITIAL_CAPITAL")? {
            self.initial_capital = v;
        }
        if let Some(v) = parse_var::<Decimal>(&lookup, "DEX_MAX_POSITION_PERCENT")? {
            self.risk.max_position_percent = v;
        }
        if let Some(v) = parse_var::<Decimal>(&lookup, "DEX_STOP_LOSS_TRAILING")? {
            self.risk.stop_loss_trailing = v;
        }
        if let Some(v) = parse_var::<Decimal>(&lookup, "DEX_MAX_GAS_PERCENT")? {
            self.risk.max_gas_percent = v;
        }
        if let Some(v) = lookup("DEX_STRATEGY_MODE") {
            self.strategy.selection.mode = match v.to_lowercase().as_str() {
                "auto" => SelectionMode::Auto,
                "grid" => SelectionMode::Grid,
                "momentum" => SelectionMode::Momentum,
                other => anyhow::bail!("Invalid DEX_STRATEGY_MODE: {}", other),
            };
        }
        if let Some(v) = parse_var::<bool>(&lookup, "DEX_DRY_RUN")? {
            self.execution.dry_run = v;
        }
        if let Some(v) = lookup("DEX_API_URL") {
            self.feed.base_url = v;
        }
        if let Some(v) = lookup("DEX_CHAIN") {
            self.feed.chain = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "DEX_POLL_INTERVAL_SECS")? {
            self.feed.poll_interval_secs = v;
        }
        if let Some(v) = lookup("DEX_PAIRS") {
            self.feed.pairs = v
                .split(',')
                .filter_map(|entry| {
                    let (symbol, address) = entry.trim().split_once('|')?;
                    Some(PairConfig {
                        symbol: symbol.trim().to_string(),
                        address: address.trim().to_string(),
                    })
                })
                .collect();
        }
        Ok(())
    }

    /// Reject out-of-range policy values before anything runs.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.initial_capital > Decimal::ZERO,
            "initial_capital must be positive, got {}",
            self.initial_capital
        );
        self.risk.validate().context("Invalid risk configuration")?;
        self.strategy.validate().context("Invalid strategy configuration")?;

        let exec = &self.execution;
        ensure!(
            exec.slippage >= Decimal::ZERO && exec.slippage < Decimal::ONE,
            "slippage must be in [0, 1), got {}",
            exec.slippage
        );
        ensure!(
            exec.fee_rate >= Decimal::ZERO && exec.fee_rate < Decimal::ONE,
            "fee_rate must be in [0, 1), got {}",
            exec.fee_rate
        );
        ensure!(exec.gas_usd >= Decimal::ZERO, "gas_usd must not be negative");

        let feed = &self.feed;
        ensure!(feed.poll_interval_secs > 0, "poll_interval_secs must be positive");
        ensure!(feed.max_retries > 0, "max_retries must be at least 1");
        ensure!(feed.history_len >= 2, "history_len must be at least 2");
        for pair in &feed.pairs {
            ensure!(
                !pair.symbol.is_empty() && !pair.address.is_empty(),
                "pair entries need both symbol and address"
            );
        }

        ensure!(self.event_capacity > 0, "event_capacity must be positive");
        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid {}: {}", key, raw))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_is_valid() {
        BotConfig::default().validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BotConfig::default();
        config
            .apply_overrides(lookup(&[
                ("DEX_INITIAL_CAPITAL", "2500"),
                ("DEX_STRATEGY_MODE", "Momentum"),
                ("DEX_DRY_RUN", "false"),
                ("DEX_PAIRS", "WETH/USDC|0xabc, PEPE/WETH|0xdef"),
            ]))
            .unwrap();

        assert_eq!(config.initial_capital, dec!(2500));
        assert_eq!(config.strategy.selection.mode, SelectionMode::Momentum);
        assert!(!config.execution.dry_run);
        assert_eq!(config.feed.pairs.len(), 2);
        assert_eq!(config.feed.pairs[1].symbol, "PEPE/WETH");
        assert_eq!(config.feed.pairs[1].address, "0xdef");
    }

    #[test]
    fn test_bad_env_value_is_an_error() {
        let mut config = BotConfig::default();
        let err = config
            .apply_overrides(lookup(&[("DEX_INITIAL_CAPITAL", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("DEX_INITIAL_CAPITAL"));
    }

    #[test]
    fn test_position_percent_over_cap_rejected() {
        let mut config = BotConfig::default();
        config
            .apply_overrides(lookup(&[("DEX_MAX_POSITION_PERCENT", "0.5")]))
            .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_file_overlay() {
        let path = std::env::temp_dir().join(format!("dex-trader-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"{"initial_capital": "500", "risk": {"stop_loss_trailing": "0.05"}}"#,
        )
        .unwrap();

        let config = BotConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.risk.stop_loss_trailing, dec!(0.05));
        assert_eq!(config.risk.max_position_percent, dec!(0.10));
    }
}
