//! Response types for the DexScreener pairs API.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::models::MarketData;

/// Response from /latest/dex/pairs/{chainId}/{pairAddress}.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairsResponse {
    #[serde(default)]
    pub pairs: Option<Vec<PairInfo>>,
    #[serde(default)]
    pub pair: Option<PairInfo>,
}

impl PairsResponse {
    /// The first pair in the response, whichever field carries it.
    pub fn into_pair(self) -> Option<PairInfo> {
        self.pair
            .or_else(|| self.pairs.and_then(|pairs| pairs.into_iter().next()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairInfo {
    pub chain_id: String,
    #[serde(default)]
    pub dex_id: String,
    pub pair_address: String,
    pub base_token: TokenInfo,
    pub quote_token: TokenInfo,
    #[serde(default)]
    pub price_usd: Option<Decimal>,
    #[serde(default)]
    pub volume: Option<VolumeStats>,
    #[serde(default)]
    pub liquidity: Option<LiquidityStats>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenInfo {
    pub address: String,
    pub symbol: String,
}

/// Rolling volume in USD. Shorter windows are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VolumeStats {
    #[serde(default)]
    pub h24: Option<Decimal>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LiquidityStats {
    #[serde(default)]
    pub usd: Option<Decimal>,
    #[serde(default)]
    pub base: Option<Decimal>,
    #[serde(default)]
    pub quote: Option<Decimal>,
}

impl PairInfo {
    /// Convert to a snapshot keyed by `symbol`. Returns `None` without a USD price.
    ///
    /// Volume is the rolling 24h figure; a missing one reads as zero.
    pub fn to_market_data(&self, symbol: &str, timestamp: DateTime<Utc>) -> Option<MarketData> {
        let price = self.price_usd?;
        let volume = self
            .volume
            .as_ref()
            .and_then(|v| v.h24)
            .unwrap_or(Decimal::ZERO);
        let liquidity = self
            .liquidity
            .as_ref()
            .and_then(|l| l.usd)
            .unwrap_or(Decimal::ZERO);

        Some(MarketData::new(symbol, price, volume, liquidity, timestamp))
    }

    pub fn symbol(&self) -> String {
        format!("{}/{}", self.base_token.symbol, self.quote_token.symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SAMPLE: &str = r#"{
        "schemaVersion": "1.0.0",
        "pairs": [{
            "chainId": "ethereum",
            "dexId": "uniswap",
            "url": "https://dexscreener.com/ethereum/0x88e6",
            "pairAddress": "0x88e6A0c2dDD26FEEb64F039a2c41296FcB3f5640",
            "baseToken": {"address": "0xC02a", "name": "Wrapped Ether", "symbol": "WETH"},
            "quoteToken": {"address": "0xA0b8", "name": "USD Coin", "symbol": "USDC"},
            "priceNative": "3412.55",
            "priceUsd": "3412.55",
            "volume": {"h24": 95000000.5, "h6": 20000000, "h1": 3500000, "m5": 250000},
            "liquidity": {"usd": 180000000.25, "base": 26000, "quote": 91000000}
        }]
    }"#;

    #[test]
    fn test_parse_pairs_response() {
        let response: PairsResponse = serde_json::from_str(SAMPLE).unwrap();
        let pair = response.into_pair().unwrap();

        assert_eq!(pair.symbol(), "WETH/USDC");
        assert_eq!(pair.price_usd, Some(dec!(3412.55)));

        let data = pair.to_market_data("WETH/USDC", Utc::now()).unwrap();
        assert_eq!(data.volume, dec!(95000000.5));
        assert_eq!(data.liquidity, dec!(180000000.25));
        assert!(data.is_valid());
    }

    #[test]
    fn test_missing_price_yields_none() {
        let response: PairsResponse = serde_json::from_str(
            r#"{"pair": {"chainId": "base", "pairAddress": "0x1",
                "baseToken": {"address": "0x2", "symbol": "AAA"},
                "quoteToken": {"address": "0x3", "symbol": "WETH"}}}"#,
        )
        .unwrap();
        let pair = response.into_pair().unwrap();
        assert!(pair.to_market_data("AAA/WETH", Utc::now()).is_none());
    }

    #[test]
    fn test_volume_uses_24h_window() {
        let response: PairsResponse = serde_json::from_str(
            r#"{"pair": {"chainId": "base", "pairAddress": "0x1",
                "baseToken": {"address": "0x2", "symbol": "AAA"},
                "quoteToken": {"address": "0x3", "symbol": "WETH"},
                "priceUsd": "0.5", "volume": {"h1": 1200}}}"#,
        )
        .unwrap();
        let data = response.into_pair().unwrap().to_market_data("AAA/WETH", Utc::now()).unwrap();
        assert_eq!(data.volume, Decimal::ZERO);
    }

    #[test]
    fn test_empty_response() {
        let response: PairsResponse = serde_json::from_str(r#"{"pairs": null}"#).unwrap();
        assert!(response.into_pair().is_none());
    }
}
