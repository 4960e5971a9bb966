//! DexScreener client for pair snapshots.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use backoff::ExponentialBackoffBuilder;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::config::{FeedConfig, PairConfig};
use crate::models::MarketData;

use super::types::{PairInfo, PairsResponse};

const INITIAL_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(8);

/// Read-only client for the DexScreener pairs endpoint.
pub struct DexClient {
    client: Client,
    base_url: String,
    chain: String,
    max_retries: u32,
}

impl DexClient {
    pub fn new(config: &FeedConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            chain: config.chain.clone(),
            max_retries: config.max_retries.max(1),
        })
    }

    /// Fetch a pair, retrying transient failures with exponential backoff.
    pub async fn get_pair(&self, pair_address: &str) -> Result<PairInfo> {
        let url = format!(
            "{}/latest/dex/pairs/{}/{}",
            self.base_url, self.chain, pair_address
        );
        let url = url.as_str();
        let attempts = &AtomicU32::new(0);
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(INITIAL_RETRY_INTERVAL)
            .with_max_interval(MAX_RETRY_INTERVAL)
            .with_max_elapsed_time(None)
            .build();

        let response = backoff::future::retry(policy, || async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match self.fetch(url).await {
                Ok(response) => Ok(response),
                Err(FetchError::Permanent(e)) => Err(backoff::Error::permanent(e)),
                Err(FetchError::Transient(e)) if attempt >= self.max_retries => {
                    Err(backoff::Error::permanent(
                        e.context(format!("Giving up after {} attempts", attempt)),
                    ))
                }
                Err(FetchError::Transient(e)) => {
                    warn!(url = %url, attempt = attempt, error = %e, "Pair request failed, retrying");
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await?;

        response
            .into_pair()
            .ok_or_else(|| anyhow!("Pair {} not found on {}", pair_address, self.chain))
    }

    /// Fetch one configured pair as a snapshot stamped now.
    pub async fn get_snapshot(&self, pair: &PairConfig) -> Result<MarketData> {
        let info = self.get_pair(&pair.address).await?;
        debug!(
            pair = %pair.symbol,
            dex = %info.dex_id,
            address = %info.pair_address,
            base = %info.base_token.address,
            price = ?info.price_usd,
            "Fetched pair"
        );
        info.to_market_data(&pair.symbol, Utc::now())
            .ok_or_else(|| anyhow!("Pair {} has no USD price", pair.symbol))
    }

    async fn fetch(&self, url: &str) -> std::result::Result<PairsResponse, FetchError> {
        debug!(url = %url, "Fetching pair");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to fetch pair")
            .map_err(FetchError::Transient)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = anyhow!("Pair request failed: {} - {}", status, body);
            return Err(if is_retryable(status) {
                FetchError::Transient(err)
            } else {
                FetchError::Permanent(err)
            });
        }

        response
            .json()
            .await
            .context("Failed to parse pair response")
            .map_err(FetchError::Permanent)
    }
}

enum FetchError {
    Transient(anyhow::Error),
    Permanent(anyhow::Error),
}

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}
