//! Trade execution: the executor seam and a paper implementation.
//!
//! Fills report an effective price net of fee and gas, so the position book
//! can account for costs through price alone.

use anyhow::{bail, ensure, Result};
use rust_decimal::Decimal;
use tracing::debug;

use crate::config::ExecutionConfig;
use crate::models::TradeSide;

/// A completed swap.
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub pair: String,
    pub side: TradeSide,
    /// Pool price after slippage
    pub fill_price: Decimal,
    /// USD per token after fee and gas
    pub effective_price: Decimal,
    /// Buy: USD spent. Sell: USD received.
    pub amount_usd: Decimal,
    pub token_amount: Decimal,
    pub fee_usd: Decimal,
    pub gas_usd: Decimal,
    pub tx_id: String,
}

/// Something that can swap on a DEX.
#[allow(async_fn_in_trait)]
pub trait TradeExecutor {
    fn name(&self) -> &str;

    /// Expected gas cost of one swap in USD.
    async fn estimate_gas_usd(&self, pair: &str) -> Result<Decimal>;

    /// Spend `amount_usd` at about `price`.
    async fn buy(&mut self, pair: &str, price: Decimal, amount_usd: Decimal) -> Result<Fill>;

    /// Sell `token_amount` at about `price`.
    async fn sell(&mut self, pair: &str, price: Decimal, token_amount: Decimal) -> Result<Fill>;
}

/// Gas is acceptable when it costs at most `max_gas_percent` of the trade.
pub fn gas_is_acceptable(gas_usd: Decimal, amount_usd: Decimal, max_gas_percent: Decimal) -> bool {
    if amount_usd <= Decimal::ZERO {
        return false;
    }
    gas_usd / amount_usd <= max_gas_percent
}

/// Simulated fills with slippage, a proportional fee and flat gas.
pub struct PaperExecutor {
    config: ExecutionConfig,
    fills: u64,
    fees_paid: Decimal,
}

impl PaperExecutor {
    pub fn new(config: ExecutionConfig) -> Self {
        Self {
            config,
            fills: 0,
            fees_paid: Decimal::ZERO,
        }
    }

    pub fn fill_count(&self) -> u64 {
        self.fills
    }

    /// Fees and gas across every fill so far.
    pub fn fees_paid(&self) -> Decimal {
        self.fees_paid
    }

    fn apply_slippage(&self, price: Decimal, side: TradeSide) -> Decimal {
        match side {
            TradeSide::Buy => price * (Decimal::ONE + self.config.slippage),
            TradeSide::Sell => price * (Decimal::ONE - self.config.slippage),
        }
    }

    fn next_tx_id(&mut self) -> String {
        self.fills += 1;
        format!("paper-{}-{}", self.fills, uuid::Uuid::new_v4().simple())
    }
}

impl TradeExecutor for PaperExecutor {
    fn name(&self) -> &str {
        "paper"
    }

    async fn estimate_gas_usd(&self, _pair: &str) -> Result<Decimal> {
        Ok(self.config.gas_usd)
    }

    async fn buy(&mut self, pair: &str, price: Decimal, amount_usd: Decimal) -> Result<Fill> {
        ensure!(price > Decimal::ZERO, "buy {}: price must be positive", pair);
        ensure!(amount_usd > Decimal::ZERO, "buy {}: amount must be positive", pair);

        let fill_price = self.apply_slippage(price, TradeSide::Buy);
        let fee_usd = amount_usd * self.config.fee_rate;
        let gas_usd = self.config.gas_usd;
        let net = amount_usd - fee_usd - gas_usd;
        if net <= Decimal::ZERO {
            bail!(
                "buy {}: costs {} exceed amount {}",
                pair,
                fee_usd + gas_usd,
                amount_usd
            );
        }

        let token_amount = net / fill_price;
        self.fees_paid += fee_usd + gas_usd;
        let fill = Fill {
            pair: pair.to_string(),
            side: TradeSide::Buy,
            fill_price,
            effective_price: amount_usd / token_amount,
            amount_usd,
            token_amount,
            fee_usd,
            gas_usd,
            tx_id: self.next_tx_id(),
        };

        debug!(pair = %pair, price = %fill_price, tokens = %token_amount, "Paper buy");
        Ok(fill)
    }

    async fn sell(&mut self, pair: &str, price: Decimal, token_amount: Decimal) -> Result<Fill> {
        ensure!(price > Decimal::ZERO, "sell {}: price must be positive", pair);
        ensure!(token_amount > Decimal::ZERO, "sell {}: token amount must be positive", pair);

        let fill_price = self.apply_slippage(price, TradeSide::Sell);
        let gross = token_amount * fill_price;
        let fee_usd = gross * self.config.fee_rate;
        let gas_usd = self.config.gas_usd;
        let proceeds = (gross - fee_usd - gas_usd).max(Decimal::ZERO);
        self.fees_paid += fee_usd + gas_usd;

        let fill = Fill {
            pair: pair.to_string(),
            side: TradeSide::Sell,
            fill_price,
            effective_price: proceeds / token_amount,
            amount_usd: proceeds,
            token_amount,
            fee_usd,
            gas_usd,
            tx_id: self.next_tx_id(),
        };

        debug!(pair = %pair, price = %fill_price, proceeds = %proceeds, "Paper sell");
        Ok(fill)
    }
}
