//! Run statistics from closed trades and the equity curve: win rate, profit
//! factor, max drawdown, Sharpe and Sortino ratios.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use statrs::statistics::Statistics;

use crate::models::TradeRecord;

const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 3600.0;

/// Performance of one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceMetrics {
    /// Closed trade records, partial sells included
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,

    pub total_pnl: Decimal,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    pub avg_win: Decimal,
    /// Positive magnitude
    pub avg_loss: Decimal,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,
    /// Gross profit over gross loss; infinite with profits and no losses
    pub profit_factor: f64,
    /// Mean P&L per trade record
    pub expectancy: Decimal,
    pub avg_holding_hours: f64,

    /// Peak-to-trough equity decline, positive fraction
    pub max_drawdown: f64,
    /// Annualized, zero risk-free rate
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,

    pub trades_by_reason: BTreeMap<String, usize>,
}

/// Calculator for run performance metrics.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Compute metrics from `trades` and a time-ordered equity curve.
    pub fn calculate(trades: &[TradeRecord], equity: &[(DateTime<Utc>, Decimal)]) -> PerformanceMetrics {
        let mut metrics = PerformanceMetrics::default();

        Self::calculate_trade_metrics(&mut metrics, trades);

        let values: Vec<f64> = equity.iter().filter_map(|(_, v)| v.to_f64()).collect();
        metrics.max_drawdown = max_drawdown(&values);
        Self::calculate_sharpe_sortino(&mut metrics, equity);

        metrics
    }

    fn calculate_trade_metrics(metrics: &mut PerformanceMetrics, trades: &[TradeRecord]) {
        if trades.is_empty() {
            return;
        }

        let (wins, losses): (Vec<&TradeRecord>, Vec<&TradeRecord>) =
            trades.iter().partition(|t| t.is_win());

        metrics.total_trades = trades.len();
        metrics.winning_trades = wins.len();
        metrics.losing_trades = losses.len();
        metrics.win_rate = wins.len() as f64 / trades.len() as f64;

        metrics.total_pnl = trades.iter().map(|t| t.pnl).sum();
        metrics.gross_profit = wins.iter().map(|t| t.pnl).sum();
        metrics.gross_loss = losses.iter().map(|t| t.pnl.abs()).sum();

        if !wins.is_empty() {
            metrics.avg_win = metrics.gross_profit / Decimal::from(wins.len());
        }
        if !losses.is_empty() {
            metrics.avg_loss = metrics.gross_loss / Decimal::from(losses.len());
        }
        metrics.largest_win = wins.iter().map(|t| t.pnl).max().unwrap_or(Decimal::ZERO);
        metrics.largest_loss = losses.iter().map(|t| t.pnl).min().unwrap_or(Decimal::ZERO);

        metrics.profit_factor = if metrics.gross_loss > Decimal::ZERO {
            (metrics.gross_profit / metrics.gross_loss).to_f64().unwrap_or(0.0)
        } else if metrics.gross_profit > Decimal::ZERO {
            f64::INFINITY
        } else {
            0.0
        };

        metrics.expectancy = metrics.total_pnl / Decimal::from(trades.len());
        metrics.avg_holding_hours =
            trades.iter().map(|t| t.holding_hours()).sum::<f64>() / trades.len() as f64;

        for trade in trades {
            *metrics
                .trades_by_reason
                .entry(trade.exit_reason.as_str().to_string())
                .or_default() += 1;
        }
    }

    /// Ratios from per-step equity returns, annualized by the curve's
    /// average sampling interval.
    fn calculate_sharpe_sortino(metrics: &mut PerformanceMetrics, equity: &[(DateTime<Utc>, Decimal)]) {
        if equity.len() < 3 {
            return;
        }

        let values: Vec<f64> = equity.iter().filter_map(|(_, v)| v.to_f64()).collect();
        let returns: Vec<f64> = values
            .windows(2)
            .filter(|w| w[0] > 0.0)
            .map(|w| (w[1] - w[0]) / w[0])
            .collect();
        if returns.len() < 2 {
            return;
        }

        let span = (equity[equity.len() - 1].0 - equity[0].0).num_seconds() as f64;
        let step = span / (equity.len() - 1) as f64;
        let annualization = if step > 0.0 {
            (SECONDS_PER_YEAR / step).sqrt()
        } else {
            1.0
        };

        let mean = returns.iter().mean();
        let std_dev = returns.iter().std_dev();
        if std_dev > 0.0 {
            metrics.sharpe_ratio = mean / std_dev * annualization;
        }

        // Downside deviation over every step, gains counting as zero
        let downside: Vec<f64> = returns.iter().map(|r| r.min(0.0).powi(2)).collect();
        let downside_dev = downside.iter().mean().sqrt();
        if downside_dev > 0.0 {
            metrics.sortino_ratio = mean / downside_dev * annualization;
        }
    }
}

/// Largest peak-to-trough decline of `equity` as a positive fraction.
pub fn max_drawdown(equity: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut max_dd = 0.0f64;

    for &value in equity {
        if value > peak {
            peak = value;
        }
        if peak > 0.0 {
            max_dd = max_dd.max((peak - value) / peak);
        }
    }

    max_dd
}
