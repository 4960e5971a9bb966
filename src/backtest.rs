//! Backtesting: replay recorded market snapshots through the trading engine.
//!
//! Features:
//! - Loads MarketData snapshots from a JSON-lines file
//! - Fills derived fields with the same rolling history as the live feed
//! - Simulates fills with slippage, fees and gas
//! - Reports performance statistics

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use crate::api::SnapshotHistory;
use crate::bot::{CycleStats, Engine};
use crate::config::BotConfig;
use crate::events::EventBus;
use crate::execution::PaperExecutor;
use crate::metrics::{MetricsCalculator, PerformanceMetrics};
use crate::models::MarketData;

/// Results from a backtest run.
#[derive(Debug, Clone)]
pub struct BacktestResults {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub pairs: Vec<String>,
    pub snapshots: usize,

    pub initial_capital: Decimal,
    /// Realized capital at the end
    pub final_capital: Decimal,
    /// Capital plus open positions at their last mark
    pub final_equity: Decimal,
    /// Final equity over initial capital, minus one
    pub total_return_pct: Decimal,
    pub fees_paid: Decimal,
    pub open_positions: usize,

    pub metrics: PerformanceMetrics,
    pub cycles: CycleStats,
    pub halted: bool,
}

impl std::fmt::Display for BacktestResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = &self.metrics;
        writeln!(f, "\n{:=^60}", " BACKTEST RESULTS ")?;
        writeln!(f)?;
        writeln!(f, "Period: {} to {}",
            self.start_time.format("%Y-%m-%d %H:%M"),
            self.end_time.format("%Y-%m-%d %H:%M"))?;
        writeln!(f, "Pairs:  {} ({} snapshots)", self.pairs.join(", "), self.snapshots)?;
        writeln!(f)?;
        writeln!(f, "--- Capital ---")?;
        writeln!(f, "Initial:     ${:.2}", self.initial_capital)?;
        writeln!(f, "Final:       ${:.2}", self.final_capital)?;
        writeln!(f, "Equity:      ${:.2} ({} open)", self.final_equity, self.open_positions)?;
        writeln!(f, "Return:      {:.2}%", self.total_return_pct * dec!(100))?;
        writeln!(f, "Fees Paid:   ${:.2}", self.fees_paid)?;
        writeln!(f)?;
        writeln!(f, "--- Trades ---")?;
        writeln!(f, "Total:       {} ({} entries, {} partial)",
            m.total_trades, self.cycles.entries, self.cycles.partial_exits)?;
        writeln!(f, "Winners:     {} ({:.1}%)", m.winning_trades, m.win_rate * 100.0)?;
        writeln!(f, "Losers:      {}", m.losing_trades)?;
        writeln!(f, "Avg Win:     ${:.2}", m.avg_win)?;
        writeln!(f, "Avg Loss:    ${:.2}", m.avg_loss)?;
        writeln!(f, "Profit Factor: {:.2}", m.profit_factor)?;
        writeln!(f, "Expectancy:  ${:.2}", m.expectancy)?;
        for (reason, count) in &m.trades_by_reason {
            writeln!(f, "  {:<24} {}", reason, count)?;
        }
        writeln!(f)?;
        writeln!(f, "--- Risk Metrics ---")?;
        writeln!(f, "Max Drawdown: {:.2}%", m.max_drawdown * 100.0)?;
        writeln!(f, "Sharpe Ratio: {:.2}", m.sharpe_ratio)?;
        writeln!(f, "Sortino Ratio: {:.2}", m.sortino_ratio)?;
        if self.halted {
            writeln!(f, "Circuit breaker stopped the run")?;
        }
        writeln!(f)?;
        writeln!(f, "--- Timing ---")?;
        writeln!(f, "Avg Hold:    {:.1} hours", m.avg_holding_hours)?;
        writeln!(f, "{:=^60}", "")?;
        Ok(())
    }
}

/// Read snapshots from a JSON-lines file, ordered by timestamp.
///
/// Blank lines and lines starting with `#` are skipped.
pub fn load_snapshots(path: &Path) -> Result<Vec<MarketData>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read snapshots from {}", path.display()))?;
    parse_snapshots(&content)
}

fn parse_snapshots(content: &str) -> Result<Vec<MarketData>> {
    let mut snapshots = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let data: MarketData = serde_json::from_str(line)
            .with_context(|| format!("Invalid snapshot on line {}", index + 1))?;
        snapshots.push(data);
    }
    snapshots.sort_by_key(|d| d.timestamp);
    Ok(snapshots)
}

/// Backtesting engine.
pub struct Backtester {
    config: BotConfig,
}

impl Backtester {
    pub fn new(config: BotConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Replay `snapshots` in order and report the run.
    pub async fn run(&self, snapshots: &[MarketData]) -> Result<BacktestResults> {
        ensure!(!snapshots.is_empty(), "No snapshots to replay");

        let events = EventBus::new(self.config.event_capacity);
        let executor = PaperExecutor::new(self.config.execution.clone());
        let mut engine = Engine::new(self.config.clone(), executor, events)?;
        let mut history = SnapshotHistory::new(self.config.feed.history_len);

        info!(snapshots = snapshots.len(), capital = %self.config.initial_capital, "Starting backtest");

        let mut equity_curve = Vec::with_capacity(snapshots.len());
        let mut pairs = BTreeSet::new();
        let mut replayed = 0;

        for data in snapshots {
            if !data.is_valid() {
                warn!(pair = %data.pair, timestamp = %data.timestamp, "Skipping invalid snapshot");
                continue;
            }
            pairs.insert(data.pair.clone());

            let data = history.enrich(data.clone());
            engine.process_snapshot(&data).await;
            replayed += 1;
            equity_curve.push((data.timestamp, engine.equity()));

            if engine.is_halted() {
                info!(timestamp = %data.timestamp, "Circuit breaker stopped the backtest");
                break;
            }
        }
        debug!(replayed = replayed, fills = engine.executor().fill_count(), "Replay finished");

        let start_time = equity_curve.first().map(|(t, _)| *t).unwrap_or_else(Utc::now);
        let end_time = equity_curve.last().map(|(t, _)| *t).unwrap_or(start_time);
        let metrics = MetricsCalculator::calculate(engine.closed_trades(), &equity_curve);

        let initial_capital = self.config.initial_capital;
        let final_equity = engine.equity();
        let results = BacktestResults {
            start_time,
            end_time,
            pairs: pairs.into_iter().collect(),
            snapshots: replayed,
            initial_capital,
            final_capital: engine.positions().current_capital(),
            final_equity,
            total_return_pct: (final_equity - initial_capital) / initial_capital,
            fees_paid: engine.executor().fees_paid(),
            open_positions: engine.positions().position_count(),
            metrics,
            cycles: engine.stats().clone(),
            halted: engine.is_halted(),
        };

        info!(
            trades = results.metrics.total_trades,
            return_pct = results.total_return_pct.to_f64().unwrap_or(0.0) * 100.0,
            max_drawdown = results.metrics.max_drawdown,
            "Backtest complete"
        );

        Ok(results)
    }
}
