//! Bot runner: the live polling loop around the trading engine.
//!
//! Handles:
//! - Polling DexScreener for every configured pair
//! - Running each snapshot through the engine
//! - Journaling events and the equity curve
//! - Ctrl+C and circuit-breaker shutdown

mod engine;

pub use engine::{CycleStats, Engine};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::api::MarketFeed;
use crate::config::BotConfig;
use crate::db::{EquitySnapshot, Journal};
use crate::events::{BotEvent, EventBus};
use crate::execution::{PaperExecutor, TradeExecutor};

/// Main bot runner.
pub struct Bot {
    config: BotConfig,
    engine: Engine<PaperExecutor>,
    feed: MarketFeed,
    events: EventBus,
    journal: Option<Journal>,
    journal_task: Option<JoinHandle<()>>,
    started_at: DateTime<Utc>,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
}

impl Bot {
    /// Create a bot for the configured pairs. Events are journaled when a
    /// journal is given.
    pub fn new(config: BotConfig, journal: Option<Journal>) -> Result<Self> {
        ensure!(
            !config.feed.pairs.is_empty(),
            "No pairs configured (set feed.pairs in the config file or DEX_PAIRS)"
        );

        let events = EventBus::new(config.event_capacity);
        events.spawn_logger();
        let journal_task = journal.as_ref().map(|j| j.spawn_writer(&events));

        if !config.execution.dry_run {
            warn!("No live executor configured. Running with paper fills.");
        }
        let executor = PaperExecutor::new(config.execution.clone());
        let engine = Engine::new(config.clone(), executor, events.clone())?;
        let feed = MarketFeed::new(&config.feed)?;

        Ok(Self {
            config,
            engine,
            feed,
            events,
            journal,
            journal_task,
            started_at: Utc::now(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Poll until Ctrl+C or the circuit breaker stops the run.
    pub async fn run(mut self) -> Result<BotStats> {
        let pairs: Vec<String> = self.feed.pairs().iter().map(|p| p.symbol.clone()).collect();
        info!(
            pairs = ?pairs,
            dry_run = self.config.execution.dry_run,
            poll_interval = self.config.feed.poll_interval_secs,
            "Starting bot run loop"
        );
        self.events.publish(BotEvent::BotStarted {
            pairs,
            capital: self.config.initial_capital,
            dry_run: self.config.execution.dry_run,
        });

        let mut poll_interval = interval(Duration::from_secs(self.config.feed.poll_interval_secs));

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        while !self.shutdown.load(Ordering::SeqCst) {
            poll_interval.tick().await;

            if let Err(e) = self.tick().await {
                error!(error = %e, "Error in bot tick");
            }
            if self.engine.is_halted() {
                break;
            }
        }

        self.finish().await
    }

    /// Single iteration of the main loop.
    async fn tick(&mut self) -> Result<()> {
        debug!("Bot tick");

        let snapshots = self.feed.poll().await;
        if snapshots.is_empty() {
            warn!("No market data this cycle");
            return Ok(());
        }

        for data in &snapshots {
            self.engine.process_snapshot(data).await;
            if self.engine.is_halted() {
                break;
            }
        }

        self.record_equity(Utc::now()).await
    }

    /// Record an equity curve point.
    async fn record_equity(&self, at: DateTime<Utc>) -> Result<()> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let positions = self.engine.positions();
        journal
            .record_equity_point(&EquitySnapshot {
                timestamp: at,
                equity: positions.equity(),
                capital: positions.current_capital(),
                invested: positions.total_invested(),
                unrealized_pnl: positions.unrealized_pnl(),
                drawdown: self.engine.drawdown().current_drawdown(),
            })
            .await
    }

    /// Graceful shutdown: publish the stop, then let the journal drain.
    async fn finish(self) -> Result<BotStats> {
        info!("Shutting down bot...");

        if !self.engine.is_halted() {
            self.events.publish(BotEvent::BotStopped {
                reason: "shutdown requested".to_string(),
            });
        }
        if let Err(e) = self.record_equity(Utc::now()).await {
            warn!(error = %e, "Failed to record final equity point");
        }
        let stats = self.get_stats();

        // The journal writer ends once every sender is gone
        let Bot {
            engine,
            events,
            journal_task,
            ..
        } = self;
        drop(engine);
        drop(events);
        if let Some(task) = journal_task {
            if let Err(e) = task.await {
                warn!(error = %e, "Journal writer ended abnormally");
            }
        }

        info!("Bot shutdown complete");
        Ok(stats)
    }

    /// Get current stats.
    pub fn get_stats(&self) -> BotStats {
        BotStats::from_engine(
            &self.engine,
            self.started_at,
            !self.shutdown.load(Ordering::SeqCst) && !self.engine.is_halted(),
        )
    }
}

/// Bot statistics.
#[derive(Debug, Clone)]
pub struct BotStats {
    pub executor: String,
    pub initial_capital: Decimal,
    pub current_capital: Decimal,
    pub equity: Decimal,
    pub total_invested: Decimal,
    pub unrealized_pnl: Decimal,
    pub current_drawdown: Decimal,
    pub max_drawdown: Decimal,
    pub open_positions: usize,
    pub closed_trades: usize,
    pub strategies: Vec<(String, String)>,
    pub cycles: CycleStats,
    pub started_at: DateTime<Utc>,
    pub is_running: bool,
    pub halted: bool,
    pub dry_run: bool,
}

impl BotStats {
    pub fn from_engine<E: TradeExecutor>(
        engine: &Engine<E>,
        started_at: DateTime<Utc>,
        is_running: bool,
    ) -> Self {
        let positions = engine.positions();
        let mut strategies: Vec<(String, String)> = engine
            .strategies()
            .map(|m| (m.pair().to_string(), m.active_kind().to_string()))
            .collect();
        strategies.sort();

        Self {
            executor: engine.executor().name().to_string(),
            initial_capital: engine.config().initial_capital,
            current_capital: positions.current_capital(),
            equity: positions.equity(),
            total_invested: positions.total_invested(),
            unrealized_pnl: positions.unrealized_pnl(),
            current_drawdown: engine.drawdown().current_drawdown(),
            max_drawdown: engine.drawdown().max_drawdown_reached(),
            open_positions: positions.position_count(),
            closed_trades: engine.closed_trades().len(),
            strategies,
            cycles: engine.stats().clone(),
            started_at,
            is_running,
            halted: engine.is_halted(),
            dry_run: engine.config().execution.dry_run,
        }
    }
}

impl std::fmt::Display for BotStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hundred = Decimal::ONE_HUNDRED;
        writeln!(f, "=== Bot Statistics ===")?;
        writeln!(f, "Initial Capital: ${:.2}", self.initial_capital)?;
        writeln!(f, "Capital:         ${:.2}", self.current_capital)?;
        writeln!(f, "Equity:          ${:.2}", self.equity)?;
        writeln!(f, "Invested:        ${:.2}", self.total_invested)?;
        writeln!(f, "Unrealized P&L:  ${:.2}", self.unrealized_pnl)?;
        writeln!(f, "Drawdown:        {:.2}% (max {:.2}%)",
            self.current_drawdown * hundred, self.max_drawdown * hundred)?;
        writeln!(f, "Positions:       {} open, {} closed trades",
            self.open_positions, self.closed_trades)?;
        writeln!(f, "Cycles:          {} (Signals: {}, Entries: {}, Exits: {}, Partial: {}, Failed: {})",
            self.cycles.cycles, self.cycles.signals, self.cycles.entries,
            self.cycles.exits, self.cycles.partial_exits, self.cycles.failed_trades)?;
        for (pair, strategy) in &self.strategies {
            writeln!(f, "Strategy:        {} -> {}", pair, strategy)?;
        }
        writeln!(f, "Started:         {}", self.started_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        let status = if self.halted {
            "Halted (circuit breaker)"
        } else if self.is_running {
            "Running"
        } else {
            "Stopped"
        };
        writeln!(f, "Status:          {} via {} {}",
            status, self.executor, if self.dry_run { "(Dry Run)" } else { "" })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PairConfig;
    use rust_decimal_macros::dec;

    #[test]
    fn test_bot_requires_pairs() {
        let err = Bot::new(BotConfig::default(), None).err().unwrap();
        assert!(err.to_string().contains("No pairs configured"));
    }

    #[tokio::test]
    async fn test_stats_for_fresh_bot() {
        let mut config = BotConfig::default();
        config.feed.pairs.push(PairConfig {
            symbol: "WETH/USDC".to_string(),
            address: "0x88e6a0c2ddd26feeb64f039a2c41296fcb3f5640".to_string(),
        });
        let bot = Bot::new(config, None).unwrap();

        let stats = bot.get_stats();
        assert_eq!(stats.current_capital, dec!(1000));
        assert_eq!(stats.equity, dec!(1000));
        assert_eq!(stats.open_positions, 0);
        assert_eq!(stats.executor, "paper");
        assert!(stats.is_running);
        assert!(!stats.halted);

        let text = stats.to_string();
        assert!(text.starts_with("=== Bot Statistics ==="));
        assert!(text.contains("Running via paper (Dry Run)"));
    }
}
