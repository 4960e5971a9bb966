//! DEX Trading Bot
//!
//! Trades DEX pairs with grid and momentum strategies, picking between them
//! from market conditions, with trailing stops, tiered take-profits and a
//! drawdown circuit breaker.

mod api;
mod backtest;
mod bot;
mod config;
mod db;
mod events;
mod execution;
mod indicators;
mod metrics;
mod models;
mod risk;
mod strategy;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::backtest::{load_snapshots, Backtester};
use crate::bot::Bot;
use crate::config::BotConfig;
use crate::db::Journal;

/// DEX trading bot CLI.
#[derive(Parser)]
#[command(name = "dex-trader")]
#[command(about = "Grid/momentum DEX trading bot with layered risk management", long_about = None)]
struct Cli {
    /// JSON configuration file (environment variables override it)
    #[arg(short, long, env = "DEX_CONFIG")]
    config: Option<PathBuf>,

    /// Database file path
    #[arg(short, long, default_value = "sqlite:./dex-trader.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the trading bot on the configured pairs
    Run {
        /// Starting capital in USD
        #[arg(long)]
        capital: Option<f64>,

        /// Polling interval in seconds
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Replay recorded snapshots through the engine
    Backtest {
        /// JSON-lines file of market snapshots
        #[arg(short, long)]
        file: PathBuf,

        /// Starting capital in USD
        #[arg(long)]
        capital: Option<f64>,
    },

    /// Show effective configuration
    Config {
        /// Print the full configuration as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show journaled trades and events
    Status {
        /// Number of recent trades and events to list
        #[arg(short, long, default_value = "10")]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = BotConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { capital, interval } => {
            if let Some(capital) = capital {
                config.initial_capital = Decimal::try_from(capital)?;
            }
            if let Some(interval) = interval {
                config.feed.poll_interval_secs = interval;
            }
            config.validate()?;

            info!(
                capital = %config.initial_capital,
                pairs = config.feed.pairs.len(),
                dry_run = config.execution.dry_run,
                "Starting DEX trading bot"
            );

            let journal = Journal::new(&cli.database).await?;
            let bot = Bot::new(config.clone(), Some(journal))?;

            println!("\n=== DEX Trading Bot ===");
            println!("Capital:          ${}", config.initial_capital);
            println!("Polling interval: {}s", config.feed.poll_interval_secs);
            println!("Chain:            {}", config.feed.chain);
            println!("Pairs:            {}", config.feed.pairs.iter()
                .map(|p| p.symbol.as_str()).collect::<Vec<_>>().join(", "));
            println!("Strategy mode:    {:?}", config.strategy.selection.mode);
            println!("Mode:             {}", if config.execution.dry_run { "DRY RUN (paper fills)" } else { "LIVE" });
            println!("\nPress Ctrl+C to stop.\n");

            let stats = bot.run().await?;
            println!("\n{}", stats);
        }

        Commands::Backtest { file, capital } => {
            if let Some(capital) = capital {
                config.initial_capital = Decimal::try_from(capital)?;
            }

            let snapshots = load_snapshots(&file)?;
            info!(file = %file.display(), snapshots = snapshots.len(), "Starting backtest");

            println!("\n=== Backtest ===");
            println!("File:     {}", file.display());
            println!("Capital:  ${}", config.initial_capital);
            println!("Slippage: {}%", config.execution.slippage * dec!(100));
            println!("Fee:      {}%", config.execution.fee_rate * dec!(100));
            println!("Gas:      ${}", config.execution.gas_usd);

            let results = Backtester::new(config)?.run(&snapshots).await?;
            println!("{}", results);
        }

        Commands::Config { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&config).context("Failed to encode configuration")?);
                return Ok(());
            }
            print_config(&config);
        }

        Commands::Status { limit } => {
            let journal = Journal::new(&cli.database).await?;

            let stats = journal.get_trade_stats().await?;
            let max_dd = journal.calculate_max_drawdown().await.unwrap_or(0.0);
            let equity = journal.get_equity_curve(1).await?;
            let events = journal.event_counts().await?;

            if stats.total == 0 && events.is_empty() {
                println!("No journal entries found. Run 'dex-trader run' to start the bot.");
                return Ok(());
            }

            println!("\n=== Bot Status ===");
            if let Some(point) = equity.first() {
                println!("Last Update:      {}", point.timestamp);
                println!("Equity:           ${:.2}", point.equity);
                println!("Capital:          ${:.2}", point.capital);
                println!("Invested:         ${:.2}", point.invested);
                println!("Unrealized P&L:   ${:.2}", point.unrealized_pnl);
                println!("Drawdown:         {:.2}%", point.drawdown * 100.0);
            }
            println!("Max Drawdown:     {:.2}%", max_dd * 100.0);

            println!("\n=== Trading ===");
            println!("Closed Trades:    {} ({} partial)", stats.total, stats.partial);
            println!("Win Rate:         {:.1}%", stats.win_rate() * 100.0);
            println!("Realized P&L:     ${:.2}", stats.total_pnl);

            let trades = journal.get_recent_trades(limit).await?;
            if !trades.is_empty() {
                println!("\n=== Recent Trades ===");
                for trade in &trades {
                    let pnl_sign = if trade.pnl >= 0.0 { "+" } else { "" };
                    println!(
                        "  {:<14} {:.4} -> {:.4} ({}${:.2}) {}{}",
                        truncate(&trade.pair, 14),
                        trade.entry_price,
                        trade.exit_price,
                        pnl_sign,
                        trade.pnl,
                        trade.exit_reason,
                        if trade.partial { " [partial]" } else { "" }
                    );
                }
            }

            println!("\n=== Events ===");
            for (event_type, count) in &events {
                println!("  {:<26} {}", event_type, count);
            }

            let recent = journal.get_recent_events(limit).await?;
            if !recent.is_empty() {
                println!("\n=== Recent Events ===");
                for event in &recent {
                    println!(
                        "  #{:<6} {} {:<22} {}",
                        event.id,
                        event.timestamp,
                        event.event_type,
                        truncate(&event.payload, 60)
                    );
                }
            }
        }
    }

    Ok(())
}

fn print_config(config: &BotConfig) {
    let hundred = dec!(100);
    let risk = &config.risk;
    let strategy = &config.strategy;

    println!("\n=== Risk Configuration ===\n");
    println!("Position Sizing:");
    println!("  Initial Capital:      ${}", config.initial_capital);
    println!("  Max Position:         {}%", risk.max_position_percent * hundred);
    println!("  Min Position Capital: ${}", risk.min_position_capital);
    println!("  Reset Size Scale:     {}", risk.reset_size_scale);
    println!("  Max Gas:              {}%", risk.max_gas_percent * hundred);

    println!("\nExits:");
    println!("  Trailing Stop:        {}%", risk.stop_loss_trailing * hundred);
    for (i, level) in risk.take_profit_levels.iter().enumerate() {
        println!(
            "  Take Profit {}:        +{}% sells {}%",
            i + 1,
            level.percent * hundred,
            level.amount * hundred
        );
    }

    println!("\nCircuit Breaker:");
    println!("  Max Drawdown:         {}%", risk.max_drawdown * hundred);
    for (i, level) in risk.drawdown_levels.iter().enumerate() {
        let duration = level
            .duration_secs
            .map(|s| format!(" for {}s", s))
            .unwrap_or_default();
        println!(
            "  Level {}:              {}% {}{}",
            i + 1,
            level.percent * hundred,
            level.action.as_str(),
            duration
        );
    }

    println!("\n=== Strategy Configuration ===\n");
    println!("Selection:");
    println!("  Mode:                 {:?}", strategy.selection.mode);
    println!("  Conservative:         {}", strategy.selection.conservative);
    println!("  Momentum Volatility:  > {}", strategy.selection.momentum_min_volatility);
    println!("  Momentum Volume:      > {}x", strategy.selection.momentum_min_volume_ratio);
    println!("  Switch Cooldown:      {}s", strategy.selection.switch_cooldown_secs);

    println!("\nGrid:");
    println!("  Enabled:              {}", strategy.grid.enabled);
    println!("  Levels:               {}", strategy.grid.levels);
    println!("  Range:                {}% to {}%",
        strategy.grid.range_min * hundred, strategy.grid.range_max * hundred);
    println!("  Rebalance:            every {}s past {}%",
        strategy.grid.rebalance_interval_secs, strategy.grid.rebalance_threshold * hundred);

    println!("\nMomentum:");
    println!("  Enabled:              {}", strategy.momentum.enabled);
    println!("  Lookback:             {}", strategy.momentum.lookback_period);
    println!("  Entry / Exit:         {}% / {}%",
        strategy.momentum.entry_threshold * 100.0, strategy.momentum.exit_threshold * 100.0);
    println!("  RSI:                  period {}, entry {}, exit {}",
        strategy.momentum.rsi_period, strategy.momentum.rsi_entry, strategy.momentum.rsi_exit);

    println!("\n=== Execution ===\n");
    println!("  Dry Run:              {}", config.execution.dry_run);
    println!("  Slippage:             {}%", config.execution.slippage * hundred);
    println!("  Fee Rate:             {}%", config.execution.fee_rate * hundred);
    println!("  Gas:                  ${}", config.execution.gas_usd);

    println!("\n=== Feed ===\n");
    println!("  API:                  {}", config.feed.base_url);
    println!("  Chain:                {}", config.feed.chain);
    println!("  Poll Interval:        {}s", config.feed.poll_interval_secs);
    if config.feed.pairs.is_empty() {
        println!("  Pairs:                none (set DEX_PAIRS=SYMBOL|address,...)");
    }
    for pair in &config.feed.pairs {
        println!("  Pair:                 {} ({})", pair.symbol, pair.address);
    }
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
