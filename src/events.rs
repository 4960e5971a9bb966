//! In-process event bus connecting the engine to logging and persistence.
//!
//! Events are a typed enum carried over a `tokio::sync::broadcast` channel.
//! Publishing never blocks and never fails: with no subscribers the event is
//! simply dropped, and slow subscribers observe `Lagged` instead of stalling
//! the trading cycle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::indicators::Trend;
use crate::models::{Position, Signal, StrategyKind, TradeRecord, TradeSide};
use crate::risk::DrawdownAction;

const DEFAULT_CAPACITY: usize = 1024;

/// Everything the engine announces to the outside world.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BotEvent {
    BotStarted {
        pairs: Vec<String>,
        capital: Decimal,
        dry_run: bool,
    },
    BotStopped {
        reason: String,
    },
    TradingPaused {
        level: usize,
        until: DateTime<Utc>,
    },
    TradingResumed,
    StrategySelected {
        pair: String,
        strategy: StrategyKind,
        volatility: f64,
        volume_ratio: f64,
        trend: Trend,
    },
    StrategyChanged {
        pair: String,
        from: StrategyKind,
        to: StrategyKind,
        reason: String,
        forced: bool,
    },
    TradeSignal {
        signal: Signal,
    },
    TradeExecuted {
        pair: String,
        side: TradeSide,
        price: Decimal,
        amount_usd: Decimal,
        token_amount: Decimal,
        fee_usd: Decimal,
        gas_usd: Decimal,
        tx_id: String,
    },
    TradeFailed {
        pair: String,
        side: TradeSide,
        error: String,
    },
    PositionOpened {
        position: Position,
    },
    PositionClosed {
        trade: TradeRecord,
    },
    CapitalChanged {
        before: Decimal,
        after: Decimal,
        available: Decimal,
    },
    StopLossTriggered {
        pair: String,
        stop_price: Decimal,
        highest_price: Decimal,
        exit_price: Decimal,
        pnl_pct: Decimal,
    },
    TakeProfitTriggered {
        pair: String,
        levels: Vec<usize>,
        fraction: Decimal,
        price: Decimal,
        all_levels: bool,
    },
    DrawdownLevelTriggered {
        level: usize,
        action: DrawdownAction,
        drawdown: Decimal,
        capital: Decimal,
        peak: Decimal,
    },
    GasChecked {
        pair: String,
        gas_usd: Decimal,
        amount_usd: Decimal,
        acceptable: bool,
    },
}

impl BotEvent {
    /// Stable event name for storage and filtering.
    pub fn name(&self) -> &'static str {
        match self {
            BotEvent::BotStarted { .. } => "bot_started",
            BotEvent::BotStopped { .. } => "bot_stopped",
            BotEvent::TradingPaused { .. } => "trading_paused",
            BotEvent::TradingResumed => "trading_resumed",
            BotEvent::StrategySelected { .. } => "strategy_selected",
            BotEvent::StrategyChanged { .. } => "strategy_changed",
            BotEvent::TradeSignal { .. } => "trade_signal",
            BotEvent::TradeExecuted { .. } => "trade_executed",
            BotEvent::TradeFailed { .. } => "trade_failed",
            BotEvent::PositionOpened { .. } => "position_opened",
            BotEvent::PositionClosed { .. } => "position_closed",
            BotEvent::CapitalChanged { .. } => "capital_changed",
            BotEvent::StopLossTriggered { .. } => "stop_loss_triggered",
            BotEvent::TakeProfitTriggered { .. } => "take_profit_triggered",
            BotEvent::DrawdownLevelTriggered { .. } => "drawdown_level_triggered",
            BotEvent::GasChecked { .. } => "gas_checked",
        }
    }
}

/// An event stamped with the cycle time it happened at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: BotEvent,
}

/// Cloneable publish/subscribe handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventRecord>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event stamped with `at`.
    pub fn publish_at(&self, at: DateTime<Utc>, event: BotEvent) {
        let name = event.name();
        if self.tx.send(EventRecord { timestamp: at, event }).is_err() {
            debug!(event = name, "No event subscribers");
        }
    }

    /// Publish an event stamped with the wall clock.
    pub fn publish(&self, event: BotEvent) {
        self.publish_at(Utc::now(), event);
    }

    /// Mirror every event into the log stream until the bus closes.
    pub fn spawn_logger(&self) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(record) => log_event(&record),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Event logger lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

fn log_event(record: &EventRecord) {
    match &record.event {
        BotEvent::DrawdownLevelTriggered { action: DrawdownAction::Stop, .. }
        | BotEvent::BotStopped { .. } => {
            error!(event = record.event.name(), payload = ?record.event, "Event");
        }
        BotEvent::TradeFailed { .. }
        | BotEvent::StopLossTriggered { .. }
        | BotEvent::DrawdownLevelTriggered { .. }
        | BotEvent::TradingPaused { .. } => {
            warn!(event = record.event.name(), payload = ?record.event, "Event");
        }
        BotEvent::TradeSignal { .. }
        | BotEvent::StrategySelected { .. }
        | BotEvent::GasChecked { .. }
        | BotEvent::CapitalChanged { .. } => {
            debug!(event = record.event.name(), payload = ?record.event, "Event");
        }
        _ => {
            info!(event = record.event.name(), payload = ?record.event, "Event");
        }
    }
}
