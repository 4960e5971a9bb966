//! Per-snapshot trading cycle shared by the live bot and the backtester.
//!
//! The engine owns every manager for one run. A cycle runs to completion
//! before the next begins, and a fill is only recorded after the executor
//! resolves it; a failed fill leaves positions and capital untouched.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::BotConfig;
use crate::events::{BotEvent, EventBus};
use crate::execution::{gas_is_acceptable, Fill, TradeExecutor};
use crate::models::{ExitReason, MarketData, Signal, SignalAction, TradeRecord, TradeSide};
use crate::risk::{
    DrawdownAction, DrawdownManager, ExitDecision, ExitManager, FiredLevel, PartialExit,
    PositionManager,
};
use crate::strategy::StrategyManager;

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    pub cycles: u64,
    pub skipped_snapshots: u64,
    pub signals: u64,
    pub entries: u64,
    pub exits: u64,
    pub partial_exits: u64,
    pub rejected_entries: u64,
    pub failed_trades: u64,
}

pub struct Engine<E> {
    config: BotConfig,
    executor: E,
    positions: PositionManager,
    exits: ExitManager,
    drawdown: DrawdownManager,
    strategies: HashMap<String, StrategyManager>,
    /// Exits whose sell failed; retried on the pair's next snapshot
    pending_exits: HashMap<String, ExitReason>,
    closed_trades: Vec<TradeRecord>,
    events: EventBus,
    halted: bool,
    stats: CycleStats,
}

impl<E: TradeExecutor> Engine<E> {
    /// Validate `config` and build the managers for a fresh run.
    pub fn new(config: BotConfig, executor: E, events: EventBus) -> Result<Self> {
        config.validate()?;

        let positions = PositionManager::new(config.risk.clone(), config.initial_capital)
            .with_events(events.clone());
        let exits = ExitManager::new(&config.risk).with_events(events.clone());
        let drawdown =
            DrawdownManager::new(&config.risk, config.initial_capital).with_events(events.clone());

        info!(
            capital = %config.initial_capital,
            executor = executor.name(),
            mode = ?config.strategy.selection.mode,
            "Engine ready"
        );

        Ok(Self {
            config,
            executor,
            positions,
            exits,
            drawdown,
            strategies: HashMap::new(),
            pending_exits: HashMap::new(),
            closed_trades: Vec::new(),
            events,
            halted: false,
            stats: CycleStats::default(),
        })
    }

    // ==================== Accessors ====================

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn drawdown(&self) -> &DrawdownManager {
        &self.drawdown
    }

    pub fn strategies(&self) -> impl Iterator<Item = &StrategyManager> {
        self.strategies.values()
    }

    pub fn closed_trades(&self) -> &[TradeRecord] {
        &self.closed_trades
    }

    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    /// Realized capital plus open positions at their last mark.
    pub fn equity(&self) -> Decimal {
        self.positions.equity()
    }

    /// Whether the circuit breaker stopped this run.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    // ==================== Cycle ====================

    /// Run one trading cycle for the snapshot's pair.
    ///
    /// Order: mark, exits, strategy selection, analysis, then the signal.
    /// `data.timestamp` is the cycle clock for every deadline.
    pub async fn process_snapshot(&mut self, data: &MarketData) {
        if self.halted {
            debug!(pair = %data.pair, "Engine halted, ignoring snapshot");
            return;
        }
        if !data.is_valid() {
            warn!(pair = %data.pair, price = %data.price, "Skipping invalid snapshot");
            self.stats.skipped_snapshots += 1;
            return;
        }
        self.stats.cycles += 1;

        let exited = self.manage_open_position(data).await;
        if self.halted {
            return;
        }

        let manager = self.strategy_for(&data.pair);
        manager.auto_select(data);
        let Some(signal) = manager.analyze(data) else {
            return;
        };
        self.stats.signals += 1;

        match signal.action {
            SignalAction::Sell => {
                if self.positions.has_position(&data.pair) {
                    self.exit_position(&data.pair, data.price, ExitReason::StrategySignal, data.timestamp)
                        .await;
                } else {
                    debug!(pair = %data.pair, "Sell signal without a position");
                }
            }
            SignalAction::Buy if exited => {
                debug!(pair = %data.pair, "Exited this cycle, skipping entry");
                self.reject_entry(&data.pair);
            }
            SignalAction::Buy => self.try_enter(&signal, data).await,
        }
    }

    /// Mark the open position and act on the exit decision.
    /// Returns true when the position was fully closed.
    async fn manage_open_position(&mut self, data: &MarketData) -> bool {
        let pair = data.pair.as_str();
        let now = data.timestamp;
        if !self.positions.has_position(pair) {
            return false;
        }
        self.positions.update_position(pair, data.price, now);

        if let Some(reason) = self.pending_exits.get(pair).copied() {
            info!(pair = %pair, reason = %reason, "Retrying exit");
            return self.exit_position(pair, data.price, reason, now).await;
        }

        match self.exits.update(pair, data.price, now) {
            ExitDecision::Hold => false,
            ExitDecision::Exit { reason, .. } => self.exit_position(pair, data.price, reason, now).await,
            ExitDecision::Partial(partial) => {
                self.partial_exit(pair, &partial, now).await;
                false
            }
        }
    }

    /// Sell the whole position. On a failed fill the exit is queued for the
    /// next cycle, since the stop and take-profit triggers are one-shot.
    async fn exit_position(
        &mut self,
        pair: &str,
        price: Decimal,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(tokens) = self.positions.get_position(pair).map(|p| p.token_amount) else {
            return false;
        };

        match self.executor.sell(pair, price, tokens).await {
            Ok(fill) => {
                self.pending_exits.remove(pair);
                self.publish_fill(&fill, now);
                if let Some(record) =
                    self.positions.close_position(pair, fill.effective_price, reason, now)
                {
                    self.closed_trades.push(record);
                }
                self.exits.stop_managing(pair);
                self.strategy_for(pair).on_position_closed();
                self.stats.exits += 1;
                self.apply_capital_change(now);
                true
            }
            Err(e) => {
                warn!(pair = %pair, reason = %reason, error = %e, "Exit fill failed, retrying next cycle");
                self.pending_exits.insert(pair.to_string(), reason);
                self.trade_failed(pair, TradeSide::Sell, &e, now);
                false
            }
        }
    }

    async fn partial_exit(&mut self, pair: &str, partial: &PartialExit, now: DateTime<Utc>) {
        let Some(tokens) = self
            .positions
            .get_position(pair)
            .map(|p| p.token_amount * partial.fraction_of_remaining)
        else {
            return;
        };

        match self.executor.sell(pair, partial.price, tokens).await {
            Ok(fill) => {
                self.publish_fill(&fill, now);
                if let Some(record) = self.positions.reduce_position(
                    pair,
                    partial.fraction_of_remaining,
                    fill.effective_price,
                    ExitReason::TakeProfit,
                    now,
                ) {
                    self.closed_trades.push(record);
                }
                self.exits.record_partial_fill(pair, partial.fraction_of_original);
                self.stats.partial_exits += 1;
                self.apply_capital_change(now);
            }
            Err(e) => {
                warn!(pair = %pair, levels = ?partial.levels, error = %e, "Take-profit fill failed, levels skipped");
                self.trade_failed(pair, TradeSide::Sell, &e, now);
            }
        }
    }

    async fn try_enter(&mut self, signal: &Signal, data: &MarketData) {
        let pair = data.pair.as_str();
        let now = data.timestamp;

        if self.positions.has_position(pair) {
            debug!(pair = %pair, "Already holding, ignoring buy signal");
            return;
        }
        if let Some(reason) = self.entry_blocker(now) {
            info!(pair = %pair, reason = reason, "Entry rejected");
            self.reject_entry(pair);
            return;
        }

        let size = self.positions.calculate_position_size(data.price, data.volatility);
        if size.is_zero() {
            info!(pair = %pair, "Entry rejected: position size is zero");
            self.reject_entry(pair);
            return;
        }

        let gas_usd = match self.executor.estimate_gas_usd(pair).await {
            Ok(gas) => gas,
            Err(e) => {
                warn!(pair = %pair, error = %e, "Gas estimate failed");
                self.trade_failed(pair, TradeSide::Buy, &e, now);
                self.reject_entry(pair);
                return;
            }
        };
        let acceptable = gas_is_acceptable(gas_usd, size.amount_usd, self.config.risk.max_gas_percent);
        self.events.publish_at(
            now,
            BotEvent::GasChecked {
                pair: pair.to_string(),
                gas_usd,
                amount_usd: size.amount_usd,
                acceptable,
            },
        );
        if !acceptable {
            warn!(pair = %pair, gas_usd = %gas_usd, amount_usd = %size.amount_usd, "Entry rejected: gas too expensive");
            self.reject_entry(pair);
            return;
        }

        match self.executor.buy(pair, data.price, size.amount_usd).await {
            Ok(fill) => {
                self.publish_fill(&fill, now);
                if self.positions.open_position(
                    pair,
                    fill.effective_price,
                    fill.amount_usd,
                    fill.token_amount,
                    now,
                ) {
                    self.exits.start_managing(pair, fill.fill_price);
                    self.stats.entries += 1;
                    info!(
                        pair = %pair,
                        strategy = %signal.strategy,
                        confidence = signal.confidence,
                        price = %fill.fill_price,
                        amount_usd = %fill.amount_usd,
                        "Entered position"
                    );
                } else {
                    warn!(pair = %pair, tx = %fill.tx_id, "Fill not recorded as a position");
                    self.reject_entry(pair);
                }
            }
            Err(e) => {
                warn!(pair = %pair, error = %e, "Entry fill failed");
                self.trade_failed(pair, TradeSide::Buy, &e, now);
                self.reject_entry(pair);
            }
        }
    }

    fn entry_blocker(&mut self, now: DateTime<Utc>) -> Option<&'static str> {
        if self.drawdown.is_stopped() {
            Some("circuit breaker stopped trading")
        } else if !self.drawdown.can_trade(now) {
            Some("trading paused")
        } else if !self.positions.can_open_position() {
            Some("insufficient available capital")
        } else {
            None
        }
    }

    /// The strategy assumed an entry that did not happen.
    fn reject_entry(&mut self, pair: &str) {
        self.stats.rejected_entries += 1;
        self.strategy_for(pair).on_position_closed();
    }

    // ==================== Circuit breaker ====================

    /// Mirror realized capital into the breaker and apply whatever fired.
    fn apply_capital_change(&mut self, now: DateTime<Utc>) {
        let capital = self.positions.current_capital();
        for fired in self.drawdown.update_capital(capital, now) {
            self.apply_drawdown_level(&fired, now);
        }
        if self.drawdown.is_beyond_max_drawdown() {
            let reason = format!(
                "drawdown {}% beyond max drawdown",
                (self.drawdown.current_drawdown() * Decimal::ONE_HUNDRED).round_dp(2)
            );
            self.halt(reason, now);
        }
    }

    fn apply_drawdown_level(&mut self, fired: &FiredLevel, now: DateTime<Utc>) {
        match fired.action {
            DrawdownAction::Pause => {}
            DrawdownAction::PauseAndReset => {
                let conservative = self.config.strategy.selection.conservative;
                let reason = format!("drawdown level {} reset", fired.level);
                for manager in self.strategies.values_mut() {
                    manager.force_switch(conservative, &reason, now);
                }
                self.positions.set_size_scale(self.config.risk.reset_size_scale);
            }
            DrawdownAction::Stop => {
                let reason = format!(
                    "drawdown {}% breached level {}",
                    (fired.drawdown * Decimal::ONE_HUNDRED).round_dp(2),
                    fired.level
                );
                self.halt(reason, now);
            }
        }
    }

    fn halt(&mut self, reason: String, now: DateTime<Utc>) {
        if self.halted {
            return;
        }
        self.halted = true;
        let status = self.drawdown.status(now);
        error!(
            reason = %reason,
            capital = %status.current_capital,
            peak = %status.peak_capital,
            drawdown = %status.current_drawdown,
            levels = ?status.triggered_levels,
            open_positions = self.positions.position_count(),
            "Trading halted"
        );
        self.events.publish_at(now, BotEvent::BotStopped { reason });
    }

    // ==================== Helpers ====================

    fn strategy_for(&mut self, pair: &str) -> &mut StrategyManager {
        let Self {
            strategies,
            config,
            events,
            ..
        } = self;
        strategies.entry(pair.to_string()).or_insert_with(|| {
            StrategyManager::new(pair, config.strategy.clone()).with_events(events.clone())
        })
    }

    fn publish_fill(&self, fill: &Fill, now: DateTime<Utc>) {
        self.events.publish_at(
            now,
            BotEvent::TradeExecuted {
                pair: fill.pair.clone(),
                side: fill.side,
                price: fill.fill_price,
                amount_usd: fill.amount_usd,
                token_amount: fill.token_amount,
                fee_usd: fill.fee_usd,
                gas_usd: fill.gas_usd,
                tx_id: fill.tx_id.clone(),
            },
        );
    }

    fn trade_failed(&mut self, pair: &str, side: TradeSide, error: &anyhow::Error, now: DateTime<Utc>) {
        self.stats.failed_trades += 1;
        self.events.publish_at(
            now,
            BotEvent::TradeFailed {
                pair: pair.to_string(),
                side,
                error: format!("{:#}", error),
            },
        );
    }
}
