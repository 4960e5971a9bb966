//! SQLite journal for events, closed trades and the equity curve.
//!
//! The journal subscribes to the event bus and stores:
//! - Every event as JSON
//! - Closed trades (full and partial)
//! - Equity curve points for P&L tracking

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::events::{BotEvent, EventBus, EventRecord};
use crate::models::TradeRecord;

/// Journal connection pool.
#[derive(Clone)]
pub struct Journal {
    pool: SqlitePool,
}

/// Stored event row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredEvent {
    pub id: i64,
    pub timestamp: String,
    pub event_type: String,
    pub payload: String,
}

/// Stored closed trade.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredTrade {
    pub id: String,
    pub pair: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub invested_amount: f64,
    pub token_amount: f64,
    pub exit_value: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub exit_reason: String,
    pub partial: bool,
    pub entry_time: String,
    pub exit_time: String,
}

/// Equity curve point for tracking P&L over time.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EquityPoint {
    pub id: i64,
    pub timestamp: String,
    pub equity: f64,
    pub capital: f64,
    pub invested: f64,
    pub unrealized_pnl: f64,
    pub drawdown: f64,
}

/// Values for a new equity point.
#[derive(Debug, Clone)]
pub struct EquitySnapshot {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
    pub capital: Decimal,
    pub invested: Decimal,
    pub unrealized_pnl: Decimal,
    pub drawdown: Decimal,
}

/// Aggregates over the trades table.
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct TradeStats {
    pub total: i64,
    pub wins: i64,
    pub losses: i64,
    pub partial: i64,
    pub total_pnl: f64,
}

impl TradeStats {
    pub fn win_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.wins as f64 / self.total as f64
        }
    }
}

impl Journal {
    /// Open (creating if needed) the journal at `database_url`.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let journal = Self { pool };
        journal.run_migrations().await?;

        Ok(journal)
    }

    /// Private in-memory journal on a single connection.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let journal = Self { pool };
        journal.run_migrations().await?;

        Ok(journal)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                pair TEXT NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL NOT NULL,
                invested_amount REAL NOT NULL,
                token_amount REAL NOT NULL,
                exit_value REAL NOT NULL,
                pnl REAL NOT NULL,
                pnl_pct REAL NOT NULL,
                exit_reason TEXT NOT NULL,
                partial INTEGER NOT NULL DEFAULT 0,
                entry_time TEXT NOT NULL,
                exit_time TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS equity_curve (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                equity REAL NOT NULL,
                capital REAL NOT NULL,
                invested REAL NOT NULL,
                unrealized_pnl REAL NOT NULL,
                drawdown REAL NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_exit_time ON trades(exit_time)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Store events from `bus` until every publisher is gone.
    pub fn spawn_writer(&self, bus: &EventBus) -> JoinHandle<()> {
        let journal = self.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(record) => {
                        if let Err(e) = journal.record(&record).await {
                            error!(event = record.event.name(), error = %e, "Failed to journal event");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Journal lagged behind, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Journal writer stopped");
        })
    }

    /// Store an event, and the trade it carries if any.
    pub async fn record(&self, record: &EventRecord) -> Result<()> {
        self.record_event(record).await?;
        if let BotEvent::PositionClosed { trade } = &record.event {
            self.record_trade(trade).await?;
        }
        Ok(())
    }

    // ==================== Events ====================

    pub async fn record_event(&self, record: &EventRecord) -> Result<()> {
        let payload = serde_json::to_string(&record.event).context("Failed to encode event")?;
        sqlx::query("INSERT INTO events (timestamp, event_type, payload) VALUES (?, ?, ?)")
            .bind(record.timestamp.to_rfc3339())
            .bind(record.event.name())
            .bind(payload)
            .execute(&self.pool)
            .await
            .context("Failed to store event")?;
        Ok(())
    }

    pub async fn get_recent_events(&self, limit: i64) -> Result<Vec<StoredEvent>> {
        sqlx::query_as::<_, StoredEvent>("SELECT * FROM events ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch events")
    }

    /// Number of stored events per type.
    pub async fn event_counts(&self) -> Result<Vec<(String, i64)>> {
        sqlx::query_as::<_, (String, i64)>(
            "SELECT event_type, COUNT(*) FROM events GROUP BY event_type ORDER BY event_type",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to count events")
    }

    // ==================== Trades ====================

    pub async fn record_trade(&self, trade: &TradeRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO trades
                (id, pair, entry_price, exit_price, invested_amount, token_amount,
                 exit_value, pnl, pnl_pct, exit_reason, partial, entry_time, exit_time)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.id)
        .bind(&trade.pair)
        .bind(trade.entry_price.to_f64().unwrap_or(0.0))
        .bind(trade.exit_price.to_f64().unwrap_or(0.0))
        .bind(trade.invested_amount.to_f64().unwrap_or(0.0))
        .bind(trade.token_amount.to_f64().unwrap_or(0.0))
        .bind(trade.exit_value.to_f64().unwrap_or(0.0))
        .bind(trade.pnl.to_f64().unwrap_or(0.0))
        .bind(trade.pnl_pct.to_f64().unwrap_or(0.0))
        .bind(trade.exit_reason.as_str())
        .bind(trade.partial)
        .bind(trade.entry_time.to_rfc3339())
        .bind(trade.exit_time.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to store trade")?;
        Ok(())
    }

    pub async fn get_recent_trades(&self, limit: i64) -> Result<Vec<StoredTrade>> {
        sqlx::query_as::<_, StoredTrade>(
            "SELECT * FROM trades ORDER BY exit_time DESC, rowid DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch trades")
    }

    pub async fn get_trade_stats(&self) -> Result<TradeStats> {
        sqlx::query_as::<_, TradeStats>(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN pnl > 0 THEN 1 ELSE 0 END), 0) AS wins,
                COALESCE(SUM(CASE WHEN pnl <= 0 THEN 1 ELSE 0 END), 0) AS losses,
                COALESCE(SUM(partial), 0) AS partial,
                COALESCE(SUM(pnl), 0.0) AS total_pnl
            FROM trades
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to fetch trade stats")
    }

    // ==================== Equity Curve ====================

    pub async fn record_equity_point(&self, point: &EquitySnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO equity_curve (timestamp, equity, capital, invested, unrealized_pnl, drawdown)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(point.timestamp.to_rfc3339())
        .bind(point.equity.to_f64().unwrap_or(0.0))
        .bind(point.capital.to_f64().unwrap_or(0.0))
        .bind(point.invested.to_f64().unwrap_or(0.0))
        .bind(point.unrealized_pnl.to_f64().unwrap_or(0.0))
        .bind(point.drawdown.to_f64().unwrap_or(0.0))
        .execute(&self.pool)
        .await
        .context("Failed to store equity point")?;

        Ok(())
    }

    /// Most recent equity points, newest first.
    pub async fn get_equity_curve(&self, limit: i64) -> Result<Vec<EquityPoint>> {
        sqlx::query_as::<_, EquityPoint>("SELECT * FROM equity_curve ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch equity curve")
    }

    /// Max peak-to-trough decline of equity over the stored curve, as a
    /// positive fraction.
    pub async fn calculate_max_drawdown(&self) -> Result<f64> {
        let points = self.get_equity_curve(10_000).await?;
        let equity: Vec<f64> = points.into_iter().rev().map(|p| p.equity).collect();
        Ok(crate::metrics::max_drawdown(&equity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExitReason;
    use rust_decimal_macros::dec;

    async fn journal() -> Journal {
        Journal::in_memory().await.unwrap()
    }

    fn trade(id: &str, pnl: Decimal, partial: bool) -> TradeRecord {
        let now = Utc::now();
        TradeRecord {
            id: id.to_string(),
            pair: "WETH/USDC".to_string(),
            entry_price: dec!(100),
            exit_price: dec!(100) + pnl,
            entry_time: now,
            exit_time: now,
            invested_amount: dec!(100),
            token_amount: dec!(1),
            exit_value: dec!(100) + pnl,
            pnl,
            pnl_pct: pnl / dec!(100),
            exit_reason: if partial { ExitReason::TakeProfit } else { ExitReason::StopLoss },
            partial,
        }
    }

    fn point(equity: Decimal) -> EquitySnapshot {
        EquitySnapshot {
            timestamp: Utc::now(),
            equity,
            capital: equity,
            invested: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            drawdown: Decimal::ZERO,
        }
    }

    #[tokio::test]
    async fn test_position_closed_event_stores_trade() {
        let journal = journal().await;
        let record = EventRecord {
            timestamp: Utc::now(),
            event: BotEvent::PositionClosed { trade: trade("t1", dec!(12), true) },
        };
        journal.record(&record).await.unwrap();

        let trades = journal.get_recent_trades(10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, "take_profit");
        assert!(trades[0].partial);

        let events = journal.get_recent_events(10).await.unwrap();
        assert_eq!(events[0].event_type, "position_closed");
        let payload: serde_json::Value = serde_json::from_str(&events[0].payload).unwrap();
        assert_eq!(payload["trade"]["id"], "t1");
    }

    #[tokio::test]
    async fn test_trade_stats() {
        let journal = journal().await;
        assert_eq!(journal.get_trade_stats().await.unwrap().total, 0);

        journal.record_trade(&trade("a", dec!(10), false)).await.unwrap();
        journal.record_trade(&trade("b", dec!(-4), false)).await.unwrap();
        journal.record_trade(&trade("c", dec!(6), true)).await.unwrap();

        let stats = journal.get_trade_stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.wins, 2);
        assert_eq!(stats.losses, 1);
        assert_eq!(stats.partial, 1);
        assert!((stats.total_pnl - 12.0).abs() < 1e-9);
        assert!((stats.win_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_max_drawdown_from_curve() {
        let journal = journal().await;
        for equity in [dec!(1000), dec!(1100), dec!(990), dec!(1050)] {
            journal.record_equity_point(&point(equity)).await.unwrap();
        }
        let dd = journal.calculate_max_drawdown().await.unwrap();
        assert!((dd - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_writer_drains_bus() {
        let journal = journal().await;
        let bus = EventBus::new(16);
        let writer = journal.spawn_writer(&bus);

        bus.publish(BotEvent::TradingResumed);
        bus.publish(BotEvent::BotStopped { reason: "test".to_string() });
        drop(bus);
        writer.await.unwrap();

        let counts = journal.event_counts().await.unwrap();
        assert_eq!(
            counts,
            vec![("bot_stopped".to_string(), 1), ("trading_resumed".to_string(), 1)]
        );
    }
}
