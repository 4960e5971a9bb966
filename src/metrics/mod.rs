//! Performance metrics for completed runs.

mod calculator;

pub use calculator::{max_drawdown, MetricsCalculator, PerformanceMetrics};
