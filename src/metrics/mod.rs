//! Metrics for the matchmaking engine
//!
//! Prometheus counters and histograms describing matching and backfill runs.

pub mod collector;

pub use collector::{
    BackfillMetrics, MatchMetrics, MetricsCollector, MetricsTimer, PerformanceMetrics,
};
