//! Metrics collection using Prometheus
//!
//! Counters and histograms for matching and backfill runs, labelled by
//! channel.

use crate::matching::{BackfillOutcome, MatchOutcome};
use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the matchmaking engine
#[derive(Clone)]
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// New-session matching metrics
    match_metrics: MatchMetrics,

    /// Session backfill metrics
    backfill_metrics: BackfillMetrics,

    /// Run timing
    performance_metrics: PerformanceMetrics,
}

/// New-session matching metrics
#[derive(Clone)]
pub struct MatchMetrics {
    /// Sessions created by the pivot loop
    pub matches_created_total: IntCounterVec,

    /// Tickets placed into a new session
    pub tickets_matched_total: IntCounterVec,

    /// Tickets handed back to the pool after a run
    pub tickets_unmatched_total: IntCounterVec,

    /// Pivots that found no assembly in any region
    pub pivots_dropped_total: IntCounterVec,

    /// Members converted to the wildcard role
    pub role_flexed_total: IntCounterVec,

    /// Tickets in the pool at the start of the latest run
    pub pool_size: IntGaugeVec,
}

/// Session backfill metrics
#[derive(Clone)]
pub struct BackfillMetrics {
    /// Proposals emitted
    pub proposals_total: IntCounterVec,

    /// Sessions that reached their full shape
    pub sessions_satisfied_total: IntCounterVec,

    /// Tickets added to existing sessions
    pub tickets_backfilled_total: IntCounterVec,
}

/// Performance metrics
#[derive(Clone)]
pub struct PerformanceMetrics {
    /// Wall-clock duration of one run
    pub run_duration_seconds: HistogramVec,

    /// Runs that stopped on the time budget
    pub budget_exhausted_total: IntCounterVec,
}

impl MetricsCollector {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Create a collector registering into an existing registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let match_metrics = MatchMetrics::new(&registry)?;
        let backfill_metrics = BackfillMetrics::new(&registry)?;
        let performance_metrics = PerformanceMetrics::new(&registry)?;

        Ok(Self {
            registry,
            match_metrics,
            backfill_metrics,
            performance_metrics,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn matching(&self) -> &MatchMetrics {
        &self.match_metrics
    }

    pub fn backfill(&self) -> &BackfillMetrics {
        &self.backfill_metrics
    }

    pub fn performance(&self) -> &PerformanceMetrics {
        &self.performance_metrics
    }

    /// Record the outcome of one pivot loop run
    pub fn record_match_run(
        &self,
        channel: &str,
        pool_size: usize,
        outcome: &MatchOutcome,
        duration: Duration,
    ) {
        let matched: usize = outcome
            .matches
            .iter()
            .map(|result| result.ticket_ids().len())
            .sum();

        self.match_metrics
            .pool_size
            .with_label_values(&[channel])
            .set(pool_size as i64);
        self.match_metrics
            .matches_created_total
            .with_label_values(&[channel])
            .inc_by(outcome.matches.len() as u64);
        self.match_metrics
            .tickets_matched_total
            .with_label_values(&[channel])
            .inc_by(matched as u64);
        self.match_metrics
            .tickets_unmatched_total
            .with_label_values(&[channel])
            .inc_by(outcome.unmatched.len() as u64);
        self.match_metrics
            .pivots_dropped_total
            .with_label_values(&[channel])
            .inc_by(outcome.dropped_pivots as u64);
        self.match_metrics
            .role_flexed_total
            .with_label_values(&[channel])
            .inc_by(outcome.role_flexed as u64);

        self.record_run_duration("match", channel, duration, outcome.budget_exhausted);
    }

    /// Record the outcome of one backfill run
    pub fn record_backfill_run(&self, channel: &str, outcome: &BackfillOutcome, duration: Duration) {
        let added: usize = outcome
            .proposals
            .iter()
            .map(|proposal| proposal.added_tickets.len())
            .sum();

        self.backfill_metrics
            .proposals_total
            .with_label_values(&[channel])
            .inc_by(outcome.proposals.len() as u64);
        self.backfill_metrics
            .sessions_satisfied_total
            .with_label_values(&[channel])
            .inc_by(outcome.sessions_satisfied as u64);
        self.backfill_metrics
            .tickets_backfilled_total
            .with_label_values(&[channel])
            .inc_by(added as u64);

        self.record_run_duration("backfill", channel, duration, outcome.budget_exhausted);
    }

    fn record_run_duration(&self, kind: &str, channel: &str, duration: Duration, exhausted: bool) {
        self.performance_metrics
            .run_duration_seconds
            .with_label_values(&[kind, channel])
            .observe(duration.as_secs_f64());

        if exhausted {
            self.performance_metrics
                .budget_exhausted_total
                .with_label_values(&[kind, channel])
                .inc();
        }
    }

    /// Render every registered metric in the text exposition format
    pub fn gather_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get the elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl MatchMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let matches_created_total = IntCounterVec::new(
            Opts::new("matchmaker_matches_created_total", "Total sessions created"),
            &["channel"],
        )?;
        registry.register(Box::new(matches_created_total.clone()))?;

        let tickets_matched_total = IntCounterVec::new(
            Opts::new(
                "matchmaker_tickets_matched_total",
                "Total tickets placed into new sessions",
            ),
            &["channel"],
        )?;
        registry.register(Box::new(tickets_matched_total.clone()))?;

        let tickets_unmatched_total = IntCounterVec::new(
            Opts::new(
                "matchmaker_tickets_unmatched_total",
                "Total tickets left unmatched after a run",
            ),
            &["channel"],
        )?;
        registry.register(Box::new(tickets_unmatched_total.clone()))?;

        let pivots_dropped_total = IntCounterVec::new(
            Opts::new(
                "matchmaker_pivots_dropped_total",
                "Total pivots that found no match",
            ),
            &["channel"],
        )?;
        registry.register(Box::new(pivots_dropped_total.clone()))?;

        let role_flexed_total = IntCounterVec::new(
            Opts::new(
                "matchmaker_role_flexed_total",
                "Total members converted to any role",
            ),
            &["channel"],
        )?;
        registry.register(Box::new(role_flexed_total.clone()))?;

        let pool_size = IntGaugeVec::new(
            Opts::new("matchmaker_pool_size", "Tickets in the latest matching run"),
            &["channel"],
        )?;
        registry.register(Box::new(pool_size.clone()))?;

        Ok(Self {
            matches_created_total,
            tickets_matched_total,
            tickets_unmatched_total,
            pivots_dropped_total,
            role_flexed_total,
            pool_size,
        })
    }
}

impl BackfillMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let proposals_total = IntCounterVec::new(
            Opts::new(
                "matchmaker_backfill_proposals_total",
                "Total backfill proposals",
            ),
            &["channel"],
        )?;
        registry.register(Box::new(proposals_total.clone()))?;

        let sessions_satisfied_total = IntCounterVec::new(
            Opts::new(
                "matchmaker_sessions_satisfied_total",
                "Total sessions filled by backfill",
            ),
            &["channel"],
        )?;
        registry.register(Box::new(sessions_satisfied_total.clone()))?;

        let tickets_backfilled_total = IntCounterVec::new(
            Opts::new(
                "matchmaker_tickets_backfilled_total",
                "Total tickets added to existing sessions",
            ),
            &["channel"],
        )?;
        registry.register(Box::new(tickets_backfilled_total.clone()))?;

        Ok(Self {
            proposals_total,
            sessions_satisfied_total,
            tickets_backfilled_total,
        })
    }
}

impl PerformanceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let run_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "matchmaker_run_duration_seconds",
                "Duration of one matching or backfill run",
            )
            .buckets(vec![
                0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0,
            ]),
            &["kind", "channel"],
        )?;
        registry.register(Box::new(run_duration_seconds.clone()))?;

        let budget_exhausted_total = IntCounterVec::new(
            Opts::new(
                "matchmaker_budget_exhausted_total",
                "Total runs stopped by the time budget",
            ),
            &["kind", "channel"],
        )?;
        registry.register(Box::new(budget_exhausted_total.clone()))?;

        Ok(Self {
            run_duration_seconds,
            budget_exhausted_total,
        })
    }
}
