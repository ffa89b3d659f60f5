//! Matchmaker facade
//!
//! Pulls tickets from a [`TicketProvider`], splits them into fixed-size
//! batches and runs one independent matching run per batch. Every run owns
//! its tickets; the rule set is shared read-only. The result channel closes
//! once the last run has sent its output.

use crate::config::AppConfig;
use crate::engine::provider::TicketProvider;
use crate::error::Result;
use crate::matching::{BackfillOutcome, MatchOutcome, PivotMatcher, SessionMatcher, TimeBudget};
use crate::metrics::MetricsCollector;
use crate::request::{BackfillProposal, BackfillTicket, MatchmakingRequest, MatchmakingResult};
use crate::rules::RuleSet;
use crate::utils::{Clock, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Knobs the engine reads at run time
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Tickets per independent run
    pub batch_size: usize,
    /// Orderings tried per assembly
    pub max_iterations: usize,
    /// Wall-clock budget per run
    pub time_budget: Duration,
    /// Capacity of the result channel
    pub result_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for EngineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            batch_size: config.matchmaking.batch_size.max(1),
            max_iterations: config.matchmaking.max_iterations.max(1),
            time_budget: config.time_budget(),
            result_buffer: config.matchmaking.result_buffer.max(1),
        }
    }
}

/// Rules either already decoded or still raw JSON
#[derive(Debug, Clone)]
pub enum RuleInput {
    Structured(RuleSet),
    Json(serde_json::Value),
}

impl RuleInput {
    /// Decoded rule set with defaults applied and bounds validated
    pub fn resolve(self) -> Result<RuleSet> {
        match self {
            RuleInput::Structured(mut rules) => {
                rules.apply_defaults();
                rules.validate()?;
                Ok(rules)
            }
            RuleInput::Json(value) => RuleSet::from_json(&value),
        }
    }
}

impl From<RuleSet> for RuleInput {
    fn from(rules: RuleSet) -> Self {
        RuleInput::Structured(rules)
    }
}

impl From<serde_json::Value> for RuleInput {
    fn from(value: serde_json::Value) -> Self {
        RuleInput::Json(value)
    }
}

/// Entry point for matching and backfill ticks
#[derive(Clone)]
pub struct Matchmaker {
    settings: EngineSettings,
    metrics_collector: Arc<MetricsCollector>,
    clock: Arc<dyn Clock>,
}

impl Matchmaker {
    /// Create a matchmaker with its own metrics registry
    pub fn new(settings: EngineSettings) -> Result<Self> {
        Ok(Self::with_metrics(settings, Arc::new(MetricsCollector::new()?)))
    }

    /// Create a matchmaker recording into an existing collector
    pub fn with_metrics(settings: EngineSettings, metrics_collector: Arc<MetricsCollector>) -> Self {
        Self {
            settings,
            metrics_collector,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used for flexing and region expansion
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics_collector.clone()
    }

    /// Form new sessions from the provider's ticket stream.
    ///
    /// Rules that fail to decode are logged and yield a channel that is
    /// already closed.
    pub fn make_matches(
        &self,
        provider: Arc<dyn TicketProvider>,
        channel: &str,
        rules: impl Into<RuleInput>,
    ) -> mpsc::Receiver<MatchmakingResult> {
        let (tx, rx) = mpsc::channel(self.settings.result_buffer);
        let rules = match rules.into().resolve() {
            Ok(rules) => Arc::new(rules),
            Err(e) => {
                error!("Rejecting rule set for channel {}: {}", channel, e);
                return rx;
            }
        };

        let engine = self.clone();
        let channel = channel.to_string();
        tokio::spawn(async move {
            engine.drive_matching(provider, channel, rules, tx).await;
        });
        rx
    }

    async fn drive_matching(
        &self,
        provider: Arc<dyn TicketProvider>,
        channel: String,
        rules: Arc<RuleSet>,
        tx: mpsc::Sender<MatchmakingResult>,
    ) {
        let mut tickets = match provider.tickets(&channel).await {
            Ok(tickets) => tickets,
            Err(e) => {
                error!("Failed to open ticket stream for {}: {}", channel, e);
                return;
            }
        };

        let mut batch = Vec::with_capacity(self.settings.batch_size);
        let mut batches = 0;
        while let Some(ticket) = tickets.recv().await {
            batch.push(ticket);
            if batch.len() >= self.settings.batch_size {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(self.settings.batch_size));
                self.spawn_matching(&channel, &rules, full, &tx);
                batches += 1;
            }
        }
        if !batch.is_empty() {
            self.spawn_matching(&channel, &rules, batch, &tx);
            batches += 1;
        }

        debug!("Dispatched {} matching batches for {}", batches, channel);
    }

    fn spawn_matching(
        &self,
        channel: &str,
        rules: &Arc<RuleSet>,
        batch: Vec<MatchmakingRequest>,
        tx: &mpsc::Sender<MatchmakingResult>,
    ) {
        let engine = self.clone();
        let channel = channel.to_string();
        let rules = rules.clone();
        let tx = tx.clone();
        let channel_label = channel.clone();

        tokio::spawn(async move {
            let run = tokio::task::spawn_blocking(move || engine.run_matching(&rules, &channel, batch));
            match run.await {
                Ok(outcome) => {
                    debug!(
                        "Batch on {} left {} tickets unmatched",
                        channel_label,
                        outcome.unmatched.len()
                    );
                    for result in outcome.matches {
                        if tx.send(result).await.is_err() {
                            warn!("Result receiver dropped, discarding remaining matches");
                            break;
                        }
                    }
                }
                Err(e) => error!("Matching run failed: {}", e),
            }
        });
    }

    /// One pivot loop run over `tickets`
    pub fn run_matching(
        &self,
        rules: &RuleSet,
        channel: &str,
        tickets: Vec<MatchmakingRequest>,
    ) -> MatchOutcome {
        let timer = self.metrics_collector.start_timer();
        let budget = TimeBudget::new(self.settings.time_budget);
        let pool_size = tickets.len();

        info!("Matching {} tickets on channel {}", pool_size, channel);

        let outcome = PivotMatcher::new(rules, channel, self.clock.now())
            .with_max_iterations(self.settings.max_iterations)
            .run(tickets, &budget);

        let duration = timer.stop();
        self.metrics_collector
            .record_match_run(channel, pool_size, &outcome, duration);

        info!(
            "Matching on {} finished: {} matches, {} unmatched in {}ms",
            channel,
            outcome.matches.len(),
            outcome.unmatched.len(),
            duration.as_millis()
        );
        outcome
    }

    /// Extend the provider's open sessions with its free tickets.
    ///
    /// Both streams are read concurrently. Each full ticket batch runs as soon
    /// as at least one session is waiting, taking every waiting session; what
    /// remains when the streams close is dealt round-robin. Rules that fail to
    /// decode yield a closed channel.
    pub fn backfill_matches(
        &self,
        provider: Arc<dyn TicketProvider>,
        channel: &str,
        rules: impl Into<RuleInput>,
    ) -> mpsc::Receiver<BackfillProposal> {
        let (tx, rx) = mpsc::channel(self.settings.result_buffer);
        let rules = match rules.into().resolve() {
            Ok(rules) => Arc::new(rules),
            Err(e) => {
                error!("Rejecting backfill rule set for channel {}: {}", channel, e);
                return rx;
            }
        };

        let engine = self.clone();
        let channel = channel.to_string();
        tokio::spawn(async move {
            engine.drive_backfill(provider, channel, rules, tx).await;
        });
        rx
    }

    async fn drive_backfill(
        &self,
        provider: Arc<dyn TicketProvider>,
        channel: String,
        rules: Arc<RuleSet>,
        tx: mpsc::Sender<BackfillProposal>,
    ) {
        let (tickets, sessions) = tokio::join!(
            provider.tickets(&channel),
            provider.backfill_tickets(&channel)
        );
        let (mut tickets, mut sessions) = match (tickets, sessions) {
            (Ok(tickets), Ok(sessions)) => (tickets, sessions),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to open backfill streams for {}: {}", channel, e);
                return;
            }
        };

        let batch_size = self.settings.batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size);
        // Full ticket batches waiting for a session to arrive
        let mut ready: Vec<Vec<MatchmakingRequest>> = Vec::new();
        let mut waiting_sessions: Vec<BackfillTicket> = Vec::new();
        let mut tickets_open = true;
        let mut sessions_open = true;
        let mut batches = 0;

        loop {
            tokio::select! {
                ticket = tickets.recv(), if tickets_open => match ticket {
                    Some(ticket) => {
                        batch.push(ticket);
                        if batch.len() >= batch_size {
                            ready.push(std::mem::replace(&mut batch, Vec::with_capacity(batch_size)));
                        }
                    }
                    None => tickets_open = false,
                },
                session = sessions.recv(), if sessions_open => match session {
                    Some(session) => waiting_sessions.push(session),
                    None => sessions_open = false,
                },
                else => break,
            }

            while !waiting_sessions.is_empty() {
                let Some(full) = ready.pop() else {
                    break;
                };
                self.spawn_backfill(&channel, &rules, std::mem::take(&mut waiting_sessions), full, &tx);
                batches += 1;
            }

            if !sessions_open && waiting_sessions.is_empty() {
                debug!("No sessions left to backfill on {}", channel);
                break;
            }
        }

        // Deal what is left round-robin
        let leftover: Vec<MatchmakingRequest> = ready.into_iter().flatten().chain(batch).collect();
        for (sessions, tickets) in partition(waiting_sessions, leftover, batch_size) {
            if tickets.is_empty() {
                continue;
            }
            self.spawn_backfill(&channel, &rules, sessions, tickets, &tx);
            batches += 1;
        }

        debug!("Dispatched {} backfill batches for {}", batches, channel);
    }

    fn spawn_backfill(
        &self,
        channel: &str,
        rules: &Arc<RuleSet>,
        sessions: Vec<BackfillTicket>,
        tickets: Vec<MatchmakingRequest>,
        tx: &mpsc::Sender<BackfillProposal>,
    ) {
        let engine = self.clone();
        let channel = channel.to_string();
        let rules = rules.clone();
        let tx = tx.clone();
        let channel_label = channel.clone();

        tokio::spawn(async move {
            let run = tokio::task::spawn_blocking(move || {
                engine.run_backfill(&rules, &channel, sessions, tickets)
            });
            match run.await {
                Ok(outcome) => {
                    debug!(
                        "Backfill batch on {} left {} tickets free",
                        channel_label,
                        outcome.unmatched.len()
                    );
                    for proposal in outcome.proposals {
                        if tx.send(proposal).await.is_err() {
                            warn!("Proposal receiver dropped, discarding remaining proposals");
                            break;
                        }
                    }
                }
                Err(e) => error!("Backfill run failed: {}", e),
            }
        });
    }

    /// One backfill run over `sessions` and `tickets`
    pub fn run_backfill(
        &self,
        rules: &RuleSet,
        channel: &str,
        sessions: Vec<BackfillTicket>,
        tickets: Vec<MatchmakingRequest>,
    ) -> BackfillOutcome {
        let timer = self.metrics_collector.start_timer();
        let budget = TimeBudget::new(self.settings.time_budget);

        info!(
            "Backfilling {} sessions from {} tickets on channel {}",
            sessions.len(),
            tickets.len(),
            channel
        );

        let outcome = SessionMatcher::new(rules, self.clock.now()).run(sessions, tickets, &budget);

        let duration = timer.stop();
        self.metrics_collector
            .record_backfill_run(channel, &outcome, duration);

        info!(
            "Backfill on {} finished: {} proposals, {} sessions satisfied in {}ms",
            channel,
            outcome.proposals.len(),
            outcome.sessions_satisfied,
            duration.as_millis()
        );
        outcome
    }
}

/// Cut `tickets` into batches and deal `sessions` round-robin over them
fn partition(
    sessions: Vec<BackfillTicket>,
    tickets: Vec<MatchmakingRequest>,
    batch_size: usize,
) -> Vec<(Vec<BackfillTicket>, Vec<MatchmakingRequest>)> {
    let batch_size = batch_size.max(1);
    let mut batches: Vec<(Vec<BackfillTicket>, Vec<MatchmakingRequest>)> = Vec::new();
    let mut tickets = tickets.into_iter().peekable();
    while tickets.peek().is_some() {
        let chunk: Vec<MatchmakingRequest> = tickets.by_ref().take(batch_size).collect();
        batches.push((Vec::new(), chunk));
    }
    if batches.is_empty() {
        batches.push((Vec::new(), Vec::new()));
    }

    let count = batches.len();
    for (index, session) in sessions.into_iter().enumerate() {
        batches[index % count].0.push(session);
    }
    batches.retain(|(sessions, _)| !sessions.is_empty());
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::provider::StaticTicketProvider;
    use crate::request::PartyMember;
    use crate::rules::AllianceRule;
    use crate::utils::current_timestamp;
    use serde_json::json;

    fn create_test_rules() -> RuleSet {
        RuleSet::new(AllianceRule::new(2, 2, 1, 1))
    }

    fn create_test_tickets(count: usize) -> Vec<MatchmakingRequest> {
        let now = current_timestamp();
        (0..count)
            .map(|i| {
                MatchmakingRequest::new(format!("t{}", i), now - chrono::Duration::seconds(i as i64))
                    .with_channel("ranked")
                    .with_member(PartyMember::new(format!("u{}", i)))
            })
            .collect()
    }

    fn create_test_settings(batch_size: usize) -> EngineSettings {
        EngineSettings {
            batch_size,
            max_iterations: 50,
            time_budget: Duration::from_secs(5),
            result_buffer: 16,
        }
    }

    #[test]
    fn test_rule_input_resolution() {
        let rules = RuleInput::from(create_test_rules()).resolve().unwrap();
        assert!(rules.defaults_applied());

        assert!(RuleInput::from(json!({ "alliance": "two teams" }))
            .resolve()
            .is_err());
    }

    #[test]
    fn test_run_matching_records_metrics() {
        let engine = Matchmaker::new(create_test_settings(10)).unwrap();
        let outcome = engine.run_matching(&create_test_rules(), "ranked", create_test_tickets(5));

        assert_eq!(outcome.matches.len(), 2);
        assert_eq!(outcome.unmatched.len(), 1);
        assert_eq!(
            engine
                .metrics()
                .matching()
                .matches_created_total
                .with_label_values(&["ranked"])
                .get(),
            2
        );
    }

    #[test]
    fn test_partition_deals_sessions_round_robin() {
        let now = current_timestamp();
        let sessions: Vec<BackfillTicket> = (0..3)
            .map(|_| BackfillTicket::new(MatchmakingResult::new("ranked", now)))
            .collect();

        let batches = partition(sessions, create_test_tickets(5), 2);
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|(sessions, _)| sessions.len() == 1));
        assert_eq!(batches[2].1.len(), 1);
    }

    #[test]
    fn test_partition_without_tickets_keeps_sessions() {
        let now = current_timestamp();
        let sessions = vec![BackfillTicket::new(MatchmakingResult::new("ranked", now))];
        let batches = partition(sessions, Vec::new(), 10);
        assert_eq!(batches.len(), 1);
        assert!(batches[0].1.is_empty());
    }

    #[tokio::test]
    async fn test_make_matches_batches_independently() {
        let engine = Matchmaker::new(create_test_settings(2)).unwrap();
        let provider = Arc::new(StaticTicketProvider::new(create_test_tickets(6), Vec::new()));

        let mut rx = engine.make_matches(provider, "ranked", create_test_rules());
        let mut results = Vec::new();
        while let Some(result) = rx.recv().await {
            results.push(result);
        }
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn test_bad_rules_close_stream() {
        let engine = Matchmaker::new(create_test_settings(2)).unwrap();
        let provider = Arc::new(StaticTicketProvider::new(create_test_tickets(4), Vec::new()));

        let mut rx = engine.make_matches(provider, "ranked", json!([1, 2, 3]));
        assert!(rx.recv().await.is_none());
    }
}
