//! Pivot matching loop
//!
//! Repeatedly takes the highest-priority, oldest ticket as pivot, searches
//! its regions and sub-game-modes for a valid assembly, emits a session and
//! starts over with the reduced pool. A pivot that cannot be matched anywhere
//! is set aside so the rest of the pool still gets a chance.

use crate::matching::assembler::{AllyAssembler, Assembly, PartyFinder};
use crate::matching::attributes::{matching_averages, session_attributes};
use crate::matching::filter::{CandidateFilter, Pivot};
use crate::matching::region::pivot_regions;
use crate::matching::{TimeBudget, DEFAULT_MAX_ITERATIONS};
use crate::request::{Alliance, MatchingParty, MatchmakingRequest, MatchmakingResult};
use crate::rules::{apply_role_flexing, flex_alliance_for, flex_rule_set, RuleSet};
use crate::types::{SessionStatus, TicketId};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, VecDeque};
use tracing::{debug, info, warn};

/// What one run produced
#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    pub matches: Vec<MatchmakingResult>,
    /// Tickets left over, dropped pivots included
    pub unmatched: Vec<MatchmakingRequest>,
    pub dropped_pivots: usize,
    pub role_flexed: usize,
    pub budget_exhausted: bool,
}

/// One region / sub-game-mode combination to try for a pivot
#[derive(Debug, Clone, PartialEq)]
struct Attempt {
    sub_game_mode: Option<String>,
    region: Option<String>,
}

enum LoopState {
    SelectPivot,
    SearchRegion {
        pivot: MatchmakingRequest,
        attempts: VecDeque<Attempt>,
    },
    Emit(MatchmakingResult),
    Done,
}

/// Forms new sessions from a ticket pool under one rule set
pub struct PivotMatcher<'a> {
    rules: &'a RuleSet,
    channel: String,
    now: DateTime<Utc>,
    max_iterations: usize,
}

impl<'a> PivotMatcher<'a> {
    pub fn new(rules: &'a RuleSet, channel: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            rules,
            channel: channel.into(),
            now,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Match as much of `tickets` as the rules and `budget` allow
    pub fn run(&self, tickets: Vec<MatchmakingRequest>, budget: &TimeBudget) -> MatchOutcome {
        let mut pool = tickets;
        let mut outcome = MatchOutcome {
            role_flexed: apply_role_flexing(&mut pool, self.rules, self.now),
            ..MatchOutcome::default()
        };

        if self.is_single_player_match() {
            self.match_single_players(pool, &mut outcome);
            return outcome;
        }

        let mut state = LoopState::SelectPivot;
        loop {
            state = match state {
                LoopState::SelectPivot => self.select_pivot(&mut pool, budget, &mut outcome),
                LoopState::SearchRegion {
                    pivot,
                    mut attempts,
                } => match attempts.pop_front() {
                    Some(attempt) => match self.try_attempt(&pivot, &attempt, &pool) {
                        Some(result) => LoopState::Emit(result),
                        None => LoopState::SearchRegion { pivot, attempts },
                    },
                    None => {
                        debug!("Dropping pivot {}: no valid assembly", pivot.ticket_id);
                        pool.retain(|ticket| ticket.ticket_id != pivot.ticket_id);
                        outcome.unmatched.push(pivot);
                        outcome.dropped_pivots += 1;
                        LoopState::SelectPivot
                    }
                },
                LoopState::Emit(result) => {
                    let matched: BTreeSet<TicketId> = result.ticket_ids().into_iter().collect();
                    pool.retain(|ticket| !matched.contains(&ticket.ticket_id));
                    info!(
                        "Created match {} with {} players in {} alliances ({})",
                        result.match_id,
                        result.player_count(),
                        result.alliances.len(),
                        result.status
                    );
                    outcome.matches.push(result);
                    LoopState::SelectPivot
                }
                LoopState::Done => break,
            };
        }

        outcome.unmatched.extend(pool);
        outcome
    }

    fn is_single_player_match(&self) -> bool {
        self.rules.alliance.is_single_player_single_team()
            && self.rules.alliance_flexing_rules.is_empty()
            && self.rules.sub_game_modes.is_empty()
    }

    /// Every solo ticket is its own match
    fn match_single_players(&self, mut pool: Vec<MatchmakingRequest>, outcome: &mut MatchOutcome) {
        sort_pool(&mut pool);
        for ticket in pool {
            if ticket.player_count() != 1 {
                outcome.unmatched.push(ticket);
                continue;
            }
            let mut alliance = Alliance::new("team-0");
            alliance.add_party(MatchingParty::from_ticket(&ticket));

            let mut result = MatchmakingResult::new(self.channel.clone(), ticket.created_at).with_alliance(alliance);
            result.party_attributes = session_attributes(self.rules, &ticket, &[]);
            result.matching_attributes = matching_averages(self.rules, &[&ticket]);
            result.priority = ticket.priority;
            result.status = SessionStatus::Satisfied;
            result.joinable = false;
            outcome.matches.push(result);
        }
    }

    fn select_pivot(
        &self,
        pool: &mut Vec<MatchmakingRequest>,
        budget: &TimeBudget,
        outcome: &mut MatchOutcome,
    ) -> LoopState {
        if pool.is_empty() {
            return LoopState::Done;
        }
        if budget.exhausted() {
            warn!(
                "Time budget exhausted after {}ms with {} tickets left",
                budget.elapsed().as_millis(),
                pool.len()
            );
            outcome.budget_exhausted = true;
            return LoopState::Done;
        }

        sort_pool(pool);
        let pivot = pool[0].clone();
        let attempts = self.attempts_for(&pivot);

        let min_viable = attempts
            .iter()
            .map(|attempt| {
                flex_alliance_for(self.rules, attempt.sub_game_mode.as_deref(), pivot.created_at, self.now)
                    .0
                    .min_players()
            })
            .min()
            .unwrap_or(0);
        let pool_players: usize = pool.iter().map(MatchmakingRequest::player_count).sum();
        if pool_players < self.rules.smallest_min_players() {
            debug!("Pool of {} players below every alliance minimum, stopping", pool_players);
            return LoopState::Done;
        }
        if pool_players < min_viable {
            debug!(
                "Dropping pivot {}: pool of {} players below its minimum of {}",
                pivot.ticket_id, pool_players, min_viable
            );
            pool.remove(0);
            outcome.unmatched.push(pivot);
            outcome.dropped_pivots += 1;
            return LoopState::SelectPivot;
        }

        debug!(
            "Selected pivot {} (priority {}, {} attempts)",
            pivot.ticket_id,
            pivot.priority,
            attempts.len()
        );
        LoopState::SearchRegion { pivot, attempts }
    }

    /// Declared sub-game-modes in name order, each crossed with the pivot's regions
    fn attempts_for(&self, pivot: &MatchmakingRequest) -> VecDeque<Attempt> {
        let mut modes: Vec<Option<String>> = pivot
            .sub_game_modes()
            .into_iter()
            .filter(|mode| self.rules.sub_game_modes.contains_key(mode))
            .map(Some)
            .collect();
        if modes.is_empty() {
            modes.push(None);
        }

        let regions = pivot_regions(self.rules, pivot, self.now);
        modes
            .iter()
            .flat_map(|mode| {
                regions.iter().map(move |region| Attempt {
                    sub_game_mode: mode.clone(),
                    region: region.clone(),
                })
            })
            .collect()
    }

    fn try_attempt(
        &self,
        pivot: &MatchmakingRequest,
        attempt: &Attempt,
        pool: &[MatchmakingRequest],
    ) -> Option<MatchmakingResult> {
        let mode = attempt.sub_game_mode.as_deref();
        let (mut active, _) = flex_rule_set(self.rules, pivot.created_at, self.now);
        active.alliance = flex_alliance_for(self.rules, mode, pivot.created_at, self.now).0;

        let candidates: Vec<&MatchmakingRequest> = pool
            .iter()
            .filter(|ticket| ticket.ticket_id != pivot.ticket_id)
            .collect();

        let mut filter = CandidateFilter::new(
            self.rules,
            &active,
            Pivot::Ticket(pivot),
            attempt.region.as_deref(),
            mode,
            self.now,
        );
        let ordered: Vec<&MatchmakingRequest> = filter
            .filter(&candidates)
            .into_iter()
            .map(|candidate| candidate.ticket)
            .collect();

        let assembly = PartyFinder::for_alliance(&active.alliance, self.max_iterations).assemble(
            pivot,
            &ordered,
            &active.alliance,
            active.blocked_player_option,
        )?;
        if assembly.teams.len() < active.alliance.min_number {
            return None;
        }

        Some(self.build_result(pivot, &assembly, &active, attempt, pool))
    }

    fn build_result(
        &self,
        pivot: &MatchmakingRequest,
        assembly: &Assembly,
        active: &RuleSet,
        attempt: &Attempt,
        pool: &[MatchmakingRequest],
    ) -> MatchmakingResult {
        let find = |ticket_id: &TicketId| pool.iter().find(|ticket| &ticket.ticket_id == ticket_id);

        let mut alliances = Vec::with_capacity(assembly.teams.len());
        let mut matched: Vec<&MatchmakingRequest> = Vec::new();
        for (index, team) in assembly.teams.iter().enumerate() {
            let mut alliance = Alliance::new(format!("team-{}", index));
            for ticket in team.ticket_ids.iter().filter_map(find) {
                let mut party = MatchingParty::from_ticket(ticket);
                for member in &mut party.party_members {
                    if let Some(role) = team.roles.get(&member.user_id) {
                        member.assigned_role = Some(role.clone());
                    }
                }
                alliance.add_party(party);
                matched.push(ticket);
            }
            alliances.push(alliance);
        }

        let created_at = matched
            .iter()
            .map(|ticket| ticket.created_at)
            .min()
            .unwrap_or(pivot.created_at);
        let others: Vec<&MatchmakingRequest> = matched
            .iter()
            .copied()
            .filter(|ticket| ticket.ticket_id != pivot.ticket_id)
            .collect();

        let mut result = MatchmakingResult::new(self.channel.clone(), created_at);
        result.sub_game_mode = attempt.sub_game_mode.clone();
        result.region = attempt.region.clone();
        result.alliances = alliances;
        result.party_attributes = session_attributes(active, pivot, &others);
        result.matching_attributes = matching_averages(active, &matched);
        result.priority = matched.iter().map(|ticket| ticket.priority).max().unwrap_or(0);

        if assembly.is_full(&active.alliance) {
            result.status = SessionStatus::Satisfied;
            result.joinable = false;
        } else {
            result.status = SessionStatus::Forming;
            result.joinable = active.auto_backfill;
        }
        result
    }
}

/// Priority first, then oldest first
pub fn sort_pool(pool: &mut [MatchmakingRequest]) {
    pool.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.ticket_id.cmp(&b.ticket_id))
    });
}
