//! Backfill: extending existing sessions with free tickets
//!
//! Sessions are processed oldest first, each with rules flexed by its own
//! age. Every candidate accepted by the filter is placed into the alliance
//! with the fewest players that can still take it, or into a new alliance
//! while the team cap allows. The time budget is shared by every session of
//! the run.

use crate::matching::assembler::{PartyFinder, RoleMode};
use crate::matching::attributes::{merge_attributes, ticket_attributes};
use crate::matching::filter::{CandidateFilter, Pivot};
use crate::matching::roles::{RoleTally, Slot};
use crate::matching::TimeBudget;
use crate::request::session::RunningAverage;
use crate::request::{
    Alliance, BackfillProposal, BackfillTicket, MatchingParty, MatchmakingRequest, MatchmakingResult, PartyMember,
};
use crate::rules::{flex_alliance_for, flex_rule_set, AllianceRule, BlockedPlayerOption, RuleSet};
use crate::types::{SessionStatus, TicketId, UserId};
use crate::utils::generate_match_id;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// What one backfill run produced
#[derive(Debug, Clone, Default)]
pub struct BackfillOutcome {
    pub proposals: Vec<BackfillProposal>,
    /// Every session, updated in place
    pub sessions: Vec<BackfillTicket>,
    pub unmatched: Vec<MatchmakingRequest>,
    pub sessions_satisfied: usize,
    pub budget_exhausted: bool,
}

/// Where a ticket goes inside a session
#[derive(Debug, Clone, PartialEq)]
struct Placement {
    /// `None` opens a new alliance
    alliance: Option<usize>,
    roles: BTreeMap<UserId, String>,
}

/// Fit `newcomers` into a team's role quotas, given its current members
fn role_fit(
    rule: &AllianceRule,
    role_mode: RoleMode,
    team_index: usize,
    existing: &[&PartyMember],
    newcomers: &[PartyMember],
) -> Option<BTreeMap<UserId, String>> {
    let combination = match (&rule.combination, role_mode) {
        (Some(combination), RoleMode::Combo | RoleMode::Unique) => combination,
        _ => return Some(BTreeMap::new()),
    };
    let roles = combination.roles_for_team(team_index);
    if roles.is_empty() {
        return Some(BTreeMap::new());
    }

    let mut tally = RoleTally::new(roles, role_mode == RoleMode::Unique);
    let mut existing_wildcards = 0;
    for member in existing {
        match &member.assigned_role {
            Some(role) => tally.force(role),
            None => {
                if let Some(Slot::Wildcard) = tally.try_assign(member) {
                    existing_wildcards += 1;
                }
            }
        }
    }

    let slots = tally.try_assign_all(newcomers)?;
    let resolved = tally.resolve_wildcards();
    let mut next_wildcard = existing_wildcards;
    let mut roles = BTreeMap::new();
    for (member, slot) in newcomers.iter().zip(slots) {
        let role = match slot {
            Slot::Role(role) => Some(role),
            Slot::Wildcard => {
                let role = resolved.get(next_wildcard).cloned();
                next_wildcard += 1;
                role
            }
        };
        if let Some(role) = role {
            roles.insert(member.user_id.clone(), role);
        }
    }
    Some(roles)
}

/// Extends sessions with tickets from a free pool
pub struct SessionMatcher<'a> {
    rules: &'a RuleSet,
    now: DateTime<Utc>,
}

impl<'a> SessionMatcher<'a> {
    pub fn new(rules: &'a RuleSet, now: DateTime<Utc>) -> Self {
        Self { rules, now }
    }

    pub fn run(
        &self,
        sessions: Vec<BackfillTicket>,
        tickets: Vec<MatchmakingRequest>,
        budget: &TimeBudget,
    ) -> BackfillOutcome {
        let mut sessions = sessions;
        sessions.sort_by(|a, b| {
            a.session
                .created_at
                .cmp(&b.session.created_at)
                .then_with(|| a.ticket_id.cmp(&b.ticket_id))
        });

        let mut pool = tickets;
        let mut outcome = BackfillOutcome::default();

        for mut backfill in sessions {
            if outcome.budget_exhausted || budget.exhausted() {
                if !outcome.budget_exhausted {
                    warn!(
                        "Backfill time budget exhausted after {}ms",
                        budget.elapsed().as_millis()
                    );
                }
                outcome.budget_exhausted = true;
                outcome.sessions.push(backfill);
                continue;
            }

            let added = self.backfill_session(&mut backfill.session, &mut pool, budget, &mut outcome);
            if !added.is_empty() {
                if backfill.session.status == SessionStatus::Satisfied {
                    outcome.sessions_satisfied += 1;
                }
                outcome.proposals.push(BackfillProposal {
                    proposal_id: generate_match_id(),
                    backfill_ticket_id: backfill.ticket_id.clone(),
                    match_id: backfill.session.match_id.clone(),
                    added_tickets: added,
                    alliances: backfill.session.alliances.clone(),
                    status: backfill.session.status,
                    created_at: self.now,
                });
            }
            outcome.sessions.push(backfill);
        }

        outcome.unmatched = pool;
        outcome
    }

    /// Returns the tickets added to `session`
    fn backfill_session(
        &self,
        session: &mut MatchmakingResult,
        pool: &mut Vec<MatchmakingRequest>,
        budget: &TimeBudget,
        outcome: &mut BackfillOutcome,
    ) -> Vec<TicketId> {
        let mode = session.sub_game_mode.clone();
        let (mut active, _) = flex_rule_set(self.rules, session.created_at, self.now);
        active.alliance = flex_alliance_for(self.rules, mode.as_deref(), session.created_at, self.now).0;

        if session.is_satisfied(&active.alliance) {
            session.refresh_status(&active.alliance, false);
            return Vec::new();
        }

        // Filter state commits on acceptance, before placement: a ticket that
        // fits no alliance keeps its unique claims for this session.
        let accepted: Vec<TicketId> = {
            let candidates: Vec<&MatchmakingRequest> = pool.iter().collect();
            let region = session.region.clone();
            let mut filter = CandidateFilter::new(
                self.rules,
                &active,
                Pivot::Session(session),
                region.as_deref(),
                mode.as_deref(),
                self.now,
            );
            filter
                .filter(&candidates)
                .into_iter()
                .map(|candidate| candidate.ticket.ticket_id.clone())
                .collect()
        };

        let role_mode = PartyFinder::for_alliance(&active.alliance, 1).role_mode();
        let mut added = Vec::new();

        for ticket_id in accepted {
            if budget.exhausted() {
                warn!(
                    "Backfill time budget exhausted after {}ms while filling {}",
                    budget.elapsed().as_millis(),
                    session.match_id
                );
                outcome.budget_exhausted = true;
                break;
            }

            let position = match pool.iter().position(|ticket| ticket.ticket_id == ticket_id) {
                Some(position) => position,
                None => continue,
            };
            let placement = match self.place(session, &pool[position], &active, role_mode) {
                Some(placement) => placement,
                None => continue,
            };

            let ticket = pool.remove(position);
            self.apply(session, &ticket, placement, &active);
            debug!(
                "Backfilled ticket {} into session {} ({} players)",
                ticket.ticket_id,
                session.match_id,
                session.player_count()
            );
            added.push(ticket.ticket_id);

            session.refresh_status(&active.alliance, true);
            if session.status == SessionStatus::Satisfied {
                info!("Session {} satisfied by backfill", session.match_id);
                break;
            }
        }

        added
    }

    fn place(
        &self,
        session: &MatchmakingResult,
        ticket: &MatchmakingRequest,
        active: &RuleSet,
        role_mode: RoleMode,
    ) -> Option<Placement> {
        let rule = &active.alliance;
        let users = ticket.user_ids();
        let blocked = ticket.blocked_players();
        let mut best: Option<(usize, Placement)> = None;

        for (index, alliance) in session.alliances.iter().enumerate() {
            let players = alliance.player_count();
            if players + ticket.player_count() > rule.player_max_number {
                continue;
            }
            if active.blocked_player_option == BlockedPlayerOption::CanMatchOnDifferentTeam
                && (!alliance.blocked_players().is_disjoint(&users)
                    || !blocked.is_disjoint(&alliance.user_ids()))
            {
                continue;
            }
            let existing: Vec<&PartyMember> = alliance.members().collect();
            let roles = match role_fit(rule, role_mode, index, &existing, &ticket.party_members) {
                Some(roles) => roles,
                None => continue,
            };
            if best.as_ref().map(|(fewest, _)| players < *fewest).unwrap_or(true) {
                best = Some((
                    players,
                    Placement {
                        alliance: Some(index),
                        roles,
                    },
                ));
            }
        }

        if let Some((_, placement)) = best {
            return Some(placement);
        }

        let team_index = session.alliances.len();
        if team_index < rule.max_number && ticket.player_count() <= rule.player_max_number {
            let roles = role_fit(rule, role_mode, team_index, &[], &ticket.party_members)?;
            return Some(Placement { alliance: None, roles });
        }
        None
    }

    fn apply(
        &self,
        session: &mut MatchmakingResult,
        ticket: &MatchmakingRequest,
        placement: Placement,
        active: &RuleSet,
    ) {
        let prior_players = session.player_count();
        let prior: Vec<(String, f64)> = active
            .matching_rules
            .iter()
            .map(|rule| (rule.attribute.clone(), session.attribute_value(&rule.attribute)))
            .collect();

        let mut party = MatchingParty::from_ticket(ticket);
        for member in &mut party.party_members {
            if let Some(role) = placement.roles.get(&member.user_id) {
                member.assigned_role = Some(role.clone());
            }
        }

        match placement.alliance {
            Some(index) => session.alliances[index].add_party(party),
            None => {
                let mut alliance = Alliance::new(format!("team-{}", session.alliances.len()));
                alliance.add_party(party);
                session.alliances.push(alliance);
            }
        }

        for (attribute, value) in prior {
            session
                .matching_attributes
                .entry(attribute.clone())
                .or_insert_with(|| RunningAverage::new(value, prior_players))
                .absorb(ticket.attribute_average(&attribute), ticket.player_count());
        }

        session.party_attributes = merge_attributes(
            active,
            &session.party_attributes,
            &[ticket_attributes(active, ticket)],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{MatchOptionType, MatchingRule, Role, RoleCombination};
    use crate::types::keys;
    use crate::utils::current_timestamp;
    use chrono::Duration;

    fn create_test_rules() -> RuleSet {
        RuleSet::new(AllianceRule::new(2, 2, 1, 2)).with_matching_rule(MatchingRule::distance("mmr", 200.0))
    }

    fn create_test_ticket(id: &str, mmr: f64, now: DateTime<Utc>) -> MatchmakingRequest {
        MatchmakingRequest::new(id, now).with_rated_member(&format!("{}-user", id), "mmr", mmr)
    }

    fn create_test_session(id: &str, teams: &[&[&str]], now: DateTime<Utc>) -> BackfillTicket {
        let mut session = MatchmakingResult::new("ch", now - Duration::seconds(5)).with_match_id(id);
        for (index, users) in teams.iter().enumerate() {
            let tickets: Vec<MatchmakingRequest> = users
                .iter()
                .map(|user| MatchmakingRequest::new(format!("{}-ticket", user), now).with_rated_member(user, "mmr", 1500.0))
                .collect();
            let user_ids: Vec<UserId> = users.iter().map(|u| u.to_string()).collect();
            session.alliances.push(Alliance::from_members(format!("team-{}", index), &user_ids, &tickets));
        }
        BackfillTicket::new(session)
    }

    #[test]
    fn test_fills_smallest_alliance_first() {
        let now = current_timestamp();
        let rules = create_test_rules();
        let sessions = vec![create_test_session("s1", &[&["a", "b"], &["c"]], now)];
        let tickets = vec![create_test_ticket("t1", 1500.0, now)];

        let outcome = SessionMatcher::new(&rules, now).run(sessions, tickets, &TimeBudget::unlimited());

        assert_eq!(outcome.proposals.len(), 1);
        let proposal = &outcome.proposals[0];
        assert_eq!(proposal.added_tickets, vec!["t1".to_string()]);
        assert_eq!(proposal.status, SessionStatus::Satisfied);
        assert_eq!(outcome.sessions[0].session.team_sizes(), vec![2, 2]);
        assert_eq!(outcome.sessions_satisfied, 1);
    }

    #[test]
    fn test_opens_new_alliance_under_cap() {
        let now = current_timestamp();
        let rules = create_test_rules();
        let sessions = vec![create_test_session("s1", &[&["a", "b"]], now)];
        let tickets = vec![create_test_ticket("t1", 1500.0, now)];

        let outcome = SessionMatcher::new(&rules, now).run(sessions, tickets, &TimeBudget::unlimited());

        let session = &outcome.sessions[0].session;
        assert_eq!(session.team_sizes(), vec![2, 1]);
        assert_eq!(session.status, SessionStatus::Updated);
        assert!(session.joinable);
    }

    #[test]
    fn test_running_average_updated() {
        let now = current_timestamp();
        let rules = create_test_rules();
        let sessions = vec![create_test_session("s1", &[&["a"], &["c"]], now)];
        let tickets = vec![create_test_ticket("t1", 1600.0, now)];

        let outcome = SessionMatcher::new(&rules, now).run(sessions, tickets, &TimeBudget::unlimited());
        let average = outcome.sessions[0].session.matching_attributes["mmr"];
        assert!((average.value - 1533.333).abs() < 0.01);
        assert_eq!(average.players, 3);
    }

    #[test]
    fn test_excluded_and_new_session_only_tickets_skipped() {
        let now = current_timestamp();
        let rules = create_test_rules();
        let sessions = vec![create_test_session("s1", &[&["a"], &["c"]], now)];
        let tickets = vec![
            create_test_ticket("excluded", 1500.0, now).excluding_session("s1"),
            create_test_ticket("fresh", 1500.0, now).with_party_attribute(keys::NEW_SESSION_ONLY, true),
        ];

        let outcome = SessionMatcher::new(&rules, now).run(sessions, tickets, &TimeBudget::unlimited());
        assert!(outcome.proposals.is_empty());
        assert_eq!(outcome.unmatched.len(), 2);
    }

    #[test]
    fn test_blocked_player_kept_off_team() {
        let now = current_timestamp();
        let rules = create_test_rules().with_blocked_player_option(BlockedPlayerOption::CanMatchOnDifferentTeam);
        let sessions = vec![create_test_session("s1", &[&["a"], &["c", "d"]], now)];
        let tickets = vec![create_test_ticket("t1", 1500.0, now).with_party_attribute(keys::BLOCKED_PLAYERS, vec!["a"])];

        let outcome = SessionMatcher::new(&rules, now).run(sessions, tickets, &TimeBudget::unlimited());
        assert!(outcome.proposals.is_empty());
    }

    #[test]
    fn test_satisfied_sessions_untouched() {
        let now = current_timestamp();
        let rules = create_test_rules();
        let sessions = vec![create_test_session("s1", &[&["a", "b"], &["c", "d"]], now)];
        let tickets = vec![create_test_ticket("t1", 1500.0, now)];

        let outcome = SessionMatcher::new(&rules, now).run(sessions, tickets, &TimeBudget::unlimited());
        assert!(outcome.proposals.is_empty());
        assert_eq!(outcome.sessions[0].session.status, SessionStatus::Satisfied);
        assert_eq!(outcome.unmatched.len(), 1);
    }

    #[test]
    fn test_role_fit_respects_quota() {
        let rule = AllianceRule::new(1, 1, 2, 2).with_combination(RoleCombination {
            has_combination: true,
            alliances: vec![vec![Role::new("tank", 1, 1), Role::new("dps", 1, 1)]],
            ..Default::default()
        });
        let mut tank = PartyMember::new("a");
        tank.assigned_role = Some("tank".to_string());
        let second_tank = PartyMember::new("b").with_attribute(keys::ROLE, "tank");
        let flexible = PartyMember::new("c").with_attribute(keys::ROLE, "any");

        assert!(role_fit(&rule, RoleMode::Combo, 0, &[&tank], &[second_tank]).is_none());
        let roles = role_fit(&rule, RoleMode::Combo, 0, &[&tank], &[flexible]).unwrap();
        assert_eq!(roles["c"], "dps");
    }

    #[test]
    fn test_unplaceable_ticket_keeps_unique_claim() {
        let now = current_timestamp();
        let rules = create_test_rules().with_match_option("hero", MatchOptionType::Unique);
        let sessions = vec![create_test_session("s1", &[&["a"], &["c"]], now)];
        let trio = MatchmakingRequest::new("trio", now)
            .with_rated_member("x", "mmr", 1500.0)
            .with_rated_member("y", "mmr", 1500.0)
            .with_rated_member("z", "mmr", 1500.0)
            .with_party_attribute("hero", "mage");
        let solo = create_test_ticket("solo", 1500.0, now).with_party_attribute("hero", "mage");

        let outcome = SessionMatcher::new(&rules, now).run(sessions, vec![trio, solo], &TimeBudget::unlimited());
        assert!(outcome.proposals.is_empty());
        assert_eq!(outcome.unmatched.len(), 2);
    }
}
