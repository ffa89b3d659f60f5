//! Candidate filtering and scoring
//!
//! A [`CandidateFilter`] is built once per pivot attempt. Each candidate goes
//! through [`CandidateFilter::evaluate`], a pure check that either rejects it
//! or returns an [`Acceptance`] holding the score and the state changes it
//! would cause. Only accepted candidates are passed to
//! [`CandidateFilter::commit`], so a candidate that fails a late check never
//! narrows the cross-play or match option state.

use crate::matching::region::region_fit;
use crate::request::{MatchmakingRequest, MatchmakingResult};
use crate::rules::{active_tolerance, BlockedPlayerOption, Criteria, MatchOptionType, RuleSet};
use crate::types::{keys, AttributeValue, Attributes, TicketId, UserId};
use crate::utils::{attribute_distance, within_tolerance};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Anchor of one search: a ticket forming a new session, or an existing session
#[derive(Debug, Clone, Copy)]
pub enum Pivot<'a> {
    Ticket(&'a MatchmakingRequest),
    Session(&'a MatchmakingResult),
}

impl<'a> Pivot<'a> {
    pub fn is_session(&self) -> bool {
        matches!(self, Pivot::Session(_))
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Pivot::Ticket(ticket) => ticket.created_at,
            Pivot::Session(session) => session.created_at,
        }
    }

    fn ticket_ids(&self) -> BTreeSet<TicketId> {
        match self {
            Pivot::Ticket(ticket) => BTreeSet::from([ticket.ticket_id.clone()]),
            Pivot::Session(session) => session.ticket_ids().into_iter().collect(),
        }
    }

    fn party_ids(&self) -> BTreeSet<String> {
        match self {
            Pivot::Ticket(ticket) => BTreeSet::from([ticket.party_id.clone()]),
            Pivot::Session(session) => session.party_ids(),
        }
    }

    fn user_ids(&self) -> BTreeSet<UserId> {
        match self {
            Pivot::Ticket(ticket) => ticket.user_ids(),
            Pivot::Session(session) => session.user_ids(),
        }
    }

    fn blocked_players(&self) -> BTreeSet<UserId> {
        match self {
            Pivot::Ticket(ticket) => ticket.blocked_players(),
            Pivot::Session(session) => session.blocked_players(),
        }
    }

    fn attribute_value(&self, attribute: &str) -> f64 {
        match self {
            Pivot::Ticket(ticket) => ticket.attribute_average(attribute),
            Pivot::Session(session) => session.attribute_value(attribute),
        }
    }

    fn option_values(&self, name: &str) -> BTreeSet<String> {
        match self {
            Pivot::Ticket(ticket) => ticket.option_values(name),
            Pivot::Session(session) => session
                .party_attributes
                .get(name)
                .map(AttributeValue::values)
                .unwrap_or_default(),
        }
    }

    fn party_attributes(&self) -> &'a Attributes {
        match self {
            Pivot::Ticket(ticket) => &ticket.party_attributes,
            Pivot::Session(session) => &session.party_attributes,
        }
    }

    fn additional_criteria(&self) -> Option<&'a Attributes> {
        match self {
            Pivot::Ticket(_) => None,
            Pivot::Session(session) => Some(&session.additional_criteria),
        }
    }
}

/// Why a candidate was turned down
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Rejection {
    #[error("candidate overlaps with the pivot")]
    SelfMatch,
    #[error("candidate excluded this session")]
    ExcludedSession,
    #[error("candidate only joins new sessions")]
    NewSessionOnly,
    #[error("candidate does not accept this sub game mode")]
    SubGameMode,
    #[error("{attribute} outside tolerance")]
    AttributeDistance { attribute: String },
    #[error("cross-play platforms incompatible")]
    CrossPlay,
    #[error("match option {name} not satisfied")]
    MatchOption { name: String },
    #[error("party attribute {key} differs")]
    PartyAttribute { key: String },
    #[error("blocked player")]
    BlockedPlayer,
    #[error("region latency out of range")]
    Region,
    #[error("additional criteria {key} differs")]
    AdditionalCriteria { key: String },
}

/// State change applied when an accepted candidate is committed
#[derive(Debug, Clone, PartialEq)]
pub enum Commit {
    NarrowCrossPlay {
        desired: Option<BTreeSet<String>>,
        current: BTreeSet<String>,
    },
    NarrowAny {
        name: String,
        values: BTreeSet<String>,
    },
    ClaimUnique {
        name: String,
        values: BTreeSet<String>,
    },
    AccumulateMembers {
        ticket_id: TicketId,
        users: BTreeSet<UserId>,
        blocked: BTreeSet<UserId>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Acceptance {
    pub score: f64,
    pub region_latency: Option<u64>,
    pub commits: Vec<Commit>,
}

/// A candidate that passed every check
#[derive(Debug, Clone)]
pub struct ScoredCandidate<'t> {
    pub ticket: &'t MatchmakingRequest,
    pub score: f64,
    pub region_latency: Option<u64>,
}

/// Accumulated state shared by every candidate of one search
#[derive(Debug, Clone, Default)]
struct FilterState {
    ticket_ids: BTreeSet<TicketId>,
    party_ids: BTreeSet<String>,
    members: BTreeSet<UserId>,
    blocked: BTreeSet<UserId>,
    /// `None` accepts every platform
    desired_platforms: Option<BTreeSet<String>>,
    current_platforms: BTreeSet<String>,
    all_options: BTreeMap<String, BTreeSet<String>>,
    any_options: BTreeMap<String, BTreeSet<String>>,
    unique_claimed: BTreeMap<String, BTreeSet<String>>,
}

fn platform_sets(values_of: impl Fn(&str) -> BTreeSet<String>) -> (Option<BTreeSet<String>>, BTreeSet<String>) {
    let current = values_of(keys::CURRENT_PLATFORM);
    let desired = values_of(keys::CROSS_PLATFORM);
    let desired = if !desired.is_empty() {
        Some(desired)
    } else if !current.is_empty() {
        Some(current.clone())
    } else {
        None
    };
    (desired, current)
}

fn accepts_platforms(desired: &Option<BTreeSet<String>>, current: &BTreeSet<String>) -> bool {
    match desired {
        Some(desired) => current.is_subset(desired),
        None => true,
    }
}

/// Filter built for one pivot, one region and one sub-game-mode
pub struct CandidateFilter<'a> {
    /// Unflexed rules, used to flex each candidate's own tolerance
    source: &'a RuleSet,
    /// Rules flexed for the pivot
    active: &'a RuleSet,
    pivot: Pivot<'a>,
    region: Option<&'a str>,
    sub_game_mode: Option<&'a str>,
    now: DateTime<Utc>,
    cross_play: bool,
    state: FilterState,
}

impl<'a> CandidateFilter<'a> {
    pub fn new(
        source: &'a RuleSet,
        active: &'a RuleSet,
        pivot: Pivot<'a>,
        region: Option<&'a str>,
        sub_game_mode: Option<&'a str>,
        now: DateTime<Utc>,
    ) -> Self {
        let cross_play = active.match_options.option_type(keys::CROSS_PLATFORM) == Some(MatchOptionType::Any);

        let mut state = FilterState {
            ticket_ids: pivot.ticket_ids(),
            party_ids: pivot.party_ids(),
            members: pivot.user_ids(),
            blocked: pivot.blocked_players(),
            ..FilterState::default()
        };

        if cross_play {
            let (desired, current) = platform_sets(|key| pivot.option_values(key));
            state.desired_platforms = desired;
            state.current_platforms = current;
        }

        for option in &active.match_options.options {
            if option.name == keys::CROSS_PLATFORM {
                continue;
            }
            let values = pivot.option_values(&option.name);
            match option.option_type {
                MatchOptionType::All => {
                    state.all_options.insert(option.name.clone(), values);
                }
                MatchOptionType::Any => {
                    state.any_options.insert(option.name.clone(), values);
                }
                MatchOptionType::Unique => {
                    state.unique_claimed.insert(option.name.clone(), values);
                }
                MatchOptionType::Disable => {}
            }
        }

        Self {
            source,
            active,
            pivot,
            region,
            sub_game_mode,
            now,
            cross_play,
            state,
        }
    }

    pub fn pivot(&self) -> Pivot<'a> {
        self.pivot
    }

    /// Run every check against `candidate` without touching shared state
    pub fn evaluate(&self, candidate: &MatchmakingRequest) -> Result<Acceptance, Rejection> {
        let mut commits = Vec::new();

        self.check_identity(candidate)?;
        let mut score = self.check_distance(candidate)?;

        if self.cross_play {
            commits.push(self.check_cross_play(candidate)?);
        }
        commits.extend(self.check_match_options(candidate)?);
        self.check_party_attributes(candidate)?;
        self.check_blocked(candidate)?;

        let (region_score, region_latency) =
            region_fit(self.active, candidate, self.region, self.now).ok_or(Rejection::Region)?;
        score += region_score;

        self.check_additional_criteria(candidate)?;

        commits.push(Commit::AccumulateMembers {
            ticket_id: candidate.ticket_id.clone(),
            users: candidate.user_ids(),
            blocked: candidate.blocked_players(),
        });

        Ok(Acceptance {
            score,
            region_latency,
            commits,
        })
    }

    /// Apply the state changes of an accepted candidate
    pub fn commit(&mut self, acceptance: &Acceptance) {
        let narrow = self.active.narrow_any_options;
        for commit in &acceptance.commits {
            match commit {
                Commit::NarrowCrossPlay { desired, current } => {
                    if narrow {
                        self.state.desired_platforms = match (self.state.desired_platforms.take(), desired) {
                            (Some(ours), Some(theirs)) => Some(ours.intersection(theirs).cloned().collect()),
                            (Some(ours), None) => Some(ours),
                            (None, theirs) => theirs.clone(),
                        };
                    }
                    self.state.current_platforms.extend(current.iter().cloned());
                }
                Commit::NarrowAny { name, values } => {
                    if narrow {
                        if let Some(ours) = self.state.any_options.get_mut(name) {
                            *ours = ours.intersection(values).cloned().collect();
                        }
                    }
                }
                Commit::ClaimUnique { name, values } => {
                    self.state
                        .unique_claimed
                        .entry(name.clone())
                        .or_default()
                        .extend(values.iter().cloned());
                }
                Commit::AccumulateMembers {
                    ticket_id,
                    users,
                    blocked,
                } => {
                    self.state.ticket_ids.insert(ticket_id.clone());
                    self.state.members.extend(users.iter().cloned());
                    self.state.blocked.extend(blocked.iter().cloned());
                }
            }
        }
    }

    /// Evaluate and commit candidates in pool order, then sort the survivors
    pub fn filter<'t>(&mut self, candidates: &[&'t MatchmakingRequest]) -> Vec<ScoredCandidate<'t>> {
        let mut accepted = Vec::new();
        for candidate in candidates {
            match self.evaluate(candidate) {
                Ok(acceptance) => {
                    self.commit(&acceptance);
                    accepted.push(ScoredCandidate {
                        ticket: *candidate,
                        score: acceptance.score,
                        region_latency: acceptance.region_latency,
                    });
                }
                Err(rejection) => {
                    tracing::trace!("Rejected ticket {}: {}", candidate.ticket_id, rejection);
                }
            }
        }

        let by_latency = self.pivot.is_session();
        accepted.sort_by(|a, b| compare_candidates(a, b, by_latency));
        accepted
    }

    fn check_identity(&self, candidate: &MatchmakingRequest) -> Result<(), Rejection> {
        if self.state.ticket_ids.contains(&candidate.ticket_id)
            || self.state.party_ids.contains(&candidate.party_id)
            || candidate
                .party_members
                .iter()
                .any(|member| self.state.members.contains(&member.user_id))
        {
            return Err(Rejection::SelfMatch);
        }

        if let Pivot::Session(session) = self.pivot {
            if candidate.excluded_sessions.contains(&session.match_id) {
                return Err(Rejection::ExcludedSession);
            }
            if candidate.new_session_only() {
                return Err(Rejection::NewSessionOnly);
            }
        }

        let declared: BTreeSet<String> = candidate
            .sub_game_modes()
            .into_iter()
            .filter(|mode| self.source.sub_game_modes.contains_key(mode))
            .collect();
        let mode_ok = match self.sub_game_mode {
            Some(mode) => declared.contains(mode),
            None => declared.is_empty(),
        };
        if !mode_ok {
            return Err(Rejection::SubGameMode);
        }

        Ok(())
    }

    /// Both sides must tolerate the gap; returns the summed score
    fn check_distance(&self, candidate: &MatchmakingRequest) -> Result<f64, Rejection> {
        let mut score = 0.0;
        for rule in &self.active.matching_rules {
            if rule.criteria != Criteria::Distance {
                continue;
            }
            let pivot_value = self.pivot.attribute_value(&rule.attribute);
            let candidate_value = candidate.attribute_average(&rule.attribute);
            let distance = attribute_distance(pivot_value, candidate_value);

            let candidate_tolerance =
                active_tolerance(self.source, &rule.attribute, candidate.created_at, self.now)
                    .unwrap_or(rule.reference);

            if !within_tolerance(pivot_value, candidate_value, rule.reference)
                || !within_tolerance(candidate_value, pivot_value, candidate_tolerance)
            {
                return Err(Rejection::AttributeDistance {
                    attribute: rule.attribute.clone(),
                });
            }
            score += rule.score(distance);
        }
        Ok(score)
    }

    fn check_cross_play(&self, candidate: &MatchmakingRequest) -> Result<Commit, Rejection> {
        let (desired, current) = platform_sets(|key| candidate.option_values(key));

        if !accepts_platforms(&self.state.desired_platforms, &current)
            || !accepts_platforms(&desired, &self.state.current_platforms)
        {
            return Err(Rejection::CrossPlay);
        }

        Ok(Commit::NarrowCrossPlay { desired, current })
    }

    fn check_match_options(&self, candidate: &MatchmakingRequest) -> Result<Vec<Commit>, Rejection> {
        let mut commits = Vec::new();

        for option in &self.active.match_options.options {
            if option.name == keys::CROSS_PLATFORM {
                continue;
            }
            let values = candidate.option_values(&option.name);
            let rejected = || Rejection::MatchOption {
                name: option.name.clone(),
            };

            match option.option_type {
                MatchOptionType::All => {
                    let required = self.state.all_options.get(&option.name);
                    if let Some(required) = required {
                        if !required.is_subset(&values) {
                            return Err(rejected());
                        }
                    }
                }
                MatchOptionType::Any => {
                    let ours = match self.state.any_options.get(&option.name) {
                        Some(ours) if !ours.is_empty() => ours,
                        _ => continue,
                    };
                    if ours.is_disjoint(&values) {
                        return Err(rejected());
                    }
                    commits.push(Commit::NarrowAny {
                        name: option.name.clone(),
                        values,
                    });
                }
                MatchOptionType::Unique => {
                    let claimed = self.state.unique_claimed.get(&option.name);
                    if claimed.map(|claimed| !claimed.is_disjoint(&values)).unwrap_or(false) {
                        return Err(rejected());
                    }
                    commits.push(Commit::ClaimUnique {
                        name: option.name.clone(),
                        values,
                    });
                }
                MatchOptionType::Disable => {}
            }
        }

        Ok(commits)
    }

    /// Custom attributes must be equal on both sides
    fn check_party_attributes(&self, candidate: &MatchmakingRequest) -> Result<(), Rejection> {
        if self.active.defer_party_attribute_checks && !self.pivot.is_session() {
            return Ok(());
        }

        let ours = self.pivot.party_attributes();
        let theirs = &candidate.party_attributes;
        let all_keys: BTreeSet<&String> = ours.keys().chain(theirs.keys()).collect();

        let criteria = self.pivot.additional_criteria();
        for key in all_keys {
            if keys::is_housekeeping(key)
                || criteria.map(|criteria| criteria.contains_key(key)).unwrap_or(false)
                || self.active.match_options.is_option(key)
                || self.active.matching_rule(key).is_some()
            {
                continue;
            }
            let our_values = ours.get(key).map(AttributeValue::values).unwrap_or_default();
            let their_values = theirs.get(key).map(AttributeValue::values).unwrap_or_default();
            if our_values != their_values {
                return Err(Rejection::PartyAttribute { key: key.clone() });
            }
        }
        Ok(())
    }

    fn check_blocked(&self, candidate: &MatchmakingRequest) -> Result<(), Rejection> {
        if self.active.blocked_player_option != BlockedPlayerOption::CannotMatch {
            return Ok(());
        }

        let users = candidate.user_ids();
        let blocked = candidate.blocked_players();
        if !blocked.is_disjoint(&self.state.members) || !self.state.blocked.is_disjoint(&users) {
            return Err(Rejection::BlockedPlayer);
        }
        Ok(())
    }

    fn check_additional_criteria(&self, candidate: &MatchmakingRequest) -> Result<(), Rejection> {
        let criteria = match self.pivot.additional_criteria() {
            Some(criteria) => criteria,
            None => return Ok(()),
        };
        for (key, expected) in criteria {
            let actual = candidate
                .party_attributes
                .get(key)
                .map(AttributeValue::values)
                .unwrap_or_default();
            if actual != expected.values() {
                return Err(Rejection::AdditionalCriteria { key: key.clone() });
            }
        }
        Ok(())
    }
}

/// Priority first, then score, then (backfill) latency, then age
pub fn compare_candidates(a: &ScoredCandidate<'_>, b: &ScoredCandidate<'_>, by_latency: bool) -> Ordering {
    b.ticket
        .priority
        .cmp(&a.ticket.priority)
        .then_with(|| a.score.total_cmp(&b.score))
        .then_with(|| {
            if by_latency {
                let a_latency = a.region_latency.unwrap_or(u64::MAX);
                let b_latency = b.region_latency.unwrap_or(u64::MAX);
                a_latency.cmp(&b_latency)
            } else {
                Ordering::Equal
            }
        })
        .then_with(|| a.ticket.created_at.cmp(&b.ticket.created_at))
        .then_with(|| a.ticket.ticket_id.cmp(&b.ticket.ticket_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Alliance, MatchingParty};
    use crate::rules::{AllianceRule, FlexingRule, MatchingRule};
    use crate::utils::current_timestamp;
    use chrono::Duration;

    fn create_test_rules() -> RuleSet {
        RuleSet::new(AllianceRule::new(2, 2, 1, 1)).with_matching_rule(MatchingRule::distance("mmr", 100.0))
    }

    fn create_test_ticket(id: &str, mmr: f64, created_at: DateTime<Utc>) -> MatchmakingRequest {
        MatchmakingRequest::new(id, created_at).with_rated_member(&format!("{}-user", id), "mmr", mmr)
    }

    fn run_filter<'t>(
        rules: &RuleSet,
        pivot: &MatchmakingRequest,
        candidates: &[&'t MatchmakingRequest],
        now: DateTime<Utc>,
    ) -> Vec<ScoredCandidate<'t>> {
        let mut filter = CandidateFilter::new(rules, rules, Pivot::Ticket(pivot), None, None, now);
        filter.filter(candidates)
    }

    #[test]
    fn test_self_and_shared_user_excluded() {
        let now = current_timestamp();
        let rules = create_test_rules();
        let pivot = create_test_ticket("p", 1500.0, now);
        let shares_user = MatchmakingRequest::new("other", now).with_rated_member("p-user", "mmr", 1500.0);

        let accepted = run_filter(&rules, &pivot, &[&pivot, &shares_user], now);
        assert!(accepted.is_empty());
    }

    #[test]
    fn test_distance_is_bidirectional() {
        let now = current_timestamp();
        let rules = create_test_rules().with_flexing_rule(FlexingRule::new(10, "mmr", 200.0));
        let (active, _) = crate::rules::flex_rule_set(&rules, now - Duration::seconds(20), now);

        let pivot = create_test_ticket("p", 1500.0, now - Duration::seconds(20));
        let fresh = create_test_ticket("fresh", 1650.0, now);
        let waited = create_test_ticket("waited", 1650.0, now - Duration::seconds(20));

        let mut filter = CandidateFilter::new(&rules, &active, Pivot::Ticket(&pivot), None, None, now);
        assert_eq!(
            filter.evaluate(&fresh),
            Err(Rejection::AttributeDistance {
                attribute: "mmr".to_string()
            })
        );
        let accepted = filter.filter(&[&fresh, &waited]);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].ticket.ticket_id, "waited");
        assert_eq!(accepted[0].score, 150.0);
    }

    #[test]
    fn test_distance_window_includes_its_edge() {
        let now = current_timestamp();
        let rules = create_test_rules();
        let pivot = create_test_ticket("p", 1500.0, now);
        let edge = create_test_ticket("edge", 1600.0, now);
        let beyond = create_test_ticket("beyond", 1600.5, now);

        let accepted = run_filter(&rules, &pivot, &[&edge, &beyond], now);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].ticket.ticket_id, "edge");
        assert_eq!(accepted[0].score, 100.0);
    }

    #[test]
    fn test_survivors_sorted_by_priority_then_score_then_age() {
        let now = current_timestamp();
        let rules = create_test_rules();
        let pivot = create_test_ticket("p", 1500.0, now);
        let close_new = create_test_ticket("close-new", 1510.0, now);
        let close_old = create_test_ticket("close-old", 1510.0, now - Duration::seconds(5));
        let far = create_test_ticket("far", 1580.0, now);
        let vip = create_test_ticket("vip", 1590.0, now).with_priority(5);

        let accepted = run_filter(&rules, &pivot, &[&far, &close_new, &vip, &close_old], now);
        let order: Vec<&str> = accepted.iter().map(|c| c.ticket.ticket_id.as_str()).collect();
        assert_eq!(order, vec!["vip", "close-old", "close-new", "far"]);
    }

    #[test]
    fn test_cross_play_narrows_after_acceptance() {
        let now = current_timestamp();
        let rules = create_test_rules().with_match_option(keys::CROSS_PLATFORM, MatchOptionType::Any);
        let pivot = create_test_ticket("p", 1500.0, now)
            .with_party_attribute(keys::CROSS_PLATFORM, vec!["pc", "xbox", "ps"])
            .with_party_attribute(keys::CURRENT_PLATFORM, "pc");
        let xbox = create_test_ticket("xbox", 1500.0, now)
            .with_party_attribute(keys::CROSS_PLATFORM, vec!["pc", "xbox"])
            .with_party_attribute(keys::CURRENT_PLATFORM, "xbox");
        let ps = create_test_ticket("ps", 1500.0, now)
            .with_party_attribute(keys::CROSS_PLATFORM, vec!["pc", "xbox", "ps"])
            .with_party_attribute(keys::CURRENT_PLATFORM, "ps");
        let pc_only = create_test_ticket("pc-only", 1500.0, now).with_party_attribute(keys::CURRENT_PLATFORM, "pc");

        let mut filter = CandidateFilter::new(&rules, &rules, Pivot::Ticket(&pivot), None, None, now);
        assert!(filter.evaluate(&ps).is_ok());
        assert!(filter.evaluate(&pc_only).is_ok());

        let accepted = filter.filter(&[&xbox, &ps, &pc_only]);
        let ids: Vec<&str> = accepted.iter().map(|c| c.ticket.ticket_id.as_str()).collect();
        assert_eq!(ids, vec!["xbox"]);
    }

    #[test]
    fn test_rejected_candidate_does_not_narrow() {
        let now = current_timestamp();
        let rules = create_test_rules().with_match_option("map", MatchOptionType::Any);
        let pivot = create_test_ticket("p", 1500.0, now).with_party_attribute("map", vec!["dust", "nuke"]);
        let wrong_server = create_test_ticket("wrong-server", 1500.0, now)
            .with_party_attribute("map", "dust")
            .with_party_attribute(keys::SERVER_NAME, "v2");
        let late = create_test_ticket("late", 1500.0, now).with_party_attribute("map", "nuke");

        let accepted = run_filter(&rules, &pivot, &[&wrong_server, &late], now);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].ticket.ticket_id, "late");
    }

    #[test]
    fn test_match_option_semantics() {
        let now = current_timestamp();
        let rules = create_test_rules()
            .with_match_option("mode", MatchOptionType::All)
            .with_match_option("hero", MatchOptionType::Unique)
            .with_match_option("ignored", MatchOptionType::Disable);
        let pivot = create_test_ticket("p", 1500.0, now)
            .with_party_attribute("mode", vec!["ranked", "hardcore"])
            .with_party_attribute("hero", "mage")
            .with_party_attribute("ignored", "x");
        let subset = create_test_ticket("subset", 1500.0, now).with_party_attribute("mode", "ranked");
        let superset = create_test_ticket("superset", 1500.0, now)
            .with_party_attribute("mode", vec!["ranked", "hardcore", "casual"])
            .with_party_attribute("hero", "rogue");
        let same_hero = create_test_ticket("same-hero", 1500.0, now)
            .with_party_attribute("mode", vec!["ranked", "hardcore"])
            .with_party_attribute("hero", "rogue");

        let accepted = run_filter(&rules, &pivot, &[&subset, &superset, &same_hero], now);
        let ids: Vec<&str> = accepted.iter().map(|c| c.ticket.ticket_id.as_str()).collect();
        assert_eq!(ids, vec!["superset"]);
    }

    #[test]
    fn test_party_attributes_must_match_unless_deferred() {
        let now = current_timestamp();
        let mut rules = create_test_rules();
        let pivot = create_test_ticket("p", 1500.0, now).with_party_attribute(keys::SERVER_NAME, "v123");
        let other = create_test_ticket("o", 1500.0, now).with_party_attribute(keys::SERVER_NAME, "v999");

        assert!(run_filter(&rules, &pivot, &[&other], now).is_empty());

        rules.defer_party_attribute_checks = true;
        assert_eq!(run_filter(&rules, &pivot, &[&other], now).len(), 1);
    }

    #[test]
    fn test_blocked_policies() {
        let now = current_timestamp();
        let pivot = create_test_ticket("p", 1500.0, now).with_party_attribute(keys::BLOCKED_PLAYERS, vec!["o-user"]);
        let other = create_test_ticket("o", 1500.0, now);

        let cannot = create_test_rules();
        assert!(run_filter(&cannot, &pivot, &[&other], now).is_empty());

        let different_team = create_test_rules().with_blocked_player_option(BlockedPlayerOption::CanMatchOnDifferentTeam);
        assert_eq!(run_filter(&different_team, &pivot, &[&other], now).len(), 1);

        let can = create_test_rules().with_blocked_player_option(BlockedPlayerOption::CanMatch);
        assert_eq!(run_filter(&can, &pivot, &[&other], now).len(), 1);
    }

    #[test]
    fn test_session_pivot_checks() {
        let now = current_timestamp();
        let rules = create_test_rules();
        let mut alliance = Alliance::new("team-0");
        alliance.add_party(MatchingParty::from_ticket(&create_test_ticket("s1", 1500.0, now)));
        let session = MatchmakingResult::new("ch", now)
            .with_match_id("session-1")
            .with_alliance(alliance)
            .with_additional_criteria("league", "gold");

        let ok = create_test_ticket("ok", 1500.0, now).with_party_attribute("league", "gold");
        let excluded = create_test_ticket("excluded", 1500.0, now)
            .with_party_attribute("league", "gold")
            .excluding_session("session-1");
        let silver = create_test_ticket("silver", 1500.0, now).with_party_attribute("league", "silver");
        let fresh_only = create_test_ticket("fresh", 1500.0, now)
            .with_party_attribute("league", "gold")
            .with_party_attribute(keys::NEW_SESSION_ONLY, true);

        let mut filter = CandidateFilter::new(&rules, &rules, Pivot::Session(&session), None, None, now);
        assert_eq!(filter.evaluate(&excluded), Err(Rejection::ExcludedSession));
        assert_eq!(filter.evaluate(&fresh_only), Err(Rejection::NewSessionOnly));
        assert_eq!(
            filter.evaluate(&silver),
            Err(Rejection::AdditionalCriteria {
                key: "league".to_string()
            })
        );

        let accepted = filter.filter(&[&ok, &excluded, &silver, &fresh_only]);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].ticket.ticket_id, "ok");
    }

    #[test]
    fn test_sub_game_mode_must_be_declared() {
        let now = current_timestamp();
        let rules = create_test_rules().with_sub_game_mode(
            "duo",
            crate::rules::SubGameMode {
                alliance: AllianceRule::new(2, 2, 2, 2),
                alliance_flexing_rules: vec![],
            },
        );
        let pivot = create_test_ticket("p", 1500.0, now).with_party_attribute(keys::SUB_GAME_MODE, "duo");
        let duo = create_test_ticket("duo", 1500.0, now).with_party_attribute(keys::SUB_GAME_MODE, "duo");
        let plain = create_test_ticket("plain", 1500.0, now);

        let mut filter = CandidateFilter::new(&rules, &rules, Pivot::Ticket(&pivot), None, Some("duo"), now);
        assert!(filter.evaluate(&duo).is_ok());
        assert_eq!(filter.evaluate(&plain), Err(Rejection::SubGameMode));

        let mut main = CandidateFilter::new(&rules, &rules, Pivot::Ticket(&plain), None, None, now);
        assert_eq!(main.evaluate(&duo), Err(Rejection::SubGameMode));
        assert!(main.filter(&[&duo]).is_empty());
        assert_eq!(filter.filter(&[&duo, &plain]).len(), 1);
    }
}
