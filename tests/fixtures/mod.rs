//! Test fixtures shared by the integration tests

#![allow(dead_code)]

use alliance_matchmaker::request::{
    Alliance, BackfillTicket, MatchmakingRequest, MatchmakingResult, PartyMember,
};
use alliance_matchmaker::rules::{AllianceRule, MatchingRule, RuleSet};
use alliance_matchmaker::types::{keys, UserId};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use tokio::sync::mpsc;

pub const CHANNEL: &str = "ranked";

/// Fixed reference time so tests never depend on the wall clock
pub fn test_epoch() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-01T12:00:00Z")
        .map(|time| time.with_timezone(&Utc))
        .unwrap()
}

pub fn create_test_rules(min: usize, max: usize, pmin: usize, pmax: usize) -> RuleSet {
    RuleSet::new(AllianceRule::new(min, max, pmin, pmax))
}

pub fn create_rated_rules(
    min: usize,
    max: usize,
    pmin: usize,
    pmax: usize,
    tolerance: f64,
) -> RuleSet {
    create_test_rules(min, max, pmin, pmax).with_matching_rule(MatchingRule::distance("mmr", tolerance))
}

/// Single-player ticket created `age_secs` before `now`
pub fn create_test_ticket(id: &str, mmr: f64, now: DateTime<Utc>, age_secs: i64) -> MatchmakingRequest {
    MatchmakingRequest::new(id, now - Duration::seconds(age_secs))
        .with_channel(CHANNEL)
        .with_rated_member(&format!("{}-user", id), "mmr", mmr)
}

/// Ticket whose single member is `user`
pub fn create_user_ticket(id: &str, user: &str, now: DateTime<Utc>, age_secs: i64) -> MatchmakingRequest {
    MatchmakingRequest::new(id, now - Duration::seconds(age_secs))
        .with_channel(CHANNEL)
        .with_member(PartyMember::new(user))
}

pub fn blocking(ticket: MatchmakingRequest, blocked: &[&str]) -> MatchmakingRequest {
    ticket.with_party_attribute(keys::BLOCKED_PLAYERS, blocked.to_vec())
}

/// Session with one alliance per entry of `teams`
pub fn create_test_session(match_id: &str, teams: &[&[&str]], now: DateTime<Utc>) -> BackfillTicket {
    let mut session = MatchmakingResult::new(CHANNEL, now - Duration::seconds(10)).with_match_id(match_id);
    for (index, users) in teams.iter().enumerate() {
        let tickets: Vec<MatchmakingRequest> = users
            .iter()
            .map(|user| create_user_ticket(&format!("{}-ticket", user), user, now, 10))
            .collect();
        let user_ids: Vec<UserId> = users.iter().map(|user| user.to_string()).collect();
        session
            .alliances
            .push(Alliance::from_members(format!("team-{}", index), &user_ids, &tickets));
    }
    BackfillTicket::new(session)
}

/// Users of each alliance of a result
pub fn alliance_users(result: &MatchmakingResult) -> Vec<BTreeSet<UserId>> {
    result.alliances.iter().map(Alliance::user_ids).collect()
}

pub fn same_alliance(result: &MatchmakingResult, a: &str, b: &str) -> bool {
    alliance_users(result)
        .iter()
        .any(|users| users.contains(a) && users.contains(b))
}

/// Drain a result stream until every sender is gone
pub async fn collect_stream<T>(mut rx: mpsc::Receiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Some(item) = rx.recv().await {
        items.push(item);
    }
    items
}
