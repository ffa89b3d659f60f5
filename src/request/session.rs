//! Sessions: assembled alliances and their lifecycle
//!
//! A session is created by the pivot loop or supplied externally for backfill.
//! It moves Forming -> Updated -> Satisfied; removing satisfied sessions from
//! the active pool is up to the caller.

use crate::request::ticket::{MatchmakingRequest, PartyMember};
use crate::rules::AllianceRule;
use crate::types::{keys, AttributeValue, Attributes, MatchId, SessionStatus, TicketId, UserId};
use crate::utils::generate_match_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Party id used for members that belong to a team but to none of the known tickets
pub const EXTERNAL_PARTY_ID: &str = "external";

/// One party inside an alliance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingParty {
    pub party_id: String,
    /// `None` for the synthetic external party
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<TicketId>,
    pub party_members: Vec<PartyMember>,
    #[serde(default)]
    pub party_attributes: Attributes,
}

impl MatchingParty {
    pub fn from_ticket(ticket: &MatchmakingRequest) -> Self {
        Self {
            party_id: ticket.party_id.clone(),
            ticket_id: Some(ticket.ticket_id.clone()),
            party_members: ticket.party_members.clone(),
            party_attributes: ticket.party_attributes.clone(),
        }
    }

    pub fn external(party_members: Vec<PartyMember>) -> Self {
        Self {
            party_id: EXTERNAL_PARTY_ID.to_string(),
            ticket_id: None,
            party_members,
            party_attributes: Attributes::new(),
        }
    }

    pub fn is_external(&self) -> bool {
        self.ticket_id.is_none()
    }

    pub fn player_count(&self) -> usize {
        self.party_members.len()
    }
}

/// One team within a match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alliance {
    pub team_id: String,
    #[serde(default)]
    pub parties: Vec<MatchingParty>,
}

impl Alliance {
    pub fn new(team_id: impl Into<String>) -> Self {
        Self {
            team_id: team_id.into(),
            parties: Vec::new(),
        }
    }

    /// Build a team from a flat member list, attributing members to the
    /// tickets they came from. Members found in no ticket land in a single
    /// external party.
    pub fn from_members(
        team_id: impl Into<String>,
        user_ids: &[UserId],
        tickets: &[MatchmakingRequest],
    ) -> Self {
        let mut alliance = Alliance::new(team_id);
        let mut external = Vec::new();

        for user_id in user_ids {
            if alliance.contains_user(user_id) || external.iter().any(|m: &PartyMember| &m.user_id == user_id) {
                continue;
            }

            let owner = tickets.iter().find_map(|ticket| {
                ticket
                    .party_members
                    .iter()
                    .find(|member| &member.user_id == user_id)
                    .map(|member| (ticket, member))
            });

            match owner {
                Some((ticket, member)) => {
                    match alliance
                        .parties
                        .iter_mut()
                        .find(|party| party.ticket_id.as_deref() == Some(ticket.ticket_id.as_str()))
                    {
                        Some(party) => party.party_members.push(member.clone()),
                        None => {
                            let mut party = MatchingParty::from_ticket(ticket);
                            party.party_members = vec![member.clone()];
                            alliance.parties.push(party);
                        }
                    }
                }
                None => external.push(PartyMember::new(user_id.clone())),
            }
        }

        if !external.is_empty() {
            alliance.parties.push(MatchingParty::external(external));
        }
        alliance
    }

    pub fn add_party(&mut self, party: MatchingParty) {
        self.parties.push(party);
    }

    pub fn player_count(&self) -> usize {
        self.parties.iter().map(MatchingParty::player_count).sum()
    }

    pub fn members(&self) -> impl Iterator<Item = &PartyMember> {
        self.parties.iter().flat_map(|party| party.party_members.iter())
    }

    pub fn user_ids(&self) -> BTreeSet<UserId> {
        self.members().map(|member| member.user_id.clone()).collect()
    }

    pub fn contains_user(&self, user_id: &str) -> bool {
        self.members().any(|member| member.user_id == user_id)
    }

    /// Players blocked by anyone on this team
    pub fn blocked_players(&self) -> BTreeSet<UserId> {
        let mut blocked = BTreeSet::new();
        for party in &self.parties {
            if let Some(value) = party.party_attributes.get(keys::BLOCKED_PLAYERS) {
                blocked.extend(value.values());
            }
            for member in &party.party_members {
                if let Some(value) = member.extra_attributes.get(keys::BLOCKED_PLAYERS) {
                    blocked.extend(value.values());
                }
            }
        }
        blocked
    }
}

/// Player-weighted running mean of a matching attribute
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunningAverage {
    pub value: f64,
    pub players: usize,
}

impl RunningAverage {
    pub fn new(value: f64, players: usize) -> Self {
        Self { value, players }
    }

    /// Fold in `players` more players whose mean is `value`
    pub fn absorb(&mut self, value: f64, players: usize) {
        let total = self.players + players;
        if total == 0 {
            return;
        }
        self.value = (self.value * self.players as f64 + value * players as f64) / total as f64;
        self.players = total;
    }
}

/// An assembled match, and the unit that backfill extends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchmakingResult {
    pub match_id: MatchId,
    #[serde(default)]
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_game_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub alliances: Vec<Alliance>,
    /// Party attributes merged across every party in the session
    #[serde(default)]
    pub party_attributes: Attributes,
    /// Running means of the rule set's matching attributes
    #[serde(default)]
    pub matching_attributes: BTreeMap<String, RunningAverage>,
    /// Exact-match criteria a backfill candidate must satisfy
    #[serde(default)]
    pub additional_criteria: Attributes,
    #[serde(default)]
    pub priority: i32,
    /// Creation time of the oldest ticket in the session
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    /// Whether the session still accepts backfill
    #[serde(default)]
    pub joinable: bool,
}

impl MatchmakingResult {
    pub fn new(channel: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            match_id: generate_match_id(),
            channel: channel.into(),
            sub_game_mode: None,
            region: None,
            alliances: Vec::new(),
            party_attributes: Attributes::new(),
            matching_attributes: BTreeMap::new(),
            additional_criteria: Attributes::new(),
            priority: 0,
            created_at,
            status: SessionStatus::Forming,
            joinable: true,
        }
    }

    pub fn with_match_id(mut self, match_id: impl Into<MatchId>) -> Self {
        self.match_id = match_id.into();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_alliance(mut self, alliance: Alliance) -> Self {
        self.alliances.push(alliance);
        self
    }

    pub fn with_party_attribute(mut self, key: &str, value: impl Into<AttributeValue>) -> Self {
        self.party_attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn with_additional_criteria(mut self, key: &str, value: impl Into<AttributeValue>) -> Self {
        self.additional_criteria.insert(key.to_string(), value.into());
        self
    }

    pub fn with_matching_attribute(mut self, attribute: &str, value: f64) -> Self {
        let players = self.player_count();
        self.matching_attributes
            .insert(attribute.to_string(), RunningAverage::new(value, players));
        self
    }

    pub fn player_count(&self) -> usize {
        self.alliances.iter().map(Alliance::player_count).sum()
    }

    pub fn team_sizes(&self) -> Vec<usize> {
        self.alliances.iter().map(Alliance::player_count).collect()
    }

    pub fn user_ids(&self) -> BTreeSet<UserId> {
        self.alliances.iter().flat_map(Alliance::user_ids).collect()
    }

    pub fn ticket_ids(&self) -> Vec<TicketId> {
        self.alliances
            .iter()
            .flat_map(|alliance| alliance.parties.iter())
            .filter_map(|party| party.ticket_id.clone())
            .collect()
    }

    pub fn party_ids(&self) -> BTreeSet<String> {
        self.alliances
            .iter()
            .flat_map(|alliance| alliance.parties.iter())
            .filter(|party| !party.is_external())
            .map(|party| party.party_id.clone())
            .collect()
    }

    pub fn blocked_players(&self) -> BTreeSet<UserId> {
        let mut blocked: BTreeSet<UserId> = self
            .party_attributes
            .get(keys::BLOCKED_PLAYERS)
            .map(AttributeValue::values)
            .unwrap_or_default();
        for alliance in &self.alliances {
            blocked.extend(alliance.blocked_players());
        }
        blocked
    }

    /// Mean of a matching attribute; sessions without a recorded mean fall
    /// back to averaging the members that carry the attribute.
    pub fn attribute_value(&self, attribute: &str) -> f64 {
        if let Some(average) = self.matching_attributes.get(attribute) {
            return average.value;
        }

        let values: Vec<f64> = self
            .alliances
            .iter()
            .flat_map(|alliance| alliance.members())
            .filter_map(|member| member.attribute_f64(attribute))
            .collect();
        if values.is_empty() {
            self.party_attributes
                .get(attribute)
                .and_then(AttributeValue::as_f64)
                .unwrap_or(0.0)
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    }

    /// Every alliance present and at its player maximum
    pub fn is_satisfied(&self, rule: &AllianceRule) -> bool {
        self.alliances.len() >= rule.max_number
            && self
                .alliances
                .iter()
                .all(|alliance| alliance.player_count() >= rule.player_max_number)
    }

    /// Recompute the lifecycle state after the session changed
    pub fn refresh_status(&mut self, rule: &AllianceRule, gained_members: bool) {
        if self.is_satisfied(rule) {
            self.status = SessionStatus::Satisfied;
            self.joinable = false;
        } else if gained_members {
            self.status = SessionStatus::Updated;
        }
    }
}

/// A partially filled session handed in for backfill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillTicket {
    pub ticket_id: TicketId,
    pub session: MatchmakingResult,
}

impl BackfillTicket {
    pub fn new(session: MatchmakingResult) -> Self {
        Self {
            ticket_id: generate_match_id(),
            session,
        }
    }
}

/// Tickets proposed for an existing session, with the resulting teams
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillProposal {
    pub proposal_id: String,
    pub backfill_ticket_id: TicketId,
    pub match_id: MatchId,
    pub added_tickets: Vec<TicketId>,
    pub alliances: Vec<Alliance>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}
