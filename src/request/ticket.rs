//! Matchmaking tickets
//!
//! A ticket is one party's submission to the queue. Tickets are immutable once
//! queued, apart from the role bookkeeping on their members which is written
//! by role flexing and role-aware ally assembly.

use crate::error::{MatchmakingError, Result};
use crate::types::{keys, AttributeValue, Attributes, MatchId, TicketId, UserId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One player inside a party
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyMember {
    pub user_id: UserId,
    #[serde(default)]
    pub extra_attributes: Attributes,
    /// Role picked for this member when the alliance was assembled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_role: Option<String>,
    /// Set once the member's declared role was relaxed to the wildcard role
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub role_flexed: bool,
}

impl PartyMember {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            extra_attributes: Attributes::new(),
            assigned_role: None,
            role_flexed: false,
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<AttributeValue>) -> Self {
        self.extra_attributes.insert(key.to_string(), value.into());
        self
    }

    /// Roles this member is willing to take, in preference order.
    ///
    /// A role-flexed member reports only the wildcard role.
    pub fn declared_roles(&self) -> Vec<String> {
        if self.role_flexed {
            return vec![keys::ANY_ROLE.to_string()];
        }
        match self.extra_attributes.get(keys::ROLE) {
            Some(AttributeValue::List(roles)) => roles
                .iter()
                .filter(|role| !role.trim().is_empty())
                .cloned()
                .collect(),
            Some(AttributeValue::Text(role)) if !role.trim().is_empty() => vec![role.clone()],
            _ => Vec::new(),
        }
    }

    /// First declared role, used when counting how a pool covers role quotas
    pub fn primary_role(&self) -> Option<String> {
        self.declared_roles()
            .into_iter()
            .find(|role| role != keys::ANY_ROLE)
    }

    pub fn attribute_f64(&self, key: &str) -> Option<f64> {
        self.extra_attributes.get(key).and_then(AttributeValue::as_f64)
    }
}

/// A matchmaking request ("ticket")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchmakingRequest {
    pub ticket_id: TicketId,
    #[serde(default)]
    pub channel: String,
    pub party_id: String,
    pub party_members: Vec<PartyMember>,
    #[serde(default)]
    pub party_attributes: Attributes,
    #[serde(default)]
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    /// Measured latency per region, in milliseconds
    #[serde(default)]
    pub latencies: BTreeMap<String, u64>,
    /// Sessions this ticket must never be placed into
    #[serde(default)]
    pub excluded_sessions: Vec<MatchId>,
}

impl MatchmakingRequest {
    /// Create an empty ticket; the party id defaults to the ticket id
    pub fn new(ticket_id: impl Into<TicketId>, created_at: DateTime<Utc>) -> Self {
        let ticket_id = ticket_id.into();
        Self {
            party_id: ticket_id.clone(),
            ticket_id,
            channel: String::new(),
            party_members: Vec::new(),
            party_attributes: Attributes::new(),
            priority: 0,
            created_at,
            latencies: BTreeMap::new(),
            excluded_sessions: Vec::new(),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_member(mut self, member: PartyMember) -> Self {
        self.party_members.push(member);
        self
    }

    /// Add a member carrying a single numeric attribute
    pub fn with_rated_member(self, user_id: &str, attribute: &str, value: f64) -> Self {
        self.with_member(PartyMember::new(user_id).with_attribute(attribute, value))
    }

    pub fn with_party_attribute(mut self, key: &str, value: impl Into<AttributeValue>) -> Self {
        self.party_attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_latency(mut self, region: &str, latency_ms: u64) -> Self {
        self.latencies.insert(region.to_string(), latency_ms);
        self
    }

    pub fn excluding_session(mut self, match_id: impl Into<MatchId>) -> Self {
        self.excluded_sessions.push(match_id.into());
        self
    }

    pub fn player_count(&self) -> usize {
        self.party_members.len()
    }

    pub fn user_ids(&self) -> BTreeSet<UserId> {
        self.party_members
            .iter()
            .map(|member| member.user_id.clone())
            .collect()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.created_at)
    }

    /// Average of a numeric attribute over the members that carry it,
    /// falling back to the party-level value, else zero.
    pub fn attribute_average(&self, attribute: &str) -> f64 {
        let values: Vec<f64> = self
            .party_members
            .iter()
            .filter_map(|member| member.attribute_f64(attribute))
            .collect();

        if !values.is_empty() {
            return values.iter().sum::<f64>() / values.len() as f64;
        }

        self.party_attributes
            .get(attribute)
            .and_then(AttributeValue::as_f64)
            .unwrap_or(0.0)
    }

    /// Players this party refuses to play with
    pub fn blocked_players(&self) -> BTreeSet<UserId> {
        let mut blocked: BTreeSet<UserId> = self
            .party_attributes
            .get(keys::BLOCKED_PLAYERS)
            .map(AttributeValue::values)
            .unwrap_or_default();

        for member in &self.party_members {
            if let Some(value) = member.extra_attributes.get(keys::BLOCKED_PLAYERS) {
                blocked.extend(value.values());
            }
        }
        blocked
    }

    /// Values of a match option attribute. Party-level values win; otherwise
    /// the union of the members' values is used.
    pub fn option_values(&self, name: &str) -> BTreeSet<String> {
        if let Some(value) = self.party_attributes.get(name) {
            return value.values();
        }

        self.party_members
            .iter()
            .filter_map(|member| member.extra_attributes.get(name))
            .flat_map(AttributeValue::values)
            .collect()
    }

    /// Latencies sorted from best to worst (ties broken by region name)
    pub fn sorted_latencies(&self) -> Vec<(String, u64)> {
        let mut sorted: Vec<(String, u64)> = self
            .latencies
            .iter()
            .map(|(region, latency)| (region.clone(), *latency))
            .collect();
        sorted.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        sorted
    }

    pub fn best_latency(&self) -> Option<u64> {
        self.latencies.values().copied().min()
    }

    pub fn latency_to(&self, region: &str) -> Option<u64> {
        self.latencies.get(region).copied()
    }

    /// Sub-game-modes this ticket accepts
    pub fn sub_game_modes(&self) -> BTreeSet<String> {
        self.party_attributes
            .get(keys::SUB_GAME_MODE)
            .map(AttributeValue::values)
            .unwrap_or_default()
    }

    pub fn new_session_only(&self) -> bool {
        self.party_attributes
            .get(keys::NEW_SESSION_ONLY)
            .and_then(AttributeValue::as_bool)
            .unwrap_or(false)
    }

    /// Structural checks: a party must have members with unique ids
    pub fn validate(&self) -> Result<()> {
        if self.party_members.is_empty() {
            return Err(MatchmakingError::InvalidTicket {
                ticket_id: self.ticket_id.clone(),
                reason: "party has no members".to_string(),
            }
            .into());
        }

        let mut seen = BTreeSet::new();
        for member in &self.party_members {
            if !seen.insert(member.user_id.as_str()) {
                return Err(MatchmakingError::InvalidTicket {
                    ticket_id: self.ticket_id.clone(),
                    reason: format!("duplicate party member {}", member.user_id),
                }
                .into());
            }
        }

        Ok(())
    }
}
