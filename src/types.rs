//! Common types used throughout the matchmaking engine

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Unique identifier for a matchmaking ticket
pub type TicketId = String;

/// Unique identifier for a player
pub type UserId = String;

/// Unique identifier for a match / session
pub type MatchId = String;

/// Free-form attribute map carried by parties, members and sessions
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Well-known attribute keys
pub mod keys {
    pub const SERVER_NAME: &str = "server_name";
    pub const CLIENT_VERSION: &str = "client_version";
    /// Platforms a party is willing to play with
    pub const CROSS_PLATFORM: &str = "cross_platform";
    /// Platforms the party members are currently playing on
    pub const CURRENT_PLATFORM: &str = "current_platform";
    pub const BLOCKED_PLAYERS: &str = "blocked_players";
    pub const SUB_GAME_MODE: &str = "sub_game_mode";
    /// Tickets flagged with this never join an existing session
    pub const NEW_SESSION_ONLY: &str = "new_session_only";
    /// Member attribute holding the roles a player is willing to take
    pub const ROLE: &str = "role";
    /// Wildcard role that can fill any slot
    pub const ANY_ROLE: &str = "any";

    /// Keys that are engine bookkeeping rather than custom party attributes
    pub fn is_housekeeping(key: &str) -> bool {
        matches!(
            key,
            CROSS_PLATFORM | CURRENT_PLATFORM | BLOCKED_PLAYERS | SUB_GAME_MODE | NEW_SESSION_ONLY
        )
    }
}

/// A single attribute value.
///
/// Match options need to treat a single value and a list of values the same
/// way, so every variant can be viewed as a set of strings via [`AttributeValue::values`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<String>),
}

impl AttributeValue {
    /// Numeric view, parsing text when possible
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            AttributeValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            AttributeValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Set view of the value. Blank strings yield an empty set.
    pub fn values(&self) -> BTreeSet<String> {
        match self {
            AttributeValue::Bool(b) => BTreeSet::from([b.to_string()]),
            AttributeValue::Number(n) => BTreeSet::from([n.to_string()]),
            AttributeValue::Text(s) if s.trim().is_empty() => BTreeSet::new(),
            AttributeValue::Text(s) => BTreeSet::from([s.clone()]),
            AttributeValue::List(items) => items
                .iter()
                .filter(|item| !item.trim().is_empty())
                .cloned()
                .collect(),
        }
    }

    /// Build a list value from a set
    pub fn from_set(values: &BTreeSet<String>) -> Self {
        AttributeValue::List(values.iter().cloned().collect())
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Number(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(value: Vec<String>) -> Self {
        AttributeValue::List(value)
    }
}

impl From<Vec<&str>> for AttributeValue {
    fn from(value: Vec<&str>) -> Self {
        AttributeValue::List(value.into_iter().map(str::to_string).collect())
    }
}

/// Lifecycle of a matchmaking session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Freshly assembled, not every alliance is at its maximum
    Forming,
    /// Gained members through backfill but still has open slots
    Updated,
    /// Every alliance is at its maximum, no more backfill
    Satisfied,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Forming => write!(f, "Forming"),
            SessionStatus::Updated => write!(f, "Updated"),
            SessionStatus::Satisfied => write!(f, "Satisfied"),
        }
    }
}
