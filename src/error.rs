//! Error types for the matchmaking engine
//!
//! This module defines all error types using anyhow for consistent error handling
//! throughout the crate. A pool that produces no match is not an error.

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Custom error types for specific matchmaking scenarios
#[derive(Debug, thiserror::Error)]
pub enum MatchmakingError {
    #[error("Invalid rule set: {reason}")]
    InvalidRuleSet { reason: String },

    #[error("Rule set could not be decoded: {reason}")]
    RuleDecodeFailed { reason: String },

    #[error("Invalid ticket {ticket_id}: {reason}")]
    InvalidTicket { ticket_id: String, reason: String },

    #[error("Ticket {ticket_id} has no region at or under {max_latency_ms}ms")]
    NoAcceptableRegion {
        ticket_id: String,
        max_latency_ms: u64,
    },
}

impl MatchmakingError {
    /// Shorthand for a rule set validation failure
    pub fn invalid_rules(reason: impl Into<String>) -> Self {
        MatchmakingError::InvalidRuleSet {
            reason: reason.into(),
        }
    }
}
