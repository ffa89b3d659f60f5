//! Alliance Matchmaker - rule-driven matchmaking and session backfill
//!
//! This crate forms alliances of parties from a ticket pool under a
//! declarative rule set that relaxes as tickets wait, and extends existing
//! sessions with new tickets.

pub mod config;
pub mod engine;
pub mod error;
pub mod matching;
pub mod metrics;
pub mod request;
pub mod rules;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{MatchmakingError, Result};
pub use types::*;

// Re-export key components
pub use engine::{EngineSettings, Matchmaker, RuleInput, StaticTicketProvider, TicketProvider};
pub use matching::{BackfillOutcome, MatchOutcome, PivotMatcher, SessionMatcher, TimeBudget};
pub use request::{
    Alliance, BackfillProposal, BackfillTicket, MatchmakingRequest, MatchmakingResult, PartyMember,
};
pub use rules::{validate_ticket, AllianceRule, RuleSet};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
