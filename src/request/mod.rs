//! Request model for the matchmaking engine
//!
//! Tickets (one party's submission) and sessions (assembled alliances that
//! backfill keeps extending).

pub mod session;
pub mod ticket;

pub use session::{
    Alliance, BackfillProposal, BackfillTicket, MatchingParty, MatchmakingResult, RunningAverage,
    EXTERNAL_PARTY_ID,
};
pub use ticket::{MatchmakingRequest, PartyMember};
