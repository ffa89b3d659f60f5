//! Engine facade
//!
//! Connects a ticket source to the matching core and fans work out over
//! independent batches.

pub mod matchmaker;
pub mod provider;

pub use matchmaker::{EngineSettings, Matchmaker, RuleInput};
pub use provider::{StaticTicketProvider, TicketProvider};
