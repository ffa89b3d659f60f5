//! Matching engine core
//!
//! - `filter` / `region`: candidate checks and scores around a pivot
//! - `roles` / `assembler`: team assembly under alliance and role rules
//! - `pivot`: the loop that forms new sessions from a ticket pool
//! - `backfill`: the loop that extends existing sessions
//! - `attributes`: session attribute merging

pub mod assembler;
pub mod attributes;
pub mod backfill;
pub mod filter;
pub mod pivot;
pub mod region;
pub mod roles;

pub use assembler::{AllyAssembler, AssembledTeam, Assembly, GreedyPacker, OrderingGenerator, PartyFinder, RoleMode};
pub use backfill::{BackfillOutcome, SessionMatcher};
pub use filter::{Acceptance, CandidateFilter, Commit, Pivot, Rejection, ScoredCandidate};
pub use pivot::{MatchOutcome, PivotMatcher};
pub use roles::{RoleTally, Slot};

use std::time::{Duration, Instant};

/// Default cap on the orderings tried per assembly
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// Cooperative wall-clock budget for one matching run.
///
/// Checked between pivots and between backfill placements; a single filter or
/// assembly call is never interrupted.
#[derive(Debug, Clone, Copy)]
pub struct TimeBudget {
    started: Instant,
    limit: Option<Duration>,
}

impl TimeBudget {
    pub fn new(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit: Some(limit),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            started: Instant::now(),
            limit: None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn exhausted(&self) -> bool {
        self.limit
            .map(|limit| self.elapsed() >= limit)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_budget() {
        assert!(!TimeBudget::unlimited().exhausted());
        assert!(TimeBudget::new(Duration::ZERO).exhausted());
        assert!(!TimeBudget::new(Duration::from_secs(60)).exhausted());
    }
}
