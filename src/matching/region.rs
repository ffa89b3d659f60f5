//! Region latency windows
//!
//! A ticket accepts regions whose latency is within a window above its best
//! latency. The window starts at `region_latency_initial_range_ms`, grows by
//! `region_expansion_range_ms` every `region_expansion_rate_ms` of waiting and
//! never exceeds `region_latency_max_ms` when that is set.

use crate::request::MatchmakingRequest;
use crate::rules::RuleSet;
use chrono::{DateTime, Utc};

/// Largest latency the ticket currently accepts, or `None` when region
/// latency is not configured for this rule set.
pub fn latency_limit(
    rules: &RuleSet,
    ticket: &MatchmakingRequest,
    now: DateTime<Utc>,
) -> Option<u64> {
    if !rules.uses_region_latency() {
        return None;
    }
    let best = ticket.best_latency()?;

    let expansion = if rules.region_expansion_rate_ms > 0 {
        let age_ms = ticket.age(now).num_milliseconds().max(0) as u64;
        (age_ms / rules.region_expansion_rate_ms).saturating_mul(rules.region_expansion_range_ms)
    } else {
        0
    };

    let limit = best
        .saturating_add(rules.region_latency_initial_range_ms)
        .saturating_add(expansion);

    if rules.region_latency_max_ms > 0 {
        Some(limit.min(rules.region_latency_max_ms))
    } else {
        Some(limit)
    }
}

/// Regions the pivot is willing to try, best latency first.
///
/// Yields a single `None` pass when region latency is not configured or the
/// ticket reports no latency at all.
pub fn pivot_regions(
    rules: &RuleSet,
    ticket: &MatchmakingRequest,
    now: DateTime<Utc>,
) -> Vec<Option<String>> {
    let limit = match latency_limit(rules, ticket, now) {
        Some(limit) => limit,
        None => return vec![None],
    };

    ticket
        .sorted_latencies()
        .into_iter()
        .filter(|(_, latency)| *latency <= limit)
        .map(|(region, _)| Some(region))
        .collect()
}

/// Check a candidate against a fixed region.
///
/// Returns the score contribution (latency above the candidate's best) and
/// the raw latency, or `None` when the candidate cannot play there.
pub fn region_fit(
    rules: &RuleSet,
    candidate: &MatchmakingRequest,
    region: Option<&str>,
    now: DateTime<Utc>,
) -> Option<(f64, Option<u64>)> {
    let region = match region {
        Some(region) => region,
        None => return Some((0.0, None)),
    };

    let latency = candidate.latency_to(region);
    if !rules.uses_region_latency() {
        return Some((0.0, latency));
    }

    let latency = latency?;
    let limit = latency_limit(rules, candidate, now)?;
    if latency > limit {
        return None;
    }

    let best = candidate.best_latency().unwrap_or(latency);
    Some(((latency - best) as f64, Some(latency)))
}
