//! Time-based rule flexing
//!
//! A flexing rule becomes active once `anchor + duration < now`, where the
//! anchor is the creation time of the pivot (ticket or session). Among the
//! active rules for one attribute the one with the longest duration replaces
//! the base rule outright; flexing is not cumulative.
//!
//! Everything here is pure: the source rule set is cloned, never modified.

use crate::rules::ruleset::{AllianceFlexingRule, AllianceRule, FlexingRule, RuleSet};
use chrono::{DateTime, Duration, Utc};

fn is_active(duration_secs: u64, anchor: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let duration = Duration::seconds(duration_secs.min(i64::MAX as u64 / 1_000) as i64);
    anchor
        .checked_add_signed(duration)
        .map(|threshold| threshold < now)
        .unwrap_or(false)
}

/// Longest-duration active flexing rule for `attribute`. On equal durations
/// the later rule in declaration order wins.
pub fn active_flexing_rule<'a>(
    rules: &'a RuleSet,
    attribute: &str,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<&'a FlexingRule> {
    rules
        .flexing_rules
        .iter()
        .filter(|flex| flex.attribute == attribute && is_active(flex.duration, anchor, now))
        .max_by_key(|flex| flex.duration)
}

/// Tolerance in force for `attribute` for a participant created at `anchor`
pub fn active_tolerance(
    rules: &RuleSet,
    attribute: &str,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<f64> {
    let base = rules.matching_rule(attribute)?;
    Some(
        active_flexing_rule(rules, attribute, anchor, now)
            .map(|flex| flex.reference)
            .unwrap_or(base.reference),
    )
}

/// Alliance rule with the longest active alliance flexing rule applied
pub fn flex_alliance(
    base: &AllianceRule,
    flexing: &[AllianceFlexingRule],
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> (AllianceRule, bool) {
    let mut alliance = base.clone();
    match flexing
        .iter()
        .filter(|flex| is_active(flex.duration, anchor, now))
        .max_by_key(|flex| flex.duration)
    {
        Some(flex) => {
            flex.apply_to(&mut alliance);
            (alliance, true)
        }
        None => (alliance, false),
    }
}

/// Alliance rule of a sub-game-mode (or the main one), flexed
pub fn flex_alliance_for(
    rules: &RuleSet,
    sub_game_mode: Option<&str>,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> (AllianceRule, bool) {
    flex_alliance(
        rules.alliance_for(sub_game_mode),
        rules.alliance_flexing_for(sub_game_mode),
        anchor,
        now,
    )
}

/// Derive the active rule set for a pivot created at `anchor`.
///
/// Returns the flexed copy and whether any flexing rule applied.
pub fn flex_rule_set(
    rules: &RuleSet,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> (RuleSet, bool) {
    let mut active = rules.clone();
    let mut flexed = false;

    for matching in &mut active.matching_rules {
        if let Some(flex) = active_flexing_rule(rules, &matching.attribute, anchor, now) {
            matching.reference = flex.reference;
            matching.criteria = flex.criteria;
            flexed = true;
        }
    }

    let (alliance, alliance_flexed) =
        flex_alliance(&rules.alliance, &rules.alliance_flexing_rules, anchor, now);
    active.alliance = alliance;

    (active, flexed || alliance_flexed)
}
