//! Session attribute merging
//!
//! When parties are combined into one session their attributes are merged
//! following the match option semantics: `all`/`any` options and desired
//! platforms keep the common subset, `unique` options, current platforms and
//! block lists are unioned, and any other key keeps the first party's value.

use crate::request::session::RunningAverage;
use crate::request::MatchmakingRequest;
use crate::rules::{MatchOptionType, RuleSet};
use crate::types::{keys, AttributeValue, Attributes};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeMode {
    Intersect,
    Union,
    KeepFirst,
}

fn merge_mode(rules: &RuleSet, key: &str) -> MergeMode {
    match key {
        keys::CROSS_PLATFORM => return MergeMode::Intersect,
        keys::CURRENT_PLATFORM | keys::BLOCKED_PLAYERS => return MergeMode::Union,
        _ => {}
    }
    match rules.match_options.option_type(key) {
        Some(MatchOptionType::All) | Some(MatchOptionType::Any) => MergeMode::Intersect,
        Some(MatchOptionType::Unique) => MergeMode::Union,
        Some(MatchOptionType::Disable) | None => MergeMode::KeepFirst,
    }
}

/// Party attributes of a ticket with option values lifted from its members
pub fn ticket_attributes(rules: &RuleSet, ticket: &MatchmakingRequest) -> Attributes {
    let mut attributes = ticket.party_attributes.clone();

    let option_keys = rules
        .match_options
        .options
        .iter()
        .map(|option| option.name.as_str())
        .chain([keys::CROSS_PLATFORM, keys::CURRENT_PLATFORM]);
    for key in option_keys {
        if attributes.contains_key(key) {
            continue;
        }
        let values = ticket.option_values(key);
        if !values.is_empty() {
            attributes.insert(key.to_string(), AttributeValue::from_set(&values));
        }
    }

    let blocked = ticket.blocked_players();
    if !blocked.is_empty() {
        attributes.insert(keys::BLOCKED_PLAYERS.to_string(), AttributeValue::from_set(&blocked));
    }
    attributes
}

/// Merge `others` into `base`. `base` wins for plain keys and is the fallback
/// when an intersection comes out empty.
pub fn merge_attributes(rules: &RuleSet, base: &Attributes, others: &[Attributes]) -> Attributes {
    let mut merged = base.clone();

    let all_keys: BTreeSet<&String> = others.iter().flat_map(|attrs| attrs.keys()).collect();
    for key in all_keys {
        let incoming: Vec<&AttributeValue> = others.iter().filter_map(|attrs| attrs.get(key)).collect();

        match merge_mode(rules, key) {
            MergeMode::KeepFirst => {
                if !merged.contains_key(key) {
                    if let Some(value) = incoming.first() {
                        merged.insert(key.clone(), (*value).clone());
                    }
                }
            }
            MergeMode::Union => {
                let mut values = base.get(key).map(AttributeValue::values).unwrap_or_default();
                for value in &incoming {
                    values.extend(value.values());
                }
                merged.insert(key.clone(), AttributeValue::from_set(&values));
            }
            MergeMode::Intersect => {
                let fallback = base
                    .get(key)
                    .or_else(|| incoming.first().copied())
                    .map(AttributeValue::values)
                    .unwrap_or_default();
                let common = base
                    .get(key)
                    .into_iter()
                    .chain(incoming.iter().copied())
                    .map(AttributeValue::values)
                    .reduce(|acc, values| acc.intersection(&values).cloned().collect())
                    .unwrap_or_default();
                let values = if common.is_empty() { fallback } else { common };
                merged.insert(key.clone(), AttributeValue::from_set(&values));
            }
        }
    }

    merged
}

/// Merged attributes for a brand new session led by `pivot`
pub fn session_attributes(
    rules: &RuleSet,
    pivot: &MatchmakingRequest,
    others: &[&MatchmakingRequest],
) -> Attributes {
    let base = ticket_attributes(rules, pivot);
    let others: Vec<Attributes> = others
        .iter()
        .map(|ticket| ticket_attributes(rules, ticket))
        .collect();
    merge_attributes(rules, &base, &others)
}

/// Player-weighted averages of every matching attribute
pub fn matching_averages(
    rules: &RuleSet,
    tickets: &[&MatchmakingRequest],
) -> BTreeMap<String, RunningAverage> {
    rules
        .matching_rules
        .iter()
        .map(|rule| {
            let mut average = RunningAverage::new(0.0, 0);
            for ticket in tickets {
                average.absorb(ticket.attribute_average(&rule.attribute), ticket.player_count());
            }
            (rule.attribute.clone(), average)
        })
        .collect()
}
