//! Rule set decoding, defaults and ticket admission

use crate::error::{MatchmakingError, Result};
use crate::request::MatchmakingRequest;
use crate::rules::ruleset::{AllianceRule, RuleSet};
use tracing::debug;

impl RuleSet {
    /// Decode, back-fill defaults and validate a rule set
    pub fn from_json(value: &serde_json::Value) -> Result<RuleSet> {
        let mut rules: RuleSet =
            serde_json::from_value(value.clone()).map_err(|e| MatchmakingError::RuleDecodeFailed {
                reason: e.to_string(),
            })?;
        rules.apply_defaults();
        rules.validate()?;
        Ok(rules)
    }

    pub fn from_json_str(raw: &str) -> Result<RuleSet> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| MatchmakingError::RuleDecodeFailed {
                reason: e.to_string(),
            })?;
        Self::from_json(&value)
    }

    /// Fill in unset values. Runs once per rule set instance.
    pub fn apply_defaults(&mut self) {
        if self.defaults_applied {
            return;
        }

        default_alliance(&mut self.alliance);
        for mode in self.sub_game_modes.values_mut() {
            default_alliance(&mut mode.alliance);
        }

        for rule in &mut self.matching_rules {
            if rule.weight.is_none() {
                rule.weight = Some(1.0);
            }
        }

        self.defaults_applied = true;
        debug!(
            "Applied rule set defaults: {} matching rules, {} flexing rules",
            self.matching_rules.len(),
            self.flexing_rules.len()
        );
    }
}

fn default_alliance(rule: &mut AllianceRule) {
    if rule.min_number == 0 {
        rule.min_number = 1;
    }
    if rule.max_number == 0 {
        rule.max_number = rule.min_number;
    }
    if rule.player_min_number == 0 {
        rule.player_min_number = 1;
    }
    if rule.player_max_number == 0 {
        rule.player_max_number = rule.player_min_number;
    }
}

/// Admission check run before a ticket is queued
pub fn validate_ticket(ticket: &MatchmakingRequest, rules: &RuleSet) -> Result<()> {
    ticket.validate()?;

    if rules.region_latency_max_ms > 0 {
        let acceptable = ticket
            .best_latency()
            .map(|best| best <= rules.region_latency_max_ms)
            .unwrap_or(false);
        if !acceptable {
            return Err(MatchmakingError::NoAcceptableRegion {
                ticket_id: ticket.ticket_id.clone(),
                max_latency_ms: rules.region_latency_max_ms,
            }
            .into());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::PartyMember;
    use crate::rules::{BlockedPlayerOption, MatchOptionType};
    use crate::utils::current_timestamp;
    use serde_json::json;

    fn create_test_rules_json() -> serde_json::Value {
        json!({
            "alliance": {
                "min_number": 2,
                "max_number": 2,
                "player_min_number": 1,
                "player_max_number": 0
            },
            "matching_rule": [
                { "attribute": "mmr", "criteria": "distance", "reference": 100.0 }
            ],
            "flexing_rule": [
                { "duration": 30, "attribute": "mmr", "criteria": "distance", "reference": 300.0 }
            ],
            "match_options": {
                "options": [ { "name": "cross_platform", "type": "any" } ]
            },
            "blocked_player_option": "blockedPlayerCanMatchOnDifferentTeam",
            "region_latency_max_ms": 150
        })
    }

    #[test]
    fn test_decode_applies_defaults() {
        let rules = RuleSet::from_json(&create_test_rules_json()).unwrap();

        assert!(rules.defaults_applied());
        assert_eq!(rules.alliance.player_max_number, 1);
        assert_eq!(rules.matching_rules[0].weight, Some(1.0));
        assert_eq!(
            rules.match_options.option_type("cross_platform"),
            Some(MatchOptionType::Any)
        );
        assert_eq!(
            rules.blocked_player_option,
            BlockedPlayerOption::CanMatchOnDifferentTeam
        );
        assert!(rules.narrow_any_options);
    }

    #[test]
    fn test_defaults_are_idempotent() {
        let mut rules = RuleSet::from_json(&create_test_rules_json()).unwrap();
        rules.matching_rules[0].weight = None;
        rules.apply_defaults();
        assert_eq!(rules.matching_rules[0].weight, None);
    }

    #[test]
    fn test_unknown_option_type_is_a_decode_error() {
        let mut raw = create_test_rules_json();
        raw["match_options"]["options"][0]["type"] = json!("sometimes");
        let err = RuleSet::from_json(&raw).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::RuleDecodeFailed { .. })
        ));

        let mut raw = create_test_rules_json();
        raw["blocked_player_option"] = json!("blockEveryone");
        assert!(RuleSet::from_json(&raw).is_err());
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let mut raw = create_test_rules_json();
        raw["alliance"]["min_number"] = json!(3);
        let err = RuleSet::from_json(&raw).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::InvalidRuleSet { .. })
        ));
    }

    #[test]
    fn test_wrong_shape_rejected() {
        assert!(RuleSet::from_json(&json!([1, 2, 3])).is_err());
        assert!(RuleSet::from_json_str("not json").is_err());
    }

    #[test]
    fn test_validate_ticket_latency_admission() {
        let rules = RuleSet::from_json(&create_test_rules_json()).unwrap();
        let base = MatchmakingRequest::new("t1", current_timestamp()).with_member(PartyMember::new("a"));

        let near = base.clone().with_latency("eu", 200).with_latency("us", 90);
        assert!(validate_ticket(&near, &rules).is_ok());

        let far = base.clone().with_latency("eu", 200);
        let err = validate_ticket(&far, &rules).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::NoAcceptableRegion { max_latency_ms: 150, .. })
        ));

        assert!(validate_ticket(&base, &rules).is_err());
    }
}
