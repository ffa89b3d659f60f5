//! Property tests for time-based rule flexing

mod fixtures;

use alliance_matchmaker::rules::{
    active_tolerance, flex_alliance, flex_rule_set, AllianceFlexingRule, AllianceRule, FlexingRule,
    MatchingRule, RuleSet,
};
use chrono::Duration;
use fixtures::test_epoch;
use proptest::prelude::*;

/// Base tolerance plus flexing steps that widen it as durations grow
fn flexing_rules() -> impl Strategy<Value = RuleSet> {
    (
        0.0f64..500.0,
        prop::collection::vec((0u64..600, 0.0f64..300.0), 0..6),
    )
        .prop_map(|(base, mut steps)| {
            steps.sort_by_key(|(duration, _)| *duration);
            let mut rules = RuleSet::new(AllianceRule::new(2, 2, 1, 1))
                .with_matching_rule(MatchingRule::distance("mmr", base));
            let mut reference = base;
            for (duration, widen) in steps {
                reference += widen;
                rules = rules.with_flexing_rule(FlexingRule::new(duration, "mmr", reference));
            }
            rules
        })
}

proptest! {
    #[test]
    fn prop_generated_rules_are_valid(rules in flexing_rules()) {
        prop_assert!(rules.validate().is_ok());
    }

    #[test]
    fn prop_tolerance_never_tightens(
        rules in flexing_rules(),
        earlier in 0i64..900,
        later_by in 0i64..900,
    ) {
        let anchor = test_epoch();
        let t0 = anchor + Duration::seconds(earlier);
        let t1 = t0 + Duration::seconds(later_by);

        let before = active_tolerance(&rules, "mmr", anchor, t0).unwrap();
        let after = active_tolerance(&rules, "mmr", anchor, t1).unwrap();
        prop_assert!(after >= before, "{} tightened to {}", before, after);
    }

    #[test]
    fn prop_flexing_is_pure(rules in flexing_rules(), elapsed in 0i64..900) {
        let anchor = test_epoch();
        let now = anchor + Duration::seconds(elapsed);
        let snapshot = rules.clone();

        let first = flex_rule_set(&rules, anchor, now);
        let second = flex_rule_set(&rules, anchor, now);

        prop_assert_eq!(&first, &second);
        prop_assert_eq!(&rules, &snapshot);
        prop_assert_eq!(
            first.0.matching_rules[0].reference,
            active_tolerance(&rules, "mmr", anchor, now).unwrap()
        );
    }

    #[test]
    fn prop_alliance_flex_applies_longest_active_rule(
        durations in prop::collection::vec(0u64..300, 1..5),
        elapsed in 0i64..400,
    ) {
        let anchor = test_epoch();
        let now = anchor + Duration::seconds(elapsed);
        let base = AllianceRule::new(2, 2, 4, 4);
        let flexing: Vec<AllianceFlexingRule> = durations
            .iter()
            .map(|duration| AllianceFlexingRule::new(*duration, 2, 2, 1, 4))
            .collect();

        let (alliance, flexed) = flex_alliance(&base, &flexing, anchor, now);
        let expected = durations.iter().any(|duration| (*duration as i64) < elapsed);

        prop_assert_eq!(flexed, expected);
        prop_assert_eq!(alliance.player_min_number, if expected { 1 } else { 4 });
        prop_assert_eq!(base.player_min_number, 4);
    }
}
