//! Role flexing
//!
//! Once tickets have waited long enough, some of their members give up their
//! declared role and accept the wildcard role. Conversions are rationed per
//! interval across the whole pool.

use crate::request::MatchmakingRequest;
use crate::rules::ruleset::{AllianceRule, RoleCombination, RuleSet};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::debug;

/// Role flexing configuration picked for a pool
#[derive(Debug, Clone, Copy)]
pub struct RoleFlexSettings<'a> {
    pub alliance: &'a AllianceRule,
    pub combination: &'a RoleCombination,
    pub sub_game_mode: Option<&'a str>,
    pub rate_per_minute: f64,
}

/// Role flexing settings with the highest conversion rate across the main
/// alliance and every sub-game-mode
pub fn role_flex_settings(rules: &RuleSet) -> Option<RoleFlexSettings<'_>> {
    let main = std::iter::once((None, &rules.alliance));
    let modes = rules
        .sub_game_modes
        .iter()
        .map(|(name, mode)| (Some(name.as_str()), &mode.alliance));

    main.chain(modes)
        .filter_map(|(sub_game_mode, alliance)| {
            let combination = alliance.combination.as_ref()?;
            let rate_per_minute = combination.role_flex_rate_per_minute()?;
            Some(RoleFlexSettings {
                alliance,
                combination,
                sub_game_mode,
                rate_per_minute,
            })
        })
        .max_by(|a, b| a.rate_per_minute.total_cmp(&b.rate_per_minute))
}

/// Minimum players required per role over every team of the alliance
fn required_per_role(alliance: &AllianceRule, combination: &RoleCombination) -> BTreeMap<String, usize> {
    let mut required = BTreeMap::new();
    for team in 0..alliance.max_number {
        for role in combination.roles_for_team(team) {
            *required.entry(role.name.clone()).or_insert(0) += role.min;
        }
    }
    required
}

/// Convert members to the wildcard role. Returns the number converted.
pub fn apply_role_flexing(
    tickets: &mut [MatchmakingRequest],
    rules: &RuleSet,
    now: DateTime<Utc>,
) -> usize {
    let settings = match role_flex_settings(rules) {
        Some(settings) => settings,
        None => return 0,
    };
    let interval_secs = settings.combination.role_flexing_second as i64;

    let oldest_age = tickets
        .iter()
        .map(|ticket| ticket.age(now).num_seconds())
        .filter(|age| *age >= interval_secs)
        .max();
    let intervals = match oldest_age {
        Some(age) => (age / interval_secs) as usize,
        None => return 0,
    };

    let already_flexed = tickets
        .iter()
        .flat_map(|ticket| ticket.party_members.iter())
        .filter(|member| member.role_flexed)
        .count();
    let budget = (settings.combination.role_flexing_player * intervals).saturating_sub(already_flexed);
    if budget == 0 {
        return 0;
    }

    let required = required_per_role(settings.alliance, settings.combination);
    let mut assigned: BTreeMap<String, usize> = BTreeMap::new();
    for member in tickets.iter().flat_map(|ticket| ticket.party_members.iter()) {
        if let Some(role) = member.primary_role() {
            *assigned.entry(role).or_insert(0) += 1;
        }
    }
    let deficit = |role: &str| -> i64 {
        required.get(role).copied().unwrap_or(0) as i64
            - assigned.get(role).copied().unwrap_or(0) as i64
    };

    // (deficit, role, created_at, ticket index, member index)
    let mut candidates: Vec<(i64, String, DateTime<Utc>, usize, usize)> = Vec::new();
    for (ticket_index, ticket) in tickets.iter().enumerate() {
        if ticket.age(now).num_seconds() < interval_secs {
            continue;
        }
        for (member_index, member) in ticket.party_members.iter().enumerate() {
            if let Some(role) = member.primary_role() {
                candidates.push((deficit(&role), role, ticket.created_at, ticket_index, member_index));
            }
        }
    }

    candidates.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then_with(|| a.1.cmp(&b.1))
            .then_with(|| b.2.cmp(&a.2))
            .then_with(|| a.3.cmp(&b.3))
            .then_with(|| a.4.cmp(&b.4))
    });

    let mut converted = 0;
    for (_, role, _, ticket_index, member_index) in candidates.into_iter().take(budget) {
        let member = &mut tickets[ticket_index].party_members[member_index];
        member.role_flexed = true;
        converted += 1;
        debug!("Role flexed {} from {} to any", member.user_id, role);
    }
    converted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::PartyMember;
    use crate::rules::{Role, SubGameMode};
    use crate::types::keys;
    use crate::utils::current_timestamp;
    use chrono::Duration;

    fn create_test_combination(second: u64, player: usize) -> RoleCombination {
        RoleCombination {
            has_combination: true,
            unique: false,
            alliances: vec![vec![Role::new("tank", 1, 1), Role::new("healer", 1, 1), Role::new("dps", 0, 3)]],
            role_flexing_enable: true,
            role_flexing_second: second,
            role_flexing_player: player,
        }
    }

    fn create_test_rules() -> RuleSet {
        RuleSet::new(AllianceRule::new(2, 2, 3, 5).with_combination(create_test_combination(30, 1)))
    }

    fn create_test_ticket(id: &str, role: &str, age_secs: i64, now: DateTime<Utc>) -> MatchmakingRequest {
        MatchmakingRequest::new(id, now - Duration::seconds(age_secs))
            .with_member(PartyMember::new(format!("{}-user", id)).with_attribute(keys::ROLE, role))
    }

    #[test]
    fn test_highest_rate_settings_selected() {
        let rules = create_test_rules().with_sub_game_mode(
            "fast",
            SubGameMode {
                alliance: AllianceRule::new(2, 2, 3, 5).with_combination(create_test_combination(10, 2)),
                alliance_flexing_rules: vec![],
            },
        );

        let settings = role_flex_settings(&rules).unwrap();
        assert_eq!(settings.sub_game_mode, Some("fast"));
        assert_eq!(settings.rate_per_minute, 12.0);
    }

    #[test]
    fn test_no_flexing_before_first_interval() {
        let now = current_timestamp();
        let mut tickets = vec![create_test_ticket("t1", "dps", 20, now)];
        assert_eq!(apply_role_flexing(&mut tickets, &create_test_rules(), now), 0);
        assert!(!tickets[0].party_members[0].role_flexed);
    }

    #[test]
    fn test_budget_grows_per_interval() {
        let now = current_timestamp();
        let rules = create_test_rules();
        let mut tickets = vec![
            create_test_ticket("t1", "dps", 65, now),
            create_test_ticket("t2", "dps", 40, now),
            create_test_ticket("t3", "dps", 35, now),
        ];

        assert_eq!(apply_role_flexing(&mut tickets, &rules, now), 2);
        assert_eq!(apply_role_flexing(&mut tickets, &rules, now), 0);
    }

    #[test]
    fn test_largest_deficit_then_newest_first() {
        let now = current_timestamp();
        let rules = create_test_rules();
        let mut tickets = vec![
            create_test_ticket("old-dps", "dps", 50, now),
            create_test_ticket("old-tank", "tank", 45, now),
            create_test_ticket("new-tank", "tank", 31, now),
        ];

        // tank: 2 required, 2 present; dps: 0 required, 1 present
        assert_eq!(apply_role_flexing(&mut tickets, &rules, now), 1);
        assert!(tickets[2].party_members[0].role_flexed);
        assert!(!tickets[1].party_members[0].role_flexed);
        assert_eq!(tickets[2].party_members[0].declared_roles(), vec![keys::ANY_ROLE]);
    }

    #[test]
    fn test_disabled_without_combination() {
        let now = current_timestamp();
        let rules = RuleSet::new(AllianceRule::new(2, 2, 1, 1));
        let mut tickets = vec![create_test_ticket("t1", "dps", 600, now)];
        assert_eq!(apply_role_flexing(&mut tickets, &rules, now), 0);
    }
}
