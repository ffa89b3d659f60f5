//! Rule sets and their time-based flexing

pub mod decode;
pub mod flexing;
pub mod role_flex;
pub mod ruleset;

pub use decode::validate_ticket;
pub use flexing::{active_flexing_rule, active_tolerance, flex_alliance, flex_alliance_for, flex_rule_set};
pub use role_flex::{apply_role_flexing, role_flex_settings, RoleFlexSettings};
pub use ruleset::{
    AllianceFlexingRule, AllianceRule, AllyViolation, BlockedPlayerOption, Criteria, FlexingRule,
    MatchOption, MatchOptionRule, MatchOptionType, MatchingRule, Role, RoleCombination, RuleSet,
    SubGameMode, TeamSummary,
};
