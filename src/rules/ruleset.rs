//! Rule set definitions
//!
//! A rule set is the per-channel configuration: alliance shape, attribute
//! distance rules, their time-keyed flexing variants, match options and region
//! latency expansion. Rule sets are plain values; flexing derives a new value
//! and never edits the source.

use crate::error::{MatchmakingError, Result};
use crate::types::UserId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Comparison criteria of a matching rule. Only distance is scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Criteria {
    #[default]
    Distance,
}

/// Attribute distance rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingRule {
    pub attribute: String,
    #[serde(default)]
    pub criteria: Criteria,
    /// Tolerance around the pivot's value
    pub reference: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalization_max: Option<f64>,
}

impl MatchingRule {
    pub fn distance(attribute: impl Into<String>, reference: f64) -> Self {
        Self {
            attribute: attribute.into(),
            criteria: Criteria::Distance,
            reference,
            weight: None,
            normalization_max: None,
        }
    }

    pub fn weight(&self) -> f64 {
        self.weight.unwrap_or(1.0)
    }

    /// Score contribution of a distance under this rule
    pub fn score(&self, distance: f64) -> f64 {
        let normalized = match self.normalization_max {
            Some(max) if max > 0.0 => distance / max,
            _ => distance,
        };
        normalized * self.weight()
    }
}

/// Wider tolerance for one attribute, active after `duration` seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlexingRule {
    pub duration: u64,
    pub attribute: String,
    #[serde(default)]
    pub criteria: Criteria,
    pub reference: f64,
}

impl FlexingRule {
    pub fn new(duration: u64, attribute: impl Into<String>, reference: f64) -> Self {
        Self {
            duration,
            attribute: attribute.into(),
            criteria: Criteria::Distance,
            reference,
        }
    }
}

/// Quota for one role inside a team
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub min: usize,
    pub max: usize,
}

impl Role {
    pub fn new(name: impl Into<String>, min: usize, max: usize) -> Self {
        Self {
            name: name.into(),
            min,
            max,
        }
    }
}

/// Role composition of the alliances, plus role flexing settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RoleCombination {
    #[serde(default)]
    pub has_combination: bool,
    /// Each declared role may be taken by at most one player per team
    #[serde(default)]
    pub unique: bool,
    /// Role quotas per team. Teams beyond the list reuse it cyclically.
    #[serde(default)]
    pub alliances: Vec<Vec<Role>>,
    #[serde(default)]
    pub role_flexing_enable: bool,
    #[serde(default)]
    pub role_flexing_second: u64,
    #[serde(default)]
    pub role_flexing_player: usize,
}

impl RoleCombination {
    pub fn roles_for_team(&self, team_index: usize) -> &[Role] {
        if self.alliances.is_empty() {
            return &[];
        }
        &self.alliances[team_index % self.alliances.len()]
    }

    /// Conversions per minute when role flexing is usable
    pub fn role_flex_rate_per_minute(&self) -> Option<f64> {
        if !self.role_flexing_enable || self.role_flexing_second == 0 || self.role_flexing_player == 0
        {
            return None;
        }
        Some(self.role_flexing_player as f64 * 60.0 / self.role_flexing_second as f64)
    }

    fn validate(&self) -> Result<()> {
        for (index, team) in self.alliances.iter().enumerate() {
            let mut names = BTreeSet::new();
            for role in team {
                if role.name.trim().is_empty() {
                    return Err(MatchmakingError::invalid_rules(format!(
                        "role combination team {} has a role without a name",
                        index
                    ))
                    .into());
                }
                if !names.insert(role.name.as_str()) {
                    return Err(MatchmakingError::invalid_rules(format!(
                        "role {} declared twice for team {}",
                        role.name, index
                    ))
                    .into());
                }
                if role.min > role.max {
                    return Err(MatchmakingError::invalid_rules(format!(
                        "role {} has min {} above max {}",
                        role.name, role.min, role.max
                    ))
                    .into());
                }
            }
        }
        if self.role_flexing_enable && self.role_flexing_second == 0 {
            return Err(MatchmakingError::invalid_rules(
                "role flexing enabled without role_flexing_second",
            )
            .into());
        }
        Ok(())
    }
}

/// Shape of a match: how many teams, and how many players per team
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllianceRule {
    pub min_number: usize,
    pub max_number: usize,
    pub player_min_number: usize,
    pub player_max_number: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combination: Option<RoleCombination>,
}

impl AllianceRule {
    pub fn new(
        min_number: usize,
        max_number: usize,
        player_min_number: usize,
        player_max_number: usize,
    ) -> Self {
        Self {
            min_number,
            max_number,
            player_min_number,
            player_max_number,
            combination: None,
        }
    }

    pub fn with_combination(mut self, combination: RoleCombination) -> Self {
        self.combination = Some(combination);
        self
    }

    /// One team of one player: every ticket is its own match
    pub fn is_single_player_single_team(&self) -> bool {
        self.min_number == 1
            && self.max_number == 1
            && self.player_min_number == 1
            && self.player_max_number == 1
    }

    /// Fewest players a valid match can hold
    pub fn min_players(&self) -> usize {
        self.min_number * self.player_min_number
    }

    /// Most players a match can hold
    pub fn max_players(&self) -> usize {
        self.max_number * self.player_max_number
    }

    pub fn has_role_combination(&self) -> bool {
        self.combination
            .as_ref()
            .map(|combination| combination.has_combination)
            .unwrap_or(false)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_number == 0 || self.player_max_number == 0 {
            return Err(MatchmakingError::invalid_rules(
                "alliance max_number and player_max_number must be positive",
            )
            .into());
        }
        if self.min_number > self.max_number {
            return Err(MatchmakingError::invalid_rules(format!(
                "alliance min_number {} above max_number {}",
                self.min_number, self.max_number
            ))
            .into());
        }
        if self.player_min_number > self.player_max_number {
            return Err(MatchmakingError::invalid_rules(format!(
                "alliance player_min_number {} above player_max_number {}",
                self.player_min_number, self.player_max_number
            ))
            .into());
        }
        if let Some(combination) = &self.combination {
            combination.validate()?;
        }
        Ok(())
    }

    /// Check a full set of assembled teams against this rule
    pub fn validate_allies(
        &self,
        teams: &[TeamSummary],
        blocked_option: BlockedPlayerOption,
    ) -> std::result::Result<(), AllyViolation> {
        if teams.len() < self.min_number || teams.len() > self.max_number {
            return Err(AllyViolation::TeamCount {
                teams: teams.len(),
                min: self.min_number,
                max: self.max_number,
            });
        }

        for (index, team) in teams.iter().enumerate() {
            if team.players < self.player_min_number || team.players > self.player_max_number {
                return Err(AllyViolation::TeamSize {
                    team: index,
                    players: team.players,
                    min: self.player_min_number,
                    max: self.player_max_number,
                });
            }
        }

        match blocked_option {
            BlockedPlayerOption::CanMatch => {}
            BlockedPlayerOption::CanMatchOnDifferentTeam => {
                for (index, team) in teams.iter().enumerate() {
                    if !team.blocked.is_disjoint(&team.user_ids) {
                        return Err(AllyViolation::BlockedTeammate { team: index });
                    }
                }
            }
            BlockedPlayerOption::CannotMatch => {
                let users: BTreeSet<&UserId> = teams.iter().flat_map(|t| t.user_ids.iter()).collect();
                for (index, team) in teams.iter().enumerate() {
                    if team.blocked.iter().any(|blocked| users.contains(blocked)) {
                        return Err(AllyViolation::BlockedInMatch { team: index });
                    }
                }
            }
        }

        Ok(())
    }
}

/// Minimal view of one assembled team, as needed by [`AllianceRule::validate_allies`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TeamSummary {
    pub players: usize,
    pub user_ids: BTreeSet<UserId>,
    pub blocked: BTreeSet<UserId>,
}

/// Why a set of teams does not satisfy the alliance rule
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AllyViolation {
    #[error("{teams} teams, expected {min}..={max}")]
    TeamCount { teams: usize, min: usize, max: usize },

    #[error("team {team} has {players} players, expected {min}..={max}")]
    TeamSize {
        team: usize,
        players: usize,
        min: usize,
        max: usize,
    },

    #[error("team {team} contains a blocked teammate")]
    BlockedTeammate { team: usize },

    #[error("team {team} blocks a player in the same match")]
    BlockedInMatch { team: usize },
}

/// Looser team bounds, active after `duration` seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllianceFlexingRule {
    pub duration: u64,
    pub min_number: usize,
    pub max_number: usize,
    pub player_min_number: usize,
    pub player_max_number: usize,
}

impl AllianceFlexingRule {
    pub fn new(
        duration: u64,
        min_number: usize,
        max_number: usize,
        player_min_number: usize,
        player_max_number: usize,
    ) -> Self {
        Self {
            duration,
            min_number,
            max_number,
            player_min_number,
            player_max_number,
        }
    }

    /// Overwrite the bounds of `rule`, keeping its role combination
    pub fn apply_to(&self, rule: &mut AllianceRule) {
        rule.min_number = self.min_number;
        rule.max_number = self.max_number;
        rule.player_min_number = self.player_min_number;
        rule.player_max_number = self.player_max_number;
    }

    fn validate(&self) -> Result<()> {
        let as_rule = AllianceRule::new(
            self.min_number,
            self.max_number,
            self.player_min_number,
            self.player_max_number,
        );
        as_rule.validate().map_err(|e| {
            MatchmakingError::invalid_rules(format!(
                "alliance flexing rule at {}s: {}",
                self.duration, e
            ))
            .into()
        })
    }
}

/// Compatibility semantics of a match option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchOptionType {
    /// Every party carries every pivot value
    All,
    /// At least one shared value
    Any,
    /// No value may be shared between parties
    Unique,
    /// Attribute ignored
    Disable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchOption {
    pub name: String,
    #[serde(rename = "type")]
    pub option_type: MatchOptionType,
}

impl MatchOption {
    pub fn new(name: impl Into<String>, option_type: MatchOptionType) -> Self {
        Self {
            name: name.into(),
            option_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MatchOptionRule {
    #[serde(default)]
    pub options: Vec<MatchOption>,
}

impl MatchOptionRule {
    pub fn option_type(&self, name: &str) -> Option<MatchOptionType> {
        self.options
            .iter()
            .find(|option| option.name == name)
            .map(|option| option.option_type)
    }

    pub fn is_option(&self, name: &str) -> bool {
        self.options.iter().any(|option| option.name == name)
    }
}

/// How blocked players are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlockedPlayerOption {
    #[serde(rename = "blockedPlayerCanMatch")]
    CanMatch,
    #[serde(rename = "blockedPlayerCanMatchOnDifferentTeam")]
    CanMatchOnDifferentTeam,
    #[default]
    #[serde(rename = "blockedPlayerCannotMatch")]
    CannotMatch,
}

/// Alternative alliance shape selected by the tickets' `sub_game_mode`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubGameMode {
    pub alliance: AllianceRule,
    #[serde(default, rename = "alliance_flexing_rule")]
    pub alliance_flexing_rules: Vec<AllianceFlexingRule>,
}

fn default_true() -> bool {
    true
}

/// Complete per-channel rule set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub alliance: AllianceRule,
    #[serde(default, rename = "matching_rule")]
    pub matching_rules: Vec<MatchingRule>,
    #[serde(default, rename = "flexing_rule")]
    pub flexing_rules: Vec<FlexingRule>,
    #[serde(default, rename = "alliance_flexing_rule")]
    pub alliance_flexing_rules: Vec<AllianceFlexingRule>,
    #[serde(default)]
    pub match_options: MatchOptionRule,
    /// Milliseconds of waiting per latency expansion step
    #[serde(default)]
    pub region_expansion_rate_ms: u64,
    /// Latency added to the window per expansion step
    #[serde(default)]
    pub region_expansion_range_ms: u64,
    /// Window above the best latency before any expansion
    #[serde(default)]
    pub region_latency_initial_range_ms: u64,
    /// Hard latency cap, zero for none
    #[serde(default)]
    pub region_latency_max_ms: u64,
    #[serde(default)]
    pub blocked_player_option: BlockedPlayerOption,
    #[serde(default)]
    pub sub_game_modes: BTreeMap<String, SubGameMode>,
    /// Narrow `any` options (cross-play included) to the common subset of
    /// everyone accepted so far
    #[serde(default = "default_true")]
    pub narrow_any_options: bool,
    /// Skip custom party attribute equality when forming new matches; it is
    /// still enforced when backfilling
    #[serde(default, rename = "match_options_referred_for_backfill")]
    pub defer_party_attribute_checks: bool,
    /// New matches that are not full stay open for backfill
    #[serde(default)]
    pub auto_backfill: bool,
    #[serde(skip)]
    pub(crate) defaults_applied: bool,
}

impl RuleSet {
    pub fn new(alliance: AllianceRule) -> Self {
        Self {
            alliance,
            matching_rules: Vec::new(),
            flexing_rules: Vec::new(),
            alliance_flexing_rules: Vec::new(),
            match_options: MatchOptionRule::default(),
            region_expansion_rate_ms: 0,
            region_expansion_range_ms: 0,
            region_latency_initial_range_ms: 0,
            region_latency_max_ms: 0,
            blocked_player_option: BlockedPlayerOption::default(),
            sub_game_modes: BTreeMap::new(),
            narrow_any_options: true,
            defer_party_attribute_checks: false,
            auto_backfill: false,
            defaults_applied: false,
        }
    }

    pub fn with_matching_rule(mut self, rule: MatchingRule) -> Self {
        self.matching_rules.push(rule);
        self
    }

    pub fn with_flexing_rule(mut self, rule: FlexingRule) -> Self {
        self.flexing_rules.push(rule);
        self
    }

    pub fn with_alliance_flexing_rule(mut self, rule: AllianceFlexingRule) -> Self {
        self.alliance_flexing_rules.push(rule);
        self
    }

    pub fn with_match_option(mut self, name: &str, option_type: MatchOptionType) -> Self {
        self.match_options.options.push(MatchOption::new(name, option_type));
        self
    }

    pub fn with_blocked_player_option(mut self, option: BlockedPlayerOption) -> Self {
        self.blocked_player_option = option;
        self
    }

    pub fn with_region_expansion(
        mut self,
        initial_range_ms: u64,
        expansion_rate_ms: u64,
        expansion_range_ms: u64,
        max_latency_ms: u64,
    ) -> Self {
        self.region_latency_initial_range_ms = initial_range_ms;
        self.region_expansion_rate_ms = expansion_rate_ms;
        self.region_expansion_range_ms = expansion_range_ms;
        self.region_latency_max_ms = max_latency_ms;
        self
    }

    pub fn with_sub_game_mode(mut self, name: &str, mode: SubGameMode) -> Self {
        self.sub_game_modes.insert(name.to_string(), mode);
        self
    }

    pub fn matching_rule(&self, attribute: &str) -> Option<&MatchingRule> {
        self.matching_rules
            .iter()
            .find(|rule| rule.attribute == attribute)
    }

    /// Whether any latency bound is configured
    pub fn uses_region_latency(&self) -> bool {
        self.region_latency_initial_range_ms > 0
            || self.region_latency_max_ms > 0
            || self.region_expansion_rate_ms > 0
    }

    /// Alliance rule for a sub-game-mode, or the main one
    pub fn alliance_for(&self, sub_game_mode: Option<&str>) -> &AllianceRule {
        sub_game_mode
            .and_then(|name| self.sub_game_modes.get(name))
            .map(|mode| &mode.alliance)
            .unwrap_or(&self.alliance)
    }

    /// Alliance flexing rules for a sub-game-mode, or the main ones
    pub fn alliance_flexing_for(&self, sub_game_mode: Option<&str>) -> &[AllianceFlexingRule] {
        sub_game_mode
            .and_then(|name| self.sub_game_modes.get(name))
            .map(|mode| mode.alliance_flexing_rules.as_slice())
            .unwrap_or(&self.alliance_flexing_rules)
    }

    /// Fewest players any alliance shape can start a match with, flexed or not
    pub fn smallest_min_players(&self) -> usize {
        std::iter::once(None)
            .chain(self.sub_game_modes.keys().map(|name| Some(name.as_str())))
            .flat_map(|mode| {
                let base = self.alliance_for(mode);
                std::iter::once(base.min_players()).chain(self.alliance_flexing_for(mode).iter().map(
                    move |flex| {
                        let mut flexed = base.clone();
                        flex.apply_to(&mut flexed);
                        flexed.min_players()
                    },
                ))
            })
            .min()
            .unwrap_or(0)
    }

    pub fn defaults_applied(&self) -> bool {
        self.defaults_applied
    }

    /// Structural validation; decode errors (unknown option or blocked
    /// player types) are caught earlier by serde.
    pub fn validate(&self) -> Result<()> {
        self.alliance.validate()?;

        for rule in &self.matching_rules {
            if rule.attribute.trim().is_empty() {
                return Err(MatchmakingError::invalid_rules("matching rule without attribute").into());
            }
            if rule.reference < 0.0 {
                return Err(MatchmakingError::invalid_rules(format!(
                    "matching rule {} has negative reference",
                    rule.attribute
                ))
                .into());
            }
            if matches!(rule.weight, Some(weight) if weight < 0.0) {
                return Err(MatchmakingError::invalid_rules(format!(
                    "matching rule {} has negative weight",
                    rule.attribute
                ))
                .into());
            }
        }

        self.validate_flexing_rules()?;

        for rule in &self.alliance_flexing_rules {
            rule.validate()?;
        }

        for (name, mode) in &self.sub_game_modes {
            mode.alliance.validate().map_err(|e| {
                MatchmakingError::invalid_rules(format!("sub game mode {}: {}", name, e))
            })?;
            for rule in &mode.alliance_flexing_rules {
                rule.validate()?;
            }
        }

        for option in &self.match_options.options {
            if option.name.trim().is_empty() {
                return Err(MatchmakingError::invalid_rules("match option without name").into());
            }
        }

        if self.region_latency_max_ms > 0
            && self.region_latency_initial_range_ms > self.region_latency_max_ms
        {
            return Err(MatchmakingError::invalid_rules(format!(
                "region_latency_initial_range_ms {} above region_latency_max_ms {}",
                self.region_latency_initial_range_ms, self.region_latency_max_ms
            ))
            .into());
        }
        if self.region_expansion_rate_ms > 0 && self.region_expansion_range_ms == 0 {
            return Err(MatchmakingError::invalid_rules(
                "region_expansion_rate_ms set without region_expansion_range_ms",
            )
            .into());
        }

        Ok(())
    }

    /// Flexing may only widen a tolerance, and a longer wait may never get a
    /// narrower tolerance than a shorter one.
    fn validate_flexing_rules(&self) -> Result<()> {
        for flex in &self.flexing_rules {
            let base = self.matching_rule(&flex.attribute).ok_or_else(|| {
                MatchmakingError::invalid_rules(format!(
                    "flexing rule for {} has no matching rule",
                    flex.attribute
                ))
            })?;
            if flex.reference < base.reference {
                return Err(MatchmakingError::invalid_rules(format!(
                    "flexing rule for {} at {}s narrows the tolerance ({} < {})",
                    flex.attribute, flex.duration, flex.reference, base.reference
                ))
                .into());
            }
        }

        for flex in &self.flexing_rules {
            let narrower_later = self.flexing_rules.iter().any(|other| {
                other.attribute == flex.attribute
                    && other.duration > flex.duration
                    && other.reference < flex.reference
            });
            if narrower_later {
                return Err(MatchmakingError::invalid_rules(format!(
                    "flexing rules for {} narrow the tolerance as the wait grows",
                    flex.attribute
                ))
                .into());
            }
        }

        Ok(())
    }
}
