//! Party/ally assembly
//!
//! Assembly is a bounded search split into three parts:
//! - [`OrderingGenerator`] yields re-orderings of the candidate list, with the
//!   pivot and priority tickets pinned at the front, up to an iteration cap;
//! - [`GreedyPacker`] packs one ordering into teams, first up to each team's
//!   minimum, then up to its maximum;
//! - [`AllianceRule::validate_allies`] accepts or rejects the packed teams.
//!
//! The first full assembly wins. Otherwise the largest valid one is kept.

use crate::matching::roles::{RoleTally, Slot};
use crate::request::MatchmakingRequest;
use crate::rules::{AllianceRule, BlockedPlayerOption, TeamSummary};
use crate::types::{TicketId, UserId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

/// One assembled team
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledTeam {
    pub ticket_ids: Vec<TicketId>,
    pub players: usize,
    /// Role picked for each member, when role quotas apply
    pub roles: BTreeMap<UserId, String>,
}

/// Teams produced for one pivot
#[derive(Debug, Clone, PartialEq)]
pub struct Assembly {
    pub teams: Vec<AssembledTeam>,
}

impl Assembly {
    pub fn player_count(&self) -> usize {
        self.teams.iter().map(|team| team.players).sum()
    }

    pub fn ticket_ids(&self) -> Vec<TicketId> {
        self.teams
            .iter()
            .flat_map(|team| team.ticket_ids.iter().cloned())
            .collect()
    }

    /// Every team present and at its player maximum
    pub fn is_full(&self, rule: &AllianceRule) -> bool {
        self.teams.len() == rule.max_number
            && self
                .teams
                .iter()
                .all(|team| team.players == rule.player_max_number)
    }
}

fn next_permutation(values: &mut [usize]) -> bool {
    if values.len() < 2 {
        return false;
    }
    let mut i = values.len() - 1;
    while i > 0 && values[i - 1] >= values[i] {
        i -= 1;
    }
    if i == 0 {
        return false;
    }
    let mut j = values.len() - 1;
    while values[j] <= values[i - 1] {
        j -= 1;
    }
    values.swap(i - 1, j);
    values[i..].reverse();
    true
}

/// Candidate orderings over entry indices `0..len`.
///
/// The first `pinned` indices never move. The tail is rotated first, then
/// walked through lexicographic permutations, until `cap` orderings were
/// produced.
#[derive(Debug, Clone)]
pub struct OrderingGenerator {
    pinned: usize,
    len: usize,
    cap: usize,
    produced: usize,
    rotation: usize,
    permutation: Option<Vec<usize>>,
}

impl OrderingGenerator {
    pub fn new(len: usize, pinned: usize, cap: usize) -> Self {
        Self {
            pinned: pinned.min(len),
            len,
            cap,
            produced: 0,
            rotation: 0,
            permutation: None,
        }
    }

    fn tail_len(&self) -> usize {
        self.len - self.pinned
    }

    fn with_tail(&self, tail: &[usize]) -> Vec<usize> {
        (0..self.pinned).chain(tail.iter().copied()).collect()
    }
}

impl Iterator for OrderingGenerator {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.produced >= self.cap {
            return None;
        }

        let tail_len = self.tail_len();
        if self.rotation < tail_len.max(1) {
            let mut tail: Vec<usize> = (self.pinned..self.len).collect();
            let shift = self.rotation.min(tail.len());
            tail.rotate_left(shift);
            self.rotation += 1;
            self.produced += 1;
            return Some(self.with_tail(&tail));
        }

        let permutation = self
            .permutation
            .get_or_insert_with(|| (self.pinned..self.len).collect());
        if !next_permutation(permutation) {
            self.produced = self.cap;
            return None;
        }
        let tail = permutation.clone();
        self.produced += 1;
        Some(self.with_tail(&tail))
    }
}

/// Which party finder handles role quotas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleMode {
    /// Quota-agnostic
    Normal,
    /// Role quotas with late-resolved wildcards
    Combo,
    /// Each declared role taken at most once per team
    Unique,
}

#[derive(Debug, Clone)]
struct TeamBuild {
    entries: Vec<usize>,
    players: usize,
    users: BTreeSet<UserId>,
    blocked: BTreeSet<UserId>,
    tally: Option<RoleTally>,
    roles: BTreeMap<UserId, String>,
    wildcards: Vec<UserId>,
}

impl TeamBuild {
    fn new(tally: Option<RoleTally>) -> Self {
        Self {
            entries: Vec::new(),
            players: 0,
            users: BTreeSet::new(),
            blocked: BTreeSet::new(),
            tally,
            roles: BTreeMap::new(),
            wildcards: Vec::new(),
        }
    }

    fn roles_satisfied(&self) -> bool {
        self.tally
            .as_ref()
            .map(RoleTally::satisfies_minimums)
            .unwrap_or(true)
    }

    fn summary(&self) -> TeamSummary {
        TeamSummary {
            players: self.players,
            user_ids: self.users.clone(),
            blocked: self.blocked.clone(),
        }
    }

    fn finish(self, entries: &[&MatchmakingRequest]) -> AssembledTeam {
        let mut roles = self.roles;
        if let Some(tally) = &self.tally {
            for (user, role) in self.wildcards.iter().zip(tally.resolve_wildcards()) {
                roles.insert(user.clone(), role);
            }
        }
        AssembledTeam {
            ticket_ids: self
                .entries
                .iter()
                .map(|index| entries[*index].ticket_id.clone())
                .collect(),
            players: self.players,
            roles,
        }
    }
}

/// Packs one ordering into teams
#[derive(Debug, Clone, Copy)]
pub struct GreedyPacker<'r> {
    rule: &'r AllianceRule,
    blocked_option: BlockedPlayerOption,
    role_mode: RoleMode,
}

impl<'r> GreedyPacker<'r> {
    pub fn new(rule: &'r AllianceRule, blocked_option: BlockedPlayerOption, role_mode: RoleMode) -> Self {
        Self {
            rule,
            blocked_option,
            role_mode,
        }
    }

    fn new_team(&self, team_index: usize) -> TeamBuild {
        let tally = match (self.role_mode, &self.rule.combination) {
            (RoleMode::Normal, _) | (_, None) => None,
            (mode, Some(combination)) => {
                let roles = combination.roles_for_team(team_index);
                if roles.is_empty() {
                    None
                } else {
                    Some(RoleTally::new(roles, mode == RoleMode::Unique))
                }
            }
        };
        TeamBuild::new(tally)
    }

    fn try_add(&self, team: &mut TeamBuild, index: usize, entry: &MatchmakingRequest) -> bool {
        if team.players + entry.player_count() > self.rule.player_max_number {
            return false;
        }

        let users = entry.user_ids();
        let blocked = entry.blocked_players();
        if self.blocked_option != BlockedPlayerOption::CanMatch
            && (!team.blocked.is_disjoint(&users) || !blocked.is_disjoint(&team.users))
        {
            return false;
        }

        if let Some(tally) = team.tally.as_mut() {
            let slots = match tally.try_assign_all(&entry.party_members) {
                Some(slots) => slots,
                None => return false,
            };
            for (member, slot) in entry.party_members.iter().zip(slots) {
                match slot {
                    Slot::Role(role) => {
                        team.roles.insert(member.user_id.clone(), role);
                    }
                    Slot::Wildcard => team.wildcards.push(member.user_id.clone()),
                }
            }
        }

        team.entries.push(index);
        team.players += entry.player_count();
        team.users.extend(users);
        team.blocked.extend(blocked);
        true
    }

    /// Add entries in `order` until the team holds `target` players
    fn fill(
        &self,
        team: &mut TeamBuild,
        target: usize,
        order: &[usize],
        entries: &[&MatchmakingRequest],
        used: &mut [bool],
    ) {
        for &index in order {
            if team.players >= target && team.roles_satisfied() {
                break;
            }
            if used[index] {
                continue;
            }
            if self.try_add(team, index, entries[index]) {
                used[index] = true;
            }
        }
    }

    /// Pack `entries` following `order`. Entry 0 is the pivot and must be
    /// placed.
    pub fn pack(&self, entries: &[&MatchmakingRequest], order: &[usize]) -> Option<Vec<AssembledTeam>> {
        let mut used = vec![false; entries.len()];
        let mut teams: Vec<TeamBuild> = Vec::with_capacity(self.rule.max_number);

        for team_index in 0..self.rule.min_number {
            let mut team = self.new_team(team_index);
            self.fill(&mut team, self.rule.player_min_number, order, entries, &mut used);
            if team.players < self.rule.player_min_number || !team.roles_satisfied() {
                return None;
            }
            teams.push(team);
        }

        for team_index in 0..self.rule.max_number {
            if team_index < teams.len() {
                self.fill(&mut teams[team_index], self.rule.player_max_number, order, entries, &mut used);
                continue;
            }

            let mut team = self.new_team(team_index);
            self.fill(&mut team, self.rule.player_max_number, order, entries, &mut used);
            if team.players < self.rule.player_min_number || !team.roles_satisfied() {
                for index in &team.entries {
                    used[*index] = false;
                }
                break;
            }
            teams.push(team);
        }

        if !used.first().copied().unwrap_or(false) {
            return None;
        }

        let summaries: Vec<TeamSummary> = teams.iter().map(TeamBuild::summary).collect();
        if let Err(violation) = self.rule.validate_allies(&summaries, self.blocked_option) {
            trace!("Packed teams rejected: {}", violation);
            return None;
        }

        Some(teams.into_iter().map(|team| team.finish(entries)).collect())
    }
}

/// Assembles alliances around a pivot
pub trait AllyAssembler: Send + Sync {
    fn assemble(
        &self,
        pivot: &MatchmakingRequest,
        candidates: &[&MatchmakingRequest],
        rule: &AllianceRule,
        blocked_option: BlockedPlayerOption,
    ) -> Option<Assembly>;
}

/// Default assembler, picked per alliance rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartyFinder {
    role_mode: RoleMode,
    max_iterations: usize,
}

impl PartyFinder {
    pub fn new(role_mode: RoleMode, max_iterations: usize) -> Self {
        Self {
            role_mode,
            max_iterations: max_iterations.max(1),
        }
    }

    /// Role-aware only when the alliance declares a role combination
    pub fn for_alliance(rule: &AllianceRule, max_iterations: usize) -> Self {
        let role_mode = match &rule.combination {
            Some(combination) if rule.has_role_combination() && combination.unique => RoleMode::Unique,
            Some(_) if rule.has_role_combination() => RoleMode::Combo,
            _ => RoleMode::Normal,
        };
        Self::new(role_mode, max_iterations)
    }

    pub fn role_mode(&self) -> RoleMode {
        self.role_mode
    }
}

impl AllyAssembler for PartyFinder {
    fn assemble(
        &self,
        pivot: &MatchmakingRequest,
        candidates: &[&MatchmakingRequest],
        rule: &AllianceRule,
        blocked_option: BlockedPlayerOption,
    ) -> Option<Assembly> {
        let mut entries: Vec<&MatchmakingRequest> = Vec::with_capacity(candidates.len() + 1);
        entries.push(pivot);
        entries.extend(candidates.iter().copied());

        // candidates arrive priority-first, so priority tickets sit right after the pivot
        let pinned = 1 + candidates.iter().take_while(|ticket| ticket.priority > 0).count();
        let pool_players: usize = entries.iter().map(|ticket| ticket.player_count()).sum();
        let can_fill = pool_players >= rule.max_players();

        let packer = GreedyPacker::new(rule, blocked_option, self.role_mode);
        let mut best: Option<Assembly> = None;

        for (iteration, order) in OrderingGenerator::new(entries.len(), pinned, self.max_iterations).enumerate() {
            let teams = match packer.pack(&entries, &order) {
                Some(teams) => teams,
                None => continue,
            };
            let assembly = Assembly { teams };

            if assembly.is_full(rule) || !can_fill {
                trace!("Assembly accepted after {} orderings", iteration + 1);
                return Some(assembly);
            }
            let better = best
                .as_ref()
                .map(|current| assembly.player_count() > current.player_count())
                .unwrap_or(true);
            if better {
                best = Some(assembly);
            }
        }

        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::PartyMember;
    use crate::rules::{Role, RoleCombination};
    use crate::types::keys;
    use crate::utils::current_timestamp;

    fn create_test_ticket(id: &str, players: usize) -> MatchmakingRequest {
        (0..players).fold(MatchmakingRequest::new(id, current_timestamp()), |ticket, n| {
            ticket.with_member(PartyMember::new(format!("{}-{}", id, n)))
        })
    }

    fn create_role_ticket(id: &str, role: &str) -> MatchmakingRequest {
        MatchmakingRequest::new(id, current_timestamp())
            .with_member(PartyMember::new(format!("{}-0", id)).with_attribute(keys::ROLE, role))
    }

    #[test]
    fn test_ordering_generator_pins_and_caps() {
        let orders: Vec<Vec<usize>> = OrderingGenerator::new(4, 2, 10).collect();

        assert!(orders.iter().all(|order| order[0] == 0 && order[1] == 1));
        assert_eq!(orders[0], vec![0, 1, 2, 3]);
        assert_eq!(orders[1], vec![0, 1, 3, 2]);
        assert!(orders.len() <= 10);

        assert_eq!(OrderingGenerator::new(6, 1, 3).count(), 3);
        assert_eq!(OrderingGenerator::new(1, 1, 5).collect::<Vec<_>>(), vec![vec![0]]);
    }

    #[test]
    fn test_ordering_generator_permutations_after_rotations() {
        let orders: Vec<Vec<usize>> = OrderingGenerator::new(4, 1, 100).collect();
        // 3 rotations + 5 further permutations of a 3-element tail
        assert_eq!(orders.len(), 8);
        assert_eq!(orders[3], vec![0, 1, 3, 2]);
    }

    #[test]
    fn test_packs_two_teams() {
        let rule = AllianceRule::new(2, 2, 2, 3);
        let pivot = create_test_ticket("p", 2);
        let others = [create_test_ticket("a", 1), create_test_ticket("b", 2), create_test_ticket("c", 1)];
        let candidates: Vec<&MatchmakingRequest> = others.iter().collect();

        let assembly = PartyFinder::for_alliance(&rule, 10)
            .assemble(&pivot, &candidates, &rule, BlockedPlayerOption::CannotMatch)
            .unwrap();

        assert_eq!(assembly.teams.len(), 2);
        assert!(assembly.is_full(&rule));
        assert_eq!(assembly.teams[0].ticket_ids[0], "p");
    }

    #[test]
    fn test_partial_pool_accepts_first_valid() {
        let rule = AllianceRule::new(2, 4, 1, 2);
        let pivot = create_test_ticket("p", 1);
        let others = [create_test_ticket("a", 1), create_test_ticket("b", 1)];
        let candidates: Vec<&MatchmakingRequest> = others.iter().collect();

        let assembly = PartyFinder::for_alliance(&rule, 10)
            .assemble(&pivot, &candidates, &rule, BlockedPlayerOption::CannotMatch)
            .unwrap();
        assert_eq!(assembly.player_count(), 3);
        assert!(!assembly.is_full(&rule));
    }

    #[test]
    fn test_oversized_pivot_cannot_be_placed() {
        let rule = AllianceRule::new(2, 2, 1, 1);
        let pivot = create_test_ticket("p", 2);
        let others = [create_test_ticket("a", 1), create_test_ticket("b", 1)];
        let candidates: Vec<&MatchmakingRequest> = others.iter().collect();

        assert!(PartyFinder::for_alliance(&rule, 10)
            .assemble(&pivot, &candidates, &rule, BlockedPlayerOption::CannotMatch)
            .is_none());
    }

    #[test]
    fn test_blocked_pair_split_across_teams() {
        let rule = AllianceRule::new(2, 2, 1, 2);
        let pivot = create_test_ticket("p", 1).with_party_attribute(keys::BLOCKED_PLAYERS, vec!["a-0"]);
        let others = [create_test_ticket("a", 1), create_test_ticket("b", 1), create_test_ticket("c", 1)];
        let candidates: Vec<&MatchmakingRequest> = others.iter().collect();

        let assembly = PartyFinder::for_alliance(&rule, 10)
            .assemble(&pivot, &candidates, &rule, BlockedPlayerOption::CanMatchOnDifferentTeam)
            .unwrap();

        let pivot_team = assembly
            .teams
            .iter()
            .find(|team| team.ticket_ids.contains(&"p".to_string()))
            .unwrap();
        assert!(!pivot_team.ticket_ids.contains(&"a".to_string()));
        assert_eq!(assembly.player_count(), 4);
    }

    #[test]
    fn test_party_finder_selection() {
        let plain = AllianceRule::new(2, 2, 1, 1);
        assert_eq!(PartyFinder::for_alliance(&plain, 1).role_mode(), RoleMode::Normal);

        let declared_off = plain.clone().with_combination(RoleCombination::default());
        assert_eq!(PartyFinder::for_alliance(&declared_off, 1).role_mode(), RoleMode::Normal);

        let combo = plain.clone().with_combination(RoleCombination {
            has_combination: true,
            ..Default::default()
        });
        assert_eq!(PartyFinder::for_alliance(&combo, 1).role_mode(), RoleMode::Combo);

        let unique = plain.with_combination(RoleCombination {
            has_combination: true,
            unique: true,
            ..Default::default()
        });
        assert_eq!(PartyFinder::for_alliance(&unique, 1).role_mode(), RoleMode::Unique);
    }

    #[test]
    fn test_role_combo_fills_quotas() {
        let rule = AllianceRule::new(1, 1, 3, 3).with_combination(RoleCombination {
            has_combination: true,
            alliances: vec![vec![Role::new("tank", 1, 1), Role::new("healer", 1, 1), Role::new("dps", 1, 1)]],
            ..Default::default()
        });
        let pivot = create_role_ticket("p", "dps");
        let others = [
            create_role_ticket("a", "dps"),
            create_role_ticket("b", "tank"),
            create_role_ticket("c", "any"),
        ];
        let candidates: Vec<&MatchmakingRequest> = others.iter().collect();

        let assembly = PartyFinder::for_alliance(&rule, 10)
            .assemble(&pivot, &candidates, &rule, BlockedPlayerOption::CannotMatch)
            .unwrap();

        let team = &assembly.teams[0];
        assert_eq!(team.ticket_ids, vec!["p", "b", "c"]);
        assert_eq!(team.roles["c-0"], "healer");
        assert_eq!(team.roles["p-0"], "dps");
    }

    #[test]
    fn test_unique_roles_reject_duplicates() {
        let rule = AllianceRule::new(1, 1, 2, 2).with_combination(RoleCombination {
            has_combination: true,
            unique: true,
            alliances: vec![vec![Role::new("tank", 0, 2), Role::new("dps", 0, 2)]],
            ..Default::default()
        });
        let pivot = create_role_ticket("p", "tank");
        let others = [create_role_ticket("a", "tank"), create_role_ticket("b", "dps")];
        let candidates: Vec<&MatchmakingRequest> = others.iter().collect();

        let assembly = PartyFinder::for_alliance(&rule, 10)
            .assemble(&pivot, &candidates, &rule, BlockedPlayerOption::CannotMatch)
            .unwrap();
        assert_eq!(assembly.teams[0].ticket_ids, vec!["p", "b"]);
    }
}
