//! Role quota bookkeeping for one team

use crate::request::PartyMember;
use crate::rules::Role;
use crate::types::keys;
use std::collections::BTreeMap;

/// Where a member landed in a [`RoleTally`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Role(String),
    /// Resolved to a concrete role by [`RoleTally::resolve_wildcards`]
    Wildcard,
}

/// Tracks how a team covers its role quotas
#[derive(Debug, Clone)]
pub struct RoleTally {
    quotas: Vec<Role>,
    counts: BTreeMap<String, usize>,
    wildcards: usize,
}

impl RoleTally {
    /// In unique mode every role holds at most one player
    pub fn new(roles: &[Role], unique: bool) -> Self {
        let quotas = roles
            .iter()
            .map(|role| {
                if unique {
                    Role::new(role.name.clone(), role.min.min(1), role.max.min(1))
                } else {
                    role.clone()
                }
            })
            .collect();
        Self {
            quotas,
            counts: BTreeMap::new(),
            wildcards: 0,
        }
    }

    fn count(&self, role: &str) -> usize {
        self.counts.get(role).copied().unwrap_or(0)
    }

    fn quota(&self, role: &str) -> Option<&Role> {
        self.quotas.iter().find(|quota| quota.name == role)
    }

    /// Open slots left across every role
    pub fn remaining_capacity(&self) -> usize {
        let open: usize = self
            .quotas
            .iter()
            .map(|quota| quota.max.saturating_sub(self.count(&quota.name)))
            .sum();
        open.saturating_sub(self.wildcards)
    }

    fn deficit(&self, role: &Role) -> i64 {
        role.min as i64 - self.count(&role.name) as i64
    }

    /// Place a member, preferring the declared role with the largest deficit
    pub fn try_assign(&mut self, member: &PartyMember) -> Option<Slot> {
        if self.remaining_capacity() == 0 {
            return None;
        }

        let declared = member.declared_roles();
        let wildcard = declared.is_empty() || declared.iter().any(|role| role == keys::ANY_ROLE);

        let best = declared
            .iter()
            .filter_map(|name| self.quota(name))
            .filter(|quota| self.count(&quota.name) < quota.max)
            .enumerate()
            .max_by(|(a_index, a), (b_index, b)| {
                self.deficit(a)
                    .cmp(&self.deficit(b))
                    .then_with(|| b_index.cmp(a_index))
            })
            .map(|(_, quota)| quota.name.clone());

        match best {
            Some(role) => {
                *self.counts.entry(role.clone()).or_insert(0) += 1;
                Some(Slot::Role(role))
            }
            None if wildcard => {
                self.wildcards += 1;
                Some(Slot::Wildcard)
            }
            None => None,
        }
    }

    /// Place every member of a party or none of them
    pub fn try_assign_all(&mut self, members: &[PartyMember]) -> Option<Vec<Slot>> {
        let mut trial = self.clone();
        let slots = members
            .iter()
            .map(|member| trial.try_assign(member))
            .collect::<Option<Vec<Slot>>>()?;
        *self = trial;
        Some(slots)
    }

    /// Count a member whose role is already fixed
    pub fn force(&mut self, role: &str) {
        *self.counts.entry(role.to_string()).or_insert(0) += 1;
    }

    /// Concrete roles for the pending wildcards, scarcest role first
    pub fn resolve_wildcards(&self) -> Vec<String> {
        let mut counts = self.counts.clone();
        let mut resolved = Vec::with_capacity(self.wildcards);

        for _ in 0..self.wildcards {
            let pick = self
                .quotas
                .iter()
                .filter(|quota| counts.get(&quota.name).copied().unwrap_or(0) < quota.max)
                .max_by(|a, b| {
                    let a_count = counts.get(&a.name).copied().unwrap_or(0);
                    let b_count = counts.get(&b.name).copied().unwrap_or(0);
                    let a_deficit = a.min as i64 - a_count as i64;
                    let b_deficit = b.min as i64 - b_count as i64;
                    a_deficit
                        .cmp(&b_deficit)
                        .then_with(|| (a.max - a_count).cmp(&(b.max - b_count)))
                        .then_with(|| b.name.cmp(&a.name))
                });
            match pick {
                Some(quota) => {
                    *counts.entry(quota.name.clone()).or_insert(0) += 1;
                    resolved.push(quota.name.clone());
                }
                None => break,
            }
        }
        resolved
    }

    /// Every role minimum met once wildcards are resolved
    pub fn satisfies_minimums(&self) -> bool {
        let mut counts = self.counts.clone();
        for role in self.resolve_wildcards() {
            *counts.entry(role).or_insert(0) += 1;
        }
        self.quotas
            .iter()
            .all(|quota| counts.get(&quota.name).copied().unwrap_or(0) >= quota.min)
    }
}
