use super::{Fleet, FleetMember};
use std::collections::BTreeSet;

/// Member naming: `<prefix>-<index>`, index zero-padded to `width`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePolicy {
    prefix: String,
    width: usize,
}

impl NamePolicy {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            width: 2,
        }
    }

    pub fn with_width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn member_name(&self, index: u32) -> String {
        format!("{}-{:0width$}", self.prefix, index, width = self.width)
    }

    /// Index encoded in a member name, if it follows this policy
    pub fn index_of(&self, name: &str) -> Option<u32> {
        name.strip_prefix(&self.prefix)?
            .strip_prefix('-')?
            .parse()
            .ok()
    }

    /// `count` fresh names, filling the lowest unused indices from 1
    pub fn next_names(&self, fleet: &Fleet, count: usize) -> Vec<String> {
        let used: BTreeSet<u32> = fleet.iter().filter_map(|m| self.index_of(&m.name)).collect();

        (1..)
            .filter(|i| !used.contains(i))
            .map(|i| self.member_name(i))
            .filter(|name| !fleet.contains(name))
            .take(count)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    Create { name: String },
    Destroy { member: FleetMember },
}

/// Create/destroy delta for one reconciliation cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationPlan {
    pub current: usize,
    pub target: usize,
    pub delta: i64,
    pub actions: Vec<PlannedAction>,
}

impl ReconciliationPlan {
    /// Plan the actions moving `fleet` to `target` counted members
    ///
    /// Scale-down victims are the counted members in ascending name order,
    /// so the same fleet and target always pick the same victims.
    pub fn compute(fleet: &Fleet, target: usize, names: &NamePolicy) -> Self {
        let current = fleet.counted();
        let delta = target as i64 - current as i64;

        let actions = if delta > 0 {
            names
                .next_names(fleet, delta.unsigned_abs() as usize)
                .into_iter()
                .map(|name| PlannedAction::Create { name })
                .collect()
        } else if delta < 0 {
            let mut counted: Vec<&FleetMember> =
                fleet.iter().filter(|m| m.state.counts_toward_size()).collect();
            counted.sort_by(|a, b| a.name.cmp(&b.name));
            counted
                .into_iter()
                .take(delta.unsigned_abs() as usize)
                .map(|member| PlannedAction::Destroy {
                    member: member.clone(),
                })
                .collect()
        } else {
            Vec::new()
        };

        Self {
            current,
            target,
            delta,
            actions,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.actions.is_empty()
    }
}
