//! Fleet model and reconciliation
//!
//! A fleet is the set of VMs governed by one scaling policy, identified by a
//! shared name prefix (`web-01`, `web-02`, ...).

pub mod actions;
pub mod plan;
pub mod reconciler;

pub use actions::CloudFleetActions;
pub use plan::{NamePolicy, PlannedAction, ReconciliationPlan};
pub use reconciler::{
    ChangeKind, ChangeOutcome, ChangeReport, FleetActions, ReconcileError, ReconcileOutcome,
    ReconcileReport, Reconciler, Submitted,
};

use crate::client::VirtualMachine;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// Lifecycle of a fleet member as seen by the reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LifecycleState {
    Deploying,
    Running,
    Stopping,
    Stopped,
    Destroying,
    Destroyed,
    Missing,
}

impl LifecycleState {
    /// Map a provider VM state string
    pub fn from_provider(state: &str) -> Self {
        match state {
            "Running" => LifecycleState::Running,
            "Starting" | "Creating" | "Deploying" | "Migrating" => LifecycleState::Deploying,
            "Stopping" => LifecycleState::Stopping,
            "Stopped" => LifecycleState::Stopped,
            "Destroying" | "Expunging" => LifecycleState::Destroying,
            "Destroyed" | "Expunged" => LifecycleState::Destroyed,
            _ => LifecycleState::Missing,
        }
    }

    /// Running and in-flight deploys make up the fleet size
    pub fn counts_toward_size(&self) -> bool {
        matches!(self, LifecycleState::Running | LifecycleState::Deploying)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, LifecycleState::Deploying | LifecycleState::Destroying)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Deploying => "Deploying",
            LifecycleState::Running => "Running",
            LifecycleState::Stopping => "Stopping",
            LifecycleState::Stopped => "Stopped",
            LifecycleState::Destroying => "Destroying",
            LifecycleState::Destroyed => "Destroyed",
            LifecycleState::Missing => "Missing",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FleetMember {
    /// Provider id; empty until the provider assigns one
    pub id: String,
    pub name: String,
    pub state: LifecycleState,
    /// Job of the transition in flight, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl FleetMember {
    pub fn new(id: impl Into<String>, name: impl Into<String>, state: LifecycleState) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            state,
            job_id: None,
        }
    }

    pub fn from_vm(vm: &VirtualMachine) -> Self {
        Self::new(&vm.id, &vm.name, LifecycleState::from_provider(&vm.state))
    }
}

/// Members keyed (and therefore ordered) by name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fleet {
    members: BTreeMap<String, FleetMember>,
}

impl Fleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a fleet from a VM listing
    ///
    /// Keeps VMs named `<prefix>-*` and skips destroyed ones. A duplicate name
    /// keeps the first VM listed.
    pub fn from_listing<'a>(vms: impl IntoIterator<Item = &'a VirtualMachine>, prefix: &str) -> Self {
        let mut fleet = Fleet::new();
        let member_prefix = format!("{}-", prefix);

        for vm in vms {
            if !vm.name.starts_with(&member_prefix) {
                continue;
            }
            let member = FleetMember::from_vm(vm);
            if member.state == LifecycleState::Destroyed {
                continue;
            }
            if fleet.contains(&member.name) {
                warn!(member = %member.name, id = %vm.id, "Duplicate VM name in listing, ignoring");
                continue;
            }
            fleet.insert(member);
        }

        fleet
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members counting toward the fleet size
    pub fn counted(&self) -> usize {
        self.iter().filter(|m| m.state.counts_toward_size()).count()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&FleetMember> {
        self.members.get(name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut FleetMember> {
        self.members.get_mut(name)
    }

    /// Insert or replace the member with the same name
    pub fn insert(&mut self, member: FleetMember) -> Option<FleetMember> {
        self.members.insert(member.name.clone(), member)
    }

    pub fn remove(&mut self, name: &str) -> Option<FleetMember> {
        self.members.remove(name)
    }

    /// Members in ascending name order
    pub fn iter(&self) -> impl Iterator<Item = &FleetMember> {
        self.members.values()
    }

    pub fn names(&self) -> Vec<&str> {
        self.members.keys().map(String::as_str).collect()
    }

    pub fn in_state(&self, state: LifecycleState) -> impl Iterator<Item = &FleetMember> {
        self.iter().filter(move |m| m.state == state)
    }
}

impl FromIterator<FleetMember> for Fleet {
    fn from_iter<T: IntoIterator<Item = FleetMember>>(iter: T) -> Self {
        let mut fleet = Fleet::new();
        for member in iter {
            fleet.insert(member);
        }
        fleet
    }
}

impl IntoIterator for Fleet {
    type Item = FleetMember;
    type IntoIter = std::collections::btree_map::IntoValues<String, FleetMember>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(id: &str, name: &str, state: &str) -> VirtualMachine {
        VirtualMachine {
            id: id.into(),
            name: name.into(),
            displayname: None,
            state: state.into(),
            zoneid: None,
            zonename: None,
            created: None,
            keypair: None,
            nic: vec![],
        }
    }

    #[test]
    fn test_provider_state_mapping() {
        assert_eq!(LifecycleState::from_provider("Running"), LifecycleState::Running);
        assert_eq!(LifecycleState::from_provider("Starting"), LifecycleState::Deploying);
        assert_eq!(LifecycleState::from_provider("Stopped"), LifecycleState::Stopped);
        assert_eq!(LifecycleState::from_provider("Expunging"), LifecycleState::Destroying);
        assert_eq!(LifecycleState::from_provider("Error"), LifecycleState::Missing);
    }

    #[test]
    fn test_counted_states() {
        assert!(LifecycleState::Running.counts_toward_size());
        assert!(LifecycleState::Deploying.counts_toward_size());
        assert!(!LifecycleState::Stopped.counts_toward_size());
        assert!(!LifecycleState::Destroying.counts_toward_size());
    }

    #[test]
    fn test_from_listing_filters_by_prefix() {
        let vms = vec![
            vm("1", "web-02", "Running"),
            vm("2", "db-01", "Running"),
            vm("3", "web-01", "Starting"),
            vm("4", "web-03", "Destroyed"),
            vm("5", "web-04", "Stopped"),
            vm("6", "webserver", "Running"),
        ];

        let fleet = Fleet::from_listing(&vms, "web");

        assert_eq!(fleet.names(), vec!["web-01", "web-02", "web-04"]);
        assert_eq!(fleet.counted(), 2);
        assert_eq!(fleet.get("web-01").unwrap().state, LifecycleState::Deploying);
    }

    #[test]
    fn test_from_listing_keeps_first_duplicate() {
        let vms = vec![vm("1", "web-01", "Running"), vm("2", "web-01", "Stopped")];
        let fleet = Fleet::from_listing(&vms, "web");
        assert_eq!(fleet.len(), 1);
        assert_eq!(fleet.get("web-01").unwrap().id, "1");
    }

    #[test]
    fn test_iteration_is_name_ordered() {
        let fleet: Fleet = ["web-c", "web-a", "web-b"]
            .into_iter()
            .map(|n| FleetMember::new(n, n, LifecycleState::Running))
            .collect();
        let names: Vec<_> = fleet.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["web-a", "web-b", "web-c"]);
    }
}
