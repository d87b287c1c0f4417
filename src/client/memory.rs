//! In-memory provider for tests and dry runs
//!
//! Behaves like the VDC API as far as the fleet core can observe: mutating
//! calls return job ids, jobs resolve after a scripted number of polls, and
//! the VM listing reflects what has completed.

use super::models::{
    AsyncJobHandle, AsyncJobStatus, DeployRequest, VirtualMachine, VmFilter,
};
use super::{ApiError, CloudApi, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Scripted outcome of one async job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobBehavior {
    /// Resolve successfully on the n-th poll (0 and 1 both mean the first)
    SucceedAfter(u32),
    /// Resolve as failed on the n-th poll
    FailAfter(u32, String),
    /// Stay pending forever
    Never,
    /// Refuse the submission itself
    RejectSubmit(String),
}

impl Default for JobBehavior {
    fn default() -> Self {
        JobBehavior::SucceedAfter(1)
    }
}

/// Call log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudCall {
    List,
    Deploy { name: String },
    Destroy { id: String },
    Poll { job_id: String },
}

#[derive(Debug)]
enum JobKind {
    Deploy { vm_id: String },
    Destroy { previous: VirtualMachine, expunge: bool },
}

#[derive(Debug)]
struct Job {
    kind: JobKind,
    behavior: JobBehavior,
    polls: u32,
    resolved: Option<AsyncJobStatus>,
}

#[derive(Debug, Default)]
struct State {
    vms: BTreeMap<String, VirtualMachine>,
    jobs: HashMap<String, Job>,
    deploy_script: VecDeque<JobBehavior>,
    destroy_script: VecDeque<JobBehavior>,
    default_behavior: JobBehavior,
    lookup_lag: u32,
    calls: Vec<CloudCall>,
}

impl State {
    fn next_behavior(&mut self, deploy: bool) -> JobBehavior {
        let script = if deploy {
            &mut self.deploy_script
        } else {
            &mut self.destroy_script
        };
        script
            .pop_front()
            .unwrap_or_else(|| self.default_behavior.clone())
    }
}

/// In-memory `CloudApi`
#[derive(Debug, Default)]
pub struct InMemoryCloud {
    state: Mutex<State>,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an existing VM and return its id
    pub async fn seed_vm(&self, name: &str, state: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let vm = VirtualMachine {
            id: id.clone(),
            name: name.to_string(),
            displayname: Some(name.to_string()),
            state: state.to_string(),
            zoneid: None,
            zonename: None,
            created: None,
            keypair: None,
            nic: Vec::new(),
        };
        self.state.lock().await.vms.insert(id.clone(), vm);
        id
    }

    /// Behaviors for the next deploy jobs, in submission order
    pub async fn script_deploys(&self, behaviors: impl IntoIterator<Item = JobBehavior>) {
        self.state.lock().await.deploy_script.extend(behaviors);
    }

    /// Behaviors for the next destroy jobs, in submission order
    pub async fn script_destroys(&self, behaviors: impl IntoIterator<Item = JobBehavior>) {
        self.state.lock().await.destroy_script.extend(behaviors);
    }

    /// Behavior once the scripts are exhausted
    pub async fn set_default_behavior(&self, behavior: JobBehavior) {
        self.state.lock().await.default_behavior = behavior;
    }

    /// Answer `JobNotFound` for the first `polls` polls of every job
    pub async fn set_lookup_lag(&self, polls: u32) {
        self.state.lock().await.lookup_lag = polls;
    }

    pub async fn calls(&self) -> Vec<CloudCall> {
        self.state.lock().await.calls.clone()
    }

    /// Current VMs, sorted by name
    pub async fn vms(&self) -> Vec<VirtualMachine> {
        let state = self.state.lock().await;
        let mut vms: Vec<_> = state.vms.values().cloned().collect();
        vms.sort_by(|a, b| a.name.cmp(&b.name));
        vms
    }
}

#[async_trait]
impl CloudApi for InMemoryCloud {
    async fn list_virtual_machines(&self, filter: &VmFilter) -> Result<Vec<VirtualMachine>> {
        let mut state = self.state.lock().await;
        state.calls.push(CloudCall::List);

        let mut vms: Vec<_> = state
            .vms
            .values()
            .filter(|vm| filter.matches(vm))
            .cloned()
            .collect();
        vms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(vms)
    }

    async fn deploy_virtual_machine(&self, request: &DeployRequest) -> Result<AsyncJobHandle> {
        let mut state = self.state.lock().await;
        state.calls.push(CloudCall::Deploy {
            name: request.name.clone(),
        });

        let behavior = state.next_behavior(true);
        if let JobBehavior::RejectSubmit(text) = behavior {
            return Err(ApiError::Remote { code: 431, text });
        }

        let vm_id = Uuid::new_v4().to_string();
        let job_id = Uuid::new_v4().to_string();
        let vm = VirtualMachine {
            id: vm_id.clone(),
            name: request.name.clone(),
            displayname: Some(request.name.clone()),
            state: "Starting".to_string(),
            zoneid: Some(request.template.zone_id.clone()),
            zonename: None,
            created: None,
            keypair: request.template.keypair.clone(),
            nic: Vec::new(),
        };
        state.vms.insert(vm_id.clone(), vm);
        state.jobs.insert(
            job_id.clone(),
            Job {
                kind: JobKind::Deploy {
                    vm_id: vm_id.clone(),
                },
                behavior,
                polls: 0,
                resolved: None,
            },
        );

        Ok(AsyncJobHandle {
            jobid: job_id,
            id: Some(vm_id),
        })
    }

    async fn destroy_virtual_machine(&self, id: &str, expunge: bool) -> Result<AsyncJobHandle> {
        let mut state = self.state.lock().await;
        state.calls.push(CloudCall::Destroy { id: id.to_string() });

        let previous = state.vms.get(id).cloned().ok_or_else(|| ApiError::Remote {
            code: 431,
            text: format!("Unable to find virtual machine with id {}", id),
        })?;

        let behavior = state.next_behavior(false);
        if let JobBehavior::RejectSubmit(text) = behavior {
            return Err(ApiError::Remote { code: 530, text });
        }

        if let Some(vm) = state.vms.get_mut(id) {
            vm.state = "Stopping".to_string();
        }

        let job_id = Uuid::new_v4().to_string();
        state.jobs.insert(
            job_id.clone(),
            Job {
                kind: JobKind::Destroy { previous, expunge },
                behavior,
                polls: 0,
                resolved: None,
            },
        );

        Ok(AsyncJobHandle {
            jobid: job_id,
            id: None,
        })
    }

    async fn query_async_job(&self, job_id: &str) -> Result<AsyncJobStatus> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.calls.push(CloudCall::Poll {
            job_id: job_id.to_string(),
        });

        let lookup_lag = state.lookup_lag;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ApiError::JobNotFound(job_id.to_string()))?;

        job.polls += 1;
        if job.polls <= lookup_lag {
            return Err(ApiError::JobNotFound(job_id.to_string()));
        }
        if let Some(status) = &job.resolved {
            return Ok(status.clone());
        }

        let visible_polls = job.polls - lookup_lag;
        let status = match &job.behavior {
            JobBehavior::SucceedAfter(n) if visible_polls >= (*n).max(1) => {
                match &job.kind {
                    JobKind::Deploy { vm_id } => {
                        let vm = state.vms.get_mut(vm_id).map(|vm| {
                            vm.state = "Running".to_string();
                            vm.clone()
                        });
                        AsyncJobStatus::succeeded(job_id, json!({ "virtualmachine": vm }))
                    }
                    JobKind::Destroy { previous, expunge } => {
                        if *expunge {
                            state.vms.remove(&previous.id);
                        } else if let Some(vm) = state.vms.get_mut(&previous.id) {
                            vm.state = "Destroyed".to_string();
                        }
                        AsyncJobStatus::succeeded(job_id, json!({ "success": true }))
                    }
                }
            }
            JobBehavior::FailAfter(n, text) if visible_polls >= (*n).max(1) => {
                match &job.kind {
                    JobKind::Deploy { vm_id } => {
                        state.vms.remove(vm_id);
                    }
                    JobKind::Destroy { previous, .. } => {
                        state.vms.insert(previous.id.clone(), previous.clone());
                    }
                }
                AsyncJobStatus::failed(job_id, 530, text)
            }
            _ => return Ok(AsyncJobStatus::pending(job_id)),
        };

        job.resolved = Some(status.clone());
        Ok(status)
    }
}
