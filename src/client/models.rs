use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Virtual machine descriptor as returned by `listVirtualMachines`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VirtualMachine {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoneid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zonename: Option<String>,
    /// Creation time, e.g. `2016-05-05T10:30:30+0100`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keypair: Option<String>,
    #[serde(default)]
    pub nic: Vec<Nic>,
}

impl VirtualMachine {
    pub fn created_at(&self) -> Option<DateTime<FixedOffset>> {
        self.created
            .as_deref()
            .and_then(|s| DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z").ok())
    }

    /// IP address on the given network, if attached
    pub fn ip_on(&self, network_id: &str) -> Option<&str> {
        self.nic
            .iter()
            .find(|nic| nic.networkid == network_id)
            .and_then(|nic| nic.ipaddress.as_deref())
    }
}

/// Network interface of a virtual machine
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Nic {
    pub networkid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networkname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipaddress: Option<String>,
}

/// `listVirtualMachines` body (empty listings come back as `{}`)
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct VirtualMachineList {
    #[serde(default)]
    pub virtualmachine: Vec<VirtualMachine>,
}

/// Handle returned by fire-and-forget mutating calls
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AsyncJobHandle {
    pub jobid: String,
    /// Resource id, when the provider assigns it up front (deploy)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Job status codes reported by `queryAsyncJobResult`
pub const JOB_STATUS_PENDING: i64 = 0;
pub const JOB_STATUS_SUCCEEDED: i64 = 1;
pub const JOB_STATUS_FAILED: i64 = 2;

/// `queryAsyncJobResult` body
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AsyncJobStatus {
    #[serde(default)]
    pub jobid: Option<String>,
    #[serde(default)]
    pub jobstatus: Option<i64>,
    #[serde(default)]
    pub jobresultcode: Option<i64>,
    #[serde(default)]
    pub jobresult: Option<Value>,
}

impl AsyncJobStatus {
    pub fn pending(job_id: &str) -> Self {
        Self {
            jobid: Some(job_id.to_string()),
            jobstatus: Some(JOB_STATUS_PENDING),
            ..Default::default()
        }
    }

    pub fn succeeded(job_id: &str, result: Value) -> Self {
        Self {
            jobid: Some(job_id.to_string()),
            jobstatus: Some(JOB_STATUS_SUCCEEDED),
            jobresultcode: Some(0),
            jobresult: Some(result),
        }
    }

    pub fn failed(job_id: &str, code: i64, text: &str) -> Self {
        Self {
            jobid: Some(job_id.to_string()),
            jobstatus: Some(JOB_STATUS_FAILED),
            jobresultcode: Some(code),
            jobresult: Some(serde_json::json!({ "errorcode": code, "errortext": text })),
        }
    }

    /// Failure text carried in `jobresult`
    pub fn error_text(&self) -> String {
        self.jobresult
            .as_ref()
            .and_then(|r| r.get("errortext"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| {
                format!(
                    "job failed with result code {}",
                    self.jobresultcode.unwrap_or_default()
                )
            })
    }
}

/// Placement and sizing shared by every VM a fleet creates
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeployTemplate {
    pub zone_id: String,
    pub template_id: String,
    pub service_offering_id: String,
    #[serde(default)]
    pub network_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keypair: Option<String>,
}

/// Parameters of one `deployVirtualMachine` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    pub name: String,
    pub template: DeployTemplate,
}

impl DeployRequest {
    pub fn new(name: impl Into<String>, template: DeployTemplate) -> Self {
        Self {
            name: name.into(),
            template,
        }
    }
}

/// Filter for `listVirtualMachines`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmFilter {
    pub id: Option<String>,
    pub name: Option<String>,
    pub zone_id: Option<String>,
}

impl VmFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn in_zone(mut self, zone_id: impl Into<String>) -> Self {
        self.zone_id = Some(zone_id.into());
        self
    }

    pub fn matches(&self, vm: &VirtualMachine) -> bool {
        self.id.as_ref().is_none_or(|id| *id == vm.id)
            && self.name.as_ref().is_none_or(|name| *name == vm.name)
            && self
                .zone_id
                .as_ref()
                .is_none_or(|zone| vm.zoneid.as_ref() == Some(zone))
    }
}
