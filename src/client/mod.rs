//! VDC API client
//!
//! `CloudApi` is the seam between the fleet logic and the provider: the HTTP
//! client (`VdcClient`) and the in-memory fake (`InMemoryCloud`) both sit
//! behind it. `CloudPoller` adapts any `CloudApi` into the tracker's
//! `JobPoller`.

pub mod http;
pub mod memory;
pub mod models;

pub use http::{HttpConfig, HttpMethod, VdcClient};
pub use memory::{CloudCall, InMemoryCloud, JobBehavior};
pub use models::{
    AsyncJobHandle, AsyncJobStatus, DeployRequest, DeployTemplate, Nic, VirtualMachine, VmFilter,
};

use crate::signer::SignerError;
use crate::tracker::{JobPoller, PollOutcome};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request signing failed: {0}")]
    Signing(#[from] SignerError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("HTTP {status}: {description}")]
    Http { status: u16, description: String },

    #[error("API error {code}: {text}")]
    Remote { code: i64, text: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("async job not found: {0}")]
    JobNotFound(String),
}

impl ApiError {
    /// Whether a retry (or the next poll sweep) may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport(_) | ApiError::Timeout | ApiError::JobNotFound(_) => true,
            ApiError::Http { status, .. } => *status >= 500,
            ApiError::Signing(_) | ApiError::Remote { .. } | ApiError::Decode(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

/// Provider operations used by the fleet core
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn list_virtual_machines(&self, filter: &VmFilter) -> Result<Vec<VirtualMachine>>;

    async fn deploy_virtual_machine(&self, request: &DeployRequest) -> Result<AsyncJobHandle>;

    async fn destroy_virtual_machine(&self, id: &str, expunge: bool) -> Result<AsyncJobHandle>;

    async fn query_async_job(&self, job_id: &str) -> Result<AsyncJobStatus>;
}

/// Map a job status body onto the tracker's poll outcome
///
/// A body with a `jobresult` but no `jobstatus` counts as finished; older
/// API versions answer that way.
pub fn poll_outcome(status: AsyncJobStatus) -> PollOutcome {
    match status.jobstatus {
        Some(models::JOB_STATUS_SUCCEEDED) => {
            PollOutcome::Succeeded(status.jobresult.unwrap_or_default())
        }
        Some(models::JOB_STATUS_FAILED) => PollOutcome::Failed(status.error_text()),
        Some(_) => PollOutcome::Pending,
        None => match status.jobresult {
            Some(result) => PollOutcome::Succeeded(result),
            None => PollOutcome::Pending,
        },
    }
}

/// Job poller backed by a `CloudApi`
pub struct CloudPoller<C: ?Sized> {
    cloud: Arc<C>,
}

impl<C: ?Sized> CloudPoller<C> {
    pub fn new(cloud: Arc<C>) -> Self {
        Self { cloud }
    }
}

impl<C: ?Sized> Clone for CloudPoller<C> {
    fn clone(&self) -> Self {
        Self {
            cloud: Arc::clone(&self.cloud),
        }
    }
}

#[async_trait]
impl<C> JobPoller for CloudPoller<C>
where
    C: CloudApi + ?Sized,
{
    async fn poll(&self, job_id: &str) -> Result<PollOutcome> {
        let status = self.cloud.query_async_job(job_id).await?;
        Ok(poll_outcome(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transient_classification() {
        assert!(ApiError::Transport("reset".into()).is_transient());
        assert!(ApiError::Timeout.is_transient());
        assert!(ApiError::JobNotFound("j".into()).is_transient());
        assert!(
            ApiError::Http {
                status: 503,
                description: "busy".into()
            }
            .is_transient()
        );
        assert!(
            !ApiError::Http {
                status: 401,
                description: "unauthorized".into()
            }
            .is_transient()
        );
        assert!(
            !ApiError::Remote {
                code: 431,
                text: "bad".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_poll_outcome_mapping() {
        assert_eq!(poll_outcome(AsyncJobStatus::pending("j")), PollOutcome::Pending);
        assert_eq!(
            poll_outcome(AsyncJobStatus::succeeded("j", json!({"virtualmachine": {"id": "v"}}))),
            PollOutcome::Succeeded(json!({"virtualmachine": {"id": "v"}}))
        );
        assert_eq!(
            poll_outcome(AsyncJobStatus::failed("j", 530, "quota exceeded")),
            PollOutcome::Failed("quota exceeded".into())
        );
    }

    #[test]
    fn test_poll_outcome_legacy_body() {
        let legacy = AsyncJobStatus {
            jobresult: Some(json!({"success": true})),
            ..Default::default()
        };
        assert_eq!(
            poll_outcome(legacy),
            PollOutcome::Succeeded(json!({"success": true}))
        );
        assert_eq!(poll_outcome(AsyncJobStatus::default()), PollOutcome::Pending);
    }
}
