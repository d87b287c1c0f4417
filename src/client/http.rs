//! HTTP client for the VDC API

use super::models::{
    AsyncJobHandle, AsyncJobStatus, DeployRequest, VirtualMachine, VirtualMachineList, VmFilter,
};
use super::{ApiError, CloudApi, Result};
use crate::signer::{Params, RequestSigner, SignedRequest};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

const NO_DESCRIPTION: &str = "(No extended error message.)";

/// Error codes the provider uses when a job id is not (yet) known
const JOB_LOOKUP_CODES: &[u16] = &[404, 431];

/// How signed requests are submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    #[value(name = "GET")]
    Get,
    #[value(name = "POST")]
    Post,
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub user_agent: String,
    pub method: HttpMethod,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            max_retries: 3,
            user_agent: "vdcfleet/0.1.0".to_string(),
            method: HttpMethod::Get,
        }
    }
}

/// Signing API client
///
/// Every call is signed fresh (so expiring signatures stay valid across
/// retries) and, when configured, carries the `region` parameter.
#[derive(Clone)]
pub struct VdcClient {
    client: Client,
    signer: RequestSigner,
    config: HttpConfig,
    region: Option<String>,
}

impl VdcClient {
    pub fn new(signer: RequestSigner, config: HttpConfig, region: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            signer,
            config,
            region,
        })
    }

    pub fn signer(&self) -> &RequestSigner {
        &self.signer
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// Call an API command and return the unwrapped response object
    ///
    /// Read-only commands (`list*`, `query*`, `get*`) are retried on transient
    /// failures with exponential backoff. Mutating commands are sent once: a
    /// retried deploy could create a second machine.
    pub async fn call(&self, command: &str, params: Params) -> Result<Value> {
        let params = self.with_region(params);
        let retryable = is_read_only(command);
        let mut attempts = 0;

        loop {
            attempts += 1;

            match self.call_once(command, &params).await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(command, attempts, "API call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if retryable && e.is_transient() && attempts < self.config.max_retries => {
                    warn!(command, attempts, error = %e, "API call failed, retrying");

                    // Doubles from 1s; max_retries bounds total attempts, so 3 sleeps 1s then 2s
                    let backoff = Duration::from_secs(2u64.pow(attempts - 1));
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    if attempts > 1 {
                        warn!(command, attempts, error = %e, "API call failed after retries");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Call and deserialize the unwrapped response
    pub async fn call_as<T: DeserializeOwned>(&self, command: &str, params: Params) -> Result<T> {
        let value = self.call(command, params).await?;
        serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn call_once(&self, command: &str, params: &Params) -> Result<Value> {
        let signed = self.signer.sign(command, params)?;
        let body = self.execute(&signed, self.config.method).await?;
        let value: Value = serde_json::from_str(&body)
            .map_err(|e| ApiError::Decode(format!("{}: invalid JSON: {}", command, e)))?;
        unwrap_response(value)
    }

    /// Submit an already signed request and return the raw body
    pub async fn execute(&self, signed: &SignedRequest, method: HttpMethod) -> Result<String> {
        debug!(command = %signed.command, ?method, "Sending API request");

        let request = match method {
            HttpMethod::Get => self.client.get(signed.url()),
            HttpMethod::Post => self
                .client
                .post(signed.endpoint())
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(signed.body().to_string()),
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout
            } else {
                ApiError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        let header_description = response
            .headers()
            .get("X-Description")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Transport(format!("Failed to read body: {}", e)))?;

        if !status.is_success() {
            let description = header_description
                .or_else(|| error_text_from_body(&body))
                .unwrap_or_else(|| NO_DESCRIPTION.to_string());
            return Err(ApiError::Http {
                status: status.as_u16(),
                description,
            });
        }

        debug!(command = %signed.command, size = body.len(), "API response received");

        Ok(body)
    }

    fn with_region(&self, mut params: Params) -> Params {
        if let Some(region) = &self.region {
            if params.get("region").is_none() {
                params.insert("region", region.as_str());
            }
        }
        params
    }
}

#[async_trait]
impl CloudApi for VdcClient {
    async fn list_virtual_machines(&self, filter: &VmFilter) -> Result<Vec<VirtualMachine>> {
        let mut params = Params::new();
        if let Some(id) = &filter.id {
            params.insert("id", id);
        }
        if let Some(name) = &filter.name {
            params.insert("name", name);
        }
        if let Some(zone) = &filter.zone_id {
            params.insert("zoneid", zone);
        }

        let list: VirtualMachineList = self.call_as("listVirtualMachines", params).await?;
        Ok(list.virtualmachine)
    }

    async fn deploy_virtual_machine(&self, request: &DeployRequest) -> Result<AsyncJobHandle> {
        let template = &request.template;
        let mut params = Params::new()
            .with("zoneid", &template.zone_id)
            .with("templateid", &template.template_id)
            .with("serviceofferingid", &template.service_offering_id)
            .with("name", &request.name)
            .with("displayname", &request.name);
        if !template.network_ids.is_empty() {
            params.insert("networkids", template.network_ids.join(","));
        }
        if let Some(keypair) = &template.keypair {
            params.insert("keypair", keypair);
        }

        self.call_as("deployVirtualMachine", params).await
    }

    async fn destroy_virtual_machine(&self, id: &str, expunge: bool) -> Result<AsyncJobHandle> {
        let mut params = Params::new().with("id", id);
        if expunge {
            params.insert("expunge", true);
        }

        self.call_as("destroyVirtualMachine", params).await
    }

    async fn query_async_job(&self, job_id: &str) -> Result<AsyncJobStatus> {
        let params = Params::new().with("jobid", job_id);

        match self.call_as("queryAsyncJobResult", params).await {
            Err(ApiError::Http { status, .. }) if JOB_LOOKUP_CODES.contains(&status) => {
                Err(ApiError::JobNotFound(job_id.to_string()))
            }
            Err(ApiError::Remote { code, .. })
                if u16::try_from(code).is_ok_and(|c| JOB_LOOKUP_CODES.contains(&c)) =>
            {
                Err(ApiError::JobNotFound(job_id.to_string()))
            }
            other => other,
        }
    }
}

fn is_read_only(command: &str) -> bool {
    ["list", "query", "get"]
        .iter()
        .any(|prefix| command.starts_with(prefix))
}

/// Strip the `<command>response` wrapper and surface in-body errors
pub(crate) fn unwrap_response(value: Value) -> Result<Value> {
    let inner = match value {
        Value::Object(map) if map.len() == 1 => {
            let (key, inner) = map
                .into_iter()
                .next()
                .ok_or_else(|| ApiError::Decode("empty response object".to_string()))?;
            if !key.ends_with("response") {
                return Err(ApiError::Decode(format!("unexpected response key '{}'", key)));
            }
            inner
        }
        other => {
            return Err(ApiError::Decode(format!(
                "expected a single <command>response object, got: {}",
                other
            )));
        }
    };

    if let Some(code) = inner.get("errorcode").and_then(Value::as_i64) {
        let text = inner
            .get("errortext")
            .and_then(Value::as_str)
            .unwrap_or(NO_DESCRIPTION)
            .to_string();
        return Err(ApiError::Remote { code, text });
    }

    Ok(inner)
}

fn error_text_from_body(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let inner = value.as_object()?.values().next()?;
    inner
        .get("errortext")
        .and_then(Value::as_str)
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_http_config_defaults() {
        let config = HttpConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.method, HttpMethod::Get);
    }

    #[test]
    fn test_unwrap_response() {
        let body = json!({"listzonesresponse": {"count": 1, "zone": [{"id": "z"}]}});
        let inner = unwrap_response(body).unwrap();
        assert_eq!(inner["count"], 1);
    }

    #[test]
    fn test_unwrap_response_in_body_error() {
        let body = json!({"deployvirtualmachineresponse": {"errorcode": 431, "errortext": "bad template"}});
        match unwrap_response(body) {
            Err(ApiError::Remote { code, text }) => {
                assert_eq!(code, 431);
                assert_eq!(text, "bad template");
            }
            other => panic!("Expected Remote error, got {:?}", other),
        }
    }

    #[test]
    fn test_unwrap_response_rejects_unexpected_shape() {
        assert!(matches!(unwrap_response(json!([1, 2])), Err(ApiError::Decode(_))));
        assert!(matches!(
            unwrap_response(json!({"a": 1, "b": 2})),
            Err(ApiError::Decode(_))
        ));
        assert!(matches!(
            unwrap_response(json!({"zones": {}})),
            Err(ApiError::Decode(_))
        ));
    }

    #[test]
    fn test_read_only_commands() {
        assert!(is_read_only("listVirtualMachines"));
        assert!(is_read_only("queryAsyncJobResult"));
        assert!(!is_read_only("deployVirtualMachine"));
        assert!(!is_read_only("destroyVirtualMachine"));
    }

    #[test]
    fn test_error_text_from_body() {
        let body = r#"{"errorresponse": {"errorcode": 401, "errortext": "unable to verify user credentials"}}"#;
        assert_eq!(
            error_text_from_body(body).as_deref(),
            Some("unable to verify user credentials")
        );
        assert_eq!(error_text_from_body("not json"), None);
    }
}
