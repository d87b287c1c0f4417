use crate::client::HttpMethod;
use crate::humanize::HumanDuration;
use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub autoscale: AutoscaleConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// API endpoint and client settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    /// e.g. `https://myservices.interoute.com/myservices/api/vdc`
    #[serde(default)]
    pub endpoint: String,
    /// Sent as `region` on every call (`Europe`, `USA`, `Asia`)
    #[serde(default = "default_region")]
    pub region: Option<String>,
    #[serde(default = "default_response_format")]
    pub response_format: String,
    /// Sign with `expires` + `signatureVersion=3` when set
    #[serde(default)]
    pub signature_expiry: Option<HumanDuration>,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: HumanDuration,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: HumanDuration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// API key (loaded from environment or the legacy credentials file)
    #[serde(skip)]
    pub api_key: Option<String>,
    /// API secret (loaded from environment or the legacy credentials file)
    #[serde(skip)]
    pub api_secret: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            region: default_region(),
            response_format: default_response_format(),
            signature_expiry: None,
            method: HttpMethod::default(),
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            max_retries: default_max_retries(),
            user_agent: default_user_agent(),
            api_key: None,
            api_secret: None,
        }
    }
}

fn default_region() -> Option<String> {
    Some("Europe".to_string())
}

fn default_response_format() -> String {
    "json".to_string()
}

fn default_connect_timeout() -> HumanDuration {
    HumanDuration::from_secs(10)
}

fn default_request_timeout() -> HumanDuration {
    HumanDuration::from_secs(60)
}

fn default_max_retries() -> u32 {
    3
}

fn default_user_agent() -> String {
    format!("vdcfleet/{}", env!("CARGO_PKG_VERSION"))
}

/// Async job polling
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval")]
    pub interval: HumanDuration,
    #[serde(default = "default_poll_timeout")]
    pub timeout: HumanDuration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
            timeout: default_poll_timeout(),
        }
    }
}

fn default_poll_interval() -> HumanDuration {
    HumanDuration::from_secs(2)
}

fn default_poll_timeout() -> HumanDuration {
    HumanDuration::from_secs(15 * 60)
}

/// Fleet and scaling policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AutoscaleConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Members are named `<name_prefix>-NN`
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_name_width")]
    pub name_width: usize,
    /// Load units (e.g. sessions) one instance absorbs
    #[serde(default = "default_capacity_per_instance")]
    pub capacity_per_instance: u64,
    #[serde(default = "default_min_instances")]
    pub min_instances: usize,
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    /// Pause between autoscaling cycles
    #[serde(default = "default_period")]
    pub period: HumanDuration,
    #[serde(default = "default_expunge")]
    pub expunge: bool,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            name_prefix: default_name_prefix(),
            name_width: default_name_width(),
            capacity_per_instance: default_capacity_per_instance(),
            min_instances: default_min_instances(),
            max_instances: default_max_instances(),
            period: default_period(),
            expunge: default_expunge(),
            load: LoadConfig::default(),
            deploy: DeployConfig::default(),
        }
    }
}

fn default_name_prefix() -> String {
    "web".to_string()
}

fn default_name_width() -> usize {
    2
}

fn default_capacity_per_instance() -> u64 {
    50
}

fn default_min_instances() -> usize {
    1
}

fn default_max_instances() -> usize {
    4
}

fn default_period() -> HumanDuration {
    HumanDuration::from_secs(60)
}

fn default_expunge() -> bool {
    true
}

/// HAProxy stats page supplying the load signal
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoadConfig {
    /// CSV export URL, e.g. `http://lb:8404/stats;csv`
    #[serde(default)]
    pub stats_url: Option<String>,
    #[serde(default = "default_frontend")]
    pub frontend: String,
    #[serde(default)]
    pub username: Option<String>,
    /// Stats password (loaded from environment, not from config file)
    #[serde(skip)]
    pub password: Option<String>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            stats_url: None,
            frontend: default_frontend(),
            username: None,
            password: None,
        }
    }
}

fn default_frontend() -> String {
    "http-in".to_string()
}

/// Placement of new fleet members
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DeployConfig {
    #[serde(default)]
    pub zone_id: String,
    #[serde(default)]
    pub template_id: String,
    #[serde(default)]
    pub service_offering_id: String,
    #[serde(default)]
    pub network_ids: Vec<String>,
    #[serde(default)]
    pub keypair: Option<String>,
}

/// Logging
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api.region.as_deref(), Some("Europe"));
        assert_eq!(config.api.response_format, "json");
        assert_eq!(config.poll.interval.as_duration(), Duration::from_secs(2));
        assert_eq!(config.autoscale.name_prefix, "web");
        assert!(!config.autoscale.enabled);
        assert_eq!(config.telemetry.log_filter, "info");
    }

    #[test]
    fn test_deserialize_sections() {
        let toml_str = r#"
[api]
endpoint = "https://vdc.example.com/api"
method = "POST"
signature_expiry = "10m"

[poll]
interval = "500ms"
timeout = 300

[autoscale]
capacity_per_instance = 5
max_instances = 8

[autoscale.deploy]
zone_id = "z1"
network_ids = ["n1", "n2"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.api.method, HttpMethod::Post);
        assert_eq!(
            config.api.signature_expiry.map(|d| d.as_duration()),
            Some(Duration::from_secs(600))
        );
        assert_eq!(config.poll.interval.as_duration(), Duration::from_millis(500));
        assert_eq!(config.poll.timeout.as_duration(), Duration::from_secs(300));
        assert_eq!(config.autoscale.capacity_per_instance, 5);
        assert_eq!(config.autoscale.min_instances, 1);
        assert_eq!(config.autoscale.deploy.network_ids, vec!["n1", "n2"]);
    }

    #[test]
    fn test_secrets_are_not_serialized() {
        let mut config = Config::default();
        config.api.api_secret = Some("hunter2".to_string());
        let rendered = toml::to_string(&config).unwrap();
        assert!(!rendered.contains("hunter2"));
    }
}
