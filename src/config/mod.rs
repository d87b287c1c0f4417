//! Configuration management for vdcfleet
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use vdcfleet::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("API endpoint: {}", config.api.endpoint);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `VDCFLEET__<section>__<key>`
//!
//! Examples:
//! - `VDCFLEET__API__ENDPOINT=https://vdc.example.com/myservices/api/vdc`
//! - `VDCFLEET__POLL__INTERVAL=5s`
//! - `VDCFLEET__AUTOSCALE__MAX_INSTANCES=8`
//!
//! API credentials come from `VDC_API_KEY` / `VDC_API_SECRET`, or from the
//! JSON credentials file `~/.vdcapi` (`api_url`, `api_key`, `api_secret`).
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/vdcfleet.toml`.
//! This can be overridden using the `VDCFLEET_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

// Re-export public types
pub use crate::humanize::HumanDuration;
pub use models::{
    ApiConfig, AutoscaleConfig, Config, DeployConfig, LoadConfig, PollConfig, TelemetryConfig,
};
pub use validation::ValidationError;

use crate::autoscale::{AutoscaleError, ScalingPolicy};
use crate::client::{DeployTemplate, HttpConfig};
use crate::fleet::NamePolicy;
use crate::signer::{Credential, RequestSigner, SignOptions, SignerError};
use crate::tracker::TrackerConfig;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// Configuration is loaded with the following priority (highest to lowest):
    /// 1. Environment variables (`VDCFLEET__*`)
    /// 2. TOML file (default: `config/vdcfleet.toml`)
    /// 3. Default values
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file is malformed
    /// - Validation fails (missing endpoint, bad bounds, etc.)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(None)
    }

    /// Like `load`, with an explicit file taking precedence over `VDCFLEET_CONFIG`
    pub fn load_with(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config = sources::load(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    ///
    /// Useful for testing with custom configuration files.
    pub fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    pub fn credential(&self) -> Result<Credential, SignerError> {
        let api_key = self
            .api
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(SignerError::MissingCredential("api_key"))?;
        let api_secret = self
            .api
            .api_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(SignerError::MissingCredential("secret_key"))?;
        Ok(Credential::new(self.api.endpoint.trim(), api_key, api_secret))
    }

    pub fn sign_options(&self) -> SignOptions {
        SignOptions {
            response_format: self.api.response_format.clone(),
            expiry: self.api.signature_expiry.map(|d| d.as_duration()),
        }
    }

    pub fn request_signer(&self) -> Result<RequestSigner, SignerError> {
        Ok(RequestSigner::new(self.credential()?, self.sign_options()))
    }

    pub fn http_config(&self) -> HttpConfig {
        HttpConfig {
            connect_timeout: self.api.connect_timeout.as_duration(),
            request_timeout: self.api.request_timeout.as_duration(),
            max_retries: self.api.max_retries,
            user_agent: self.api.user_agent.clone(),
            method: self.api.method,
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            interval: self.poll.interval.as_duration(),
            timeout: self.poll.timeout.as_duration(),
        }
    }

    pub fn scaling_policy(&self) -> Result<ScalingPolicy, AutoscaleError> {
        ScalingPolicy::new(
            self.autoscale.capacity_per_instance,
            self.autoscale.min_instances,
            self.autoscale.max_instances,
        )
    }

    pub fn name_policy(&self) -> NamePolicy {
        NamePolicy::new(self.autoscale.name_prefix.trim()).with_width(self.autoscale.name_width)
    }

    /// Template for new members; fails when a required field is unset
    pub fn deploy_template(&self) -> Result<DeployTemplate, ValidationError> {
        validation::validate_deploy(self)?;
        let deploy = &self.autoscale.deploy;
        Ok(DeployTemplate {
            zone_id: deploy.zone_id.clone(),
            template_id: deploy.template_id.clone(),
            service_offering_id: deploy.service_offering_id.clone(),
            network_ids: deploy.network_ids.clone(),
            keypair: deploy.keypair.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_load_minimal_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[api]
endpoint = "https://vdc.example.com/myservices/api/vdc"
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = Config::load_from_path(config_path).unwrap();
        assert_eq!(config.tracker_config(), TrackerConfig::default());
        assert_eq!(config.name_policy().member_name(1), "web-01");
    }

    #[test]
    fn test_validation_catches_bad_bounds() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[api]
endpoint = "https://vdc.example.com/api"

[autoscale]
min_instances = 6
max_instances = 3
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let result = Config::load_from_path(config_path);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::ValidationError(ValidationError::InvalidInstanceRange { .. })
        ));
    }

    #[test]
    fn test_credential_requires_secrets() {
        let mut config = Config::default();
        config.api.endpoint = "https://vdc.example.com/api".to_string();
        assert_eq!(
            config.credential().unwrap_err(),
            SignerError::MissingCredential("api_key")
        );

        config.api.api_key = Some("key".to_string());
        config.api.api_secret = Some("secret".to_string());
        let credential = config.credential().unwrap();
        assert_eq!(credential.api_key(), "key");
        assert_eq!(credential.endpoint(), "https://vdc.example.com/api");
    }

    #[test]
    fn test_full_config_example() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[api]
endpoint = "https://vdc.example.com/myservices/api/vdc"
region = "Asia"
method = "POST"
signature_expiry = "10m"
max_retries = 5

[poll]
interval = "3s"
timeout = "10m"

[autoscale]
enabled = true
name_prefix = "app"
name_width = 3
capacity_per_instance = 5
min_instances = 2
max_instances = 10
period = "2m"

[autoscale.load]
stats_url = "http://lb:8404/stats;csv"
frontend = "www"
username = "stats"

[autoscale.deploy]
zone_id = "z1"
template_id = "t1"
service_offering_id = "small"
network_ids = ["priv", "inet"]
keypair = "ops"

[telemetry]
log_filter = "vdcfleet=debug"
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = Config::load_from_path(config_path).unwrap();

        let http = config.http_config();
        assert_eq!(http.max_retries, 5);
        assert_eq!(http.method, crate::client::HttpMethod::Post);

        let options = config.sign_options();
        assert_eq!(options.expiry, Some(Duration::from_secs(600)));

        let policy = config.scaling_policy().unwrap();
        assert_eq!(policy.target_for_load(22), 5);

        assert_eq!(config.name_policy().member_name(4), "app-004");
        let template = config.deploy_template().unwrap();
        assert_eq!(template.network_ids, vec!["priv", "inet"]);
        assert_eq!(config.tracker_config().interval, Duration::from_secs(3));
        assert_eq!(config.telemetry.log_filter, "vdcfleet=debug");
    }
}
