use super::models::Config;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("API endpoint is not configured (set api.endpoint or api_url in ~/.vdcapi)")]
    MissingEndpoint,

    #[error("Invalid API endpoint scheme '{scheme}', expected 'http://' or 'https://'")]
    InvalidEndpointScheme { scheme: String },

    #[error("Unsupported response format '{0}', expected 'json'")]
    UnsupportedResponseFormat(String),

    #[error("Duration must be positive: {field}")]
    ZeroDuration { field: &'static str },

    #[error("autoscale.capacity_per_instance must be positive")]
    ZeroCapacity,

    #[error("autoscale.min_instances ({min}) exceeds autoscale.max_instances ({max})")]
    InvalidInstanceRange { min: usize, max: usize },

    #[error("autoscale.name_prefix must not be empty")]
    EmptyNamePrefix,

    #[error("Autoscaling is enabled but autoscale.deploy.{field} is not set")]
    MissingDeployField { field: &'static str },

    #[error("Autoscaling is enabled but autoscale.load.stats_url is not set")]
    MissingLoadSource,
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_api(config)?;
    validate_poll(config)?;
    validate_autoscale(config)?;
    Ok(())
}

fn validate_api(config: &Config) -> Result<(), ValidationError> {
    let endpoint = config.api.endpoint.trim();
    if endpoint.is_empty() {
        return Err(ValidationError::MissingEndpoint);
    }

    let scheme = endpoint.split("://").next().unwrap_or_default();
    if !endpoint.contains("://") || !matches!(scheme, "http" | "https") {
        return Err(ValidationError::InvalidEndpointScheme {
            scheme: scheme.to_string(),
        });
    }

    // Responses are decoded as JSON
    if !config.api.response_format.eq_ignore_ascii_case("json") {
        return Err(ValidationError::UnsupportedResponseFormat(
            config.api.response_format.clone(),
        ));
    }

    if config.api.signature_expiry.is_some_and(|d| d.is_zero()) {
        return Err(ValidationError::ZeroDuration {
            field: "api.signature_expiry",
        });
    }
    if config.api.request_timeout.is_zero() {
        return Err(ValidationError::ZeroDuration {
            field: "api.request_timeout",
        });
    }

    Ok(())
}

fn validate_poll(config: &Config) -> Result<(), ValidationError> {
    if config.poll.interval.is_zero() {
        return Err(ValidationError::ZeroDuration {
            field: "poll.interval",
        });
    }
    if config.poll.timeout.is_zero() {
        return Err(ValidationError::ZeroDuration {
            field: "poll.timeout",
        });
    }
    Ok(())
}

/// Policy bounds always; deploy template and load source only when enabled
fn validate_autoscale(config: &Config) -> Result<(), ValidationError> {
    let autoscale = &config.autoscale;

    if autoscale.name_prefix.trim().is_empty() {
        return Err(ValidationError::EmptyNamePrefix);
    }
    if autoscale.capacity_per_instance == 0 {
        return Err(ValidationError::ZeroCapacity);
    }
    if autoscale.min_instances > autoscale.max_instances {
        return Err(ValidationError::InvalidInstanceRange {
            min: autoscale.min_instances,
            max: autoscale.max_instances,
        });
    }

    if !autoscale.enabled {
        return Ok(());
    }

    if autoscale.period.is_zero() {
        return Err(ValidationError::ZeroDuration {
            field: "autoscale.period",
        });
    }
    validate_deploy(config)?;
    if autoscale.load.stats_url.is_none() {
        return Err(ValidationError::MissingLoadSource);
    }

    Ok(())
}

/// Fields required to create fleet members
pub(crate) fn validate_deploy(config: &Config) -> Result<(), ValidationError> {
    let deploy = &config.autoscale.deploy;
    let required = [
        ("zone_id", &deploy.zone_id),
        ("template_id", &deploy.template_id),
        ("service_offering_id", &deploy.service_offering_id),
    ];

    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(ValidationError::MissingDeployField { field });
        }
    }

    Ok(())
}
