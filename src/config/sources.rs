use super::models::Config;
use config::{ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_ENV_VAR: &str = "VDCFLEET_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/vdcfleet.toml";
const ENV_PREFIX: &str = "VDCFLEET";
const ENV_SEPARATOR: &str = "__";

const LEGACY_CREDENTIALS_ENV_VAR: &str = "VDCFLEET_CREDENTIALS";
const LEGACY_CREDENTIALS_FILE: &str = ".vdcapi";

/// Load configuration from multiple sources with priority:
/// 1. Defaults (embedded in structs)
/// 2. TOML file (if exists)
/// 3. Environment variables from .env file (via dotenvy)
/// 4. System environment variables (highest priority)
pub fn load(config_path: Option<PathBuf>) -> Result<Config, ConfigError> {
    // Load .env file if it exists (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    let config_path = config_path
        .or_else(|| env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = load_from_sources(config_path)?;

    load_secrets(&mut config);

    Ok(config)
}

/// Load secrets from environment variables into config
/// Secrets are never stored in TOML files, only in environment
fn load_secrets(config: &mut Config) {
    if let Ok(api_key) = env::var("VDC_API_KEY") {
        config.api.api_key = Some(api_key);
    }
    if let Ok(api_secret) = env::var("VDC_API_SECRET") {
        config.api.api_secret = Some(api_secret);
    }
    if let Ok(password) = env::var("HAPROXY_STATS_PASSWORD") {
        config.autoscale.load.password = Some(password);
    }

    // Fall back to the JSON credentials file the scripts have always used
    if config.api.api_key.is_none() || config.api.api_secret.is_none() || config.api.endpoint.is_empty() {
        if let Some(path) = legacy_credentials_path() {
            apply_legacy_credentials(config, &path);
        }
    }
}

fn legacy_credentials_path() -> Option<PathBuf> {
    env::var(LEGACY_CREDENTIALS_ENV_VAR)
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            env::var("HOME")
                .ok()
                .map(|home| Path::new(&home).join(LEGACY_CREDENTIALS_FILE))
        })
}

/// `~/.vdcapi` contents
#[derive(Debug, Deserialize)]
struct LegacyCredentials {
    api_url: Option<String>,
    api_key: Option<String>,
    api_secret: Option<String>,
}

/// Fill unset credential fields from a legacy JSON credentials file
///
/// Returns whether the file was read. A missing or malformed file is not an
/// error; validation reports whatever is still missing.
pub(crate) fn apply_legacy_credentials(config: &mut Config, path: &Path) -> bool {
    let Ok(data) = fs::read_to_string(path) else {
        return false;
    };

    let legacy: LegacyCredentials = match serde_json::from_str(&data) {
        Ok(legacy) => legacy,
        Err(e) => {
            tracing::warn!("Ignoring malformed credentials file {}: {}", path.display(), e);
            return false;
        }
    };

    tracing::info!("Loading API credentials from: {}", path.display());

    if config.api.endpoint.is_empty() {
        if let Some(url) = legacy.api_url {
            config.api.endpoint = url;
        }
    }
    if config.api.api_key.is_none() {
        config.api.api_key = legacy.api_key;
    }
    if config.api.api_secret.is_none() {
        config.api.api_secret = legacy.api_secret;
    }

    true
}

/// Load configuration from a specific path and environment
/// Useful for testing with custom config files
pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    // Start with defaults (handled by struct Default implementations)
    // Add TOML file if it exists (optional)
    if config_path.exists() {
        tracing::info!("Loading configuration from: {}", config_path.display());
        builder = builder.add_source(File::from(config_path).required(false));
    } else {
        tracing::warn!(
            "Configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    // VDCFLEET__POLL__INTERVAL -> poll.interval
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize()
}
