//! Global configuration loader for Colloquy.
//!
//! Reads `config.toml` from the data directory (`~/.colloquy/` in production)
//! and deserializes it into [`GlobalConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use secrecy::SecretString;

use colloquy_types::config::GlobalConfig;
use colloquy_types::error::ConfigError;

const DATA_DIR_ENV: &str = "COLLOQUY_DATA_DIR";

/// Load global configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`GlobalConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - If the file exists and parses successfully, returns the parsed config.
pub async fn load_global_config(data_dir: &Path) -> GlobalConfig {
    let config_path = config_path(data_dir);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
    };

    match toml::from_str::<GlobalConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            GlobalConfig::default()
        }
    }
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}

/// Resolve the data directory.
///
/// Priority:
/// 1. `COLLOQUY_DATA_DIR` environment variable
/// 2. `~/.colloquy`
/// 3. `./.colloquy`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".colloquy");
    }

    PathBuf::from(".colloquy")
}

/// Read the API token from the variable named by `api_key_env`.
///
/// A missing or blank token is only an error for remote endpoints; local
/// servers (loopback hosts) are usually unauthenticated.
pub fn resolve_api_key(config: &GlobalConfig) -> Result<Option<SecretString>, ConfigError> {
    match std::env::var(&config.api_key_env) {
        Ok(key) if !key.trim().is_empty() => Ok(Some(SecretString::from(key.trim().to_string()))),
        _ if is_loopback_endpoint(&config.endpoint) => {
            tracing::debug!(endpoint = %config.endpoint, "no API token set, sending unauthenticated requests");
            Ok(None)
        }
        _ => Err(ConfigError::MissingApiKey(config.api_key_env.clone())),
    }
}

fn is_loopback_endpoint(endpoint: &str) -> bool {
    let rest = endpoint
        .strip_prefix("http://")
        .or_else(|| endpoint.strip_prefix("https://"))
        .unwrap_or(endpoint);
    let authority = rest.split('/').next().unwrap_or_default();
    let host = if authority.starts_with('[') {
        authority.split(']').next().map(|h| &h[1..]).unwrap_or_default()
    } else {
        authority.split(':').next().unwrap_or_default()
    };
    matches!(host, "localhost" | "127.0.0.1" | "::1" | "0.0.0.0")
}
