//! Service configuration structs, loading and validation

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::defaults;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "VITALSTREAM_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "vitalstream.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Complete service configuration.
///
/// Every section defaults independently, so a file only needs the values it
/// changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub rolling_buffer: RollingBufferConfig,
    pub trials: TrialsConfig,
    pub ingest: IngestConfig,
}

impl ServiceConfig {
    /// Load configuration using the standard search order.
    ///
    /// Never fails: an unreadable or invalid file is logged and skipped.
    pub fn load() -> Self {
        // 1. Check env var
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded config from {}", CONFIG_ENV_VAR);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {}, falling back", CONFIG_ENV_VAR);
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", CONFIG_ENV_VAR);
            }
        }

        // 2. Check ./vitalstream.toml
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded config from ./{}", LOCAL_CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", LOCAL_CONFIG_FILE);
                }
            }
        }

        // 3. Defaults
        info!("No config file found, using built-in defaults");
        Self::default()
    }

    /// Load and validate a specific TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;

        for key in super::validation::unknown_keys(&contents) {
            warn!(key = %key, path = %path.display(), "Unknown config key ignored");
        }

        let config = Self::from_toml_str(&contents)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating.
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Reject configurations the service cannot run with.
    ///
    /// All violations are collected and reported together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        if self.server.addr.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "server.addr '{}' is not a valid socket address",
                self.server.addr
            ));
        }
        if self.storage.data_dir.as_os_str().is_empty() {
            errors.push("storage.data_dir must not be empty".to_string());
        }

        let rb = &self.rolling_buffer;
        if rb.capacity == 0 {
            errors.push("rolling_buffer.capacity must be greater than 0".to_string());
        }
        if rb.max_age_secs == 0 {
            errors.push("rolling_buffer.max_age_secs must be greater than 0".to_string());
        }
        if rb.cleanup_interval_secs == 0 {
            errors.push("rolling_buffer.cleanup_interval_secs must be greater than 0".to_string());
        } else if rb.cleanup_interval_secs > rb.max_age_secs {
            errors.push(format!(
                "rolling_buffer.cleanup_interval_secs ({}) must not exceed max_age_secs ({})",
                rb.cleanup_interval_secs, rb.max_age_secs
            ));
        }

        if self.trials.end_timeout_secs == 0 {
            errors.push("trials.end_timeout_secs must be greater than 0".to_string());
        }
        if self.ingest.max_message_bytes < 64 {
            errors.push(format!(
                "ingest.max_message_bytes ({}) must be at least 64",
                self.ingest.max_message_bytes
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error ({path}): {err}", path = .0.display(), err = .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Config parse error ({path}): {err}", path = .0.display(), err = .1)]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error("Config serialization error: {0}")]
    Serialize(#[source] toml::ser::Error),

    #[error("Config validation failed:\n{}", format_violations(.0))]
    Validation(Vec<String>),
}

fn format_violations(errors: &[String]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

// ============================================================================
// Sections
// ============================================================================

/// HTTP / WebSocket server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address. Can be overridden by `VITALSTREAM_ADDR` or `--addr`.
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

fn default_server_addr() -> String {
    defaults::SERVER_ADDR.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// sled database directory.
    pub data_dir: PathBuf,
    /// Flush the database after every trial log append instead of relying
    /// on sled's periodic flush.
    pub flush_each_append: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(defaults::DATA_DIR),
            flush_each_append: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollingBufferConfig {
    pub capacity: usize,
    pub max_age_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl RollingBufferConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl Default for RollingBufferConfig {
    fn default() -> Self {
        Self {
            capacity: defaults::ROLLING_BUFFER_CAPACITY,
            max_age_secs: defaults::ROLLING_BUFFER_MAX_AGE_SECS,
            cleanup_interval_secs: defaults::ROLLING_BUFFER_CLEANUP_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrialsConfig {
    /// Caller-side timeout for `end_trial` over HTTP.
    pub end_timeout_secs: u64,
    /// Drop repeated `(device_id, device timestamp)` readings within a trial.
    pub dedupe_device_timestamps: bool,
}

impl TrialsConfig {
    pub fn end_timeout(&self) -> Duration {
        Duration::from_secs(self.end_timeout_secs)
    }
}

impl Default for TrialsConfig {
    fn default() -> Self {
        Self {
            end_timeout_secs: defaults::END_TRIAL_TIMEOUT_SECS,
            dedupe_device_timestamps: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub max_message_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: defaults::MAX_MESSAGE_BYTES,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
