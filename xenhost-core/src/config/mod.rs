//! Configuration for the xenhost agent
//!
//! Structured configuration with defaults, TOML file loading, environment
//! variable overrides and validation. Configuration is delivered to the core
//! before the first command runs and is not re-read afterwards.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{XenhostError, XenhostResult};

pub mod defaults;
pub mod host;

pub use defaults::*;
pub use host::{CredentialConfig, HostProfile, HostTunables, NetworkRoles};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Host this agent controls
    pub host: HostProfile,

    /// Hypervisor backend type, resolved through the backend registry
    pub hypervisor_backend: String,

    /// Root directory containing per-release patch bundles
    pub scripts_dir: PathBuf,

    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level directive, overridden by RUST_LOG
    pub level: String,
    /// "text" or "json"
    pub format: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: HostProfile::default(),
            hypervisor_backend: DEFAULT_HYPERVISOR_BACKEND.to_string(),
            scripts_dir: PathBuf::from(DEFAULT_SCRIPTS_DIR),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file(path: &Path) -> XenhostResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            XenhostError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut config: AgentConfig = toml::from_str(&content)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> XenhostResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> XenhostResult<()> {
        if let Ok(val) = std::env::var("XENHOST_HYPERVISOR_BACKEND") {
            self.hypervisor_backend = val;
        }
        if let Ok(val) = std::env::var("XENHOST_SCRIPTS_DIR") {
            self.scripts_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("XENHOST_LOG_FORMAT") {
            self.logging.format = val;
        }
        self.host.apply_env()
    }

    /// Validate the configuration
    pub fn validate(&self) -> XenhostResult<()> {
        if self.hypervisor_backend.is_empty() {
            return Err(XenhostError::ConfigError(
                "hypervisor_backend must be set".to_string(),
            ));
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(XenhostError::ConfigError(format!(
                "Invalid log format: {}",
                self.logging.format
            )));
        }

        self.host.validate()
    }
}

/// Builder for AgentConfig
pub struct AgentConfigBuilder {
    config: AgentConfig,
}

impl AgentConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AgentConfig::default(),
        }
    }

    pub fn host_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.config.host.host_uuid = uuid.into();
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.config.host.ip = ip.into();
        self
    }

    pub fn pool_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.config.host.pool_uuid = uuid.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.host.credentials.passwords.push(password.into());
        self
    }

    pub fn networks(mut self, networks: NetworkRoles) -> Self {
        self.config.host.networks = networks;
        self
    }

    pub fn tunables(mut self, tunables: HostTunables) -> Self {
        self.config.host.tunables = tunables;
        self
    }

    pub fn hypervisor_backend(mut self, backend: impl Into<String>) -> Self {
        self.config.hypervisor_backend = backend.into();
        self
    }

    pub fn scripts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.scripts_dir = dir.into();
        self
    }

    pub fn build(self) -> XenhostResult<AgentConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for AgentConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper functions for duration parsing
pub(crate) fn parse_duration_ms_from_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

pub(crate) fn parse_duration_secs_from_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = AgentConfigBuilder::new()
            .host_uuid("host-1")
            .ip("10.0.0.5")
            .pool_uuid("pool-1")
            .password("pw")
            .build()
            .unwrap();

        assert_eq!(config.host.host_uuid, "host-1");
        assert_eq!(config.hypervisor_backend, "simulated");
    }

    #[test]
    fn test_invalid_config() {
        // No host identity
        let config = AgentConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_format() {
        let mut config = AgentConfigBuilder::new()
            .host_uuid("host-1")
            .ip("10.0.0.5")
            .pool_uuid("pool-1")
            .password("pw")
            .build()
            .unwrap();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }
}
