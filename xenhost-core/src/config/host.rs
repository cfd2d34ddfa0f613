//! Host profile: identity, network roles, tunables and credentials of one host

use super::defaults::*;
use super::{parse_duration_ms_from_env, parse_duration_secs_from_env};
use crate::error::{XenhostError, XenhostResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Static identity and tunables for one hypervisor host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostProfile {
    /// Host UUID as reported by the hypervisor
    pub host_uuid: String,

    /// Management IP address of the host
    pub ip: String,

    /// Pool the host belongs to; doubles as the cluster identifier
    pub pool_uuid: String,

    /// Symbolic network role names
    pub networks: NetworkRoles,

    /// Timing and resource tunables
    pub tunables: HostTunables,

    /// Login material
    pub credentials: CredentialConfig,
}

/// Network role assignments by hypervisor network name label
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkRoles {
    pub public: Option<String>,
    pub private: Option<String>,
    pub guest: Option<String>,
    pub storage: Option<String>,
    pub storage2: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostTunables {
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    pub retry_count: u32,

    #[serde(with = "humantime_serde")]
    pub sleep: Duration,

    /// Poll interval for asynchronous tasks
    #[serde(with = "humantime_serde")]
    pub task_poll_interval: Duration,

    /// Default wait budget for asynchronous tasks
    #[serde(with = "humantime_serde")]
    pub task_wait: Duration,

    /// Wait budget for migrations
    #[serde(with = "humantime_serde")]
    pub migrate_wait: Duration,

    pub max_nics: u32,

    /// Minimum memory reserved for the control domain
    pub dom0_min_memory_mib: u64,

    /// Memory consumed by the hypervisor itself
    pub hypervisor_memory_used_mib: u64,

    /// Discount applied to advertised memory
    pub virtualization_factor: f64,
}

/// Username plus a rotating list of passwords, tried front to back
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    pub username: String,
    #[serde(skip_serializing)]
    pub passwords: Vec<String>,
}

impl std::fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("username", &self.username)
            .field("passwords", &format_args!("[{} redacted]", self.passwords.len()))
            .finish()
    }
}

impl Default for HostProfile {
    fn default() -> Self {
        Self {
            host_uuid: String::new(),
            ip: String::new(),
            pool_uuid: String::new(),
            networks: NetworkRoles::default(),
            tunables: HostTunables::default(),
            credentials: CredentialConfig::default(),
        }
    }
}

impl Default for HostTunables {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            retry_count: DEFAULT_RETRY_COUNT,
            sleep: Duration::from_millis(DEFAULT_SLEEP_MS),
            task_poll_interval: Duration::from_millis(DEFAULT_TASK_POLL_INTERVAL_MS),
            task_wait: Duration::from_secs(DEFAULT_TASK_WAIT_SECS),
            migrate_wait: Duration::from_secs(DEFAULT_MIGRATE_WAIT_SECS),
            max_nics: DEFAULT_MAX_NICS,
            dom0_min_memory_mib: DEFAULT_DOM0_MIN_MEMORY_MIB,
            hypervisor_memory_used_mib: DEFAULT_HYPERVISOR_MEMORY_USED_MIB,
            virtualization_factor: DEFAULT_VIRTUALIZATION_FACTOR,
        }
    }
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            username: DEFAULT_USERNAME.to_string(),
            passwords: Vec::new(),
        }
    }
}

impl HostProfile {
    /// Cluster identifier used as the cache partition key
    pub fn cluster_id(&self) -> &str {
        &self.pool_uuid
    }

    /// Load host profile overrides from environment variables
    pub fn from_env() -> XenhostResult<Self> {
        let mut profile = Self::default();
        profile.apply_env()?;
        Ok(profile)
    }

    pub(crate) fn apply_env(&mut self) -> XenhostResult<()> {
        if let Ok(val) = std::env::var("XENHOST_HOST_UUID") {
            self.host_uuid = val;
        }
        if let Ok(val) = std::env::var("XENHOST_HOST_IP") {
            self.ip = val;
        }
        if let Ok(val) = std::env::var("XENHOST_POOL_UUID") {
            self.pool_uuid = val;
        }
        if let Ok(val) = std::env::var("XENHOST_USERNAME") {
            self.credentials.username = val;
        }
        if let Ok(val) = std::env::var("XENHOST_PASSWORDS") {
            self.credentials.passwords = val
                .split(',')
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(val) = std::env::var("XENHOST_PRIVATE_NETWORK") {
            self.networks.private = Some(val);
        }

        let t = &mut self.tunables;
        t.task_poll_interval =
            parse_duration_ms_from_env("XENHOST_TASK_POLL_INTERVAL_MS", t.task_poll_interval);
        t.task_wait = parse_duration_secs_from_env("XENHOST_TASK_WAIT_SECS", t.task_wait);
        t.migrate_wait = parse_duration_secs_from_env("XENHOST_MIGRATE_WAIT_SECS", t.migrate_wait);

        if let Ok(val) = std::env::var("XENHOST_VIRTUALIZATION_FACTOR") {
            t.virtualization_factor = val.parse().map_err(|_| {
                XenhostError::ConfigError("Invalid XENHOST_VIRTUALIZATION_FACTOR".to_string())
            })?;
        }
        if let Ok(val) = std::env::var("XENHOST_DOM0_MIN_MEMORY_MIB") {
            t.dom0_min_memory_mib = val.parse().map_err(|_| {
                XenhostError::ConfigError("Invalid XENHOST_DOM0_MIN_MEMORY_MIB".to_string())
            })?;
        }

        Ok(())
    }

    /// Validate host profile
    pub fn validate(&self) -> XenhostResult<()> {
        if self.host_uuid.is_empty() {
            return Err(XenhostError::ConfigError(
                "host.host_uuid must be set".to_string(),
            ));
        }
        if self.ip.is_empty() {
            return Err(XenhostError::ConfigError("host.ip must be set".to_string()));
        }
        if self.pool_uuid.is_empty() {
            return Err(XenhostError::ConfigError(
                "host.pool_uuid must be set".to_string(),
            ));
        }
        if self.credentials.passwords.is_empty() {
            return Err(XenhostError::ConfigError(
                "host.credentials.passwords must contain at least one password".to_string(),
            ));
        }

        let t = &self.tunables;
        if t.task_poll_interval.is_zero() {
            return Err(XenhostError::ConfigError(
                "task_poll_interval must be non-zero".to_string(),
            ));
        }
        if t.task_wait < t.task_poll_interval || t.migrate_wait < t.task_poll_interval {
            return Err(XenhostError::ConfigError(
                "task_wait and migrate_wait must be at least task_poll_interval".to_string(),
            ));
        }
        if t.heartbeat_timeout < t.heartbeat_interval {
            return Err(XenhostError::ConfigError(
                "heartbeat_timeout must not be shorter than heartbeat_interval".to_string(),
            ));
        }
        if !(t.virtualization_factor > 0.0 && t.virtualization_factor <= 1.0) {
            return Err(XenhostError::ConfigError(
                "virtualization_factor must be in (0, 1]".to_string(),
            ));
        }
        if t.max_nics == 0 {
            return Err(XenhostError::ConfigError(
                "max_nics must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
