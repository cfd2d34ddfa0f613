//! Default configuration values for xenhost
//!
//! This module centralizes all default values to make them easy to find and modify.

// Heartbeat defaults
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 120;

// Remote call defaults
pub const DEFAULT_RETRY_COUNT: u32 = 3;
pub const DEFAULT_SLEEP_MS: u64 = 10_000;
pub const DEFAULT_TASK_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_TASK_WAIT_SECS: u64 = 1_800;
pub const DEFAULT_MIGRATE_WAIT_SECS: u64 = 3_600;

// Host resource defaults
pub const DEFAULT_MAX_NICS: u32 = 7;
pub const DEFAULT_DOM0_MIN_MEMORY_MIB: u64 = 2_048;
pub const DEFAULT_HYPERVISOR_MEMORY_USED_MIB: u64 = 128;
pub const DEFAULT_VIRTUALIZATION_FACTOR: f64 = 63.0 / 64.0;

// Network role defaults
pub const DEFAULT_PRIVATE_NETWORK: &str = "cloud-private";
pub const DEFAULT_USERNAME: &str = "root";

// Agent defaults
pub const DEFAULT_HYPERVISOR_BACKEND: &str = "simulated";
pub const DEFAULT_SCRIPTS_DIR: &str = "./scripts";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_LOG_FORMAT: &str = "text";
