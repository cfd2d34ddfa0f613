// Common test utilities and helpers for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use xenhost_core::config::{HostTunables, NetworkRoles};
use xenhost_core::remote::RemoteOutput;
use xenhost_core::{
    standard_chain, AgentConfig, AgentConfigBuilder, CapabilityChain, ClusterVmStateCache,
    HostConnector, HostContext, RemoteExecutor, RotatingCredentials, SimulatedHypervisor,
    XenhostResult,
};

pub const HOST_UUID: &str = "host-a";
pub const OTHER_HOST_UUID: &str = "host-b";
pub const POOL_UUID: &str = "pool-1";
pub const PRIVATE_NETWORK: &str = "cloud-private";

/// Tunables short enough for tests on a paused or real clock
pub fn fast_tunables() -> HostTunables {
    HostTunables {
        task_poll_interval: Duration::from_millis(10),
        task_wait: Duration::from_secs(5),
        migrate_wait: Duration::from_secs(10),
        ..HostTunables::default()
    }
}

pub fn test_config(scripts_dir: &Path) -> AgentConfig {
    AgentConfigBuilder::new()
        .host_uuid(HOST_UUID)
        .ip("10.0.0.5")
        .pool_uuid(POOL_UUID)
        .password("secret")
        .networks(NetworkRoles {
            private: Some(PRIVATE_NETWORK.to_string()),
            ..NetworkRoles::default()
        })
        .tunables(fast_tunables())
        .scripts_dir(scripts_dir)
        .build()
        .unwrap()
}

/// Records remote commands and file copies instead of running them
#[derive(Default)]
pub struct RecordingExecutor {
    commands: Mutex<Vec<String>>,
    copies: Mutex<Vec<(PathBuf, String, String)>>,
    fail_runs: AtomicBool,
}

impl RecordingExecutor {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// (local file, remote dir, mode) per copy
    pub fn copies(&self) -> Vec<(PathBuf, String, String)> {
        self.copies.lock().clone()
    }

    pub fn fail_runs(&self) {
        self.fail_runs.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteExecutor for RecordingExecutor {
    async fn run(&self, _host_ip: &str, _username: &str, command: &str) -> XenhostResult<RemoteOutput> {
        self.commands.lock().push(command.to_string());
        let failed = self.fail_runs.load(Ordering::SeqCst);
        Ok(RemoteOutput {
            exit_code: Some(if failed { 1 } else { 0 }),
            stdout: String::new(),
            stderr: if failed {
                "Permission denied".to_string()
            } else {
                String::new()
            },
        })
    }

    async fn copy(
        &self,
        _host_ip: &str,
        _username: &str,
        local: &Path,
        remote_dir: &str,
        mode: &str,
    ) -> XenhostResult<()> {
        self.copies
            .lock()
            .push((local.to_path_buf(), remote_dir.to_string(), mode.to_string()));
        Ok(())
    }
}

/// Two-host pool on a simulated hypervisor
pub struct TestEnv {
    pub sim: Arc<SimulatedHypervisor>,
    pub cache: Arc<ClusterVmStateCache>,
    pub remote: Arc<RecordingExecutor>,
    pub chain: Arc<CapabilityChain>,
    pub config: AgentConfig,
}

impl TestEnv {
    pub fn new(version: &str, hotfixes: &[&str]) -> Self {
        Self::with_scripts_dir(version, hotfixes, Path::new("./scripts"))
    }

    pub fn with_scripts_dir(version: &str, hotfixes: &[&str], scripts_dir: &Path) -> Self {
        let sim = Arc::new(SimulatedHypervisor::new());
        for uuid in [HOST_UUID, OTHER_HOST_UUID] {
            sim.add_host(uuid, version, hotfixes);
            sim.add_control_domain(uuid);
        }
        sim.add_network(PRIVATE_NETWORK);

        Self {
            sim,
            cache: Arc::new(ClusterVmStateCache::new()),
            remote: Arc::new(RecordingExecutor::default()),
            chain: Arc::new(standard_chain().unwrap()),
            config: test_config(scripts_dir),
        }
    }

    pub fn connector(&self) -> HostConnector {
        HostConnector::new(
            self.sim.clone(),
            self.chain.clone(),
            self.cache.clone(),
            self.remote.clone(),
            Arc::new(RotatingCredentials::new(
                self.config.host.credentials.passwords.clone(),
            )),
        )
    }

    pub async fn connect(&self) -> HostContext {
        self.connector().connect(&self.config).await.unwrap()
    }
}
