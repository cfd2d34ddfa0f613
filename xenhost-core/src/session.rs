//! Connecting to a host and assembling the per-connection context

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::capability::{CapabilityChain, ReleaseTag, ResolvedBehavior};
use crate::cluster_vm_cache::ClusterVmStateCache;
use crate::config::{AgentConfig, HostProfile};
use crate::credentials::CredentialProvider;
use crate::error::{XenhostError, XenhostResult};
use crate::gpu_capacity::GpuCapacityAggregator;
use crate::hypervisor::{HostRef, HypervisorApi, NetworkRef};
use crate::migration::MigrationOrchestrator;
use crate::remote::RemoteExecutor;
use crate::task_waiter::TaskWaiter;

/// Network roles resolved to hypervisor networks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedNetworks {
    pub public: Option<NetworkRef>,
    pub private: Option<NetworkRef>,
    pub guest: Option<NetworkRef>,
    pub storage: Option<NetworkRef>,
    pub storage2: Option<NetworkRef>,
}

/// Everything a command handler needs for one connected host
///
/// Built once per connection. The profile, release and resolved networks do
/// not change until the agent reconnects.
pub struct HostContext {
    pub profile: HostProfile,
    pub release: ReleaseTag,
    pub behavior: ResolvedBehavior,
    pub api: Arc<dyn HypervisorApi>,
    pub waiter: TaskWaiter,
    pub cache: Arc<ClusterVmStateCache>,
    pub remote: Arc<dyn RemoteExecutor>,
    pub networks: ResolvedNetworks,
    pub host_ref: HostRef,
    pub scripts_dir: PathBuf,
}

impl HostContext {
    pub fn cluster_id(&self) -> &str {
        self.profile.cluster_id()
    }

    pub fn host_uuid(&self) -> &str {
        &self.profile.host_uuid
    }

    pub fn orchestrator(&self) -> MigrationOrchestrator {
        MigrationOrchestrator::new(
            self.api.clone(),
            self.cache.clone(),
            &self.profile,
            &self.behavior,
        )
    }

    pub fn gpu_aggregator(&self) -> GpuCapacityAggregator {
        GpuCapacityAggregator::new(self.api.clone())
    }
}

pub struct HostConnector {
    api: Arc<dyn HypervisorApi>,
    chain: Arc<CapabilityChain>,
    cache: Arc<ClusterVmStateCache>,
    remote: Arc<dyn RemoteExecutor>,
    credentials: Arc<dyn CredentialProvider>,
}

impl HostConnector {
    pub fn new(
        api: Arc<dyn HypervisorApi>,
        chain: Arc<CapabilityChain>,
        cache: Arc<ClusterVmStateCache>,
        remote: Arc<dyn RemoteExecutor>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            api,
            chain,
            cache,
            remote,
            credentials,
        }
    }

    /// Log in, moving to the next password whenever one is rejected
    pub async fn login(&self, profile: &HostProfile) -> XenhostResult<()> {
        let username = &profile.credentials.username;
        loop {
            let password = self
                .credentials
                .peek()
                .ok_or_else(|| XenhostError::CredentialsExhausted {
                    host: profile.ip.clone(),
                })?;

            match self.api.login(&profile.ip, username, &password).await {
                Ok(()) => return Ok(()),
                Err(XenhostError::AuthenticationFailed { host }) => {
                    warn!("Password rejected by {}, trying the next one", host);
                    if !self.credentials.advance() {
                        return Err(XenhostError::CredentialsExhausted { host });
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn connect(&self, config: &AgentConfig) -> XenhostResult<HostContext> {
        let profile = config.host.clone();
        self.login(&profile).await?;

        let host_ref = self.api.host_by_uuid(&profile.host_uuid).await?;
        let software = self.api.host_software_version(&host_ref).await?;
        let release = self.chain.select_release(&software)?.clone();
        let behavior = self.chain.resolve_all(&release.name)?;
        let networks = self.resolve_networks(&profile).await?;

        info!(
            host = %profile.host_uuid,
            cluster = %profile.pool_uuid,
            "Connected to {} running {}",
            profile.ip,
            release
        );

        Ok(HostContext {
            profile,
            release,
            behavior,
            waiter: TaskWaiter::new(self.api.clone()),
            api: self.api.clone(),
            cache: self.cache.clone(),
            remote: self.remote.clone(),
            networks,
            host_ref,
            scripts_dir: config.scripts_dir.clone(),
        })
    }

    async fn resolve_networks(&self, profile: &HostProfile) -> XenhostResult<ResolvedNetworks> {
        let roles = &profile.networks;
        Ok(ResolvedNetworks {
            public: self.resolve_network("public", roles.public.as_deref()).await?,
            private: self.resolve_network("private", roles.private.as_deref()).await?,
            guest: self.resolve_network("guest", roles.guest.as_deref()).await?,
            storage: self.resolve_network("storage", roles.storage.as_deref()).await?,
            storage2: self.resolve_network("storage2", roles.storage2.as_deref()).await?,
        })
    }

    async fn resolve_network(
        &self,
        role: &str,
        name: Option<&str>,
    ) -> XenhostResult<Option<NetworkRef>> {
        let Some(name) = name else {
            return Ok(None);
        };
        match self.api.network_by_name(name).await? {
            Some(network) => Ok(Some(network)),
            None => Err(XenhostError::not_found(format!(
                "{} network '{}'",
                role, name
            ))),
        }
    }
}
