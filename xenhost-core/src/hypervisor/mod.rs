//! Boundary to the hypervisor management API
//!
//! The wire protocol is out of scope for the core. Everything the core needs
//! from the hypervisor goes through [`HypervisorApi`], which models the
//! management API as synchronous calls plus handles for long-running tasks.
//! Backends register a [`HypervisorFactory`] with the [`HypervisorRegistry`];
//! the in-memory [`SimulatedHypervisor`] is registered by default.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::config::AgentConfig;
use crate::error::{XenhostError, XenhostResult};
use crate::types::{HostSoftwareVersion, VmPowerState};

pub mod simulated;

pub use simulated::{SimulatedHypervisor, TaskOutcome, TaskScript};

macro_rules! opaque_ref {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
            pub struct $name(pub String);

            impl $name {
                pub fn new(value: impl Into<String>) -> Self {
                    Self(value.into())
                }

                pub fn as_str(&self) -> &str {
                    &self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }
        )*
    };
}

opaque_ref!(
    /// Physical host
    HostRef,
    /// VM, template or snapshot
    VmRef,
    /// Virtual disk
    VdiRef,
    /// Storage repository
    SrRef,
    NetworkRef,
    VifRef,
    /// Server-side asynchronous task
    TaskRef,
    GpuGroupRef,
    /// Physical GPU
    PgpuRef,
    VgpuTypeRef,
    VgpuRef,
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    pub uuid: String,
    pub name_label: String,
    pub power_state: VmPowerState,
    /// UUID of the host the VM is resident on
    pub resident_on: Option<String>,
    pub is_control_domain: bool,
    pub is_a_template: bool,
    pub is_a_snapshot: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VbdType {
    Disk,
    Cd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VbdRecord {
    /// Device position as a decimal string, e.g. "0"
    pub userdevice: String,
    pub vbd_type: VbdType,
    pub vdi: Option<VdiRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    pub total_memory_mib: u64,
    pub free_memory_mib: u64,
    pub cpu_count: u32,
    pub cpu_utilisation: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VgpuTypeRecord {
    pub model_name: String,
    pub framebuffer_size: u64,
    pub max_heads: u64,
    pub max_resolution_x: u64,
    pub max_resolution_y: u64,
}

/// Memory limits applied to a VM, all in MiB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLimits {
    pub static_min: u64,
    pub dynamic_min: u64,
    pub dynamic_max: u64,
    pub static_max: u64,
}

/// Status of a remote task as reported by the hypervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteTaskStatus {
    Pending,
    Success,
    Failure { error_info: Vec<String> },
    Cancelling,
    Cancelled,
}

/// Long-running operations submitted as server-side tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsyncOperation {
    StartVm {
        vm: VmRef,
        host: HostRef,
    },
    CleanShutdownVm {
        vm: VmRef,
    },
    HardShutdownVm {
        vm: VmRef,
    },
    PoolMigrateVm {
        vm: VmRef,
        host: HostRef,
        live: bool,
    },
    MigrateSend {
        vm: VmRef,
        destination: HostRef,
        vdi_map: Vec<(VdiRef, SrRef)>,
        live: bool,
    },
    VdiPoolMigrate {
        vdi: VdiRef,
        sr: SrRef,
        options: BTreeMap<String, String>,
    },
    RevertSnapshot {
        snapshot: VmRef,
    },
}

impl AsyncOperation {
    /// API call name, used for logging and error messages
    pub fn label(&self) -> &'static str {
        match self {
            AsyncOperation::StartVm { .. } => "VM.start_on",
            AsyncOperation::CleanShutdownVm { .. } => "VM.clean_shutdown",
            AsyncOperation::HardShutdownVm { .. } => "VM.hard_shutdown",
            AsyncOperation::PoolMigrateVm { .. } => "VM.pool_migrate",
            AsyncOperation::MigrateSend { .. } => "VM.migrate_send",
            AsyncOperation::VdiPoolMigrate { .. } => "VDI.pool_migrate",
            AsyncOperation::RevertSnapshot { .. } => "VM.revert",
        }
    }
}

/// Contract the core requires from the hypervisor management API
#[async_trait]
pub trait HypervisorApi: Send + Sync {
    /// Authenticate a session against the host
    ///
    /// Must return `XenhostError::AuthenticationFailed` when the password is
    /// rejected so the caller can rotate credentials.
    async fn login(&self, host_ip: &str, username: &str, password: &str) -> XenhostResult<()>;

    async fn host_by_uuid(&self, uuid: &str) -> XenhostResult<HostRef>;

    async fn host_uuid(&self, host: &HostRef) -> XenhostResult<String>;

    async fn host_software_version(&self, host: &HostRef) -> XenhostResult<HostSoftwareVersion>;

    async fn host_license_params(&self, host: &HostRef) -> XenhostResult<HashMap<String, String>>;

    async fn host_metrics(&self, host: &HostRef) -> XenhostResult<HostMetrics>;

    /// Memory currently assigned to the control domain
    async fn dom0_memory_mib(&self, host: &HostRef) -> XenhostResult<u64>;

    async fn network_by_name(&self, name_label: &str) -> XenhostResult<Option<NetworkRef>>;

    async fn vms_by_name(&self, name_label: &str) -> XenhostResult<Vec<VmRef>>;

    async fn vm_record(&self, vm: &VmRef) -> XenhostResult<VmRecord>;

    /// Every VM object in the pool, including templates and dom0s
    async fn all_vm_records(&self) -> XenhostResult<Vec<(VmRef, VmRecord)>>;

    async fn vm_vbds(&self, vm: &VmRef) -> XenhostResult<Vec<VbdRecord>>;

    async fn vm_snapshot_by_name(&self, vm: &VmRef, name: &str) -> XenhostResult<Option<VmRef>>;

    async fn set_vm_affinity(&self, vm: &VmRef, host: &HostRef) -> XenhostResult<()>;

    async fn set_vm_memory_limits(&self, vm: &VmRef, limits: MemoryLimits) -> XenhostResult<()>;

    /// Control-domain VIFs on a host
    async fn dom0_vifs(&self, host: &HostRef) -> XenhostResult<Vec<VifRef>>;

    async fn plug_vif(&self, vif: &VifRef) -> XenhostResult<()>;

    async fn vdi_by_uuid(&self, uuid: &str) -> XenhostResult<VdiRef>;

    async fn vdi_uuid(&self, vdi: &VdiRef) -> XenhostResult<String>;

    async fn sr_by_uuid(&self, uuid: &str) -> XenhostResult<SrRef>;

    /// Submit a long-running operation, returning its task handle
    async fn submit(&self, operation: &AsyncOperation) -> XenhostResult<TaskRef>;

    async fn task_status(&self, task: &TaskRef) -> XenhostResult<RemoteTaskStatus>;

    /// Result reference of a successful task
    async fn task_result(&self, task: &TaskRef) -> XenhostResult<Option<String>>;

    /// Ask the server to cancel a task. Advisory only.
    async fn cancel_task(&self, task: &TaskRef) -> XenhostResult<()>;

    async fn destroy_task(&self, task: &TaskRef) -> XenhostResult<()>;

    /// GPU groups with at least one physical GPU on the host
    async fn gpu_groups(&self, host: &HostRef) -> XenhostResult<Vec<GpuGroupRef>>;

    async fn gpu_group_name(&self, group: &GpuGroupRef) -> XenhostResult<String>;

    async fn gpu_group_pgpus(&self, group: &GpuGroupRef) -> XenhostResult<Vec<PgpuRef>>;

    async fn gpu_group_enabled_vgpu_types(
        &self,
        group: &GpuGroupRef,
    ) -> XenhostResult<Vec<VgpuTypeRef>>;

    async fn vgpu_type_record(&self, vgpu_type: &VgpuTypeRef) -> XenhostResult<VgpuTypeRecord>;

    async fn pgpu_remaining_capacity(
        &self,
        pgpu: &PgpuRef,
        vgpu_type: &VgpuTypeRef,
    ) -> XenhostResult<u64>;

    async fn pgpu_max_capacities(&self, pgpu: &PgpuRef) -> XenhostResult<HashMap<VgpuTypeRef, u64>>;

    async fn create_vgpu(
        &self,
        vm: &VmRef,
        group: &GpuGroupRef,
        vgpu_type: &VgpuTypeRef,
    ) -> XenhostResult<VgpuRef>;
}

/// Look up exactly one VM by name, optionally requiring residence on a host
pub async fn find_vm(
    api: &dyn HypervisorApi,
    name: &str,
    resident_on: Option<&str>,
) -> XenhostResult<(VmRef, VmRecord)> {
    let mut found = Vec::new();
    for vm in api.vms_by_name(name).await? {
        let record = api.vm_record(&vm).await?;
        if record.is_a_template || record.is_a_snapshot || record.is_control_domain {
            continue;
        }
        if let Some(host) = resident_on {
            if record.resident_on.as_deref() != Some(host) {
                continue;
            }
        }
        found.push((vm, record));
    }

    match found.len() {
        0 => Err(XenhostError::not_found(match resident_on {
            Some(host) => format!("VM '{}' on host {}", name, host),
            None => format!("VM '{}'", name),
        })),
        1 => Ok(found.remove(0)),
        n => Err(XenhostError::inconsistency(format!(
            "{} VMs share the name '{}'",
            n, name
        ))),
    }
}

/// Factory trait for creating hypervisor API clients
pub trait HypervisorFactory: Send + Sync {
    fn create(&self, config: &AgentConfig) -> XenhostResult<Arc<dyn HypervisorApi>>;

    fn backend_type(&self) -> &'static str;

    fn description(&self) -> &'static str;
}

/// Registry for hypervisor backend factories
#[derive(Clone)]
pub struct HypervisorRegistry {
    factories: HashMap<String, Arc<dyn HypervisorFactory>>,
}

impl HypervisorRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, factory: Arc<dyn HypervisorFactory>) {
        let backend_type = factory.backend_type().to_string();
        tracing::info!(
            "Registering hypervisor backend: {} ({})",
            backend_type,
            factory.description()
        );
        self.factories.insert(backend_type, factory);
    }

    pub fn create(&self, config: &AgentConfig) -> XenhostResult<Arc<dyn HypervisorApi>> {
        let factory = self
            .factories
            .get(&config.hypervisor_backend)
            .ok_or_else(|| {
                XenhostError::ConfigError(format!(
                    "Unknown hypervisor backend: '{}'. Available backends: {:?}",
                    config.hypervisor_backend,
                    self.list_available_backends()
                ))
            })?;

        factory.create(config)
    }

    pub fn list_available_backends(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for HypervisorRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(simulated::SimulatedHypervisorFactory));
        registry
    }
}
