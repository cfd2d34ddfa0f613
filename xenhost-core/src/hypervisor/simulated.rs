//! In-memory hypervisor used by tests and the demo backend
//!
//! Holds hosts, VMs, disks, GPU inventory and server-side tasks in a single
//! mutex-protected state. Tasks follow a [`TaskScript`]: they stay pending for
//! a number of polls, then finish with the scripted outcome. Operation
//! effects (power state, residency, disk relocation) are applied when a task
//! succeeds. Any call can be made to fail with [`SimulatedHypervisor::inject_failure`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    AsyncOperation, GpuGroupRef, HostMetrics, HostRef, HypervisorApi, HypervisorFactory,
    MemoryLimits, NetworkRef, PgpuRef, RemoteTaskStatus, SrRef, TaskRef, VbdRecord, VbdType,
    VdiRef, VgpuRef, VgpuTypeRecord, VgpuTypeRef, VifRef, VmRecord, VmRef,
};
use crate::config::AgentConfig;
use crate::error::{XenhostError, XenhostResult};
use crate::types::{HostSoftwareVersion, VmPowerState};

/// Final outcome of a simulated task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Failure(Vec<String>),
    /// Stays pending forever unless cancelled
    Never,
}

/// How the next submitted task behaves
#[derive(Debug, Clone)]
pub struct TaskScript {
    /// Polls answered with `Pending` before the outcome is reported
    pub pending_polls: u32,
    pub outcome: TaskOutcome,
    /// Whether a cancel request turns the task into `Cancelled`
    pub honor_cancel: bool,
}

impl Default for TaskScript {
    fn default() -> Self {
        Self {
            pending_polls: 0,
            outcome: TaskOutcome::Success,
            honor_cancel: true,
        }
    }
}

impl TaskScript {
    pub fn succeed_after(pending_polls: u32) -> Self {
        Self {
            pending_polls,
            ..Default::default()
        }
    }

    pub fn fail_after(pending_polls: u32, error_info: &[&str]) -> Self {
        Self {
            pending_polls,
            outcome: TaskOutcome::Failure(error_info.iter().map(|s| s.to_string()).collect()),
            honor_cancel: true,
        }
    }

    pub fn never() -> Self {
        Self {
            outcome: TaskOutcome::Never,
            ..Default::default()
        }
    }

    pub fn ignoring_cancel(mut self) -> Self {
        self.honor_cancel = false;
        self
    }
}

struct SimHost {
    uuid: String,
    software: HostSoftwareVersion,
    license: HashMap<String, String>,
    metrics: HostMetrics,
    dom0_memory_mib: u64,
    dom0_vifs: Vec<VifRef>,
}

struct SimVm {
    record: VmRecord,
    vbds: Vec<VbdRecord>,
    affinity: Option<HostRef>,
    memory: Option<MemoryLimits>,
    snapshots: BTreeMap<String, VmRef>,
    snapshot_of: Option<VmRef>,
}

struct SimVdi {
    uuid: String,
    sr: SrRef,
}

struct SimTask {
    operation: AsyncOperation,
    script: TaskScript,
    polls: u32,
    status: RemoteTaskStatus,
    result: Option<String>,
    cancel_requested: bool,
}

struct SimGpuGroup {
    name: String,
    host_uuid: String,
    pgpus: Vec<PgpuRef>,
    enabled: Vec<VgpuTypeRef>,
}

#[derive(Default)]
struct SimState {
    accepted_passwords: Option<Vec<String>>,
    login_attempts: Vec<String>,
    hosts: BTreeMap<HostRef, SimHost>,
    networks: BTreeMap<String, NetworkRef>,
    vms: BTreeMap<VmRef, SimVm>,
    vdis: BTreeMap<VdiRef, SimVdi>,
    srs: BTreeMap<SrRef, String>,
    tasks: BTreeMap<TaskRef, SimTask>,
    scripts: VecDeque<TaskScript>,
    default_script: TaskScript,
    gpu_groups: BTreeMap<GpuGroupRef, SimGpuGroup>,
    /// (remaining, max) per enabled type
    pgpus: BTreeMap<PgpuRef, BTreeMap<VgpuTypeRef, (u64, u64)>>,
    vgpu_types: BTreeMap<VgpuTypeRef, VgpuTypeRecord>,
    vgpus: Vec<(VgpuRef, VmRef, VgpuTypeRef)>,
    plugged_vifs: Vec<VifRef>,
    failures: HashSet<String>,
    total_polls: u32,
    cancel_requests: u32,
    destroyed_tasks: u32,
    counter: u64,
}

fn is_terminal(status: &RemoteTaskStatus) -> bool {
    matches!(
        status,
        RemoteTaskStatus::Success | RemoteTaskStatus::Failure { .. } | RemoteTaskStatus::Cancelled
    )
}

fn invalid(call: &str, handle: impl std::fmt::Display) -> XenhostError {
    XenhostError::remote(call, format!("HANDLE_INVALID {}", handle))
}

impl SimState {
    fn next_ref(&mut self, kind: &str) -> String {
        self.counter += 1;
        format!("OpaqueRef:{}-{}", kind, self.counter)
    }

    fn check(&self, call: &str, arg: &str) -> XenhostResult<()> {
        if self.failures.contains(call) || self.failures.contains(&format!("{}:{}", call, arg)) {
            return Err(XenhostError::remote(call, "INTERNAL_ERROR injected failure"));
        }
        Ok(())
    }

    fn host(&self, call: &str, host: &HostRef) -> XenhostResult<&SimHost> {
        self.hosts.get(host).ok_or_else(|| invalid(call, host))
    }

    fn vm(&self, call: &str, vm: &VmRef) -> XenhostResult<&SimVm> {
        self.vms.get(vm).ok_or_else(|| invalid(call, vm))
    }

    fn vm_mut(&mut self, call: &str, vm: &VmRef) -> XenhostResult<&mut SimVm> {
        self.vms.get_mut(vm).ok_or_else(|| invalid(call, vm))
    }

    fn validate(&self, operation: &AsyncOperation) -> XenhostResult<()> {
        let call = operation.label();
        match operation {
            AsyncOperation::StartVm { vm, host } | AsyncOperation::PoolMigrateVm { vm, host, .. } => {
                self.vm(call, vm)?;
                self.host(call, host)?;
            }
            AsyncOperation::CleanShutdownVm { vm } | AsyncOperation::HardShutdownVm { vm } => {
                self.vm(call, vm)?;
            }
            AsyncOperation::MigrateSend {
                vm,
                destination,
                vdi_map,
                ..
            } => {
                self.vm(call, vm)?;
                self.host(call, destination)?;
                for (vdi, sr) in vdi_map {
                    if !self.vdis.contains_key(vdi) {
                        return Err(invalid(call, vdi));
                    }
                    if !self.srs.contains_key(sr) {
                        return Err(invalid(call, sr));
                    }
                }
            }
            AsyncOperation::VdiPoolMigrate { vdi, sr, .. } => {
                if !self.vdis.contains_key(vdi) {
                    return Err(invalid(call, vdi));
                }
                if !self.srs.contains_key(sr) {
                    return Err(invalid(call, sr));
                }
            }
            AsyncOperation::RevertSnapshot { snapshot } => {
                let snap = self.vm(call, snapshot)?;
                if snap.snapshot_of.is_none() {
                    return Err(XenhostError::remote(call, "VM_IS_NOT_A_SNAPSHOT"));
                }
            }
        }
        Ok(())
    }

    /// Copy a VDI into `sr` and repoint every VBD at the copy
    fn relocate_vdi(&mut self, vdi: &VdiRef, sr: &SrRef) -> VdiRef {
        let copy = VdiRef::new(self.next_ref("vdi"));
        self.vdis.insert(
            copy.clone(),
            SimVdi {
                uuid: Uuid::new_v4().to_string(),
                sr: sr.clone(),
            },
        );
        self.vdis.remove(vdi);
        for vm in self.vms.values_mut() {
            for vbd in vm.vbds.iter_mut().filter(|v| v.vdi.as_ref() == Some(vdi)) {
                vbd.vdi = Some(copy.clone());
            }
        }
        copy
    }

    fn apply(&mut self, operation: &AsyncOperation) -> XenhostResult<Option<String>> {
        let call = operation.label();
        match operation {
            AsyncOperation::StartVm { vm, host } => {
                let host_uuid = self.host(call, host)?.uuid.clone();
                let sim = self.vm_mut(call, vm)?;
                sim.record.power_state = VmPowerState::Running;
                sim.record.resident_on = Some(host_uuid);
                Ok(None)
            }
            AsyncOperation::CleanShutdownVm { vm } | AsyncOperation::HardShutdownVm { vm } => {
                let sim = self.vm_mut(call, vm)?;
                sim.record.power_state = VmPowerState::Stopped;
                sim.record.resident_on = None;
                Ok(None)
            }
            AsyncOperation::PoolMigrateVm { vm, host, .. } => {
                let host_uuid = self.host(call, host)?.uuid.clone();
                self.vm_mut(call, vm)?.record.resident_on = Some(host_uuid);
                Ok(None)
            }
            AsyncOperation::MigrateSend {
                vm,
                destination,
                vdi_map,
                ..
            } => {
                let host_uuid = self.host(call, destination)?.uuid.clone();
                for (vdi, sr) in vdi_map {
                    self.relocate_vdi(vdi, sr);
                }
                self.vm_mut(call, vm)?.record.resident_on = Some(host_uuid);
                Ok(Some(vm.to_string()))
            }
            AsyncOperation::VdiPoolMigrate { vdi, sr, .. } => {
                let copy = self.relocate_vdi(vdi, sr);
                Ok(Some(copy.to_string()))
            }
            AsyncOperation::RevertSnapshot { snapshot } => {
                let parent = self
                    .vm(call, snapshot)?
                    .snapshot_of
                    .clone()
                    .ok_or_else(|| XenhostError::remote(call, "VM_IS_NOT_A_SNAPSHOT"))?;
                let sim = self.vm_mut(call, &parent)?;
                sim.record.power_state = VmPowerState::Stopped;
                sim.record.resident_on = None;
                Ok(None)
            }
        }
    }
}

/// Hypervisor API backed by in-memory state
#[derive(Default)]
pub struct SimulatedHypervisor {
    state: Mutex<SimState>,
}

impl SimulatedHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&self, uuid: &str, version: &str, hotfixes: &[&str]) -> HostRef {
        let mut state = self.state.lock();
        let host = HostRef::new(format!("OpaqueRef:host-{}", uuid));
        let vif = VifRef::new(state.next_ref("vif"));
        state.hosts.insert(
            host.clone(),
            SimHost {
                uuid: uuid.to_string(),
                software: HostSoftwareVersion {
                    product_version: version
                        .parse()
                        .unwrap_or(crate::types::ProductVersion::new(0, 0, 0)),
                    hotfixes: hotfixes.iter().map(|h| h.to_string()).collect(),
                },
                license: HashMap::new(),
                metrics: HostMetrics {
                    total_memory_mib: 65_536,
                    free_memory_mib: 61_440,
                    cpu_count: 16,
                    cpu_utilisation: 0.1,
                },
                dom0_memory_mib: 752,
                dom0_vifs: vec![vif],
            },
        );
        host
    }

    pub fn set_license_param(&self, host_uuid: &str, key: &str, value: &str) {
        let mut state = self.state.lock();
        if let Some(host) = state.hosts.values_mut().find(|h| h.uuid == host_uuid) {
            host.license.insert(key.to_string(), value.to_string());
        }
    }

    pub fn set_host_memory(&self, host_uuid: &str, total_mib: u64, free_mib: u64, dom0_mib: u64) {
        let mut state = self.state.lock();
        if let Some(host) = state.hosts.values_mut().find(|h| h.uuid == host_uuid) {
            host.metrics.total_memory_mib = total_mib;
            host.metrics.free_memory_mib = free_mib;
            host.dom0_memory_mib = dom0_mib;
        }
    }

    pub fn add_network(&self, name: &str) -> NetworkRef {
        let mut state = self.state.lock();
        let network = NetworkRef::new(state.next_ref("network"));
        state.networks.insert(name.to_string(), network.clone());
        network
    }

    pub fn add_sr(&self, uuid: &str) -> SrRef {
        let mut state = self.state.lock();
        let sr = SrRef::new(state.next_ref("sr"));
        state.srs.insert(sr.clone(), uuid.to_string());
        sr
    }

    pub fn add_vdi(&self, uuid: &str, sr: &SrRef) -> VdiRef {
        let mut state = self.state.lock();
        let vdi = VdiRef::new(state.next_ref("vdi"));
        state.vdis.insert(
            vdi.clone(),
            SimVdi {
                uuid: uuid.to_string(),
                sr: sr.clone(),
            },
        );
        vdi
    }

    fn insert_vm(&self, record: VmRecord, snapshot_of: Option<VmRef>) -> VmRef {
        let mut state = self.state.lock();
        let vm = VmRef::new(state.next_ref("vm"));
        state.vms.insert(
            vm.clone(),
            SimVm {
                record,
                vbds: Vec::new(),
                affinity: None,
                memory: None,
                snapshots: BTreeMap::new(),
                snapshot_of,
            },
        );
        vm
    }

    pub fn add_vm(&self, name: &str, resident_on: Option<&str>, power_state: VmPowerState) -> VmRef {
        self.insert_vm(
            VmRecord {
                uuid: Uuid::new_v4().to_string(),
                name_label: name.to_string(),
                power_state,
                resident_on: resident_on.map(str::to_string),
                is_control_domain: false,
                is_a_template: false,
                is_a_snapshot: false,
            },
            None,
        )
    }

    pub fn add_template(&self, name: &str) -> VmRef {
        self.insert_vm(
            VmRecord {
                uuid: Uuid::new_v4().to_string(),
                name_label: name.to_string(),
                power_state: VmPowerState::Stopped,
                resident_on: None,
                is_control_domain: false,
                is_a_template: true,
                is_a_snapshot: false,
            },
            None,
        )
    }

    pub fn add_control_domain(&self, host_uuid: &str) -> VmRef {
        self.insert_vm(
            VmRecord {
                uuid: Uuid::new_v4().to_string(),
                name_label: format!("Control domain on host: {}", host_uuid),
                power_state: VmPowerState::Running,
                resident_on: Some(host_uuid.to_string()),
                is_control_domain: true,
                is_a_template: false,
                is_a_snapshot: false,
            },
            None,
        )
    }

    pub fn add_snapshot(&self, vm: &VmRef, name: &str) -> VmRef {
        let snapshot = self.insert_vm(
            VmRecord {
                uuid: Uuid::new_v4().to_string(),
                name_label: name.to_string(),
                power_state: VmPowerState::Stopped,
                resident_on: None,
                is_control_domain: false,
                is_a_template: false,
                is_a_snapshot: true,
            },
            Some(vm.clone()),
        );
        let mut state = self.state.lock();
        if let Some(parent) = state.vms.get_mut(vm) {
            parent.snapshots.insert(name.to_string(), snapshot.clone());
        }
        snapshot
    }

    pub fn attach_disk(&self, vm: &VmRef, userdevice: u32, vdi: &VdiRef) {
        self.attach(vm, userdevice, VbdType::Disk, Some(vdi.clone()));
    }

    pub fn attach_cd(&self, vm: &VmRef, userdevice: u32) {
        self.attach(vm, userdevice, VbdType::Cd, None);
    }

    fn attach(&self, vm: &VmRef, userdevice: u32, vbd_type: VbdType, vdi: Option<VdiRef>) {
        let mut state = self.state.lock();
        if let Some(sim) = state.vms.get_mut(vm) {
            sim.vbds.push(VbdRecord {
                userdevice: userdevice.to_string(),
                vbd_type,
                vdi,
            });
        }
    }

    pub fn add_vgpu_type(&self, record: VgpuTypeRecord) -> VgpuTypeRef {
        let mut state = self.state.lock();
        let vgpu_type = VgpuTypeRef::new(state.next_ref("vgpu-type"));
        state.vgpu_types.insert(vgpu_type.clone(), record);
        vgpu_type
    }

    pub fn add_gpu_group(&self, name: &str, host_uuid: &str) -> GpuGroupRef {
        let mut state = self.state.lock();
        let group = GpuGroupRef::new(state.next_ref("gpu-group"));
        state.gpu_groups.insert(
            group.clone(),
            SimGpuGroup {
                name: name.to_string(),
                host_uuid: host_uuid.to_string(),
                pgpus: Vec::new(),
                enabled: Vec::new(),
            },
        );
        group
    }

    pub fn enable_vgpu_type(&self, group: &GpuGroupRef, vgpu_type: &VgpuTypeRef) {
        let mut state = self.state.lock();
        if let Some(sim) = state.gpu_groups.get_mut(group) {
            sim.enabled.push(vgpu_type.clone());
        }
    }

    /// Add a physical GPU with `(type, remaining, max)` capacities
    pub fn add_pgpu(&self, group: &GpuGroupRef, capacities: &[(VgpuTypeRef, u64, u64)]) -> PgpuRef {
        let mut state = self.state.lock();
        let pgpu = PgpuRef::new(state.next_ref("pgpu"));
        state.pgpus.insert(
            pgpu.clone(),
            capacities
                .iter()
                .map(|(t, remaining, max)| (t.clone(), (*remaining, *max)))
                .collect(),
        );
        if let Some(sim) = state.gpu_groups.get_mut(group) {
            sim.pgpus.push(pgpu.clone());
        }
        pgpu
    }

    /// Only these passwords will be accepted by `login`
    pub fn accept_passwords(&self, passwords: &[&str]) {
        self.state.lock().accepted_passwords =
            Some(passwords.iter().map(|p| p.to_string()).collect());
    }

    /// Script for the next submitted task; later submissions use the default
    pub fn push_task_script(&self, script: TaskScript) {
        self.state.lock().scripts.push_back(script);
    }

    pub fn set_default_task_script(&self, script: TaskScript) {
        self.state.lock().default_script = script;
    }

    /// Fail every `call`, or only calls on one handle with `call:handle`
    pub fn inject_failure(&self, call: &str) {
        self.state.lock().failures.insert(call.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn login_attempts(&self) -> Vec<String> {
        self.state.lock().login_attempts.clone()
    }

    pub fn task_polls(&self, task: &TaskRef) -> Option<u32> {
        self.state.lock().tasks.get(task).map(|t| t.polls)
    }

    pub fn total_polls(&self) -> u32 {
        self.state.lock().total_polls
    }

    pub fn cancel_requests(&self) -> u32 {
        self.state.lock().cancel_requests
    }

    pub fn destroyed_tasks(&self) -> u32 {
        self.state.lock().destroyed_tasks
    }

    pub fn vm(&self, vm: &VmRef) -> Option<VmRecord> {
        self.state.lock().vms.get(vm).map(|v| v.record.clone())
    }

    pub fn vm_affinity(&self, vm: &VmRef) -> Option<HostRef> {
        self.state.lock().vms.get(vm).and_then(|v| v.affinity.clone())
    }

    pub fn vm_memory(&self, vm: &VmRef) -> Option<MemoryLimits> {
        self.state.lock().vms.get(vm).and_then(|v| v.memory)
    }

    pub fn plugged_vifs(&self) -> Vec<VifRef> {
        self.state.lock().plugged_vifs.clone()
    }

    pub fn vgpu_count(&self, vm: &VmRef) -> usize {
        self.state
            .lock()
            .vgpus
            .iter()
            .filter(|(_, owner, _)| owner == vm)
            .count()
    }

    /// Storage repository a VDI currently lives on
    pub fn vdi_sr(&self, vdi: &VdiRef) -> Option<SrRef> {
        self.state.lock().vdis.get(vdi).map(|v| v.sr.clone())
    }
}

#[async_trait]
impl HypervisorApi for SimulatedHypervisor {
    async fn login(&self, host_ip: &str, username: &str, password: &str) -> XenhostResult<()> {
        let mut state = self.state.lock();
        state.check("session.login_with_password", host_ip)?;
        state.login_attempts.push(password.to_string());
        if let Some(accepted) = &state.accepted_passwords {
            if !accepted.iter().any(|p| p == password) {
                return Err(XenhostError::AuthenticationFailed {
                    host: host_ip.to_string(),
                });
            }
        }
        debug!("Simulated login for {}@{}", username, host_ip);
        Ok(())
    }

    async fn host_by_uuid(&self, uuid: &str) -> XenhostResult<HostRef> {
        let state = self.state.lock();
        state.check("host.get_by_uuid", uuid)?;
        state
            .hosts
            .iter()
            .find(|(_, h)| h.uuid == uuid)
            .map(|(r, _)| r.clone())
            .ok_or_else(|| XenhostError::remote("host.get_by_uuid", format!("UUID_INVALID {}", uuid)))
    }

    async fn host_uuid(&self, host: &HostRef) -> XenhostResult<String> {
        let state = self.state.lock();
        state.check("host.get_uuid", host.as_str())?;
        Ok(state.host("host.get_uuid", host)?.uuid.clone())
    }

    async fn host_software_version(&self, host: &HostRef) -> XenhostResult<HostSoftwareVersion> {
        let state = self.state.lock();
        state.check("host.get_software_version", host.as_str())?;
        Ok(state.host("host.get_software_version", host)?.software.clone())
    }

    async fn host_license_params(&self, host: &HostRef) -> XenhostResult<HashMap<String, String>> {
        let state = self.state.lock();
        state.check("host.get_license_params", host.as_str())?;
        Ok(state.host("host.get_license_params", host)?.license.clone())
    }

    async fn host_metrics(&self, host: &HostRef) -> XenhostResult<HostMetrics> {
        let state = self.state.lock();
        state.check("host.get_metrics", host.as_str())?;
        Ok(state.host("host.get_metrics", host)?.metrics.clone())
    }

    async fn dom0_memory_mib(&self, host: &HostRef) -> XenhostResult<u64> {
        let state = self.state.lock();
        state.check("host.get_control_domain_memory", host.as_str())?;
        Ok(state.host("host.get_control_domain_memory", host)?.dom0_memory_mib)
    }

    async fn network_by_name(&self, name_label: &str) -> XenhostResult<Option<NetworkRef>> {
        let state = self.state.lock();
        state.check("network.get_by_name_label", name_label)?;
        Ok(state.networks.get(name_label).cloned())
    }

    async fn vms_by_name(&self, name_label: &str) -> XenhostResult<Vec<VmRef>> {
        let state = self.state.lock();
        state.check("VM.get_by_name_label", name_label)?;
        Ok(state
            .vms
            .iter()
            .filter(|(_, v)| v.record.name_label == name_label)
            .map(|(r, _)| r.clone())
            .collect())
    }

    async fn vm_record(&self, vm: &VmRef) -> XenhostResult<VmRecord> {
        let state = self.state.lock();
        state.check("VM.get_record", vm.as_str())?;
        Ok(state.vm("VM.get_record", vm)?.record.clone())
    }

    async fn all_vm_records(&self) -> XenhostResult<Vec<(VmRef, VmRecord)>> {
        let state = self.state.lock();
        state.check("VM.get_all_records", "")?;
        Ok(state
            .vms
            .iter()
            .map(|(r, v)| (r.clone(), v.record.clone()))
            .collect())
    }

    async fn vm_vbds(&self, vm: &VmRef) -> XenhostResult<Vec<VbdRecord>> {
        let state = self.state.lock();
        state.check("VM.get_VBDs", vm.as_str())?;
        Ok(state.vm("VM.get_VBDs", vm)?.vbds.clone())
    }

    async fn vm_snapshot_by_name(&self, vm: &VmRef, name: &str) -> XenhostResult<Option<VmRef>> {
        let state = self.state.lock();
        state.check("VM.get_snapshots", vm.as_str())?;
        Ok(state.vm("VM.get_snapshots", vm)?.snapshots.get(name).cloned())
    }

    async fn set_vm_affinity(&self, vm: &VmRef, host: &HostRef) -> XenhostResult<()> {
        let mut state = self.state.lock();
        state.check("VM.set_affinity", vm.as_str())?;
        state.host("VM.set_affinity", host)?;
        state.vm_mut("VM.set_affinity", vm)?.affinity = Some(host.clone());
        Ok(())
    }

    async fn set_vm_memory_limits(&self, vm: &VmRef, limits: MemoryLimits) -> XenhostResult<()> {
        let mut state = self.state.lock();
        state.check("VM.set_memory_limits", vm.as_str())?;
        if !(limits.static_min <= limits.dynamic_min
            && limits.dynamic_min <= limits.dynamic_max
            && limits.dynamic_max <= limits.static_max)
        {
            return Err(XenhostError::remote(
                "VM.set_memory_limits",
                "MEMORY_CONSTRAINT_VIOLATION",
            ));
        }
        state.vm_mut("VM.set_memory_limits", vm)?.memory = Some(limits);
        Ok(())
    }

    async fn dom0_vifs(&self, host: &HostRef) -> XenhostResult<Vec<VifRef>> {
        let state = self.state.lock();
        state.check("VM.get_VIFs", host.as_str())?;
        Ok(state.host("VM.get_VIFs", host)?.dom0_vifs.clone())
    }

    async fn plug_vif(&self, vif: &VifRef) -> XenhostResult<()> {
        let mut state = self.state.lock();
        state.check("VIF.plug", vif.as_str())?;
        state.plugged_vifs.push(vif.clone());
        Ok(())
    }

    async fn vdi_by_uuid(&self, uuid: &str) -> XenhostResult<VdiRef> {
        let state = self.state.lock();
        state.check("VDI.get_by_uuid", uuid)?;
        state
            .vdis
            .iter()
            .find(|(_, v)| v.uuid == uuid)
            .map(|(r, _)| r.clone())
            .ok_or_else(|| XenhostError::remote("VDI.get_by_uuid", format!("UUID_INVALID {}", uuid)))
    }

    async fn vdi_uuid(&self, vdi: &VdiRef) -> XenhostResult<String> {
        let state = self.state.lock();
        state.check("VDI.get_uuid", vdi.as_str())?;
        state
            .vdis
            .get(vdi)
            .map(|v| v.uuid.clone())
            .ok_or_else(|| invalid("VDI.get_uuid", vdi))
    }

    async fn sr_by_uuid(&self, uuid: &str) -> XenhostResult<SrRef> {
        let state = self.state.lock();
        state.check("SR.get_by_uuid", uuid)?;
        state
            .srs
            .iter()
            .find(|(_, u)| u.as_str() == uuid)
            .map(|(r, _)| r.clone())
            .ok_or_else(|| XenhostError::remote("SR.get_by_uuid", format!("UUID_INVALID {}", uuid)))
    }

    async fn submit(&self, operation: &AsyncOperation) -> XenhostResult<TaskRef> {
        let mut state = self.state.lock();
        state.check(operation.label(), "")?;
        state.validate(operation)?;

        let script = state
            .scripts
            .pop_front()
            .unwrap_or_else(|| state.default_script.clone());
        let task = TaskRef::new(state.next_ref("task"));
        state.tasks.insert(
            task.clone(),
            SimTask {
                operation: operation.clone(),
                script,
                polls: 0,
                status: RemoteTaskStatus::Pending,
                result: None,
                cancel_requested: false,
            },
        );
        info!("Simulated task {} submitted for {}", task, operation.label());
        Ok(task)
    }

    async fn task_status(&self, task: &TaskRef) -> XenhostResult<RemoteTaskStatus> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.check("task.get_status", task.as_str())?;
        state.total_polls += 1;

        let sim = state
            .tasks
            .get_mut(task)
            .ok_or_else(|| invalid("task.get_status", task))?;
        sim.polls += 1;

        if is_terminal(&sim.status) {
            return Ok(sim.status.clone());
        }
        if sim.cancel_requested && sim.script.honor_cancel {
            sim.status = RemoteTaskStatus::Cancelled;
            return Ok(sim.status.clone());
        }
        if sim.polls <= sim.script.pending_polls {
            return Ok(RemoteTaskStatus::Pending);
        }

        let operation = match &sim.script.outcome {
            TaskOutcome::Never => return Ok(RemoteTaskStatus::Pending),
            TaskOutcome::Failure(error_info) => {
                sim.status = RemoteTaskStatus::Failure {
                    error_info: error_info.clone(),
                };
                return Ok(sim.status.clone());
            }
            TaskOutcome::Success => sim.operation.clone(),
        };

        let (status, result) = match state.apply(&operation) {
            Ok(result) => (RemoteTaskStatus::Success, result),
            Err(e) => (
                RemoteTaskStatus::Failure {
                    error_info: vec![e.to_string()],
                },
                None,
            ),
        };
        let sim = state
            .tasks
            .get_mut(task)
            .ok_or_else(|| invalid("task.get_status", task))?;
        sim.status = status.clone();
        sim.result = result;
        Ok(status)
    }

    async fn task_result(&self, task: &TaskRef) -> XenhostResult<Option<String>> {
        let state = self.state.lock();
        state.check("task.get_result", task.as_str())?;
        let sim = state
            .tasks
            .get(task)
            .ok_or_else(|| invalid("task.get_result", task))?;
        match sim.status {
            RemoteTaskStatus::Success => Ok(sim.result.clone()),
            _ => Err(XenhostError::remote(
                "task.get_result",
                format!("task {} has not succeeded", task),
            )),
        }
    }

    async fn cancel_task(&self, task: &TaskRef) -> XenhostResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.check("task.cancel", task.as_str())?;
        state.cancel_requests += 1;
        let sim = state
            .tasks
            .get_mut(task)
            .ok_or_else(|| invalid("task.cancel", task))?;
        sim.cancel_requested = true;
        Ok(())
    }

    async fn destroy_task(&self, task: &TaskRef) -> XenhostResult<()> {
        let mut state = self.state.lock();
        state.check("task.destroy", task.as_str())?;
        if state.tasks.remove(task).is_none() {
            return Err(invalid("task.destroy", task));
        }
        state.destroyed_tasks += 1;
        Ok(())
    }

    async fn gpu_groups(&self, host: &HostRef) -> XenhostResult<Vec<GpuGroupRef>> {
        let state = self.state.lock();
        state.check("host.get_PGPUs", host.as_str())?;
        let host_uuid = &state.host("host.get_PGPUs", host)?.uuid;
        Ok(state
            .gpu_groups
            .iter()
            .filter(|(_, g)| &g.host_uuid == host_uuid)
            .map(|(r, _)| r.clone())
            .collect())
    }

    async fn gpu_group_name(&self, group: &GpuGroupRef) -> XenhostResult<String> {
        let state = self.state.lock();
        state.check("GPU_group.get_name_label", group.as_str())?;
        state
            .gpu_groups
            .get(group)
            .map(|g| g.name.clone())
            .ok_or_else(|| invalid("GPU_group.get_name_label", group))
    }

    async fn gpu_group_pgpus(&self, group: &GpuGroupRef) -> XenhostResult<Vec<PgpuRef>> {
        let state = self.state.lock();
        state.check("GPU_group.get_PGPUs", group.as_str())?;
        state
            .gpu_groups
            .get(group)
            .map(|g| g.pgpus.clone())
            .ok_or_else(|| invalid("GPU_group.get_PGPUs", group))
    }

    async fn gpu_group_enabled_vgpu_types(
        &self,
        group: &GpuGroupRef,
    ) -> XenhostResult<Vec<VgpuTypeRef>> {
        let state = self.state.lock();
        state.check("GPU_group.get_enabled_VGPU_types", group.as_str())?;
        state
            .gpu_groups
            .get(group)
            .map(|g| g.enabled.clone())
            .ok_or_else(|| invalid("GPU_group.get_enabled_VGPU_types", group))
    }

    async fn vgpu_type_record(&self, vgpu_type: &VgpuTypeRef) -> XenhostResult<VgpuTypeRecord> {
        let state = self.state.lock();
        state.check("VGPU_type.get_record", vgpu_type.as_str())?;
        state
            .vgpu_types
            .get(vgpu_type)
            .cloned()
            .ok_or_else(|| invalid("VGPU_type.get_record", vgpu_type))
    }

    async fn pgpu_remaining_capacity(
        &self,
        pgpu: &PgpuRef,
        vgpu_type: &VgpuTypeRef,
    ) -> XenhostResult<u64> {
        let state = self.state.lock();
        state.check("PGPU.get_remaining_capacity", pgpu.as_str())?;
        let capacities = state
            .pgpus
            .get(pgpu)
            .ok_or_else(|| invalid("PGPU.get_remaining_capacity", pgpu))?;
        Ok(capacities.get(vgpu_type).map_or(0, |(remaining, _)| *remaining))
    }

    async fn pgpu_max_capacities(&self, pgpu: &PgpuRef) -> XenhostResult<HashMap<VgpuTypeRef, u64>> {
        let state = self.state.lock();
        state.check("PGPU.get_supported_VGPU_max_capacities", pgpu.as_str())?;
        let capacities = state
            .pgpus
            .get(pgpu)
            .ok_or_else(|| invalid("PGPU.get_supported_VGPU_max_capacities", pgpu))?;
        Ok(capacities
            .iter()
            .map(|(t, (_, max))| (t.clone(), *max))
            .collect())
    }

    async fn create_vgpu(
        &self,
        vm: &VmRef,
        group: &GpuGroupRef,
        vgpu_type: &VgpuTypeRef,
    ) -> XenhostResult<VgpuRef> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.check("VGPU.create", vm.as_str())?;
        state.vm("VGPU.create", vm)?;

        let sim_group = state
            .gpu_groups
            .get(group)
            .ok_or_else(|| invalid("VGPU.create", group))?;
        if !sim_group.enabled.contains(vgpu_type) {
            return Err(XenhostError::remote("VGPU.create", "VGPU_TYPE_NOT_ENABLED"));
        }

        let slot = sim_group.pgpus.iter().find_map(|p| {
            state
                .pgpus
                .get(p)
                .and_then(|caps| caps.get(vgpu_type))
                .filter(|(remaining, _)| *remaining > 0)
                .map(|_| p.clone())
        });
        let pgpu = slot.ok_or_else(|| XenhostError::remote("VGPU.create", "VGPU_TYPE_NOT_SUPPORTED"))?;
        if let Some((remaining, _)) = state
            .pgpus
            .get_mut(&pgpu)
            .and_then(|caps| caps.get_mut(vgpu_type))
        {
            *remaining -= 1;
        }

        let vgpu = VgpuRef::new(state.next_ref("vgpu"));
        state
            .vgpus
            .push((vgpu.clone(), vm.clone(), vgpu_type.clone()));
        Ok(vgpu)
    }
}

/// Demo environment built from the agent configuration
pub struct SimulatedHypervisorFactory;

impl SimulatedHypervisorFactory {
    fn demo_environment(config: &AgentConfig) -> SimulatedHypervisor {
        let host = &config.host;
        let sim = SimulatedHypervisor::new();
        sim.add_host(&host.host_uuid, "6.2.0", &["XS62ESP1"]);
        sim.add_control_domain(&host.host_uuid);
        sim.set_license_param(&host.host_uuid, "restrict_dmc", "false");

        let roles = &host.networks;
        for name in [
            &roles.public,
            &roles.private,
            &roles.guest,
            &roles.storage,
            &roles.storage2,
        ]
        .into_iter()
        .flatten()
        {
            sim.add_network(name);
        }

        let sr = sim.add_sr("demo-sr");
        let root = sim.add_vdi("demo-root-vdi", &sr);
        let vm = sim.add_vm("demo-vm", Some(&host.host_uuid), VmPowerState::Running);
        sim.attach_disk(&vm, 0, &root);
        sim.attach_cd(&vm, 3);
        sim.add_snapshot(&vm, "demo-snapshot");
        sim.add_vm("demo-stopped", None, VmPowerState::Stopped);

        let k100 = sim.add_vgpu_type(VgpuTypeRecord {
            model_name: "GRID K100".to_string(),
            framebuffer_size: 268_435_456,
            max_heads: 2,
            max_resolution_x: 1920,
            max_resolution_y: 1200,
        });
        let group = sim.add_gpu_group("Group of NVIDIA Corporation GK107GL [GRID K1] GPUs", &host.host_uuid);
        sim.enable_vgpu_type(&group, &k100);
        sim.add_pgpu(&group, &[(k100.clone(), 8, 8)]);
        sim.add_pgpu(&group, &[(k100, 8, 8)]);

        sim
    }
}

impl HypervisorFactory for SimulatedHypervisorFactory {
    fn create(&self, config: &AgentConfig) -> XenhostResult<Arc<dyn HypervisorApi>> {
        Ok(Arc::new(Self::demo_environment(config)))
    }

    fn backend_type(&self) -> &'static str {
        "simulated"
    }

    fn description(&self) -> &'static str {
        "In-memory hypervisor for testing and demos (no real host contacted)"
    }
}
