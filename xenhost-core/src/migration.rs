//! Storage-aware VM migration
//!
//! A migration with storage moves the VM's disks to the target pool's
//! storage and the VM to the destination host in one hypervisor task, then
//! finishes on the destination: the VM is validated there, the new disk
//! locations are reported back, affinity is pinned and the cluster cache is
//! updated. Failures are reported with the stage they happened in. Nothing
//! is retried or rolled back.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::capability::ResolvedBehavior;
use crate::cluster_vm_cache::ClusterVmStateCache;
use crate::config::HostProfile;
use crate::error::{XenhostError, XenhostResult};
use crate::hypervisor::{
    find_vm, AsyncOperation, HostRef, HypervisorApi, SrRef, VbdType, VdiRef, VmRef,
};
use crate::task_waiter::{CancellationFlag, TaskWaiter};
use crate::types::{DiskDescriptor, VmPowerState, VolumeLocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStage {
    Requested,
    SourceValidated,
    StorageMigrating,
    TargetValidated,
    Completed,
    Failed,
}

impl fmt::Display for MigrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationStage::Requested => "Requested",
            MigrationStage::SourceValidated => "SourceValidated",
            MigrationStage::StorageMigrating => "StorageMigrating",
            MigrationStage::TargetValidated => "TargetValidated",
            MigrationStage::Completed => "Completed",
            MigrationStage::Failed => "Failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub vm_name: String,
    pub destination_host_uuid: String,
    /// Default target storage pool for every disk
    pub target_pool_uuid: String,
    pub disks: Vec<DiskDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOutcome {
    pub stage: MigrationStage,
    pub volumes: Vec<VolumeLocation>,
}

/// Map each non-ISO disk to its new location by device sequence
///
/// `device_map` holds device sequence to new volume path for the migrated
/// VM. A disk without an entry means the VM on the destination does not
/// match the request.
pub fn relocate_volumes(
    disks: &[DiskDescriptor],
    device_map: &HashMap<u32, String>,
) -> XenhostResult<Vec<VolumeLocation>> {
    disks
        .iter()
        .filter(|disk| !disk.is_iso())
        .map(|disk| {
            device_map
                .get(&disk.device_seq)
                .map(|path| VolumeLocation {
                    volume_id: disk.volume_id.clone(),
                    path: path.clone(),
                })
                .ok_or_else(|| {
                    XenhostError::inconsistency(format!(
                        "no disk at device {} for volume {}",
                        disk.device_seq, disk.volume_id
                    ))
                })
        })
        .collect()
}

fn stage_error(subject: &str, stage: MigrationStage, err: XenhostError) -> XenhostError {
    match err {
        e @ XenhostError::MigrationFailed { .. } => e,
        e => XenhostError::MigrationFailed {
            subject: subject.to_string(),
            stage: stage.to_string(),
            source: Box::new(e),
        },
    }
}

pub struct MigrationOrchestrator {
    api: Arc<dyn HypervisorApi>,
    waiter: TaskWaiter,
    cache: Arc<ClusterVmStateCache>,
    cluster_id: String,
    dom0_vif_plug: bool,
    poll_interval: Duration,
    migrate_wait: Duration,
}

impl MigrationOrchestrator {
    pub fn new(
        api: Arc<dyn HypervisorApi>,
        cache: Arc<ClusterVmStateCache>,
        profile: &HostProfile,
        behavior: &ResolvedBehavior,
    ) -> Self {
        Self {
            waiter: TaskWaiter::new(api.clone()),
            api,
            cache,
            cluster_id: profile.cluster_id().to_string(),
            dom0_vif_plug: behavior.dom0_vif_plug,
            poll_interval: profile.tunables.task_poll_interval,
            migrate_wait: profile.tunables.migrate_wait,
        }
    }

    /// Move a VM and its disks to another host and storage pool
    pub async fn migrate_with_storage(
        &self,
        request: &MigrationRequest,
        cancel: Option<&CancellationFlag>,
    ) -> XenhostResult<MigrationOutcome> {
        let subject = request.vm_name.as_str();
        info!(
            vm = subject,
            destination = %request.destination_host_uuid,
            disks = request.disks.len(),
            "Migrating VM with storage"
        );

        let (vm, record) = find_vm(self.api.as_ref(), subject, None)
            .await
            .map_err(|e| stage_error(subject, MigrationStage::SourceValidated, e))?;
        let source_host = record.resident_on.clone().unwrap_or_default();

        let (destination, vdi_map) = self
            .storage_plan(request)
            .await
            .map_err(|e| stage_error(subject, MigrationStage::SourceValidated, e))?;

        self.cache
            .put(&self.cluster_id, subject, &source_host, VmPowerState::Migrating);

        let operation = AsyncOperation::MigrateSend {
            vm,
            destination,
            vdi_map,
            live: true,
        };
        if let Err(e) = self
            .waiter
            .run(&operation, self.poll_interval, self.migrate_wait, cancel)
            .await
        {
            // The remote outcome of a timed out task is unknown; keep Migrating
            if !matches!(e, XenhostError::Timeout { .. }) {
                self.cache
                    .put(&self.cluster_id, subject, &source_host, record.power_state);
            }
            return Err(stage_error(subject, MigrationStage::StorageMigrating, e));
        }

        self.complete_on_destination(request).await
    }

    async fn storage_plan(
        &self,
        request: &MigrationRequest,
    ) -> XenhostResult<(HostRef, Vec<(VdiRef, SrRef)>)> {
        let destination = self.api.host_by_uuid(&request.destination_host_uuid).await?;

        let mut vdi_map = Vec::new();
        for disk in request.disks.iter().filter(|d| !d.is_iso()) {
            let vdi = self.api.vdi_by_uuid(&disk.path).await?;
            let pool = disk
                .target_pool_uuid
                .as_deref()
                .unwrap_or(&request.target_pool_uuid);
            let sr = self.api.sr_by_uuid(pool).await?;
            debug!("Disk {} ({}) -> pool {}", disk.device_seq, disk.path, pool);
            vdi_map.push((vdi, sr));
        }
        Ok((destination, vdi_map))
    }

    /// Finish a migration on the destination host
    pub async fn complete_on_destination(
        &self,
        request: &MigrationRequest,
    ) -> XenhostResult<MigrationOutcome> {
        let subject = request.vm_name.as_str();
        let fail = |stage, e| stage_error(subject, stage, e);

        let destination = self
            .api
            .host_by_uuid(&request.destination_host_uuid)
            .await
            .map_err(|e| fail(MigrationStage::TargetValidated, e))?;
        let (vm, _) = find_vm(
            self.api.as_ref(),
            subject,
            Some(&request.destination_host_uuid),
        )
        .await
        .map_err(|e| {
            fail(
                MigrationStage::TargetValidated,
                XenhostError::inconsistency(format!(
                    "migrated VM not found on destination: {}",
                    e
                )),
            )
        })?;

        let volumes = self
            .updated_volume_paths(&vm, &request.disks)
            .await
            .map_err(|e| fail(MigrationStage::TargetValidated, e))?;

        self.api
            .set_vm_affinity(&vm, &destination)
            .await
            .map_err(|e| fail(MigrationStage::TargetValidated, e))?;

        if self.dom0_vif_plug {
            let vifs = self
                .api
                .dom0_vifs(&destination)
                .await
                .map_err(|e| fail(MigrationStage::TargetValidated, e))?;
            for vif in vifs {
                self.api
                    .plug_vif(&vif)
                    .await
                    .map_err(|e| fail(MigrationStage::TargetValidated, e))?;
            }
        }

        self.cache.put(
            &self.cluster_id,
            subject,
            &request.destination_host_uuid,
            VmPowerState::Running,
        );
        info!(vm = subject, "Migration completed on {}", request.destination_host_uuid);

        Ok(MigrationOutcome {
            stage: MigrationStage::Completed,
            volumes,
        })
    }

    /// New volume paths of the migrated VM's disks, keyed by the request
    pub async fn updated_volume_paths(
        &self,
        vm: &VmRef,
        disks: &[DiskDescriptor],
    ) -> XenhostResult<Vec<VolumeLocation>> {
        let mut device_map = HashMap::new();
        for vbd in self.api.vm_vbds(vm).await? {
            if vbd.vbd_type != VbdType::Disk {
                continue;
            }
            let Some(vdi) = vbd.vdi else { continue };
            match vbd.userdevice.parse::<u32>() {
                Ok(device) => {
                    device_map.insert(device, self.api.vdi_uuid(&vdi).await?);
                }
                Err(_) => warn!("Ignoring VBD with userdevice '{}'", vbd.userdevice),
            }
        }
        relocate_volumes(disks, &device_map)
    }

    /// Live-move one volume to another storage pool, returning its new path
    pub async fn migrate_volume_live(
        &self,
        volume_path: &str,
        target_pool_uuid: &str,
        wait: Duration,
    ) -> XenhostResult<String> {
        let fail = |stage, e| stage_error(volume_path, stage, e);

        let vdi = self
            .api
            .vdi_by_uuid(volume_path)
            .await
            .map_err(|e| fail(MigrationStage::SourceValidated, e))?;
        let sr = self
            .api
            .sr_by_uuid(target_pool_uuid)
            .await
            .map_err(|e| fail(MigrationStage::SourceValidated, e))?;

        let mut options = BTreeMap::new();
        options.insert("live".to_string(), "true".to_string());
        let operation = AsyncOperation::VdiPoolMigrate { vdi, sr, options };

        let result = self
            .waiter
            .run(&operation, self.poll_interval, wait, None)
            .await
            .map_err(|e| fail(MigrationStage::StorageMigrating, e))?;
        let new_vdi = result.ok_or_else(|| {
            fail(
                MigrationStage::TargetValidated,
                XenhostError::inconsistency("VDI.pool_migrate returned no VDI"),
            )
        })?;

        let path = self
            .api
            .vdi_uuid(&VdiRef::new(new_vdi))
            .await
            .map_err(|e| fail(MigrationStage::TargetValidated, e))?;
        info!("Volume {} moved to pool {} as {}", volume_path, target_pool_uuid, path);
        Ok(path)
    }

    /// Live-migrate a VM between hosts of the same pool, storage unchanged
    pub async fn migrate_within_pool(
        &self,
        vm_name: &str,
        destination_host_uuid: &str,
    ) -> XenhostResult<()> {
        let fail = |stage, e| stage_error(vm_name, stage, e);

        let (vm, record) = find_vm(self.api.as_ref(), vm_name, None)
            .await
            .map_err(|e| fail(MigrationStage::SourceValidated, e))?;
        let host = self
            .api
            .host_by_uuid(destination_host_uuid)
            .await
            .map_err(|e| fail(MigrationStage::SourceValidated, e))?;

        let source_host = record.resident_on.unwrap_or_default();
        self.cache
            .put(&self.cluster_id, vm_name, &source_host, VmPowerState::Migrating);

        let operation = AsyncOperation::PoolMigrateVm {
            vm,
            host,
            live: true,
        };
        if let Err(e) = self
            .waiter
            .run(&operation, self.poll_interval, self.migrate_wait, None)
            .await
        {
            if !matches!(e, XenhostError::Timeout { .. }) {
                self.cache
                    .put(&self.cluster_id, vm_name, &source_host, record.power_state);
            }
            return Err(fail(MigrationStage::StorageMigrating, e));
        }

        self.cache.put(
            &self.cluster_id,
            vm_name,
            destination_host_uuid,
            VmPowerState::Running,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VolumeType;

    fn disk(seq: u32, volume_type: VolumeType) -> DiskDescriptor {
        DiskDescriptor {
            device_seq: seq,
            volume_id: format!("vol-{}", seq),
            path: format!("vdi-{}", seq),
            volume_type,
            target_pool_uuid: None,
        }
    }

    #[test]
    fn test_relocate_skips_iso() {
        let disks = vec![disk(0, VolumeType::Root), disk(3, VolumeType::Iso)];
        let mut map = HashMap::new();
        map.insert(0, "new-root".to_string());

        let volumes = relocate_volumes(&disks, &map).unwrap();
        assert_eq!(
            volumes,
            vec![VolumeLocation {
                volume_id: "vol-0".to_string(),
                path: "new-root".to_string()
            }]
        );
    }

    #[test]
    fn test_relocate_missing_device_is_inconsistency() {
        let disks = vec![disk(0, VolumeType::Root), disk(1, VolumeType::DataDisk)];
        let mut map = HashMap::new();
        map.insert(0, "new-root".to_string());

        let err = relocate_volumes(&disks, &map).unwrap_err();
        assert!(matches!(err, XenhostError::Inconsistency { .. }));
    }

    #[test]
    fn test_stage_error_keeps_first_stage() {
        let inner = stage_error(
            "vm",
            MigrationStage::TargetValidated,
            XenhostError::not_found("VM 'vm'"),
        );
        let outer = stage_error("vm", MigrationStage::StorageMigrating, inner);
        match outer {
            XenhostError::MigrationFailed { stage, .. } => assert_eq!(stage, "TargetValidated"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
