// Storage-aware migration against a simulated two-host pool

mod common;

use common::{TestEnv, HOST_UUID, OTHER_HOST_UUID, POOL_UUID};
use pretty_assertions::assert_eq;
use std::time::Duration;
use xenhost_core::hypervisor::{HypervisorApi, TaskScript, VmRef};
use xenhost_core::migration::{MigrationRequest, MigrationStage};
use xenhost_core::types::{DiskDescriptor, VmPowerState, VolumeType};
use xenhost_core::error::ErrorKind;
use xenhost_core::XenhostError;

struct MigratingVm {
    vm: VmRef,
    request: MigrationRequest,
}

fn disk(seq: u32, path: &str, volume_type: VolumeType) -> DiskDescriptor {
    DiskDescriptor {
        device_seq: seq,
        volume_id: format!("vol-{}", seq),
        path: path.to_string(),
        volume_type,
        target_pool_uuid: None,
    }
}

/// web-1 on host-a with a root disk, a data disk and a CD, all on sr-1
fn prepare(env: &TestEnv) -> MigratingVm {
    let sr1 = env.sim.add_sr("sr-1");
    env.sim.add_sr("sr-2");
    env.sim.add_sr("sr-3");
    let root = env.sim.add_vdi("vdi-root", &sr1);
    let data = env.sim.add_vdi("vdi-data", &sr1);

    let vm = env.sim.add_vm("web-1", Some(HOST_UUID), VmPowerState::Running);
    env.sim.attach_disk(&vm, 0, &root);
    env.sim.attach_disk(&vm, 1, &data);
    env.sim.attach_cd(&vm, 3);

    let mut data_disk = disk(1, "vdi-data", VolumeType::DataDisk);
    data_disk.target_pool_uuid = Some("sr-3".to_string());

    MigratingVm {
        vm,
        request: MigrationRequest {
            vm_name: "web-1".to_string(),
            destination_host_uuid: OTHER_HOST_UUID.to_string(),
            target_pool_uuid: "sr-2".to_string(),
            disks: vec![
                disk(0, "vdi-root", VolumeType::Root),
                data_disk,
                disk(3, "", VolumeType::Iso),
            ],
        },
    }
}

#[tokio::test(start_paused = true)]
async fn test_migrate_with_storage_relocates_disks() {
    let env = TestEnv::new("6.1.0", &[]);
    let migrating = prepare(&env);
    let ctx = env.connect().await;

    let outcome = ctx
        .orchestrator()
        .migrate_with_storage(&migrating.request, None)
        .await
        .unwrap();

    assert_eq!(outcome.stage, MigrationStage::Completed);
    assert_eq!(outcome.volumes.len(), 2);
    assert_eq!(outcome.volumes[0].volume_id, "vol-0");
    assert_eq!(outcome.volumes[1].volume_id, "vol-1");

    let root = env.sim.vdi_by_uuid(&outcome.volumes[0].path).await.unwrap();
    let data = env.sim.vdi_by_uuid(&outcome.volumes[1].path).await.unwrap();
    assert_eq!(env.sim.vdi_sr(&root), Some(env.sim.sr_by_uuid("sr-2").await.unwrap()));
    assert_eq!(env.sim.vdi_sr(&data), Some(env.sim.sr_by_uuid("sr-3").await.unwrap()));
    assert!(env.sim.vdi_by_uuid("vdi-root").await.is_err());

    let destination = env.sim.host_by_uuid(OTHER_HOST_UUID).await.unwrap();
    assert_eq!(env.sim.vm_affinity(&migrating.vm), Some(destination));
    // 6.1 hosts bring dom0 VIFs up on their own
    assert!(env.sim.plugged_vifs().is_empty());

    let placement = env.cache.get(POOL_UUID, "web-1").unwrap();
    assert_eq!(placement.host_uuid, OTHER_HOST_UUID);
    assert_eq!(placement.state, VmPowerState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_completion_plugs_dom0_vifs_on_older_releases() {
    let env = TestEnv::new("5.6.0", &[]);
    let migrating = prepare(&env);
    let ctx = env.connect().await;
    assert!(ctx.behavior.dom0_vif_plug);

    // Simulate a VM that already arrived on the destination
    let pool_migrate = xenhost_core::hypervisor::AsyncOperation::PoolMigrateVm {
        vm: migrating.vm.clone(),
        host: env.sim.host_by_uuid(OTHER_HOST_UUID).await.unwrap(),
        live: true,
    };
    ctx.waiter
        .run(&pool_migrate, Duration::from_millis(10), Duration::from_secs(5), None)
        .await
        .unwrap();

    let outcome = ctx
        .orchestrator()
        .complete_on_destination(&migrating.request)
        .await
        .unwrap();
    assert_eq!(outcome.stage, MigrationStage::Completed);
    assert_eq!(outcome.volumes[0].path, "vdi-root");
    assert_eq!(env.sim.plugged_vifs().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_vm_missing_on_destination_is_inconsistency() {
    let env = TestEnv::new("6.1.0", &[]);
    let migrating = prepare(&env);
    let ctx = env.connect().await;

    let err = ctx
        .orchestrator()
        .complete_on_destination(&migrating.request)
        .await
        .unwrap_err();
    match err {
        XenhostError::MigrationFailed { stage, source, .. } => {
            assert_eq!(stage, "TargetValidated");
            assert_eq!(source.kind(), ErrorKind::Inconsistency);
            assert!(source.to_string().contains("not found on destination"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_failed_task_restores_cache() {
    let env = TestEnv::new("6.1.0", &[]);
    let migrating = prepare(&env);
    let ctx = env.connect().await;
    env.sim
        .push_task_script(TaskScript::fail_after(1, &["SR_NOT_ENOUGH_SPACE"]));

    let err = ctx
        .orchestrator()
        .migrate_with_storage(&migrating.request, None)
        .await
        .unwrap_err();
    match err {
        XenhostError::MigrationFailed { stage, source, .. } => {
            assert_eq!(stage, "StorageMigrating");
            assert_eq!(source.kind(), ErrorKind::RemoteCall);
            assert!(source.to_string().contains("SR_NOT_ENOUGH_SPACE"));
        }
        other => panic!("unexpected {:?}", other),
    }

    let placement = env.cache.get(POOL_UUID, "web-1").unwrap();
    assert_eq!(placement.host_uuid, HOST_UUID);
    assert_eq!(placement.state, VmPowerState::Running);
    // Nothing moved
    assert!(env.sim.vdi_by_uuid("vdi-root").await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_migration_stays_migrating() {
    let env = TestEnv::new("6.1.0", &[]);
    let migrating = prepare(&env);
    let ctx = env.connect().await;
    env.sim.push_task_script(TaskScript::never().ignoring_cancel());

    let err = ctx
        .orchestrator()
        .migrate_with_storage(&migrating.request, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("outcome unknown"));
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(
        env.cache.get_state(POOL_UUID, "web-1"),
        VmPowerState::Migrating
    );
    assert_eq!(env.sim.cancel_requests(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_target_pool_fails_before_submitting() {
    let env = TestEnv::new("6.1.0", &[]);
    let mut migrating = prepare(&env);
    migrating.request.target_pool_uuid = "sr-missing".to_string();
    let ctx = env.connect().await;

    let err = ctx
        .orchestrator()
        .migrate_with_storage(&migrating.request, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        XenhostError::MigrationFailed { ref stage, .. } if stage == "SourceValidated"
    ));
    assert_eq!(env.sim.total_polls(), 0);
    assert_eq!(env.cache.get(POOL_UUID, "web-1"), None);
}

#[tokio::test(start_paused = true)]
async fn test_live_volume_migration_returns_new_path() {
    let env = TestEnv::new("6.1.0", &[]);
    prepare(&env);
    let ctx = env.connect().await;

    let path = ctx
        .orchestrator()
        .migrate_volume_live("vdi-data", "sr-2", Duration::from_secs(5))
        .await
        .unwrap();
    assert_ne!(path, "vdi-data");
    let moved = env.sim.vdi_by_uuid(&path).await.unwrap();
    assert_eq!(env.sim.vdi_sr(&moved), Some(env.sim.sr_by_uuid("sr-2").await.unwrap()));
}

#[tokio::test(start_paused = true)]
async fn test_migrate_within_pool_updates_cache() {
    let env = TestEnv::new("6.0.0", &[]);
    let migrating = prepare(&env);
    let ctx = env.connect().await;

    ctx.orchestrator()
        .migrate_within_pool("web-1", OTHER_HOST_UUID)
        .await
        .unwrap();

    let record = env.sim.vm(&migrating.vm).unwrap();
    assert_eq!(record.resident_on.as_deref(), Some(OTHER_HOST_UUID));
    assert_eq!(
        env.cache.get(POOL_UUID, "web-1").unwrap().host_uuid,
        OTHER_HOST_UUID
    );
}
