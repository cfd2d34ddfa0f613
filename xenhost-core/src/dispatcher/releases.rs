//! Handlers that newer releases layer over the baseline

use std::time::Duration;
use tracing::{debug, info};

use super::{
    unexpected, Answer, AnswerPayload, Command, CommandDispatcher, CommandKind, HandlerFuture,
    Predecessor,
};
use crate::capability::releases::{XENSERVER56, XENSERVER610, XENSERVER620SP1};
use crate::error::{XenhostError, XenhostResult};
use crate::gpu_capacity::GpuCapacitySnapshot;
use crate::hypervisor::{find_vm, GpuGroupRef, VgpuTypeRef};
use crate::remote::run_best_effort;
use crate::session::HostContext;
use crate::types::VolumeLocation;

/// Scripts installed by pre-5.6 bundles that 5.6 and later must not keep
pub const LEGACY_SCRIPTS: &[&str] = &[
    "/opt/xensource/bin/vhd-util",
    "/opt/xensource/bin/copy_vhd_to_secondarystorage.sh",
    "/opt/xensource/bin/copy_vhd_from_secondarystorage.sh",
    "/opt/xensource/bin/create_privatetemplate_from_snapshot.sh",
];

pub fn register(dispatcher: &mut CommandDispatcher) -> XenhostResult<()> {
    dispatcher.register(XENSERVER56, CommandKind::SetupHost, setup_host_removing_legacy)?;

    dispatcher.register(XENSERVER610, CommandKind::MigrateWithStorage, migrate_with_storage)?;
    dispatcher.register(XENSERVER610, CommandKind::MigrateVolume, migrate_volume)?;

    dispatcher.register(XENSERVER620SP1, CommandKind::GetGpuStats, get_gpu_stats)?;
    dispatcher.register(XENSERVER620SP1, CommandKind::CreateVgpu, create_vgpu)?;
    Ok(())
}

/// Fail with `Unsupported` when the host's resolved behavior lacks the feature
fn require(enabled: bool, ctx: &HostContext, command: &Command) -> XenhostResult<()> {
    if enabled {
        Ok(())
    } else {
        Err(XenhostError::Unsupported {
            feature: command.kind().to_string(),
            release: ctx.release.name.clone(),
        })
    }
}

fn gpu_details(snapshot: &GpuCapacitySnapshot) -> String {
    if snapshot.is_complete() {
        format!("GPU capacity for {} groups", snapshot.groups.len())
    } else {
        format!(
            "GPU capacity for {} groups, {} devices could not be queried",
            snapshot.groups.len(),
            snapshot.failures.len()
        )
    }
}

fn setup_host_removing_legacy<'a>(
    ctx: &'a HostContext,
    command: &'a Command,
    prev: Predecessor<'a>,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let answer = prev.run(ctx, command).await?;

        let username = &ctx.profile.credentials.username;
        let command_line = format!("rm -f {}", LEGACY_SCRIPTS.join(" "));
        if run_best_effort(ctx.remote.as_ref(), &ctx.profile.ip, username, &command_line).await {
            debug!("Removed {} legacy scripts", LEGACY_SCRIPTS.len());
        }
        Ok(answer)
    })
}

fn migrate_with_storage<'a>(
    ctx: &'a HostContext,
    command: &'a Command,
    _prev: Predecessor<'a>,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let Command::MigrateWithStorage(request) = command else {
            return Err(unexpected(command));
        };
        require(ctx.behavior.supports_storage_motion(), ctx, command)?;

        let outcome = ctx.orchestrator().migrate_with_storage(request, None).await?;
        Ok(Answer::with_payload(
            format!(
                "Migrated VM {} to {} with {} volumes",
                request.vm_name,
                request.destination_host_uuid,
                outcome.volumes.len()
            ),
            AnswerPayload::Migration(outcome),
        ))
    })
}

fn migrate_volume<'a>(
    ctx: &'a HostContext,
    command: &'a Command,
    _prev: Predecessor<'a>,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let Command::MigrateVolume {
            volume_path,
            target_pool_uuid,
            wait_secs,
        } = command
        else {
            return Err(unexpected(command));
        };
        require(ctx.behavior.supports_storage_motion(), ctx, command)?;

        let wait = wait_secs
            .map(Duration::from_secs)
            .unwrap_or(ctx.profile.tunables.migrate_wait);
        let path = ctx
            .orchestrator()
            .migrate_volume_live(volume_path, target_pool_uuid, wait)
            .await?;

        Ok(Answer::with_payload(
            format!("Volume {} moved to pool {}", volume_path, target_pool_uuid),
            AnswerPayload::Volume(VolumeLocation {
                volume_id: volume_path.clone(),
                path,
            }),
        ))
    })
}

fn get_gpu_stats<'a>(
    ctx: &'a HostContext,
    command: &'a Command,
    _prev: Predecessor<'a>,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        require(ctx.behavior.gpu_support, ctx, command)?;
        let snapshot = ctx.gpu_aggregator().collect(&ctx.host_ref).await?;
        Ok(Answer::with_payload(
            gpu_details(&snapshot),
            AnswerPayload::GpuCapacity(snapshot),
        ))
    })
}

async fn gpu_group_named(ctx: &HostContext, name: &str) -> XenhostResult<GpuGroupRef> {
    for group in ctx.api.gpu_groups(&ctx.host_ref).await? {
        if ctx.api.gpu_group_name(&group).await? == name {
            return Ok(group);
        }
    }
    Err(XenhostError::not_found(format!(
        "GPU group '{}' on host {}",
        name,
        ctx.host_uuid()
    )))
}

async fn enabled_vgpu_type(
    ctx: &HostContext,
    group: &GpuGroupRef,
    model_name: &str,
) -> XenhostResult<VgpuTypeRef> {
    for vgpu_type in ctx.api.gpu_group_enabled_vgpu_types(group).await? {
        if ctx.api.vgpu_type_record(&vgpu_type).await?.model_name == model_name {
            return Ok(vgpu_type);
        }
    }
    Err(XenhostError::not_found(format!(
        "vGPU type '{}' enabled in group {}",
        model_name, group
    )))
}

fn create_vgpu<'a>(
    ctx: &'a HostContext,
    command: &'a Command,
    _prev: Predecessor<'a>,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let Command::CreateVgpu {
            vm_name,
            gpu_group,
            vgpu_model,
        } = command
        else {
            return Err(unexpected(command));
        };
        require(ctx.behavior.gpu_support, ctx, command)?;

        let (vm, _) = find_vm(ctx.api.as_ref(), vm_name, None).await?;
        let group = gpu_group_named(ctx, gpu_group).await?;
        let vgpu_type = enabled_vgpu_type(ctx, &group, vgpu_model).await?;
        let vgpu = ctx.api.create_vgpu(&vm, &group, &vgpu_type).await?;
        info!("Created vGPU {} ({}) for VM {}", vgpu, vgpu_model, vm_name);

        // Capacity changed; report the fresh view
        let snapshot = ctx.gpu_aggregator().collect(&ctx.host_ref).await?;
        Ok(Answer::with_payload(
            format!("Created {} vGPU for VM {}", vgpu_model, vm_name),
            AnswerPayload::GpuCapacity(snapshot),
        ))
    })
}
