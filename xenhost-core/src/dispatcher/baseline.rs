//! Baseline command handlers, valid on every release

use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use super::{
    unexpected, Answer, AnswerPayload, Command, CommandDispatcher, CommandKind, HandlerFuture,
    HostCapacity, HostStats, Predecessor,
};
use crate::capability::ResolvedBehavior;
use crate::cluster_vm_cache::VmPlacement;
use crate::error::{XenhostError, XenhostResult};
use crate::hypervisor::{find_vm, AsyncOperation, MemoryLimits};
use crate::session::HostContext;
use crate::types::{MemorySpec, VmPowerState};

pub fn register(dispatcher: &mut CommandDispatcher) {
    dispatcher.register_baseline(CommandKind::SetupHost, setup_host);
    dispatcher.register_baseline(CommandKind::GetHostCapacity, get_host_capacity);
    dispatcher.register_baseline(CommandKind::GetHostStats, get_host_stats);
    dispatcher.register_baseline(CommandKind::StartVm, start_vm);
    dispatcher.register_baseline(CommandKind::StopVm, stop_vm);
    dispatcher.register_baseline(CommandKind::MigrateVm, migrate_vm);
    dispatcher.register_baseline(CommandKind::MigrateWithStorage, unsupported);
    dispatcher.register_baseline(CommandKind::MigrateVolume, unsupported);
    dispatcher.register_baseline(CommandKind::RevertToSnapshot, revert_to_snapshot);
    dispatcher.register_baseline(CommandKind::GetGpuStats, unsupported);
    dispatcher.register_baseline(CommandKind::CreateVgpu, unsupported);
    dispatcher.register_baseline(CommandKind::SyncClusterVmStates, sync_cluster_vm_states);
    dispatcher.register_baseline(CommandKind::GetVmState, get_vm_state);
}

/// One line of a patch bundle: `file,permissions,destination`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchEntry {
    pub file: String,
    pub permissions: String,
    pub destination: String,
}

pub fn parse_patch_bundle(content: &str) -> XenhostResult<Vec<PatchEntry>> {
    let mut entries = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let invalid = |message: String| XenhostError::InvalidInput {
            field: "patch".to_string(),
            message: format!("line {}: {}", index + 1, message),
        };

        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        let [file, permissions, destination] = parts[..] else {
            return Err(invalid(format!(
                "expected file,permissions,destination, got '{}'",
                line
            )));
        };
        if file.is_empty() || destination.is_empty() {
            return Err(invalid("empty file or destination".to_string()));
        }
        if permissions.is_empty() || !permissions.chars().all(|c| ('0'..='7').contains(&c)) {
            return Err(invalid(format!("invalid permissions '{}'", permissions)));
        }

        entries.push(PatchEntry {
            file: file.to_string(),
            permissions: permissions.to_string(),
            destination: destination.to_string(),
        });
    }
    Ok(entries)
}

/// Memory offered to the scheduler
///
/// `floor((total - max(dom0 observed, dom0 min) - hypervisor used) * factor)`
pub fn advertised_memory_mib(
    total_mib: u64,
    dom0_observed_mib: u64,
    dom0_min_mib: u64,
    hypervisor_used_mib: u64,
    virtualization_factor: f64,
) -> u64 {
    let available = total_mib
        .saturating_sub(dom0_observed_mib.max(dom0_min_mib))
        .saturating_sub(hypervisor_used_mib);
    (available as f64 * virtualization_factor).floor() as u64
}

/// Memory limits for a VM start
///
/// Without dynamic memory control the dynamic range cannot move, so the
/// static limits equal the requested dynamic ones.
pub fn memory_limits(
    behavior: &ResolvedBehavior,
    spec: &MemorySpec,
    dmc_enabled: bool,
) -> XenhostResult<MemoryLimits> {
    if spec.dynamic_min_mib > spec.dynamic_max_mib {
        return Err(XenhostError::InvalidInput {
            field: "memory".to_string(),
            message: format!(
                "dynamic min {} MiB exceeds dynamic max {} MiB",
                spec.dynamic_min_mib, spec.dynamic_max_mib
            ),
        });
    }

    if !dmc_enabled {
        return Ok(MemoryLimits {
            static_min: spec.dynamic_min_mib,
            dynamic_min: spec.dynamic_min_mib,
            dynamic_max: spec.dynamic_max_mib,
            static_max: spec.dynamic_max_mib,
        });
    }

    let os = behavior.guest_os_type(&spec.guest_os);
    Ok(MemoryLimits {
        static_min: behavior.static_min(&os, spec.dynamic_min_mib, spec.dynamic_max_mib),
        dynamic_min: spec.dynamic_min_mib,
        dynamic_max: spec.dynamic_max_mib,
        static_max: behavior.static_max(&os, spec.dynamic_min_mib, spec.dynamic_max_mib),
    })
}

async fn load_patch_bundle(path: &Path) -> XenhostResult<Vec<PatchEntry>> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        XenhostError::ConfigError(format!("Unable to read patch file {}: {}", path.display(), e))
    })?;
    parse_patch_bundle(&content)
}

pub(crate) fn unsupported<'a>(
    ctx: &'a HostContext,
    command: &'a Command,
    _prev: Predecessor<'a>,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        Err(XenhostError::Unsupported {
            feature: command.kind().to_string(),
            release: ctx.release.name.clone(),
        })
    })
}

fn setup_host<'a>(
    ctx: &'a HostContext,
    _command: &'a Command,
    _prev: Predecessor<'a>,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let patch = ctx.behavior.patch_path(&ctx.scripts_dir);
        let entries = load_patch_bundle(&patch).await?;
        let bundle_dir = patch.parent().unwrap_or_else(|| Path::new("."));
        let username = &ctx.profile.credentials.username;

        let mut installed = Vec::with_capacity(entries.len());
        for entry in &entries {
            let local = bundle_dir.join(&entry.file);
            if tokio::fs::metadata(&local).await.is_err() {
                return Err(XenhostError::ConfigError(format!(
                    "Patch file {} listed in {} does not exist",
                    local.display(),
                    patch.display()
                )));
            }
            ctx.remote
                .copy(
                    &ctx.profile.ip,
                    username,
                    &local,
                    &entry.destination,
                    &entry.permissions,
                )
                .await?;
            debug!("Installed {} into {}", entry.file, entry.destination);
            installed.push(format!("{}/{}", entry.destination, entry.file));
        }

        info!("Host set up with {} files from {}", installed.len(), patch.display());
        Ok(Answer::with_payload(
            format!("Installed {} files", installed.len()),
            AnswerPayload::SetupHost { installed },
        ))
    })
}

fn get_host_capacity<'a>(
    ctx: &'a HostContext,
    _command: &'a Command,
    _prev: Predecessor<'a>,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let metrics = ctx.api.host_metrics(&ctx.host_ref).await?;
        let dom0_observed = ctx.api.dom0_memory_mib(&ctx.host_ref).await?;
        let license = ctx.api.host_license_params(&ctx.host_ref).await?;
        let tunables = &ctx.profile.tunables;

        let capacity = HostCapacity {
            release: ctx.release.name.clone(),
            total_memory_mib: metrics.total_memory_mib,
            dom0_memory_mib: dom0_observed.max(tunables.dom0_min_memory_mib),
            hypervisor_memory_mib: tunables.hypervisor_memory_used_mib,
            advertised_memory_mib: advertised_memory_mib(
                metrics.total_memory_mib,
                dom0_observed,
                tunables.dom0_min_memory_mib,
                tunables.hypervisor_memory_used_mib,
                tunables.virtualization_factor,
            ),
            cpu_count: metrics.cpu_count,
            dmc_enabled: ctx.behavior.dmc_enabled(&license),
        };
        Ok(Answer::with_payload(
            format!("{} MiB available", capacity.advertised_memory_mib),
            AnswerPayload::HostCapacity(capacity),
        ))
    })
}

fn get_host_stats<'a>(
    ctx: &'a HostContext,
    _command: &'a Command,
    _prev: Predecessor<'a>,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let metrics = ctx.api.host_metrics(&ctx.host_ref).await?;
        Ok(Answer::with_payload(
            "Host statistics",
            AnswerPayload::HostStats(HostStats {
                total_memory_mib: metrics.total_memory_mib,
                free_memory_mib: metrics.free_memory_mib,
                cpu_count: metrics.cpu_count,
                cpu_utilisation: metrics.cpu_utilisation,
            }),
        ))
    })
}

fn start_vm<'a>(
    ctx: &'a HostContext,
    command: &'a Command,
    _prev: Predecessor<'a>,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let Command::StartVm { vm_name, memory } = command else {
            return Err(unexpected(command));
        };
        let cluster = ctx.cluster_id();
        let host_uuid = ctx.host_uuid();

        let (vm, record) = find_vm(ctx.api.as_ref(), vm_name, None).await?;
        if record.power_state == VmPowerState::Running {
            if record.resident_on.as_deref() == Some(host_uuid) {
                ctx.cache.put(cluster, vm_name, host_uuid, VmPowerState::Running);
                return Ok(Answer::ok(format!("VM {} is already running", vm_name)));
            }
            return Err(XenhostError::inconsistency(format!(
                "VM {} is running on another host {:?}",
                vm_name, record.resident_on
            )));
        }

        if let Some(spec) = memory {
            let license = ctx.api.host_license_params(&ctx.host_ref).await?;
            let limits = memory_limits(&ctx.behavior, spec, ctx.behavior.dmc_enabled(&license))?;
            ctx.api.set_vm_memory_limits(&vm, limits).await?;
        }

        ctx.cache.put(cluster, vm_name, host_uuid, VmPowerState::Starting);
        let operation = AsyncOperation::StartVm {
            vm,
            host: ctx.host_ref.clone(),
        };
        let tunables = &ctx.profile.tunables;
        if let Err(e) = ctx
            .waiter
            .run(&operation, tunables.task_poll_interval, tunables.task_wait, None)
            .await
        {
            if !matches!(e, XenhostError::Timeout { .. }) {
                ctx.cache.put(cluster, vm_name, host_uuid, VmPowerState::Stopped);
            }
            return Err(e);
        }

        ctx.cache.put(cluster, vm_name, host_uuid, VmPowerState::Running);
        Ok(Answer::with_payload(
            format!("Started VM {}", vm_name),
            AnswerPayload::VmState {
                host_uuid: Some(host_uuid.to_string()),
                state: VmPowerState::Running,
            },
        ))
    })
}

fn stop_vm<'a>(
    ctx: &'a HostContext,
    command: &'a Command,
    _prev: Predecessor<'a>,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let Command::StopVm { vm_name, force } = command else {
            return Err(unexpected(command));
        };
        let cluster = ctx.cluster_id();
        let host_uuid = ctx.host_uuid();

        let (vm, record) = find_vm(ctx.api.as_ref(), vm_name, None).await?;
        if record.power_state == VmPowerState::Stopped {
            ctx.cache.put(cluster, vm_name, host_uuid, VmPowerState::Stopped);
            return Ok(Answer::ok(format!("VM {} is already stopped", vm_name)));
        }

        ctx.cache.put(cluster, vm_name, host_uuid, VmPowerState::Stopping);
        let operation = if *force {
            AsyncOperation::HardShutdownVm { vm }
        } else {
            AsyncOperation::CleanShutdownVm { vm }
        };
        let tunables = &ctx.profile.tunables;
        if let Err(e) = ctx
            .waiter
            .run(&operation, tunables.task_poll_interval, tunables.task_wait, None)
            .await
        {
            if !matches!(e, XenhostError::Timeout { .. }) {
                ctx.cache.put(cluster, vm_name, host_uuid, record.power_state);
            }
            return Err(e);
        }

        ctx.cache.put(cluster, vm_name, host_uuid, VmPowerState::Stopped);
        Ok(Answer::with_payload(
            format!("Stopped VM {}", vm_name),
            AnswerPayload::VmState {
                host_uuid: None,
                state: VmPowerState::Stopped,
            },
        ))
    })
}

fn migrate_vm<'a>(
    ctx: &'a HostContext,
    command: &'a Command,
    _prev: Predecessor<'a>,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let Command::MigrateVm {
            vm_name,
            destination_host_uuid,
        } = command
        else {
            return Err(unexpected(command));
        };

        ctx.orchestrator()
            .migrate_within_pool(vm_name, destination_host_uuid)
            .await?;
        Ok(Answer::with_payload(
            format!("Migrated VM {} to {}", vm_name, destination_host_uuid),
            AnswerPayload::VmState {
                host_uuid: Some(destination_host_uuid.clone()),
                state: VmPowerState::Running,
            },
        ))
    })
}

fn revert_to_snapshot<'a>(
    ctx: &'a HostContext,
    command: &'a Command,
    _prev: Predecessor<'a>,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let Command::RevertToSnapshot {
            vm_name,
            snapshot_name,
        } = command
        else {
            return Err(unexpected(command));
        };

        let (vm, _) = find_vm(ctx.api.as_ref(), vm_name, None).await?;
        let snapshot = ctx
            .api
            .vm_snapshot_by_name(&vm, snapshot_name)
            .await?
            .ok_or_else(|| {
                XenhostError::not_found(format!("snapshot '{}' of VM {}", snapshot_name, vm_name))
            })?;

        let tunables = &ctx.profile.tunables;
        ctx.waiter
            .run(
                &AsyncOperation::RevertSnapshot { snapshot },
                tunables.task_poll_interval,
                tunables.task_wait,
                None,
            )
            .await?;

        let record = ctx.api.vm_record(&vm).await?;
        let host_uuid = record
            .resident_on
            .clone()
            .unwrap_or_else(|| ctx.host_uuid().to_string());
        ctx.cache
            .put(ctx.cluster_id(), vm_name, &host_uuid, record.power_state);

        Ok(Answer::with_payload(
            format!("Reverted VM {} to {}", vm_name, snapshot_name),
            AnswerPayload::VmState {
                host_uuid: record.resident_on,
                state: record.power_state,
            },
        ))
    })
}

fn sync_cluster_vm_states<'a>(
    ctx: &'a HostContext,
    _command: &'a Command,
    _prev: Predecessor<'a>,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let mut snapshot = HashMap::new();
        for (_, record) in ctx.api.all_vm_records().await? {
            if record.is_a_template || record.is_a_snapshot || record.is_control_domain {
                continue;
            }
            if record.power_state == VmPowerState::Stopped {
                continue;
            }
            if let Some(host_uuid) = record.resident_on {
                snapshot.insert(
                    record.name_label,
                    VmPlacement::new(host_uuid, record.power_state),
                );
            }
        }

        ctx.cache.resync(ctx.cluster_id(), snapshot.clone());
        Ok(Answer::with_payload(
            format!("{} VMs active in cluster {}", snapshot.len(), ctx.cluster_id()),
            AnswerPayload::ClusterStates(snapshot),
        ))
    })
}

fn get_vm_state<'a>(
    ctx: &'a HostContext,
    command: &'a Command,
    _prev: Predecessor<'a>,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let Command::GetVmState { vm_name } = command else {
            return Err(unexpected(command));
        };

        let (host_uuid, state) = match ctx.cache.get(ctx.cluster_id(), vm_name) {
            Some(placement) => (Some(placement.host_uuid), placement.state),
            None => (None, VmPowerState::Stopped),
        };
        Ok(Answer::with_payload(
            format!("VM {} is {}", vm_name, state),
            AnswerPayload::VmState { host_uuid, state },
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::standard_chain;

    #[test]
    fn test_parse_patch_bundle() {
        let content = "\
# comment
vmops, 0755, /etc/xapi.d/plugins

make_migratable.sh,0755,/opt/cloud/bin
";
        let entries = parse_patch_bundle(content).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].file, "vmops");
        assert_eq!(entries[0].permissions, "0755");
        assert_eq!(entries[1].destination, "/opt/cloud/bin");
    }

    #[test]
    fn test_parse_patch_bundle_rejects_bad_lines() {
        let err = parse_patch_bundle("vmops,0755").unwrap_err();
        assert!(err.to_string().contains("line 1"));
        assert!(parse_patch_bundle("vmops,rwx,/opt").is_err());
    }

    #[test]
    fn test_advertised_memory() {
        // dom0 below the minimum reservation uses the minimum
        assert_eq!(advertised_memory_mib(65_536, 752, 2_048, 128, 1.0), 63_360);
        // observed dom0 above the minimum wins, then the discount floors
        assert_eq!(advertised_memory_mib(16_384, 4_096, 2_048, 128, 0.5), 6_080);
        assert_eq!(advertised_memory_mib(1_024, 4_096, 2_048, 128, 1.0), 0);
    }

    #[test]
    fn test_memory_limits_without_dmc_pin_static_to_dynamic() {
        let behavior = standard_chain().unwrap().resolve_all("xenserver600").unwrap();
        let spec = MemorySpec {
            guest_os: "CentOS 6.0 (64-bit)".to_string(),
            dynamic_min_mib: 512,
            dynamic_max_mib: 2048,
        };
        let limits = memory_limits(&behavior, &spec, false).unwrap();
        assert_eq!(
            limits,
            MemoryLimits {
                static_min: 512,
                dynamic_min: 512,
                dynamic_max: 2048,
                static_max: 2048,
            }
        );

        let limits = memory_limits(&behavior, &spec, true).unwrap();
        assert_eq!(limits.dynamic_min, 512);
        // min(128 GiB, 4 * 512) = 2048
        assert_eq!(limits.static_max, 2048);
    }
}
