//! Command and answer envelope

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::cluster_vm_cache::VmPlacement;
use crate::error::{ErrorKind, XenhostError};
use crate::gpu_capacity::GpuCapacitySnapshot;
use crate::migration::{MigrationOutcome, MigrationRequest};
use crate::types::{MemorySpec, VmPowerState, VolumeLocation};

/// Inbound unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    SetupHost,
    GetHostCapacity,
    GetHostStats,
    StartVm {
        vm_name: String,
        #[serde(default)]
        memory: Option<MemorySpec>,
    },
    StopVm {
        vm_name: String,
        #[serde(default)]
        force: bool,
    },
    MigrateVm {
        vm_name: String,
        destination_host_uuid: String,
    },
    MigrateWithStorage(MigrationRequest),
    MigrateVolume {
        volume_path: String,
        target_pool_uuid: String,
        /// Overrides the host's migrate wait
        #[serde(default)]
        wait_secs: Option<u64>,
    },
    RevertToSnapshot {
        vm_name: String,
        snapshot_name: String,
    },
    GetGpuStats,
    CreateVgpu {
        vm_name: String,
        gpu_group: String,
        vgpu_model: String,
    },
    SyncClusterVmStates,
    GetVmState {
        vm_name: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CommandKind {
    SetupHost,
    GetHostCapacity,
    GetHostStats,
    StartVm,
    StopVm,
    MigrateVm,
    MigrateWithStorage,
    MigrateVolume,
    RevertToSnapshot,
    GetGpuStats,
    CreateVgpu,
    SyncClusterVmStates,
    GetVmState,
}

impl CommandKind {
    pub const ALL: [CommandKind; 13] = [
        CommandKind::SetupHost,
        CommandKind::GetHostCapacity,
        CommandKind::GetHostStats,
        CommandKind::StartVm,
        CommandKind::StopVm,
        CommandKind::MigrateVm,
        CommandKind::MigrateWithStorage,
        CommandKind::MigrateVolume,
        CommandKind::RevertToSnapshot,
        CommandKind::GetGpuStats,
        CommandKind::CreateVgpu,
        CommandKind::SyncClusterVmStates,
        CommandKind::GetVmState,
    ];
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::SetupHost => CommandKind::SetupHost,
            Command::GetHostCapacity => CommandKind::GetHostCapacity,
            Command::GetHostStats => CommandKind::GetHostStats,
            Command::StartVm { .. } => CommandKind::StartVm,
            Command::StopVm { .. } => CommandKind::StopVm,
            Command::MigrateVm { .. } => CommandKind::MigrateVm,
            Command::MigrateWithStorage(_) => CommandKind::MigrateWithStorage,
            Command::MigrateVolume { .. } => CommandKind::MigrateVolume,
            Command::RevertToSnapshot { .. } => CommandKind::RevertToSnapshot,
            Command::GetGpuStats => CommandKind::GetGpuStats,
            Command::CreateVgpu { .. } => CommandKind::CreateVgpu,
            Command::SyncClusterVmStates => CommandKind::SyncClusterVmStates,
            Command::GetVmState { .. } => CommandKind::GetVmState,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostCapacity {
    pub release: String,
    pub total_memory_mib: u64,
    pub dom0_memory_mib: u64,
    pub hypervisor_memory_mib: u64,
    /// Memory offered to the scheduler after reservations and discount
    pub advertised_memory_mib: u64,
    pub cpu_count: u32,
    pub dmc_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostStats {
    pub total_memory_mib: u64,
    pub free_memory_mib: u64,
    pub cpu_count: u32,
    pub cpu_utilisation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AnswerPayload {
    SetupHost { installed: Vec<String> },
    HostCapacity(HostCapacity),
    HostStats(HostStats),
    VmState {
        host_uuid: Option<String>,
        state: VmPowerState,
    },
    Migration(MigrationOutcome),
    Volume(VolumeLocation),
    GpuCapacity(GpuCapacitySnapshot),
    ClusterStates(HashMap<String, VmPlacement>),
}

/// Outbound result of a command; failures always carry a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub success: bool,
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<AnswerPayload>,
}

impl Answer {
    pub fn ok(details: impl Into<String>) -> Self {
        Self {
            success: true,
            details: details.into(),
            error_kind: None,
            payload: None,
        }
    }

    pub fn with_payload(details: impl Into<String>, payload: AnswerPayload) -> Self {
        Self {
            payload: Some(payload),
            ..Self::ok(details)
        }
    }

    pub fn failed(error: &XenhostError) -> Self {
        let kind = match error.kind() {
            ErrorKind::Configuration => "configuration",
            ErrorKind::RemoteCall => "remote_call",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Inconsistency => "inconsistency",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Internal => "internal",
        };
        Self {
            success: false,
            details: error.to_string(),
            error_kind: Some(kind.to_string()),
            payload: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_json_shape() {
        let cmd: Command =
            serde_json::from_str(r#"{"kind":"stop_vm","vm_name":"web-1"}"#).unwrap();
        assert_eq!(
            cmd,
            Command::StopVm {
                vm_name: "web-1".to_string(),
                force: false
            }
        );
        assert_eq!(cmd.kind(), CommandKind::StopVm);
    }

    #[test]
    fn test_migrate_with_storage_is_flattened() {
        let json = r#"{
            "kind": "migrate_with_storage",
            "vm_name": "web-1",
            "destination_host_uuid": "h2",
            "target_pool_uuid": "sr-2",
            "disks": [{"device_seq": 0, "volume_id": "v0", "path": "vdi-0", "volume_type": "Root"}]
        }"#;
        let cmd: Command = serde_json::from_str(json).unwrap();
        match cmd {
            Command::MigrateWithStorage(request) => assert_eq!(request.disks.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_failed_answer_carries_kind() {
        let answer = Answer::failed(&XenhostError::Unsupported {
            feature: "GetGpuStats".to_string(),
            release: "xenserver600".to_string(),
        });
        assert!(!answer.success);
        assert_eq!(answer.error_kind.as_deref(), Some("unsupported"));
        assert!(answer.details.contains("xenserver600"));
    }

    #[test]
    fn test_failed_migration_answer_uses_cause_kind() {
        let answer = Answer::failed(&XenhostError::MigrationFailed {
            subject: "web-1".to_string(),
            stage: "TargetValidated".to_string(),
            source: Box::new(XenhostError::inconsistency(
                "migrated VM not found on destination",
            )),
        });
        assert_eq!(answer.error_kind.as_deref(), Some("inconsistency"));
        assert!(answer.details.contains("TargetValidated"));
    }
}
