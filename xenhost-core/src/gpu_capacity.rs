//! vGPU capacity aggregation
//!
//! Physical GPUs report remaining and maximum capacity per vGPU model. The
//! management server wants one figure per (GPU group, model), so device
//! reports are summed. Descriptive metadata comes from the first device seen
//! for a model and is never merged again.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::XenhostResult;
use crate::hypervisor::{GpuGroupRef, HostRef, HypervisorApi, PgpuRef, VgpuTypeRecord, VgpuTypeRef};

/// Capacity of one vGPU model, in concurrent VM slots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VgpuTypeCapacity {
    pub model_name: String,
    pub framebuffer_size: u64,
    pub max_heads: u64,
    pub max_resolution_x: u64,
    pub max_resolution_y: u64,
    pub remaining_capacity: u64,
    pub max_capacity: u64,
}

impl VgpuTypeCapacity {
    pub fn from_record(record: &VgpuTypeRecord, remaining: u64, max: u64) -> Self {
        Self {
            model_name: record.model_name.clone(),
            framebuffer_size: record.framebuffer_size,
            max_heads: record.max_heads,
            max_resolution_x: record.max_resolution_x,
            max_resolution_y: record.max_resolution_y,
            remaining_capacity: remaining,
            max_capacity: max,
        }
    }
}

/// group name -> model name -> capacity
pub type GpuCapacityMap = BTreeMap<String, BTreeMap<String, VgpuTypeCapacity>>;

/// Capacity of every enabled model on one physical GPU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapacityReport {
    pub group: String,
    pub device: String,
    pub models: Vec<VgpuTypeCapacity>,
}

/// Sum device reports into per-group, per-model totals
pub fn aggregate<'a, I>(reports: I) -> GpuCapacityMap
where
    I: IntoIterator<Item = &'a DeviceCapacityReport>,
{
    let mut groups = GpuCapacityMap::new();
    for report in reports {
        let models = groups.entry(report.group.clone()).or_default();
        for capacity in &report.models {
            models
                .entry(capacity.model_name.clone())
                .and_modify(|entry| {
                    entry.remaining_capacity = entry
                        .remaining_capacity
                        .saturating_add(capacity.remaining_capacity);
                    entry.max_capacity = entry.max_capacity.saturating_add(capacity.max_capacity);
                })
                .or_insert_with(|| capacity.clone());
        }
    }
    groups
}

/// A device query that failed during collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceQueryFailure {
    pub group: String,
    pub device: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuCapacitySnapshot {
    pub groups: GpuCapacityMap,
    pub failures: Vec<DeviceQueryFailure>,
}

impl GpuCapacitySnapshot {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Collects capacity reports from a host through the hypervisor API
pub struct GpuCapacityAggregator {
    api: Arc<dyn HypervisorApi>,
}

impl GpuCapacityAggregator {
    pub fn new(api: Arc<dyn HypervisorApi>) -> Self {
        Self { api }
    }

    /// Walk groups, devices and enabled models on `host`
    ///
    /// Listing the host's groups is the only call whose failure aborts the
    /// collection. A failing group or device is recorded in the snapshot and
    /// the walk continues with its siblings.
    pub async fn collect(&self, host: &HostRef) -> XenhostResult<GpuCapacitySnapshot> {
        let mut reports = Vec::new();
        let mut failures = Vec::new();
        let mut empty_groups = Vec::new();

        for group in self.api.gpu_groups(host).await? {
            let name = match self.api.gpu_group_name(&group).await {
                Ok(name) => name,
                Err(e) => {
                    warn!("Skipping GPU group {}: {}", group, e);
                    failures.push(DeviceQueryFailure {
                        group: group.to_string(),
                        device: String::new(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            match self.group_reports(&group, &name, &mut failures).await {
                Ok(group_reports) if group_reports.iter().all(|r| r.models.is_empty()) => {
                    empty_groups.push(name);
                    reports.extend(group_reports);
                }
                Ok(group_reports) => reports.extend(group_reports),
                Err(e) => {
                    warn!("Failed to query GPU group '{}': {}", name, e);
                    failures.push(DeviceQueryFailure {
                        group: name,
                        device: String::new(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let mut groups = aggregate(&reports);
        for name in empty_groups {
            groups.entry(name).or_default();
        }

        debug!(
            groups = groups.len(),
            failures = failures.len(),
            "Collected GPU capacity"
        );
        Ok(GpuCapacitySnapshot { groups, failures })
    }

    async fn group_reports(
        &self,
        group: &GpuGroupRef,
        name: &str,
        failures: &mut Vec<DeviceQueryFailure>,
    ) -> XenhostResult<Vec<DeviceCapacityReport>> {
        let pgpus = self.api.gpu_group_pgpus(group).await?;
        let enabled = self.api.gpu_group_enabled_vgpu_types(group).await?;

        let mut records = Vec::with_capacity(enabled.len());
        for vgpu_type in &enabled {
            records.push((vgpu_type.clone(), self.api.vgpu_type_record(vgpu_type).await?));
        }

        let mut reports = Vec::with_capacity(pgpus.len());
        for pgpu in &pgpus {
            match self.device_report(pgpu, name, &records).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    warn!("GPU {} in group '{}' did not report capacity: {}", pgpu, name, e);
                    failures.push(DeviceQueryFailure {
                        group: name.to_string(),
                        device: pgpu.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(reports)
    }

    async fn device_report(
        &self,
        pgpu: &PgpuRef,
        group: &str,
        records: &[(VgpuTypeRef, VgpuTypeRecord)],
    ) -> XenhostResult<DeviceCapacityReport> {
        let max_capacities = self.api.pgpu_max_capacities(pgpu).await?;
        let mut models = Vec::new();
        for (vgpu_type, record) in records {
            // Models this device does not support contribute nothing
            let Some(max) = max_capacities.get(vgpu_type).copied() else {
                continue;
            };
            let remaining = self.api.pgpu_remaining_capacity(pgpu, vgpu_type).await?;
            models.push(VgpuTypeCapacity::from_record(record, remaining, max));
        }
        Ok(DeviceCapacityReport {
            group: group.to_string(),
            device: pgpu.to_string(),
            models,
        })
    }
}
