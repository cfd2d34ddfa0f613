//! Cluster-wide cache of VM placement and power state
//!
//! One table per cluster, each mapping VM name to the host it runs on and its
//! last known state. Tables are independent `DashMap`s so writers in one
//! cluster never contend with another. A VM absent from its table is
//! considered stopped, and storing `Stopped` removes the entry.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::types::VmPowerState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmPlacement {
    pub host_uuid: String,
    pub state: VmPowerState,
}

impl VmPlacement {
    pub fn new(host_uuid: impl Into<String>, state: VmPowerState) -> Self {
        Self {
            host_uuid: host_uuid.into(),
            state,
        }
    }
}

type ClusterTable = Arc<DashMap<String, VmPlacement>>;

#[derive(Debug, Default)]
pub struct ClusterVmStateCache {
    clusters: DashMap<String, ClusterTable>,
}

impl ClusterVmStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or atomically create the table for `cluster`
    fn table(&self, cluster: &str) -> ClusterTable {
        self.clusters
            .entry(cluster.to_string())
            .or_insert_with(|| Arc::new(DashMap::new()))
            .clone()
    }

    fn existing_table(&self, cluster: &str) -> Option<ClusterTable> {
        self.clusters.get(cluster).map(|t| t.value().clone())
    }

    pub fn get(&self, cluster: &str, vm_name: &str) -> Option<VmPlacement> {
        self.existing_table(cluster)?
            .get(vm_name)
            .map(|p| p.value().clone())
    }

    /// Last known state; unknown VMs are `Stopped`
    pub fn get_state(&self, cluster: &str, vm_name: &str) -> VmPowerState {
        self.get(cluster, vm_name)
            .map_or(VmPowerState::Stopped, |p| p.state)
    }

    pub fn put(&self, cluster: &str, vm_name: &str, host_uuid: &str, state: VmPowerState) {
        let table = self.table(cluster);
        if state == VmPowerState::Stopped {
            table.remove(vm_name);
        } else {
            table.insert(vm_name.to_string(), VmPlacement::new(host_uuid, state));
        }
    }

    pub fn remove(&self, cluster: &str, vm_name: &str) -> Option<VmPlacement> {
        self.existing_table(cluster)?
            .remove(vm_name)
            .map(|(_, placement)| placement)
    }

    /// Overwrite each given entry, leaving other VMs untouched
    pub fn put_all<I>(&self, cluster: &str, entries: I)
    where
        I: IntoIterator<Item = (String, VmPlacement)>,
    {
        let table = self.table(cluster);
        for (vm_name, placement) in entries {
            if placement.state == VmPowerState::Stopped {
                table.remove(&vm_name);
            } else {
                table.insert(vm_name, placement);
            }
        }
    }

    /// Replace the cluster's contents with an authoritative snapshot
    ///
    /// Entries missing from the snapshot are dropped. Readers may observe a
    /// mix of old and new entries while the resync is in progress.
    pub fn resync(&self, cluster: &str, snapshot: HashMap<String, VmPlacement>) {
        let table = self.table(cluster);
        let before = table.len();
        table.retain(|vm_name, _| {
            snapshot
                .get(vm_name)
                .map_or(false, |p| p.state != VmPowerState::Stopped)
        });
        for (vm_name, placement) in snapshot {
            if placement.state != VmPowerState::Stopped {
                table.insert(vm_name, placement);
            }
        }
        debug!(
            cluster,
            before,
            after = table.len(),
            "Resynchronised cluster VM states"
        );
    }

    pub fn clear(&self, cluster: &str) {
        if let Some(table) = self.existing_table(cluster) {
            table.clear();
        }
    }

    pub fn size(&self, cluster: &str) -> usize {
        self.existing_table(cluster).map_or(0, |t| t.len())
    }

    pub fn clusters(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Copy of one cluster's entries
    pub fn snapshot(&self, cluster: &str) -> HashMap<String, VmPlacement> {
        self.existing_table(cluster)
            .map(|t| {
                t.iter()
                    .map(|e| (e.key().clone(), e.value().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_vm_is_stopped() {
        let cache = ClusterVmStateCache::new();
        assert_eq!(cache.get_state("c1", "vm"), VmPowerState::Stopped);
        assert_eq!(cache.size("c1"), 0);
        // Reads do not create tables
        assert!(cache.clusters().is_empty());
    }

    #[test]
    fn test_put_stopped_removes() {
        let cache = ClusterVmStateCache::new();
        cache.put("c1", "vm", "h1", VmPowerState::Running);
        assert_eq!(cache.size("c1"), 1);

        cache.put("c1", "vm", "h1", VmPowerState::Stopped);
        assert_eq!(cache.size("c1"), 0);
        assert_eq!(cache.get("c1", "vm"), None);
    }

    #[test]
    fn test_clusters_are_isolated() {
        let cache = ClusterVmStateCache::new();
        cache.put("c1", "vm", "h1", VmPowerState::Running);
        cache.put("c2", "vm", "h9", VmPowerState::Paused);

        assert_eq!(cache.get("c1", "vm").unwrap().host_uuid, "h1");
        assert_eq!(cache.get_state("c2", "vm"), VmPowerState::Paused);

        cache.clear("c1");
        assert_eq!(cache.size("c1"), 0);
        assert_eq!(cache.size("c2"), 1);
        assert_eq!(cache.clusters(), vec!["c1", "c2"]);
    }

    #[test]
    fn test_put_all_merges_and_resync_replaces() {
        let cache = ClusterVmStateCache::new();
        cache.put("c1", "old", "h1", VmPowerState::Running);

        cache.put_all(
            "c1",
            vec![("new".to_string(), VmPlacement::new("h2", VmPowerState::Running))],
        );
        assert_eq!(cache.size("c1"), 2);

        let mut snapshot = HashMap::new();
        snapshot.insert("new".to_string(), VmPlacement::new("h3", VmPowerState::Running));
        cache.resync("c1", snapshot);

        assert_eq!(cache.size("c1"), 1);
        assert_eq!(cache.get("c1", "new").unwrap().host_uuid, "h3");
        assert_eq!(cache.get("c1", "old"), None);
    }
}
