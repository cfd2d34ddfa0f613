// Property and concurrency tests for the cluster VM state cache

use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use xenhost_core::types::VmPowerState;
use xenhost_core::{ClusterVmStateCache, VmPlacement};

#[derive(Debug, Clone)]
enum CacheOp {
    Put {
        cluster: String,
        vm: String,
        host: String,
        state: VmPowerState,
    },
    Remove {
        cluster: String,
        vm: String,
    },
    Clear {
        cluster: String,
    },
}

fn cluster_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(&["pool-1", "pool-2"]).prop_map(|s| s.to_string())
}

fn vm_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(&["web-1", "web-2", "db-1", "cache-1"]).prop_map(|s| s.to_string())
}

fn state_strategy() -> impl Strategy<Value = VmPowerState> {
    prop::sample::select(&[
        VmPowerState::Starting,
        VmPowerState::Running,
        VmPowerState::Stopping,
        VmPowerState::Stopped,
        VmPowerState::Migrating,
    ])
}

fn op_strategy() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        4 => (cluster_strategy(), vm_strategy(), "host-[ab]", state_strategy()).prop_map(
            |(cluster, vm, host, state)| CacheOp::Put {
                cluster,
                vm,
                host,
                state
            }
        ),
        1 => (cluster_strategy(), vm_strategy())
            .prop_map(|(cluster, vm)| CacheOp::Remove { cluster, vm }),
        1 => cluster_strategy().prop_map(|cluster| CacheOp::Clear { cluster }),
    ]
}

type Model = HashMap<String, HashMap<String, VmPlacement>>;

fn apply(cache: &ClusterVmStateCache, model: &mut Model, op: &CacheOp) {
    match op {
        CacheOp::Put {
            cluster,
            vm,
            host,
            state,
        } => {
            cache.put(cluster, vm, host, *state);
            let table = model.entry(cluster.clone()).or_default();
            if *state == VmPowerState::Stopped {
                table.remove(vm);
            } else {
                table.insert(vm.clone(), VmPlacement::new(host.clone(), *state));
            }
        }
        CacheOp::Remove { cluster, vm } => {
            cache.remove(cluster, vm);
            if let Some(table) = model.get_mut(cluster) {
                table.remove(vm);
            }
        }
        CacheOp::Clear { cluster } => {
            cache.clear(cluster);
            if let Some(table) = model.get_mut(cluster) {
                table.clear();
            }
        }
    }
}

proptest! {
    #[test]
    fn cache_matches_map_model(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let cache = ClusterVmStateCache::new();
        let mut model = Model::new();

        for op in &ops {
            apply(&cache, &mut model, op);
        }

        for cluster in ["pool-1", "pool-2"] {
            let expected = model.get(cluster).cloned().unwrap_or_default();
            prop_assert_eq!(cache.snapshot(cluster), expected.clone());
            prop_assert_eq!(cache.size(cluster), expected.len());
            for vm in ["web-1", "web-2", "db-1", "cache-1"] {
                let state = expected.get(vm).map_or(VmPowerState::Stopped, |p| p.state);
                prop_assert_eq!(cache.get_state(cluster, vm), state);
            }
        }
    }

    #[test]
    fn resync_leaves_exactly_the_active_snapshot(
        before in prop::collection::vec((vm_strategy(), state_strategy()), 0..8),
        snapshot in prop::collection::vec((vm_strategy(), state_strategy()), 0..8),
    ) {
        let cache = ClusterVmStateCache::new();
        for (vm, state) in &before {
            cache.put("pool-1", vm, "host-a", *state);
        }
        cache.put("pool-2", "other", "host-z", VmPowerState::Running);

        let snapshot: HashMap<String, VmPlacement> = snapshot
            .into_iter()
            .map(|(vm, state)| (vm, VmPlacement::new("host-b", state)))
            .collect();
        cache.resync("pool-1", snapshot.clone());

        let expected: HashMap<String, VmPlacement> = snapshot
            .into_iter()
            .filter(|(_, p)| p.state != VmPowerState::Stopped)
            .collect();
        prop_assert_eq!(cache.snapshot("pool-1"), expected);
        prop_assert_eq!(cache.size("pool-2"), 1);
    }
}

#[test]
fn test_concurrent_writers_per_cluster() {
    let cache = Arc::new(ClusterVmStateCache::new());
    let mut handles = Vec::new();

    for worker in 0..8 {
        let cache = cache.clone();
        handles.push(thread::spawn(move || {
            let cluster = format!("pool-{}", worker % 2);
            for i in 0..200 {
                let vm = format!("vm-{}-{}", worker, i);
                cache.put(&cluster, &vm, "host-a", VmPowerState::Running);
                if i % 2 == 0 {
                    cache.put(&cluster, &vm, "host-a", VmPowerState::Stopped);
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(cache.clusters(), vec!["pool-0".to_string(), "pool-1".to_string()]);
    assert_eq!(cache.size("pool-0"), 4 * 100);
    assert_eq!(cache.size("pool-1"), 4 * 100);
}

#[test]
fn test_put_all_merges_entries() {
    let cache = ClusterVmStateCache::new();
    cache.put("pool-1", "web-1", "host-a", VmPowerState::Running);
    cache.put("pool-1", "web-2", "host-a", VmPowerState::Running);

    cache.put_all(
        "pool-1",
        vec![
            ("web-2".to_string(), VmPlacement::new("host-b", VmPowerState::Stopped)),
            ("db-1".to_string(), VmPlacement::new("host-b", VmPowerState::Starting)),
        ],
    );

    assert_eq!(cache.get_state("pool-1", "web-1"), VmPowerState::Running);
    assert_eq!(cache.get("pool-1", "web-2"), None);
    assert_eq!(cache.get("pool-1", "db-1").unwrap().host_uuid, "host-b");
}
