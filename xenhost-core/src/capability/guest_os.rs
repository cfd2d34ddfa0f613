//! Guest OS name mapping and static memory recommendation tables

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Hypervisor OS name used when a management OS name has no mapping
pub const FALLBACK_GUEST_OS: &str = "Other install media";

/// Static max is capped at this multiple of dynamic min
pub const STATIC_MAX_DYNAMIC_MIN_MULTIPLE: u64 = 4;

/// Management OS name to hypervisor OS name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestOsTable {
    entries: BTreeMap<String, String>,
    fallback: String,
}

impl Default for GuestOsTable {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            fallback: FALLBACK_GUEST_OS.to_string(),
        }
    }
}

impl GuestOsTable {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::default().with_entries(entries)
    }

    /// Add or replace entries, keeping existing ones
    pub fn with_entries<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.entries
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn lookup(&self, management_os: &str) -> Option<&str> {
        self.entries.get(management_os).map(String::as_str)
    }

    pub fn map(&self, management_os: &str) -> String {
        match self.lookup(management_os) {
            Some(os) => os.to_string(),
            None => {
                warn!(
                    "No guest OS mapping for '{}', using '{}'",
                    management_os, self.fallback
                );
                self.fallback.clone()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Recommended static memory bounds for one hypervisor OS, in MiB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecommendation {
    pub min_mib: u64,
    pub max_mib: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecommendationTable {
    entries: BTreeMap<String, MemoryRecommendation>,
}

impl MemoryRecommendationTable {
    pub fn new<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, MemoryRecommendation)>,
        K: Into<String>,
    {
        Self::default().with_entries(entries)
    }

    pub fn with_entries<I, K>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, MemoryRecommendation)>,
        K: Into<String>,
    {
        self.entries
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v)));
        self
    }

    pub fn get(&self, hypervisor_os: &str) -> Option<MemoryRecommendation> {
        self.entries.get(hypervisor_os).copied()
    }

    pub fn recommended_max(&self, hypervisor_os: &str) -> u64 {
        self.get(hypervisor_os).map_or(0, |r| r.max_mib)
    }

    pub fn recommended_min(&self, hypervisor_os: &str) -> u64 {
        self.get(hypervisor_os).map_or(0, |r| r.min_mib)
    }

    /// Static max for a VM; never below `dynamic_max`
    pub fn static_max(&self, hypervisor_os: &str, dynamic_min: u64, dynamic_max: u64) -> u64 {
        let recommended = self.recommended_max(hypervisor_os);
        if recommended == 0 {
            return dynamic_max;
        }

        let cap = recommended.min(dynamic_min.saturating_mul(STATIC_MAX_DYNAMIC_MIN_MULTIPLE));
        if dynamic_max > cap {
            warn!(
                os = hypervisor_os,
                dynamic_max,
                cap,
                "Dynamic max exceeds the recommended static max, the VM may be unstable"
            );
            return dynamic_max;
        }
        cap
    }

    pub fn static_min(&self, hypervisor_os: &str, dynamic_min: u64, _dynamic_max: u64) -> u64 {
        let recommended = self.recommended_min(hypervisor_os);
        if recommended != 0 && dynamic_min < recommended {
            warn!(
                os = hypervisor_os,
                dynamic_min,
                recommended,
                "Dynamic min is below the recommended static min, the VM may be unstable"
            );
        }
        dynamic_min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> MemoryRecommendationTable {
        MemoryRecommendationTable::new([(
            "Big OS",
            MemoryRecommendation {
                min_mib: 1024,
                max_mib: 20000,
            },
        )])
    }

    #[test]
    fn test_static_max_without_recommendation() {
        assert_eq!(table().static_max("Unknown OS", 1024, 4096), 4096);
    }

    #[test]
    fn test_static_max_forced_to_dynamic_max() {
        // cap = min(20000, 4 * 2048) = 8192 < 10000
        assert_eq!(table().static_max("Big OS", 2048, 10000), 10000);
    }

    #[test]
    fn test_static_max_uses_cap() {
        assert_eq!(table().static_max("Big OS", 2048, 4096), 8192);
        assert_eq!(table().static_max("Big OS", 8192, 4096), 20000);
    }

    #[test]
    fn test_static_min_is_dynamic_min() {
        assert_eq!(table().static_min("Big OS", 512, 4096), 512);
    }

    #[test]
    fn test_guest_os_fallback() {
        let table = GuestOsTable::new([("CentOS 5.5 (64-bit)", "CentOS 5 (64-bit)")]);
        assert_eq!(table.map("CentOS 5.5 (64-bit)"), "CentOS 5 (64-bit)");
        assert_eq!(table.map("BeOS"), FALLBACK_GUEST_OS);
    }
}
