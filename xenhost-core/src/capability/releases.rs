//! The standard XenServer release chain
//!
//! Each release lists only what differs from its predecessor. Guest OS and
//! memory tables grow by extension, so newer releases keep every older entry.

use std::path::PathBuf;

use super::guest_os::{GuestOsTable, MemoryRecommendation, MemoryRecommendationTable};
use super::{
    Behavior, CapabilityAxis, CapabilityChain, DmcDetection, OverrideSet, ReleaseTag,
    StorageProcessorKind,
};
use crate::error::XenhostResult;
use crate::types::ProductVersion;

pub const XENSERVER56: &str = "xenserver56";
pub const XENSERVER56FP1: &str = "xenserver56fp1";
pub const XENSERVER56SP2: &str = "xenserver56sp2";
pub const XENSERVER600: &str = "xenserver600";
pub const XENSERVER602: &str = "xenserver602";
pub const XENSERVER610: &str = "xenserver610";
pub const XENSERVER620: &str = "xenserver620";
pub const XENSERVER620SP1: &str = "xenserver620sp1";
pub const XENSERVER650: &str = "xenserver650";

/// License parameter that disables DMC when set to "true"
pub const DMC_RESTRICTION_PARAM: &str = "restrict_dmc";

const MIB_PER_GIB: u64 = 1024;

fn rec(min_mib: u64, max_gib: u64) -> MemoryRecommendation {
    MemoryRecommendation {
        min_mib,
        max_mib: max_gib * MIB_PER_GIB,
    }
}

fn add_guest_os(entries: &'static [(&'static str, &'static str)]) -> OverrideSet {
    OverrideSet::new().extend(CapabilityAxis::GuestOsMapping, move |prev| match prev {
        Behavior::GuestOsMapping(table) => {
            Behavior::GuestOsMapping(table.with_entries(entries.iter().copied()))
        }
        other => other,
    })
}

fn add_memory(
    set: OverrideSet,
    entries: &'static [(&'static str, u64, u64)],
) -> OverrideSet {
    set.extend(CapabilityAxis::StaticMemoryRecommendation, move |prev| match prev {
        Behavior::StaticMemoryRecommendation(table) => Behavior::StaticMemoryRecommendation(
            table.with_entries(entries.iter().map(|(os, min, max)| (*os, rec(*min, *max)))),
        ),
        other => other,
    })
}

const BASELINE_GUEST_OS: &[(&str, &str)] = &[
    ("CentOS 5.3 (32-bit)", "CentOS 5 (32-bit)"),
    ("CentOS 5.3 (64-bit)", "CentOS 5 (64-bit)"),
    ("Debian GNU/Linux 5.0 (32-bit)", "Debian Lenny 5.0 (32-bit)"),
    ("Red Hat Enterprise Linux 5.3 (64-bit)", "Red Hat Enterprise Linux 5 (64-bit)"),
    ("Windows Server 2003 (32-bit)", "Windows Server 2003 (32-bit)"),
    ("Windows Server 2008 (64-bit)", "Windows Server 2008 (64-bit)"),
    ("Windows 7 (64-bit)", "Windows 7 (64-bit)"),
];

const BASELINE_MEMORY: &[(&str, u64, u64)] = &[
    ("CentOS 5 (32-bit)", 512, 16),
    ("CentOS 5 (64-bit)", 512, 128),
    ("Debian Lenny 5.0 (32-bit)", 128, 32),
    ("Red Hat Enterprise Linux 5 (64-bit)", 512, 128),
    ("Windows Server 2003 (32-bit)", 256, 64),
    ("Windows Server 2008 (64-bit)", 512, 128),
    ("Windows 7 (64-bit)", 1024, 128),
];

const XS56_GUEST_OS: &[(&str, &str)] = &[
    ("CentOS 5.5 (32-bit)", "CentOS 5 (32-bit)"),
    ("CentOS 5.5 (64-bit)", "CentOS 5 (64-bit)"),
    ("Ubuntu 10.04 (64-bit)", "Ubuntu Lucid Lynx 10.04 (64-bit) (experimental)"),
];

const XS600_GUEST_OS: &[(&str, &str)] = &[
    ("CentOS 6.0 (64-bit)", "CentOS 6 (64-bit)"),
    ("Red Hat Enterprise Linux 6.0 (64-bit)", "Red Hat Enterprise Linux 6 (64-bit)"),
    ("Ubuntu 10.04 (64-bit)", "Ubuntu Lucid Lynx 10.04 (64-bit)"),
    ("Windows Server 2008 R2 (64-bit)", "Windows Server 2008 R2 (64-bit)"),
];

const XS600_MEMORY: &[(&str, u64, u64)] = &[
    ("CentOS 6 (64-bit)", 512, 128),
    ("Red Hat Enterprise Linux 6 (64-bit)", 512, 128),
    ("Ubuntu Lucid Lynx 10.04 (64-bit)", 128, 32),
    ("Windows Server 2008 R2 (64-bit)", 512, 128),
];

const XS620_GUEST_OS: &[(&str, &str)] = &[
    ("Ubuntu 12.04 (64-bit)", "Ubuntu Precise Pangolin 12.04 (64-bit)"),
    ("Windows 8 (64-bit)", "Windows 8 (64-bit)"),
    ("Windows Server 2012 (64-bit)", "Windows Server 2012 (64-bit)"),
];

const XS620_MEMORY: &[(&str, u64, u64)] = &[
    ("Ubuntu Precise Pangolin 12.04 (64-bit)", 128, 128),
    ("Windows 8 (64-bit)", 2048, 128),
    ("Windows Server 2012 (64-bit)", 1024, 128),
];

const XS650_GUEST_OS: &[(&str, &str)] = &[
    ("CentOS 7 (64-bit)", "CentOS 7"),
    ("Red Hat Enterprise Linux 7 (64-bit)", "Red Hat Enterprise Linux 7"),
    ("Windows Server 2012 R2 (64-bit)", "Windows Server 2012 R2 (64-bit)"),
];

const XS650_MEMORY: &[(&str, u64, u64)] = &[
    ("CentOS 7", 1024, 512),
    ("Red Hat Enterprise Linux 7", 1024, 512),
    ("Windows Server 2012 R2 (64-bit)", 1024, 512),
];

/// Build the XenServer chain from 5.6 through 6.5
pub fn standard_chain() -> XenhostResult<CapabilityChain> {
    CapabilityChain::builder()
        .baseline(Behavior::PatchBundle(PathBuf::from("xenserver/patch")))
        .baseline(Behavior::DynamicMemoryControl(DmcDetection::Unavailable))
        .baseline(Behavior::GuestOsMapping(GuestOsTable::new(
            BASELINE_GUEST_OS.iter().copied(),
        )))
        .baseline(Behavior::StaticMemoryRecommendation(
            MemoryRecommendationTable::new(
                BASELINE_MEMORY
                    .iter()
                    .map(|(os, min, max)| (*os, rec(*min, *max))),
            ),
        ))
        .baseline(Behavior::StorageProcessor(StorageProcessorKind::Legacy))
        .baseline(Behavior::Dom0VifPlug(true))
        .baseline(Behavior::GpuSupport(false))
        .release(
            ReleaseTag::new(XENSERVER56, ProductVersion::new(5, 6, 0)),
            add_guest_os(XS56_GUEST_OS)
                .replace(Behavior::PatchBundle(PathBuf::from("xenserver56/patch"))),
        )
        .release(
            ReleaseTag::new(XENSERVER56FP1, ProductVersion::new(5, 6, 100)),
            OverrideSet::new()
                .replace(Behavior::PatchBundle(PathBuf::from("xenserver56fp1/patch")))
                .replace(Behavior::DynamicMemoryControl(
                    DmcDetection::LicenseRestriction {
                        param: DMC_RESTRICTION_PARAM.to_string(),
                    },
                )),
        )
        .release(
            ReleaseTag::new(XENSERVER56SP2, ProductVersion::new(5, 6, 199)),
            OverrideSet::new(),
        )
        .release(
            ReleaseTag::new(XENSERVER600, ProductVersion::new(6, 0, 0)),
            add_memory(add_guest_os(XS600_GUEST_OS), XS600_MEMORY)
                .replace(Behavior::PatchBundle(PathBuf::from("xenserver60/patch")))
                .replace(Behavior::Dom0VifPlug(false)),
        )
        .release(
            ReleaseTag::new(XENSERVER602, ProductVersion::new(6, 0, 2)),
            OverrideSet::new(),
        )
        .release(
            ReleaseTag::new(XENSERVER610, ProductVersion::new(6, 1, 0)),
            OverrideSet::new().replace(Behavior::StorageProcessor(
                StorageProcessorKind::StorageMotion,
            )),
        )
        .release(
            ReleaseTag::new(XENSERVER620, ProductVersion::new(6, 2, 0)),
            add_memory(add_guest_os(XS620_GUEST_OS), XS620_MEMORY),
        )
        .release(
            ReleaseTag::new(XENSERVER620SP1, ProductVersion::new(6, 2, 0)).with_hotfix("XS62ESP1"),
            OverrideSet::new().replace(Behavior::GpuSupport(true)),
        )
        .release(
            ReleaseTag::new(XENSERVER650, ProductVersion::new(6, 5, 0)),
            add_memory(add_guest_os(XS650_GUEST_OS), XS650_MEMORY)
                .replace(Behavior::PatchBundle(PathBuf::from("xenserver65/patch")))
                .replace(Behavior::DynamicMemoryControl(DmcDetection::Available)),
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HostSoftwareVersion;
    use std::collections::HashMap;

    fn software(version: &str, hotfixes: &[&str]) -> HostSoftwareVersion {
        HostSoftwareVersion {
            product_version: version.parse().unwrap(),
            hotfixes: hotfixes.iter().map(|h| h.to_string()).collect(),
        }
    }

    #[test]
    fn test_standard_chain_builds() {
        let chain = standard_chain().unwrap();
        assert_eq!(chain.releases().count(), 9);
        for tag in chain.releases() {
            assert!(chain.resolve_all(&tag.name).is_ok());
        }
    }

    #[test]
    fn test_hotfix_selects_sp1() {
        let chain = standard_chain().unwrap();
        assert_eq!(
            chain.select_release(&software("6.2.0", &["XS62ESP1"])).unwrap().name,
            XENSERVER620SP1
        );
        assert_eq!(
            chain.select_release(&software("6.2.0", &[])).unwrap().name,
            XENSERVER620
        );
        assert!(chain.select_release(&software("5.5.0", &[])).is_err());
    }

    #[test]
    fn test_guest_os_entries_accumulate() {
        let chain = standard_chain().unwrap();
        let resolved = chain.resolve_all(XENSERVER650).unwrap();
        // From the baseline, 5.6 and 6.5 tables
        assert_eq!(resolved.guest_os_type("CentOS 5.3 (64-bit)"), "CentOS 5 (64-bit)");
        assert_eq!(resolved.guest_os_type("CentOS 5.5 (64-bit)"), "CentOS 5 (64-bit)");
        assert_eq!(resolved.guest_os_type("CentOS 7 (64-bit)"), "CentOS 7");
        // 6.0 replaced the experimental Lucid mapping
        assert_eq!(
            resolved.guest_os_type("Ubuntu 10.04 (64-bit)"),
            "Ubuntu Lucid Lynx 10.04 (64-bit)"
        );
    }

    #[test]
    fn test_fp1_license_restriction() {
        let chain = standard_chain().unwrap();
        let resolved = chain.resolve_all(XENSERVER56FP1).unwrap();

        let mut params = HashMap::new();
        params.insert(DMC_RESTRICTION_PARAM.to_string(), "FALSE".to_string());
        assert!(resolved.dmc_enabled(&params));

        params.insert(DMC_RESTRICTION_PARAM.to_string(), "true".to_string());
        assert!(!resolved.dmc_enabled(&params));

        assert!(!resolved.dmc_enabled(&HashMap::new()));
    }
}
