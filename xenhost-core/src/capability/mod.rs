//! Version-aware capability resolution
//!
//! A [`CapabilityChain`] holds a baseline value for every [`CapabilityAxis`]
//! and an ordered list of releases, each carrying only the axes it changes.
//! Resolving an axis for a release walks from that release back towards the
//! baseline and takes the first explicit override. An [`Override::Extend`]
//! receives the fully resolved value of its predecessor, so a release can add
//! a few guest OS entries without restating the whole table.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use crate::error::{XenhostError, XenhostResult};
use crate::types::{HostSoftwareVersion, ProductVersion};

pub mod guest_os;
pub mod releases;

pub use guest_os::{GuestOsTable, MemoryRecommendation, MemoryRecommendationTable};
pub use releases::standard_chain;

/// Independently overridable aspects of host behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CapabilityAxis {
    PatchBundle,
    DynamicMemoryControl,
    GuestOsMapping,
    StaticMemoryRecommendation,
    StorageProcessor,
    Dom0VifPlug,
    GpuSupport,
}

impl CapabilityAxis {
    pub const ALL: [CapabilityAxis; 7] = [
        CapabilityAxis::PatchBundle,
        CapabilityAxis::DynamicMemoryControl,
        CapabilityAxis::GuestOsMapping,
        CapabilityAxis::StaticMemoryRecommendation,
        CapabilityAxis::StorageProcessor,
        CapabilityAxis::Dom0VifPlug,
        CapabilityAxis::GpuSupport,
    ];
}

/// How dynamic memory control availability is detected on a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DmcDetection {
    Unavailable,
    /// DMC is enabled when the named license parameter reads "false"
    LicenseRestriction { param: String },
    Available,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageProcessorKind {
    Legacy,
    /// Live storage migration between storage repositories
    StorageMotion,
}

/// Resolved value of one capability axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Behavior {
    /// Patch bundle location, relative to the scripts directory
    PatchBundle(PathBuf),
    DynamicMemoryControl(DmcDetection),
    GuestOsMapping(GuestOsTable),
    StaticMemoryRecommendation(MemoryRecommendationTable),
    StorageProcessor(StorageProcessorKind),
    Dom0VifPlug(bool),
    GpuSupport(bool),
}

impl Behavior {
    pub fn axis(&self) -> CapabilityAxis {
        match self {
            Behavior::PatchBundle(_) => CapabilityAxis::PatchBundle,
            Behavior::DynamicMemoryControl(_) => CapabilityAxis::DynamicMemoryControl,
            Behavior::GuestOsMapping(_) => CapabilityAxis::GuestOsMapping,
            Behavior::StaticMemoryRecommendation(_) => CapabilityAxis::StaticMemoryRecommendation,
            Behavior::StorageProcessor(_) => CapabilityAxis::StorageProcessor,
            Behavior::Dom0VifPlug(_) => CapabilityAxis::Dom0VifPlug,
            Behavior::GpuSupport(_) => CapabilityAxis::GpuSupport,
        }
    }
}

pub type ExtendFn = Arc<dyn Fn(Behavior) -> Behavior + Send + Sync>;

/// A release's change to one axis
#[derive(Clone)]
pub enum Override {
    Replace(Behavior),
    /// Derive the value from the predecessor's resolved value
    Extend(ExtendFn),
}

impl fmt::Debug for Override {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Override::Replace(b) => f.debug_tuple("Replace").field(b).finish(),
            Override::Extend(_) => f.write_str("Extend(<fn>)"),
        }
    }
}

/// Overrides one release applies on top of its predecessor
#[derive(Debug, Clone, Default)]
pub struct OverrideSet {
    overrides: HashMap<CapabilityAxis, Override>,
}

impl OverrideSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(mut self, behavior: Behavior) -> Self {
        self.overrides
            .insert(behavior.axis(), Override::Replace(behavior));
        self
    }

    pub fn extend<F>(mut self, axis: CapabilityAxis, f: F) -> Self
    where
        F: Fn(Behavior) -> Behavior + Send + Sync + 'static,
    {
        self.overrides.insert(axis, Override::Extend(Arc::new(f)));
        self
    }

    pub fn get(&self, axis: CapabilityAxis) -> Option<&Override> {
        self.overrides.get(&axis)
    }

    pub fn axes(&self) -> impl Iterator<Item = CapabilityAxis> + '_ {
        self.overrides.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}

/// Identity of a hypervisor release in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseTag {
    pub name: String,
    pub version: ProductVersion,
    /// Hotfix that must be installed for this release to apply
    pub required_hotfix: Option<String>,
}

impl ReleaseTag {
    pub fn new(name: impl Into<String>, version: ProductVersion) -> Self {
        Self {
            name: name.into(),
            version,
            required_hotfix: None,
        }
    }

    pub fn with_hotfix(mut self, hotfix: impl Into<String>) -> Self {
        self.required_hotfix = Some(hotfix.into());
        self
    }

    /// Whether a host running `software` can be driven as this release
    pub fn applies_to(&self, software: &HostSoftwareVersion) -> bool {
        self.version <= software.product_version
            && self
                .required_hotfix
                .as_deref()
                .map_or(true, |h| software.has_hotfix(h))
    }
}

impl fmt::Display for ReleaseTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.required_hotfix {
            Some(h) => write!(f, "{} ({} + {})", self.name, self.version, h),
            None => write!(f, "{} ({})", self.name, self.version),
        }
    }
}

/// Ordered release override tables over a complete baseline
#[derive(Debug, Clone)]
pub struct CapabilityChain {
    baseline: HashMap<CapabilityAxis, Behavior>,
    releases: Vec<(ReleaseTag, OverrideSet)>,
}

#[derive(Debug, Default)]
pub struct CapabilityChainBuilder {
    baseline: HashMap<CapabilityAxis, Behavior>,
    releases: Vec<(ReleaseTag, OverrideSet)>,
}

impl CapabilityChainBuilder {
    pub fn baseline(mut self, behavior: Behavior) -> Self {
        self.baseline.insert(behavior.axis(), behavior);
        self
    }

    /// Append a release; later releases are more specific
    pub fn release(mut self, tag: ReleaseTag, overrides: OverrideSet) -> Self {
        self.releases.push((tag, overrides));
        self
    }

    pub fn build(self) -> XenhostResult<CapabilityChain> {
        for axis in CapabilityAxis::ALL {
            if !self.baseline.contains_key(&axis) {
                return Err(XenhostError::MissingCapabilityDefault { axis });
            }
        }

        let mut seen = HashSet::new();
        for (tag, _) in &self.releases {
            if !seen.insert(tag.name.as_str()) {
                return Err(XenhostError::ConfigError(format!(
                    "release '{}' registered twice",
                    tag.name
                )));
            }
        }

        for pair in self.releases.windows(2) {
            let (prev, next) = (&pair[0].0, &pair[1].0);
            let ordered = prev.version < next.version
                || (prev.version == next.version
                    && prev.required_hotfix.is_none()
                    && next.required_hotfix.is_some());
            if !ordered {
                return Err(XenhostError::ConfigError(format!(
                    "release {} must come before {}",
                    next, prev
                )));
            }
        }

        Ok(CapabilityChain {
            baseline: self.baseline,
            releases: self.releases,
        })
    }
}

impl CapabilityChain {
    pub fn builder() -> CapabilityChainBuilder {
        CapabilityChainBuilder::default()
    }

    pub fn releases(&self) -> impl Iterator<Item = &ReleaseTag> {
        self.releases.iter().map(|(tag, _)| tag)
    }

    pub fn release(&self, name: &str) -> XenhostResult<&ReleaseTag> {
        self.position(name).map(|i| &self.releases[i].0)
    }

    /// Index of a release in the chain, oldest first
    pub fn position(&self, name: &str) -> XenhostResult<usize> {
        self.releases
            .iter()
            .position(|(tag, _)| tag.name == name)
            .ok_or_else(|| XenhostError::UnknownRelease {
                release: name.to_string(),
            })
    }

    /// Pick the most specific release a host can be driven as
    pub fn select_release(&self, software: &HostSoftwareVersion) -> XenhostResult<&ReleaseTag> {
        self.releases
            .iter()
            .rev()
            .map(|(tag, _)| tag)
            .find(|tag| tag.applies_to(software))
            .ok_or_else(|| XenhostError::UnsupportedVersion {
                version: software.product_version.to_string(),
            })
    }

    pub fn resolve(&self, release: &str, axis: CapabilityAxis) -> XenhostResult<Behavior> {
        let pos = self.position(release)?;
        self.resolve_upto(pos + 1, axis)
    }

    /// Resolve `axis` considering only the first `count` releases
    fn resolve_upto(&self, count: usize, axis: CapabilityAxis) -> XenhostResult<Behavior> {
        for (i, (tag, overrides)) in self.releases[..count].iter().enumerate().rev() {
            let resolved = match overrides.get(axis) {
                None => continue,
                Some(Override::Replace(behavior)) => behavior.clone(),
                Some(Override::Extend(f)) => f(self.resolve_upto(i, axis)?),
            };
            if resolved.axis() != axis {
                return Err(XenhostError::internal(format!(
                    "release {} override for {:?} produced {:?}",
                    tag.name,
                    axis,
                    resolved.axis()
                )));
            }
            return Ok(resolved);
        }

        self.baseline
            .get(&axis)
            .cloned()
            .ok_or(XenhostError::MissingCapabilityDefault { axis })
    }

    /// Snapshot of every axis for one release
    pub fn resolve_all(&self, release: &str) -> XenhostResult<ResolvedBehavior> {
        let tag = self.release(release)?.clone();

        macro_rules! axis {
            ($variant:ident) => {
                match self.resolve(release, CapabilityAxis::$variant)? {
                    Behavior::$variant(value) => value,
                    other => {
                        return Err(XenhostError::internal(format!(
                            "expected {:?}, resolved {:?}",
                            CapabilityAxis::$variant,
                            other.axis()
                        )))
                    }
                }
            };
        }

        Ok(ResolvedBehavior {
            release: tag,
            patch_bundle: axis!(PatchBundle),
            dmc: axis!(DynamicMemoryControl),
            guest_os: axis!(GuestOsMapping),
            memory: axis!(StaticMemoryRecommendation),
            storage_processor: axis!(StorageProcessor),
            dom0_vif_plug: axis!(Dom0VifPlug),
            gpu_support: axis!(GpuSupport),
        })
    }
}

/// Every capability axis resolved for one release
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedBehavior {
    pub release: ReleaseTag,
    pub patch_bundle: PathBuf,
    pub dmc: DmcDetection,
    pub guest_os: GuestOsTable,
    pub memory: MemoryRecommendationTable,
    pub storage_processor: StorageProcessorKind,
    pub dom0_vif_plug: bool,
    pub gpu_support: bool,
}

impl ResolvedBehavior {
    pub fn patch_path(&self, scripts_dir: &Path) -> PathBuf {
        scripts_dir.join(&self.patch_bundle)
    }

    /// Interpret host license parameters according to this release's DMC rule
    pub fn dmc_enabled(&self, license_params: &HashMap<String, String>) -> bool {
        match &self.dmc {
            DmcDetection::Unavailable => false,
            DmcDetection::Available => true,
            DmcDetection::LicenseRestriction { param } => match license_params.get(param) {
                Some(value) => value.eq_ignore_ascii_case("false"),
                None => {
                    warn!(
                        release = %self.release.name,
                        "Host does not report license parameter '{}', treating DMC as disabled",
                        param
                    );
                    false
                }
            },
        }
    }

    pub fn guest_os_type(&self, management_os: &str) -> String {
        self.guest_os.map(management_os)
    }

    pub fn static_max(&self, hypervisor_os: &str, dynamic_min: u64, dynamic_max: u64) -> u64 {
        self.memory.static_max(hypervisor_os, dynamic_min, dynamic_max)
    }

    pub fn static_min(&self, hypervisor_os: &str, dynamic_min: u64, dynamic_max: u64) -> u64 {
        self.memory.static_min(hypervisor_os, dynamic_min, dynamic_max)
    }

    pub fn supports_storage_motion(&self) -> bool {
        self.storage_processor == StorageProcessorKind::StorageMotion
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_baseline() -> CapabilityChainBuilder {
        CapabilityChain::builder()
            .baseline(Behavior::PatchBundle(PathBuf::from("base/patch")))
            .baseline(Behavior::DynamicMemoryControl(DmcDetection::Unavailable))
            .baseline(Behavior::GuestOsMapping(GuestOsTable::default()))
            .baseline(Behavior::StaticMemoryRecommendation(
                MemoryRecommendationTable::default(),
            ))
            .baseline(Behavior::StorageProcessor(StorageProcessorKind::Legacy))
            .baseline(Behavior::Dom0VifPlug(true))
            .baseline(Behavior::GpuSupport(false))
    }

    #[test]
    fn test_missing_baseline_fails_build() {
        let err = CapabilityChain::builder()
            .baseline(Behavior::GpuSupport(false))
            .build()
            .unwrap_err();
        assert!(matches!(err, XenhostError::MissingCapabilityDefault { .. }));
    }

    #[test]
    fn test_first_override_wins_walking_back() {
        let chain = complete_baseline()
            .release(
                ReleaseTag::new("a", ProductVersion::new(1, 0, 0)),
                OverrideSet::new().replace(Behavior::Dom0VifPlug(false)),
            )
            .release(
                ReleaseTag::new("b", ProductVersion::new(2, 0, 0)),
                OverrideSet::new(),
            )
            .build()
            .unwrap();

        assert_eq!(
            chain.resolve("b", CapabilityAxis::Dom0VifPlug).unwrap(),
            Behavior::Dom0VifPlug(false)
        );
        assert_eq!(
            chain.resolve("b", CapabilityAxis::GpuSupport).unwrap(),
            Behavior::GpuSupport(false)
        );
    }

    #[test]
    fn test_extend_sees_predecessor_value() {
        let chain = complete_baseline()
            .release(
                ReleaseTag::new("a", ProductVersion::new(1, 0, 0)),
                OverrideSet::new().extend(CapabilityAxis::GpuSupport, |prev| match prev {
                    Behavior::GpuSupport(v) => Behavior::GpuSupport(!v),
                    other => other,
                }),
            )
            .build()
            .unwrap();

        assert_eq!(
            chain.resolve("a", CapabilityAxis::GpuSupport).unwrap(),
            Behavior::GpuSupport(true)
        );
    }

    #[test]
    fn test_extend_with_wrong_axis_is_reported() {
        let chain = complete_baseline()
            .release(
                ReleaseTag::new("a", ProductVersion::new(1, 0, 0)),
                OverrideSet::new()
                    .extend(CapabilityAxis::GpuSupport, |_| Behavior::Dom0VifPlug(true)),
            )
            .build()
            .unwrap();

        assert!(chain.resolve("a", CapabilityAxis::GpuSupport).is_err());
    }

    #[test]
    fn test_out_of_order_releases_rejected() {
        let err = complete_baseline()
            .release(
                ReleaseTag::new("new", ProductVersion::new(2, 0, 0)),
                OverrideSet::new(),
            )
            .release(
                ReleaseTag::new("old", ProductVersion::new(1, 0, 0)),
                OverrideSet::new(),
            )
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("must come before"));
    }

    #[test]
    fn test_unknown_release() {
        let chain = complete_baseline().build().unwrap();
        assert!(matches!(
            chain.resolve("nope", CapabilityAxis::GpuSupport),
            Err(XenhostError::UnknownRelease { .. })
        ));
    }
}
