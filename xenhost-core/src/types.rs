use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::XenhostError;

/// Lifecycle state of a VM as tracked by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmPowerState {
    Starting,
    Running,
    Paused,
    Suspended,
    Stopping,
    Stopped,
    Migrating,
    Unknown,
}

impl fmt::Display for VmPowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmPowerState::Starting => "Starting",
            VmPowerState::Running => "Running",
            VmPowerState::Paused => "Paused",
            VmPowerState::Suspended => "Suspended",
            VmPowerState::Stopping => "Stopping",
            VmPowerState::Stopped => "Stopped",
            VmPowerState::Migrating => "Migrating",
            VmPowerState::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Product version reported by a host, e.g. `6.2.0`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProductVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProductVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for ProductVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ProductVersion {
    type Err = XenhostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || XenhostError::InvalidInput {
            field: "product_version".to_string(),
            message: format!("expected MAJOR.MINOR[.PATCH], got '{}'", s),
        };

        let mut parts = s.trim().split('.');
        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let minor = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let patch = match parts.next() {
            Some(p) => p.parse().map_err(|_| invalid())?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self::new(major, minor, patch))
    }
}

/// Software identity of a host, used to pick its release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSoftwareVersion {
    pub product_version: ProductVersion,
    #[serde(default)]
    pub hotfixes: Vec<String>,
}

impl HostSoftwareVersion {
    pub fn has_hotfix(&self, name: &str) -> bool {
        self.hotfixes.iter().any(|h| h.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeType {
    Root,
    DataDisk,
    Iso,
}

/// One disk of a VM being migrated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDescriptor {
    /// Device sequence number (the VBD userdevice)
    pub device_seq: u32,
    /// Management-side volume identity
    pub volume_id: String,
    /// Current backing location (VDI uuid); empty for ISOs
    #[serde(default)]
    pub path: String,
    pub volume_type: VolumeType,
    /// Per-disk target storage pool, overrides the request's pool
    #[serde(default)]
    pub target_pool_uuid: Option<String>,
}

impl DiskDescriptor {
    pub fn is_iso(&self) -> bool {
        self.volume_type == VolumeType::Iso
    }
}

/// New location of a relocated volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeLocation {
    pub volume_id: String,
    pub path: String,
}

/// Memory request for a VM start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySpec {
    /// Management-side guest OS name, e.g. "CentOS 6.0 (64-bit)"
    pub guest_os: String,
    pub dynamic_min_mib: u64,
    pub dynamic_max_mib: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_product_version() {
        assert_eq!(
            "6.2.0".parse::<ProductVersion>().unwrap(),
            ProductVersion::new(6, 2, 0)
        );
        assert_eq!(
            "5.6".parse::<ProductVersion>().unwrap(),
            ProductVersion::new(5, 6, 0)
        );
        assert!("6.x.0".parse::<ProductVersion>().is_err());
        assert!("6.2.0.1".parse::<ProductVersion>().is_err());
    }

    #[test]
    fn test_version_ordering() {
        assert!(ProductVersion::new(5, 6, 100) < ProductVersion::new(5, 6, 199));
        assert!(ProductVersion::new(5, 6, 199) < ProductVersion::new(6, 0, 0));
    }

    #[test]
    fn test_hotfix_match_ignores_case() {
        let v = HostSoftwareVersion {
            product_version: ProductVersion::new(6, 2, 0),
            hotfixes: vec!["xs62esp1".to_string()],
        };
        assert!(v.has_hotfix("XS62ESP1"));
        assert!(!v.has_hotfix("XS62ESP2"));
    }
}
