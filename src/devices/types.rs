//! Device data types

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::utils::format_size;

/// Filesystems a boot partition may carry
const BOOT_FS_KINDS: &[&str] = &["vfat", "fat", "fat16", "fat32", "msdos", "msdosfs"];
/// Volume labels used for boot partitions by common images
const BOOT_LABELS: &[&str] = &["boot", "bootfs", "system-boot", "resin-boot", "efi"];

/// One partition on a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionInfo {
    pub number: u32,
    pub path: PathBuf,
    pub fs_kind: Option<String>,
    pub label: Option<String>,
    pub is_boot: bool,
    pub mount_point: Option<PathBuf>,
}

impl PartitionInfo {
    /// Boot-partition heuristic: a FAT filesystem with a boot label, or a FAT
    /// first partition
    pub fn looks_like_boot(number: u32, fs_kind: Option<&str>, label: Option<&str>) -> bool {
        let is_fat = fs_kind
            .map(|fs| BOOT_FS_KINDS.iter().any(|k| fs.eq_ignore_ascii_case(k)))
            .unwrap_or(false);
        let boot_label = label
            .map(|l| BOOT_LABELS.iter().any(|b| l.eq_ignore_ascii_case(b)))
            .unwrap_or(false);
        is_fat && (boot_label || number == 1)
    }
}

/// A block device as seen by one enumeration call
///
/// Never cached: presence and mount state can change between calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    /// Platform identifier (`sdb`, `disk4`, `PhysicalDrive2`)
    pub id: String,
    /// Raw block path used for writing
    pub path: PathBuf,
    pub label: String,
    pub model: Option<String>,
    pub bus: Option<String>,
    pub total_bytes: u64,
    pub free_bytes: Option<u64>,
    pub removable: bool,
    /// Hosts the running system
    pub is_system: bool,
    pub mounted: bool,
    pub partitions: Vec<PartitionInfo>,
}

impl DeviceDescriptor {
    pub fn boot_partition(&self) -> Option<&PartitionInfo> {
        self.partitions.iter().find(|p| p.is_boot)
    }

    pub fn mounted_partitions(&self) -> impl Iterator<Item = &PartitionInfo> {
        self.partitions.iter().filter(|p| p.mount_point.is_some())
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = if self.mounted {
            "[Mounted]"
        } else {
            "[Not mounted]"
        };
        write!(
            f,
            "{:<15} {:<10} {:<28} {}{}",
            self.id,
            format_size(self.total_bytes),
            self.label,
            mount_info,
            if self.removable { "" } else { " [fixed]" }
        )
    }
}

/// A boot partition mounted for configuration injection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootMount {
    pub device_id: String,
    pub partition: PathBuf,
    pub path: PathBuf,
    /// Mounted by this process, so it must be released again
    pub mounted_by_us: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_heuristic() {
        assert!(PartitionInfo::looks_like_boot(1, Some("vfat"), None));
        assert!(PartitionInfo::looks_like_boot(2, Some("FAT32"), Some("bootfs")));
        assert!(!PartitionInfo::looks_like_boot(2, Some("vfat"), Some("data")));
        assert!(!PartitionInfo::looks_like_boot(1, Some("ext4"), Some("boot")));
        assert!(!PartitionInfo::looks_like_boot(1, None, None));
    }
}
