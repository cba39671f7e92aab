//! Linux device detection through sysfs, `/proc/mounts` and the udev database

use std::collections::HashMap;
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use super::{run_command, BootMount, DeviceDescriptor, DeviceEnumerator, DeviceError, PartitionInfo};
use crate::{log_debug, log_info, log_warn};

const MODULE: &str = "devices::linux";

/// BLKRRPART ioctl: re-read partition table
const BLKRRPART: libc::c_ulong = 0x125F;

/// Kernel devices that are never flash targets
const SKIPPED_PREFIXES: &[&str] = &["loop", "ram", "zram", "dm-", "md", "sr", "fd", "nbd"];

/// Mount points that mark a device as hosting the running system
const SYSTEM_MOUNTS: &[&str] = &["/", "/boot", "/boot/efi", "/home", "/usr", "/var"];

#[derive(Debug, Clone)]
struct MountInfo {
    mount_point: PathBuf,
    fs_type: String,
}

pub struct LinuxEnumerator {
    sys_block: PathBuf,
}

impl LinuxEnumerator {
    pub fn new() -> Self {
        Self {
            sys_block: PathBuf::from("/sys/block"),
        }
    }

    fn read_sys(&self, device: &str, file: &str) -> Option<String> {
        fs::read_to_string(self.sys_block.join(device).join(file))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn describe(
        &self,
        name: &str,
        mounts: &HashMap<PathBuf, MountInfo>,
        swaps: &[PathBuf],
    ) -> Option<DeviceDescriptor> {
        let sectors: u64 = self.read_sys(name, "size")?.parse().ok()?;
        if sectors == 0 {
            // Empty card reader
            return None;
        }
        let total_bytes = sectors * 512;

        let sys_path = fs::canonicalize(self.sys_block.join(name)).unwrap_or_default();
        let sys_path = sys_path.to_string_lossy();
        let bus = if sys_path.contains("/usb") {
            Some("USB")
        } else if sys_path.contains("/mmc") || name.starts_with("mmcblk") {
            Some("SD")
        } else if name.starts_with("nvme") {
            Some("NVMe")
        } else if sys_path.contains("/ata") {
            Some("SATA")
        } else {
            None
        };

        let removable_flag = self.read_sys(name, "removable").as_deref() == Some("1");
        let removable = removable_flag || matches!(bus, Some("USB") | Some("SD"));

        let vendor = self.read_sys(name, "device/vendor");
        let model = self
            .read_sys(name, "device/model")
            .or_else(|| self.read_sys(name, "device/name"));
        let label = match (&vendor, &model) {
            (Some(v), Some(m)) => format!("{} {}", v, m),
            (None, Some(m)) => m.clone(),
            (Some(v), None) => v.clone(),
            (None, None) => name.to_string(),
        };

        let device_path = PathBuf::from("/dev").join(name);
        let mut partitions = self.partitions(name, mounts);
        partitions.sort_by_key(|p| p.number);

        let whole_disk_mount = mounts.get(&device_path);
        let mounted = whole_disk_mount.is_some() || partitions.iter().any(|p| p.mount_point.is_some());

        let is_system = partitions
            .iter()
            .filter_map(|p| p.mount_point.as_deref())
            .chain(whole_disk_mount.map(|m| m.mount_point.as_path()))
            .any(|mp| SYSTEM_MOUNTS.iter().any(|s| mp == Path::new(s)))
            || swaps
                .iter()
                .any(|s| *s == device_path || partitions.iter().any(|p| p.path == *s));

        let free_bytes = partitions
            .iter()
            .filter_map(|p| p.mount_point.as_deref())
            .filter_map(free_space)
            .reduce(|a, b| a + b);

        Some(DeviceDescriptor {
            id: name.to_string(),
            path: device_path,
            label,
            model,
            bus: bus.map(str::to_string),
            total_bytes,
            free_bytes,
            removable,
            is_system,
            mounted,
            partitions,
        })
    }

    fn partitions(&self, name: &str, mounts: &HashMap<PathBuf, MountInfo>) -> Vec<PartitionInfo> {
        let Ok(entries) = fs::read_dir(self.sys_block.join(name)) else {
            return Vec::new();
        };

        entries
            .flatten()
            .filter_map(|entry| {
                let part_name = entry.file_name().to_string_lossy().to_string();
                if !part_name.starts_with(name) {
                    return None;
                }
                let number: u32 = fs::read_to_string(entry.path().join("partition"))
                    .ok()?
                    .trim()
                    .parse()
                    .ok()?;

                let path = PathBuf::from("/dev").join(&part_name);
                let udev = udev_properties(&entry.path());
                let mount = mounts.get(&path);
                let fs_kind = mount
                    .map(|m| m.fs_type.clone())
                    .or_else(|| udev.get("ID_FS_TYPE").cloned());
                let label = udev.get("ID_FS_LABEL").cloned();

                Some(PartitionInfo {
                    number,
                    is_boot: PartitionInfo::looks_like_boot(
                        number,
                        fs_kind.as_deref(),
                        label.as_deref(),
                    ),
                    path,
                    fs_kind,
                    label,
                    mount_point: mount.map(|m| m.mount_point.clone()),
                })
            })
            .collect()
    }
}

impl Default for LinuxEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceEnumerator for LinuxEnumerator {
    fn platform(&self) -> &'static str {
        "linux"
    }

    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        let mounts = read_mounts();
        let swaps = read_swaps();
        let entries = fs::read_dir(&self.sys_block).map_err(|source| DeviceError::Io {
            path: self.sys_block.clone(),
            source,
        })?;

        let mut devices: Vec<DeviceDescriptor> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                if SKIPPED_PREFIXES.iter().any(|p| name.starts_with(p)) {
                    return None;
                }
                self.describe(&name, &mounts, &swaps)
            })
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));

        log_debug!(MODULE, "Found {} block devices", devices.len());
        Ok(devices)
    }

    fn unmount(&self, device: &DeviceDescriptor) -> Result<(), DeviceError> {
        for partition in device.mounted_partitions() {
            let dev = partition.path.to_string_lossy();
            log_info!(MODULE, "Unmounting {}", dev);
            let udisks = run_command(
                "udisksctl",
                &["unmount", "-b", &dev, "--no-user-interaction"],
            );
            if udisks.is_err() {
                run_command("umount", &[&dev]).map_err(|e| {
                    DeviceError::Busy(format!("cannot unmount {}: {}", dev, e))
                })?;
            }
        }
        Ok(())
    }

    fn sync(&self, device: &DeviceDescriptor) -> Result<(), DeviceError> {
        log_debug!(MODULE, "Syncing {}", device.path.display());
        let file = fs::OpenOptions::new()
            .read(true)
            .open(&device.path)
            .map_err(|source| DeviceError::Io {
                path: device.path.clone(),
                source,
            })?;
        file.sync_all().map_err(|source| DeviceError::Io {
            path: device.path.clone(),
            source,
        })?;
        unsafe { libc::sync() };
        Ok(())
    }

    fn reread_partitions(&self, device: &DeviceDescriptor) -> Result<(), DeviceError> {
        let file = fs::OpenOptions::new()
            .read(true)
            .open(&device.path)
            .map_err(|source| DeviceError::Io {
                path: device.path.clone(),
                source,
            })?;

        let result = unsafe { libc::ioctl(file.as_raw_fd(), BLKRRPART as _) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            log_warn!(MODULE, "BLKRRPART failed on {}: {}", device.path.display(), err);
            let path = device.path.to_string_lossy();
            run_command("partprobe", &[&path])?;
        }

        // Give udev a moment to create partition nodes
        let _ = run_command("udevadm", &["settle", "--timeout=10"]);
        Ok(())
    }

    fn mount_boot(&self, device: &DeviceDescriptor) -> Result<BootMount, DeviceError> {
        let device = self.refresh_device(&device.id)?;
        let boot = device
            .boot_partition()
            .ok_or_else(|| DeviceError::NoBootPartition(device.id.clone()))?;

        if let Some(mount_point) = &boot.mount_point {
            log_info!(MODULE, "Boot partition already mounted at {}", mount_point.display());
            return Ok(BootMount {
                device_id: device.id.clone(),
                partition: boot.path.clone(),
                path: mount_point.clone(),
                mounted_by_us: false,
            });
        }

        let dev = boot.path.to_string_lossy().to_string();
        if let Ok(out) = run_command("udisksctl", &["mount", "-b", &dev, "--no-user-interaction"]) {
            if let Some(path) = parse_udisks_mount(&out) {
                log_info!(MODULE, "Mounted {} at {}", dev, path.display());
                return Ok(BootMount {
                    device_id: device.id.clone(),
                    partition: boot.path.clone(),
                    path,
                    mounted_by_us: true,
                });
            }
        }

        let target = std::env::temp_dir().join(format!("flashkit-boot-{}", device.id));
        fs::create_dir_all(&target).map_err(|source| DeviceError::Io {
            path: target.clone(),
            source,
        })?;
        let target_str = target.to_string_lossy().to_string();
        run_command("mount", &[&dev, &target_str])?;
        log_info!(MODULE, "Mounted {} at {}", dev, target.display());

        Ok(BootMount {
            device_id: device.id.clone(),
            partition: boot.path.clone(),
            path: target,
            mounted_by_us: true,
        })
    }

    fn release_boot(&self, mount: &BootMount) -> Result<(), DeviceError> {
        if !mount.mounted_by_us {
            return Ok(());
        }
        let dev = mount.partition.to_string_lossy();
        if run_command("udisksctl", &["unmount", "-b", &dev, "--no-user-interaction"]).is_err() {
            let path = mount.path.to_string_lossy();
            run_command("umount", &[&path])?;
        }
        if mount.path.starts_with(std::env::temp_dir()) {
            let _ = fs::remove_dir(&mount.path);
        }
        Ok(())
    }
}

/// Decode the octal escapes `/proc/mounts` uses for spaces and tabs
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(value) = u8::from_str_radix(digits, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

fn parse_mounts(content: &str) -> HashMap<PathBuf, MountInfo> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            if !device.starts_with("/dev/") {
                return None;
            }
            Some((
                PathBuf::from(unescape_mount_field(device)),
                MountInfo {
                    mount_point: PathBuf::from(unescape_mount_field(mount_point)),
                    fs_type: fs_type.to_string(),
                },
            ))
        })
        .collect()
}

fn read_mounts() -> HashMap<PathBuf, MountInfo> {
    fs::read_to_string("/proc/mounts")
        .map(|c| parse_mounts(&c))
        .unwrap_or_default()
}

fn read_swaps() -> Vec<PathBuf> {
    fs::read_to_string("/proc/swaps")
        .map(|content| {
            content
                .lines()
                .skip(1)
                .filter_map(|l| l.split_whitespace().next())
                .map(PathBuf::from)
                .collect()
        })
        .unwrap_or_default()
}

/// `E:KEY=VALUE` lines from `/run/udev/data/b<major>:<minor>`
fn udev_properties(sys_partition: &Path) -> HashMap<String, String> {
    let Some(dev) = fs::read_to_string(sys_partition.join("dev")).ok() else {
        return HashMap::new();
    };
    let db = PathBuf::from(format!("/run/udev/data/b{}", dev.trim()));
    fs::read_to_string(db)
        .map(|content| parse_udev_db(&content))
        .unwrap_or_default()
}

fn parse_udev_db(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .filter_map(|line| line.strip_prefix("E:"))
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// `Mounted /dev/sdb1 at /media/user/bootfs` (trailing `.` on older udisks)
fn parse_udisks_mount(output: &str) -> Option<PathBuf> {
    let (_, path) = output.trim().split_once(" at ")?;
    Some(PathBuf::from(path.trim_end_matches('.')))
}

fn free_space(mount_point: &Path) -> Option<u64> {
    let c_path = CString::new(mount_point.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if result != 0 {
        return None;
    }
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}
