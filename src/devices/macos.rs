//! macOS device detection via `diskutil`

use std::collections::HashMap;
use std::path::PathBuf;

use super::{run_command, BootMount, DeviceDescriptor, DeviceEnumerator, DeviceError, PartitionInfo};
use crate::{log_debug, log_info};

const MODULE: &str = "devices::macos";

pub struct MacosEnumerator;

impl MacosEnumerator {
    pub fn new() -> Self {
        Self
    }

    fn info(&self, identifier: &str) -> Result<HashMap<String, String>, DeviceError> {
        run_command("diskutil", &["info", identifier]).map(|out| parse_info(&out))
    }

    fn describe(&self, disk: &str, slices: &[String]) -> Option<DeviceDescriptor> {
        let info = self.info(disk).ok()?;
        let total_bytes = info.get("Disk Size").and_then(|s| parse_bytes(s))?;
        if total_bytes == 0 {
            return None;
        }

        let protocol = info.get("Protocol").cloned();
        let removable = info
            .get("Removable Media")
            .map(|v| v == "Removable" || v == "Yes")
            .unwrap_or(false)
            || info.get("Device Location").map(|v| v == "External").unwrap_or(false)
            || matches!(protocol.as_deref(), Some("USB") | Some("Secure Digital"));
        let model = info.get("Device / Media Name").cloned();

        let partitions: Vec<PartitionInfo> = slices
            .iter()
            .filter_map(|slice| {
                let number: u32 = slice.rsplit('s').next()?.parse().ok()?;
                let info = self.info(slice).ok()?;
                let fs_kind = info
                    .get("Type (Bundle)")
                    .or_else(|| info.get("File System Personality"))
                    .cloned();
                let label = info.get("Volume Name").cloned().filter(|v| !v.is_empty());
                let mount_point = info
                    .get("Mount Point")
                    .filter(|v| !v.is_empty() && !v.starts_with("Not"))
                    .map(PathBuf::from);
                Some(PartitionInfo {
                    number,
                    path: PathBuf::from(format!("/dev/{}", slice)),
                    is_boot: PartitionInfo::looks_like_boot(
                        number,
                        fs_kind.as_deref(),
                        label.as_deref(),
                    ),
                    fs_kind,
                    label,
                    mount_point,
                })
            })
            .collect();

        let is_system = partitions
            .iter()
            .any(|p| p.mount_point.as_deref() == Some(std::path::Path::new("/")));
        let mounted = partitions.iter().any(|p| p.mount_point.is_some());

        Some(DeviceDescriptor {
            id: disk.to_string(),
            // Raw node bypasses the buffer cache
            path: PathBuf::from(format!("/dev/r{}", disk)),
            label: model.clone().unwrap_or_else(|| disk.to_string()),
            model,
            bus: protocol,
            total_bytes,
            free_bytes: None,
            removable,
            is_system,
            mounted,
            partitions,
        })
    }
}

impl Default for MacosEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceEnumerator for MacosEnumerator {
    fn platform(&self) -> &'static str {
        "macos"
    }

    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        let listing = run_command("diskutil", &["list", "physical"])?;
        let disks = parse_list(&listing);
        let devices: Vec<DeviceDescriptor> = disks
            .iter()
            .filter_map(|(disk, slices)| self.describe(disk, slices))
            .collect();
        log_debug!(MODULE, "Found {} disks", devices.len());
        Ok(devices)
    }

    fn unmount(&self, device: &DeviceDescriptor) -> Result<(), DeviceError> {
        log_info!(MODULE, "Unmounting {}", device.id);
        run_command("diskutil", &["unmountDisk", &format!("/dev/{}", device.id)])
            .map(|_| ())
            .map_err(|e| DeviceError::Busy(e.to_string()))
    }

    fn sync(&self, _device: &DeviceDescriptor) -> Result<(), DeviceError> {
        unsafe { libc::sync() };
        Ok(())
    }

    fn reread_partitions(&self, _device: &DeviceDescriptor) -> Result<(), DeviceError> {
        // diskarbitrationd probes the new table on its own
        Ok(())
    }

    fn mount_boot(&self, device: &DeviceDescriptor) -> Result<BootMount, DeviceError> {
        let device = self.refresh_device(&device.id)?;
        let boot = device
            .boot_partition()
            .ok_or_else(|| DeviceError::NoBootPartition(device.id.clone()))?;

        let mut mounted_by_us = false;
        if boot.mount_point.is_none() {
            let slice = boot.path.to_string_lossy().to_string();
            run_command("diskutil", &["mount", &slice])?;
            mounted_by_us = true;
        }

        let slice = boot.path.to_string_lossy().to_string();
        let path = self
            .info(&slice)?
            .get("Mount Point")
            .filter(|v| !v.is_empty() && !v.starts_with("Not"))
            .map(PathBuf::from)
            .ok_or_else(|| DeviceError::Command {
                command: format!("diskutil mount {}", slice),
                reason: "no mount point reported".to_string(),
            })?;

        Ok(BootMount {
            device_id: device.id.clone(),
            partition: boot.path.clone(),
            path,
            mounted_by_us,
        })
    }

    fn release_boot(&self, mount: &BootMount) -> Result<(), DeviceError> {
        if mount.mounted_by_us {
            let slice = mount.partition.to_string_lossy();
            run_command("diskutil", &["unmount", &slice])?;
        }
        Ok(())
    }
}

/// `Key:   Value` lines from `diskutil info`
fn parse_info(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// `15.9 GB (15931539456 Bytes) (exactly 31116288 512-Byte-Units)`
fn parse_bytes(value: &str) -> Option<u64> {
    let start = value.find('(')? + 1;
    let rest = &value[start..];
    let end = rest.find(' ')?;
    rest[..end].parse().ok()
}

/// Disk identifiers with their slices from `diskutil list`
fn parse_list(output: &str) -> Vec<(String, Vec<String>)> {
    let mut disks: Vec<(String, Vec<String>)> = Vec::new();
    for line in output.lines() {
        if let Some(header) = line.strip_prefix("/dev/") {
            let disk = header.split_whitespace().next().unwrap_or("").to_string();
            if !disk.is_empty() {
                disks.push((disk, Vec::new()));
            }
            continue;
        }
        let Some(identifier) = line.split_whitespace().last() else {
            continue;
        };
        if let Some((disk, slices)) = disks.last_mut() {
            if identifier.starts_with(disk.as_str()) && identifier.len() > disk.len() {
                slices.push(identifier.to_string());
            }
        }
    }
    disks
}
