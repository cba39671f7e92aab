//! File-backed mock devices
//!
//! Each device is a regular file of the declared capacity plus a directory
//! standing in for its mounted boot partition. Used by tests and by CLI runs
//! against `--mock-dir`.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{BootMount, DeviceDescriptor, DeviceEnumerator, DeviceError, PartitionInfo};
use crate::log_debug;

const MODULE: &str = "devices::mock";

#[derive(Debug, Clone)]
struct MockDevice {
    id: String,
    capacity: u64,
    removable: bool,
    mounted: bool,
    busy: bool,
    present: bool,
}

/// Enumerator over file-backed devices in one directory
#[derive(Debug)]
pub struct MockEnumerator {
    root: PathBuf,
    devices: Mutex<Vec<MockDevice>>,
}

impl MockEnumerator {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, DeviceError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| DeviceError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self {
            root,
            devices: Mutex::new(Vec::new()),
        })
    }

    /// Pick up existing `<id>.img` files in `root` as removable devices
    pub fn from_dir(root: impl Into<PathBuf>) -> Result<Self, DeviceError> {
        let enumerator = Self::new(root)?;
        let entries = std::fs::read_dir(&enumerator.root).map_err(|source| DeviceError::Io {
            path: enumerator.root.clone(),
            source,
        })?;

        let mut found = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("img") {
                continue;
            }
            let (Some(id), Ok(meta)) = (
                path.file_stem().and_then(|s| s.to_str()),
                entry.metadata(),
            ) else {
                continue;
            };
            found.push(MockDevice {
                id: id.to_string(),
                capacity: meta.len(),
                removable: true,
                mounted: false,
                busy: false,
                present: true,
            });
        }
        found.sort_by(|a, b| a.id.cmp(&b.id));
        *enumerator.lock() = found;
        Ok(enumerator)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<MockDevice>> {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn device_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.img", id))
    }

    pub fn boot_dir(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}-boot", id))
    }

    /// Create a zero-filled device of `capacity` bytes
    pub fn add_device(
        &self,
        id: &str,
        capacity: u64,
        removable: bool,
    ) -> Result<DeviceDescriptor, DeviceError> {
        let path = self.device_path(id);
        let io_err = |source| DeviceError::Io {
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(io_err)?;
        file.set_len(capacity).map_err(io_err)?;

        self.lock().push(MockDevice {
            id: id.to_string(),
            capacity,
            removable,
            mounted: false,
            busy: false,
            present: true,
        });
        log_debug!(MODULE, "Added mock device {} ({} bytes)", id, capacity);
        self.refresh_device(id)
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut MockDevice)) -> Result<(), DeviceError> {
        let mut devices = self.lock();
        let device = devices
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;
        f(device);
        Ok(())
    }

    pub fn set_mounted(&self, id: &str, mounted: bool) -> Result<(), DeviceError> {
        self.update(id, |d| d.mounted = mounted)
    }

    /// A busy device refuses to unmount
    pub fn set_busy(&self, id: &str, busy: bool) -> Result<(), DeviceError> {
        self.update(id, |d| d.busy = busy)
    }

    /// Simulate removal of the card
    pub fn eject(&self, id: &str) -> Result<(), DeviceError> {
        self.update(id, |d| d.present = false)
    }

    fn describe(&self, device: &MockDevice) -> DeviceDescriptor {
        let boot_mount = device.mounted.then(|| self.boot_dir(&device.id));
        let partitions = vec![
            PartitionInfo {
                number: 1,
                path: self.root.join(format!("{}p1", device.id)),
                fs_kind: Some("vfat".to_string()),
                label: Some("bootfs".to_string()),
                is_boot: true,
                mount_point: boot_mount,
            },
            PartitionInfo {
                number: 2,
                path: self.root.join(format!("{}p2", device.id)),
                fs_kind: Some("ext4".to_string()),
                label: Some("rootfs".to_string()),
                is_boot: false,
                mount_point: None,
            },
        ];

        DeviceDescriptor {
            id: device.id.clone(),
            path: self.device_path(&device.id),
            label: format!("Mock Card {}", device.id),
            model: Some("Mock SD".to_string()),
            bus: Some("SD".to_string()),
            total_bytes: device.capacity,
            free_bytes: None,
            removable: device.removable,
            is_system: false,
            mounted: device.mounted,
            partitions,
        }
    }
}

impl DeviceEnumerator for MockEnumerator {
    fn platform(&self) -> &'static str {
        "mock"
    }

    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        let devices = self.lock().clone();
        Ok(devices
            .iter()
            .filter(|d| d.present && self.device_path(&d.id).exists())
            .map(|d| self.describe(d))
            .collect())
    }

    fn unmount(&self, device: &DeviceDescriptor) -> Result<(), DeviceError> {
        let mut devices = self.lock();
        let mock = devices
            .iter_mut()
            .find(|d| d.id == device.id && d.present)
            .ok_or_else(|| DeviceError::NotFound(device.id.clone()))?;
        if mock.busy {
            return Err(DeviceError::Busy(format!(
                "{} is in use by another process",
                device.id
            )));
        }
        mock.mounted = false;
        Ok(())
    }

    fn sync(&self, _device: &DeviceDescriptor) -> Result<(), DeviceError> {
        Ok(())
    }

    fn reread_partitions(&self, _device: &DeviceDescriptor) -> Result<(), DeviceError> {
        Ok(())
    }

    fn mount_boot(&self, device: &DeviceDescriptor) -> Result<BootMount, DeviceError> {
        let current = self.refresh_device(&device.id)?;
        let dir = self.boot_dir(&device.id);
        std::fs::create_dir_all(&dir).map_err(|source| DeviceError::Io {
            path: dir.clone(),
            source,
        })?;
        self.set_mounted(&device.id, true)?;

        Ok(BootMount {
            device_id: device.id.clone(),
            partition: self.root.join(format!("{}p1", device.id)),
            path: dir,
            mounted_by_us: !current.mounted,
        })
    }

    fn release_boot(&self, mount: &BootMount) -> Result<(), DeviceError> {
        if mount.mounted_by_us {
            self.set_mounted(&mount.device_id, false)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_reflects_file_and_flags() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockEnumerator::new(dir.path()).unwrap();
        mock.add_device("card", 4096, true).unwrap();
        mock.add_device("disk", 8192, false).unwrap();

        let devices = mock.list_devices().unwrap();
        assert_eq!(devices.len(), 2);
        let card = &devices[0];
        assert_eq!(card.total_bytes, 4096);
        assert!(card.removable);
        assert_eq!(card.boot_partition().unwrap().number, 1);
        assert!(!devices[1].removable);
        assert_eq!(std::fs::metadata(&card.path).unwrap().len(), 4096);
    }

    #[test]
    fn test_ejected_device_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockEnumerator::new(dir.path()).unwrap();
        mock.add_device("card", 4096, true).unwrap();
        mock.eject("card").unwrap();
        assert!(matches!(
            mock.refresh_device("card"),
            Err(DeviceError::NotFound(_))
        ));
    }

    #[test]
    fn test_boot_mount_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockEnumerator::new(dir.path()).unwrap();
        let device = mock.add_device("card", 4096, true).unwrap();

        let mount = mock.mount_boot(&device).unwrap();
        assert!(mount.mounted_by_us);
        assert!(mount.path.is_dir());
        assert!(mock.refresh_device("card").unwrap().mounted);

        mock.release_boot(&mount).unwrap();
        assert!(!mock.refresh_device("card").unwrap().mounted);
    }

    #[test]
    fn test_from_dir_discovers_images() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.img"), vec![0u8; 512]).unwrap();
        std::fs::write(dir.path().join("a.img"), vec![0u8; 1024]).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let mock = MockEnumerator::from_dir(dir.path()).unwrap();
        let ids: Vec<String> = mock.list_devices().unwrap().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
