//! Windows device detection using native Win32 APIs

use std::ffi::c_void;
use std::mem;
use std::path::PathBuf;

use windows_sys::Win32::{
    Foundation::{CloseHandle, GetLastError, GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE},
    Storage::FileSystem::{
        CreateFileW, FlushFileBuffers, GetVolumeInformationW, FILE_SHARE_READ, FILE_SHARE_WRITE,
        OPEN_EXISTING,
    },
    System::Ioctl::IOCTL_DISK_GET_DRIVE_GEOMETRY_EX,
    System::IO::DeviceIoControl,
};

use super::{BootMount, DeviceDescriptor, DeviceEnumerator, DeviceError, PartitionInfo};
use crate::{log_debug, log_error, log_info, log_warn};

const MODULE: &str = "devices::windows";

// ===== IOCTL Codes =====

const IOCTL_VOLUME_GET_VOLUME_DISK_EXTENTS: u32 = 0x00560000;
const IOCTL_STORAGE_QUERY_PROPERTY: u32 = 0x002D1400;
const IOCTL_DISK_UPDATE_PROPERTIES: u32 = 0x00070140;
const FSCTL_LOCK_VOLUME: u32 = 0x00090018;
const FSCTL_DISMOUNT_VOLUME: u32 = 0x00090020;

// ===== Storage Property Constants =====

const STORAGE_DEVICE_PROPERTY: u32 = 0;
const PROPERTY_STANDARD_QUERY: u32 = 0;

/// Win32 errors meaning "no such drive"
const MISSING_DRIVE_ERRORS: &[u32] = &[1, 2, 5, 21];

// ===== Structures =====

/// STORAGE_PROPERTY_QUERY - matches winioctl.h layout
#[repr(C)]
#[allow(dead_code)]
struct StoragePropertyQuery {
    property_id: u32,
    query_type: u32,
    additional_parameters: [u8; 1],
}

/// DISK_GEOMETRY_EX - returned by IOCTL_DISK_GET_DRIVE_GEOMETRY_EX
#[repr(C)]
#[allow(dead_code)]
struct DiskGeometryEx {
    geometry: DiskGeometry,
    disk_size: u64,
    data: [u8; 1],
}

#[repr(C)]
#[allow(dead_code)]
struct DiskGeometry {
    cylinders: i64,
    media_type: u32,
    tracks_per_cylinder: u32,
    sectors_per_track: u32,
    bytes_per_sector: u32,
}

/// VOLUME_DISK_EXTENT - maps a volume extent to a physical disk
#[repr(C)]
#[allow(dead_code)]
struct VolumeDiskExtent {
    disk_number: u32,
    starting_offset: u64,
    extent_length: u64,
}

#[repr(C)]
#[allow(dead_code)]
struct VolumeDiskExtents {
    number_of_extents: u32,
    extents: [VolumeDiskExtent; 1],
}

extern "system" {
    fn GetLogicalDrives() -> u32;
}

/// Converts a string path to UTF-16 null-terminated vector for Win32 APIs
fn to_utf16(path: &str) -> Vec<u16> {
    path.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Owned Win32 handle, closed on drop
struct Handle(HANDLE);

impl Drop for Handle {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0) };
    }
}

/// Open a device or volume, returning the Win32 error code on failure
fn open_device(path: &str, access: u32) -> Result<Handle, u32> {
    let path_utf16 = to_utf16(path);
    let handle = unsafe {
        CreateFileW(
            path_utf16.as_ptr(),
            access,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            std::ptr::null(),
            OPEN_EXISTING,
            0,
            std::ptr::null_mut(),
        )
    };

    if handle == INVALID_HANDLE_VALUE {
        Err(unsafe { GetLastError() })
    } else {
        Ok(Handle(handle))
    }
}

/// DeviceIoControl wrapper; returns bytes written to `out` on success
fn ioctl(handle: &Handle, code: u32, input: Option<&[u8]>, out: &mut [u8]) -> Option<u32> {
    let mut bytes_returned = 0u32;
    let (in_ptr, in_len) = match input {
        Some(buf) => (buf.as_ptr() as *const c_void, buf.len() as u32),
        None => (std::ptr::null(), 0),
    };
    let result = unsafe {
        DeviceIoControl(
            handle.0,
            code,
            in_ptr,
            in_len,
            if out.is_empty() {
                std::ptr::null_mut()
            } else {
                out.as_mut_ptr() as *mut c_void
            },
            out.len() as u32,
            &mut bytes_returned,
            std::ptr::null_mut(),
        )
    };
    (result != 0).then_some(bytes_returned)
}

/// Maps STORAGE_BUS_TYPE enum byte to human-readable string
fn bus_type_to_string(bus_type_enum: u8) -> Option<&'static str> {
    const BUS_TYPE_MAP: &[(&str, u8)] = &[
        ("Unknown", 0x00),
        ("SCSI", 0x01),
        ("ATAPI", 0x02),
        ("ATA", 0x03),
        ("1394", 0x04),
        ("SSA", 0x05),
        ("Fibre", 0x06),
        ("USB", 0x07),
        ("RAID", 0x08),
        ("iSCSI", 0x09),
        ("SAS", 0x0A),
        ("SATA", 0x0B),
        ("SD", 0x0C),
        ("MMC", 0x0D),
        ("Virtual", 0x0E),
        ("FileBacked", 0x0F),
        ("Spaces", 0x10),
        ("NVMe", 0x11),
        ("SCM", 0x12),
        ("UFS", 0x13),
        ("NVMe-oF", 0x14),
    ];

    BUS_TYPE_MAP
        .iter()
        .find(|(_, code)| *code == bus_type_enum)
        .map(|(name, _)| *name)
}

/// Extracts null-terminated ASCII string from buffer at offset
fn extract_ascii_string(buffer: &[u8], offset: usize) -> Option<String> {
    if offset == 0 || offset >= buffer.len() {
        return None;
    }
    let end = buffer[offset..]
        .iter()
        .position(|&b| b == 0)
        .map(|pos| offset + pos)
        .unwrap_or(buffer.len());
    let text = String::from_utf8_lossy(&buffer[offset..end]).trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// Model, removable flag and bus type via IOCTL_STORAGE_QUERY_PROPERTY
fn query_device_properties(disk_number: u32) -> (Option<String>, bool, Option<String>) {
    const MIN_DESCRIPTOR_SIZE: u32 = 33;
    const PRODUCT_ID_OFFSET: usize = 16;
    const BUS_TYPE_OFFSET: usize = 28;

    let Ok(handle) = open_device(&physical_drive(disk_number), GENERIC_READ) else {
        return (None, false, None);
    };

    let query = StoragePropertyQuery {
        property_id: STORAGE_DEVICE_PROPERTY,
        query_type: PROPERTY_STANDARD_QUERY,
        additional_parameters: [0],
    };
    let query_bytes = unsafe {
        std::slice::from_raw_parts(
            &query as *const StoragePropertyQuery as *const u8,
            mem::size_of::<StoragePropertyQuery>(),
        )
    };

    let mut buffer = [0u8; 2048];
    match ioctl(&handle, IOCTL_STORAGE_QUERY_PROPERTY, Some(query_bytes), &mut buffer) {
        Some(n) if n >= MIN_DESCRIPTOR_SIZE => {}
        _ => return (None, false, None),
    }

    let bus_type = bus_type_to_string(buffer[BUS_TYPE_OFFSET]).map(str::to_string);
    let mut offset_bytes = [0u8; 4];
    offset_bytes.copy_from_slice(&buffer[PRODUCT_ID_OFFSET..PRODUCT_ID_OFFSET + 4]);
    let model = extract_ascii_string(&buffer, u32::from_le_bytes(offset_bytes) as usize);

    let is_removable = match bus_type.as_deref() {
        Some(bt) => bt == "USB" || bt == "SD" || bt == "MMC",
        None => false,
    };

    (model, is_removable, bus_type)
}

fn physical_drive(disk_number: u32) -> String {
    format!("\\\\.\\PhysicalDrive{}", disk_number)
}

fn disk_number_from_id(id: &str) -> Option<u32> {
    id.strip_prefix("PhysicalDrive")?.parse().ok()
}

/// Filesystem name and volume label for a drive letter
fn volume_information(letter: char) -> (Option<String>, Option<String>) {
    let root = to_utf16(&format!("{}:\\", letter));
    let mut name = [0u16; 261];
    let mut fs = [0u16; 261];
    let result = unsafe {
        GetVolumeInformationW(
            root.as_ptr(),
            name.as_mut_ptr(),
            name.len() as u32,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            fs.as_mut_ptr(),
            fs.len() as u32,
        )
    };
    if result == 0 {
        return (None, None);
    }
    let decode = |buf: &[u16]| {
        let end = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
        let s = String::from_utf16_lossy(&buf[..end]);
        (!s.is_empty()).then_some(s)
    };
    (decode(&fs), decode(&name))
}

/// Drive letters mounted on a specific physical disk
fn drive_letters_for_disk(disk_number: u32) -> Vec<char> {
    let drives_mask = unsafe { GetLogicalDrives() };
    if drives_mask == 0 {
        log_error!(MODULE, "GetLogicalDrives failed: {}", unsafe { GetLastError() });
        return Vec::new();
    }

    let mut letters = Vec::new();
    for i in 0..26u8 {
        if (drives_mask & (1 << i)) == 0 {
            continue;
        }
        let letter = (b'A' + i) as char;
        let Ok(handle) = open_device(&format!(r"\\.\{}:", letter), GENERIC_READ) else {
            continue;
        };

        let mut extents_bytes = [0u8; 1024];
        if ioctl(&handle, IOCTL_VOLUME_GET_VOLUME_DISK_EXTENTS, None, &mut extents_bytes).is_none() {
            continue;
        }
        let extents = unsafe { &*(extents_bytes.as_ptr() as *const VolumeDiskExtents) };
        let count = extents.number_of_extents as usize;
        let first = extents.extents.as_ptr();
        let on_disk = (0..count).any(|j| unsafe { (*first.add(j)).disk_number } == disk_number);
        if on_disk {
            letters.push(letter);
        }
    }
    letters
}

fn disk_size(disk_number: u32) -> Result<u64, u32> {
    let handle = open_device(&physical_drive(disk_number), GENERIC_READ)?;
    let mut geometry_bytes = [0u8; 256];
    if ioctl(&handle, IOCTL_DISK_GET_DRIVE_GEOMETRY_EX, None, &mut geometry_bytes).is_none() {
        return Err(unsafe { GetLastError() });
    }
    let geometry = unsafe { &*(geometry_bytes.as_ptr() as *const DiskGeometryEx) };
    Ok(geometry.disk_size)
}

pub struct WindowsEnumerator;

impl WindowsEnumerator {
    pub fn new() -> Self {
        Self
    }

    fn describe(&self, disk_number: u32, size: u64) -> DeviceDescriptor {
        let (model, removable, bus) = query_device_properties(disk_number);
        let letters = drive_letters_for_disk(disk_number);

        let partitions: Vec<PartitionInfo> = letters
            .iter()
            .enumerate()
            .map(|(i, letter)| {
                let (fs_kind, label) = volume_information(*letter);
                let number = i as u32 + 1;
                PartitionInfo {
                    number,
                    path: PathBuf::from(format!(r"\\.\{}:", letter)),
                    is_boot: PartitionInfo::looks_like_boot(
                        number,
                        fs_kind.as_deref(),
                        label.as_deref(),
                    ),
                    fs_kind,
                    label,
                    mount_point: Some(PathBuf::from(format!("{}:\\", letter))),
                }
            })
            .collect();

        let is_system = letters.contains(&'C');
        let label = match letters.is_empty() {
            false => format!(
                "Disk {} ({})",
                disk_number,
                letters
                    .iter()
                    .map(|l| format!("{}:", l))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            true => format!("Disk {}", disk_number),
        };

        DeviceDescriptor {
            id: format!("PhysicalDrive{}", disk_number),
            path: PathBuf::from(physical_drive(disk_number)),
            label,
            model,
            bus,
            total_bytes: size,
            free_bytes: None,
            removable,
            is_system,
            mounted: !partitions.is_empty(),
            partitions,
        }
    }
}

impl Default for WindowsEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceEnumerator for WindowsEnumerator {
    fn platform(&self) -> &'static str {
        "windows"
    }

    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        let mut devices = Vec::new();
        let mut consecutive_errors = 0;
        const MAX_CONSECUTIVE_ERRORS: usize = 4;

        for disk_number in 0..32 {
            let size = match disk_size(disk_number) {
                Ok(size) => {
                    consecutive_errors = 0;
                    size
                }
                Err(err) if MISSING_DRIVE_ERRORS.contains(&err) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        break;
                    }
                    continue;
                }
                Err(err) => {
                    log_error!(MODULE, "Failed to query {}: error {}", physical_drive(disk_number), err);
                    consecutive_errors += 1;
                    continue;
                }
            };
            if size == 0 {
                continue;
            }
            devices.push(self.describe(disk_number, size));
        }

        log_debug!(MODULE, "Found {} physical drives", devices.len());
        Ok(devices)
    }

    fn refresh_device(&self, id: &str) -> Result<DeviceDescriptor, DeviceError> {
        let disk_number =
            disk_number_from_id(id).ok_or_else(|| DeviceError::NotFound(id.to_string()))?;
        match disk_size(disk_number) {
            Ok(size) if size > 0 => Ok(self.describe(disk_number, size)),
            _ => Err(DeviceError::NotFound(id.to_string())),
        }
    }

    fn unmount(&self, device: &DeviceDescriptor) -> Result<(), DeviceError> {
        for partition in device.mounted_partitions() {
            let volume = partition.path.to_string_lossy().to_string();
            log_info!(MODULE, "Dismounting {}", volume);
            let handle = open_device(&volume, GENERIC_READ | GENERIC_WRITE)
                .map_err(|err| DeviceError::Busy(format!("cannot open {}: error {}", volume, err)))?;
            if ioctl(&handle, FSCTL_LOCK_VOLUME, None, &mut []).is_none() {
                return Err(DeviceError::Busy(format!("{} is in use", volume)));
            }
            if ioctl(&handle, FSCTL_DISMOUNT_VOLUME, None, &mut []).is_none() {
                return Err(DeviceError::Busy(format!(
                    "failed to dismount {}: error {}",
                    volume,
                    unsafe { GetLastError() }
                )));
            }
        }
        Ok(())
    }

    fn sync(&self, device: &DeviceDescriptor) -> Result<(), DeviceError> {
        let path = device.path.to_string_lossy().to_string();
        let handle = open_device(&path, GENERIC_READ | GENERIC_WRITE).map_err(|err| {
            DeviceError::Command {
                command: format!("open {}", path),
                reason: format!("error {}", err),
            }
        })?;
        if unsafe { FlushFileBuffers(handle.0) } == 0 {
            log_warn!(MODULE, "FlushFileBuffers failed: {}", unsafe { GetLastError() });
        }
        Ok(())
    }

    fn reread_partitions(&self, device: &DeviceDescriptor) -> Result<(), DeviceError> {
        let path = device.path.to_string_lossy().to_string();
        let handle = open_device(&path, GENERIC_READ | GENERIC_WRITE).map_err(|err| {
            DeviceError::Command {
                command: format!("open {}", path),
                reason: format!("error {}", err),
            }
        })?;
        if ioctl(&handle, IOCTL_DISK_UPDATE_PROPERTIES, None, &mut []).is_none() {
            log_warn!(MODULE, "IOCTL_DISK_UPDATE_PROPERTIES failed: {}", unsafe {
                GetLastError()
            });
        }
        Ok(())
    }

    fn mount_boot(&self, device: &DeviceDescriptor) -> Result<BootMount, DeviceError> {
        // Windows assigns drive letters to FAT volumes on its own after the rescan
        let device = self.refresh_device(&device.id)?;
        let boot = device
            .boot_partition()
            .ok_or_else(|| DeviceError::NoBootPartition(device.id.clone()))?;
        let path = boot
            .mount_point
            .clone()
            .ok_or_else(|| DeviceError::NoBootPartition(device.id.clone()))?;
        Ok(BootMount {
            device_id: device.id.clone(),
            partition: boot.path.clone(),
            path,
            mounted_by_us: false,
        })
    }

    fn release_boot(&self, _mount: &BootMount) -> Result<(), DeviceError> {
        Ok(())
    }
}
