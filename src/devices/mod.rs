//! Device enumeration
//!
//! One [`DeviceEnumerator`] implementation per target OS, chosen at startup
//! from the build target or the `platform` config key. Every call re-queries
//! the OS; nothing is cached between calls.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
pub mod mock;
mod types;
#[cfg(target_os = "windows")]
mod windows;

pub use types::{BootMount, DeviceDescriptor, PartitionInfo};

use std::path::PathBuf;
use std::process::Command;

use thiserror::Error;

use crate::config::PlatformChoice;
use crate::{log_debug, log_info, log_warn};

const MODULE: &str = "devices";

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Device not found: {0}")]
    NotFound(String),
    #[error("Device is busy: {0}")]
    Busy(String),
    #[error("No boot partition found on {0}")]
    NoBootPartition(String),
    #[error("{command} failed: {reason}")]
    Command { command: String, reason: String },
    #[error("Device I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Device enumeration for {0} is not available in this build")]
    Unsupported(&'static str),
}

/// Platform access to removable media
pub trait DeviceEnumerator: Send + Sync {
    /// Backend name for logs
    fn platform(&self) -> &'static str;

    /// Query the OS for all candidate devices
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError>;

    /// Re-query a single device
    fn refresh_device(&self, id: &str) -> Result<DeviceDescriptor, DeviceError> {
        self.list_devices()?
            .into_iter()
            .find(|d| d.id == id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))
    }

    /// Unmount every mounted partition of `device`
    fn unmount(&self, device: &DeviceDescriptor) -> Result<(), DeviceError>;

    /// Flush OS caches for `device`
    fn sync(&self, device: &DeviceDescriptor) -> Result<(), DeviceError>;

    /// Ask the kernel to re-read the partition table after a write
    fn reread_partitions(&self, device: &DeviceDescriptor) -> Result<(), DeviceError>;

    /// Mount the boot partition read-write, reusing an existing mount
    fn mount_boot(&self, device: &DeviceDescriptor) -> Result<BootMount, DeviceError>;

    /// Undo [`DeviceEnumerator::mount_boot`]
    fn release_boot(&self, mount: &BootMount) -> Result<(), DeviceError>;

    /// Re-confirm a device right before a destructive write and unmount it
    ///
    /// Fails with `NotFound` if the device vanished and `Busy` if partitions
    /// stay mounted.
    fn prepare_for_write(&self, id: &str) -> Result<DeviceDescriptor, DeviceError> {
        let device = self.refresh_device(id)?;
        if !device.mounted {
            return Ok(device);
        }

        log_info!(MODULE, "Unmounting partitions of {}", id);
        self.unmount(&device)
            .map_err(|e| DeviceError::Busy(format!("{}: {}", id, e)))?;

        let device = self.refresh_device(id)?;
        if device.mounted {
            return Err(DeviceError::Busy(format!(
                "{} still has mounted partitions",
                id
            )));
        }
        Ok(device)
    }
}

/// Enumerator for the requested platform
pub fn platform_enumerator(
    choice: PlatformChoice,
) -> Result<Box<dyn DeviceEnumerator>, DeviceError> {
    let choice = match choice {
        PlatformChoice::Auto if cfg!(target_os = "linux") => PlatformChoice::Linux,
        PlatformChoice::Auto if cfg!(target_os = "macos") => PlatformChoice::Macos,
        PlatformChoice::Auto if cfg!(target_os = "windows") => PlatformChoice::Windows,
        other => other,
    };

    match choice {
        #[cfg(target_os = "linux")]
        PlatformChoice::Linux => Ok(Box::new(linux::LinuxEnumerator::new())),
        #[cfg(target_os = "macos")]
        PlatformChoice::Macos => Ok(Box::new(macos::MacosEnumerator::new())),
        #[cfg(target_os = "windows")]
        PlatformChoice::Windows => Ok(Box::new(windows::WindowsEnumerator::new())),
        PlatformChoice::Linux => Err(DeviceError::Unsupported("linux")),
        PlatformChoice::Macos => Err(DeviceError::Unsupported("macos")),
        PlatformChoice::Windows => Err(DeviceError::Unsupported("windows")),
        PlatformChoice::Auto => Err(DeviceError::Unsupported("this platform")),
    }
}

/// Run a helper command, returning stdout on success
#[cfg_attr(target_os = "windows", allow(dead_code))]
pub(crate) fn run_command(program: &str, args: &[&str]) -> Result<String, DeviceError> {
    let command = format!("{} {}", program, args.join(" "));
    log_debug!(MODULE, "Running: {}", command);

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| DeviceError::Command {
            command: command.clone(),
            reason: e.to_string(),
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        log_warn!(MODULE, "{} failed: {}", command, stderr);
        Err(DeviceError::Command {
            command,
            reason: stderr,
        })
    }
}
