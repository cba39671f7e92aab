//! Linux target handling
//!
//! Block devices are opened with `O_EXCL`, which the kernel refuses while any
//! partition is mounted or claimed, so a stale mount fails the open instead of
//! corrupting the card.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::log_debug;

const MODULE: &str = "flash::linux";

/// BLKFLSBUF ioctl: drop the buffer cache for the device
const BLKFLSBUF: libc::c_ulong = 0x1261;

pub(super) fn open_target(path: &Path) -> std::io::Result<File> {
    let is_block = std::fs::metadata(path)?.file_type().is_block_device();
    let mut options = OpenOptions::new();
    options.write(true);
    if is_block {
        log_debug!(MODULE, "Opening block device {} exclusively", path.display());
        options.custom_flags(libc::O_EXCL);
    }
    options.open(path)
}

pub(super) fn finalize(file: &File) -> std::io::Result<()> {
    if !file.metadata()?.file_type().is_block_device() {
        return Ok(());
    }
    let result = unsafe { libc::ioctl(file.as_raw_fd(), BLKFLSBUF as _) };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
