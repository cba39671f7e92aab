//! macOS target handling

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

pub(super) fn open_target(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().write(true).open(path)
}

/// `fsync` on macOS stops at the drive cache; F_FULLFSYNC reaches the media
pub(super) fn finalize(file: &File) -> std::io::Result<()> {
    let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
    if result == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
