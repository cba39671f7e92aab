//! Windows target handling

use std::fs::{File, OpenOptions};
use std::os::windows::fs::OpenOptionsExt;
use std::path::Path;

use windows_sys::Win32::Storage::FileSystem::{FILE_SHARE_READ, FILE_SHARE_WRITE};

pub(super) fn open_target(path: &Path) -> std::io::Result<File> {
    // Physical drives must be shared or the open fails while Explorer holds a handle
    OpenOptions::new()
        .read(true)
        .write(true)
        .share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE)
        .open(path)
}

pub(super) fn finalize(_file: &File) -> std::io::Result<()> {
    // sync_all already issued FlushFileBuffers
    Ok(())
}
