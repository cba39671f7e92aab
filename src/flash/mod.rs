//! Flash module
//!
//! Sequential chunked write of a raw image onto a device's block path.
//!
//! State machine: `Idle -> Writing -> {Completed | Failed | Cancelled}`.
//! There are no retries here; after a terminal state the caller re-checks the
//! device and calls [`BlockWriter::reset`] before trying again.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "windows")]
mod windows;

#[cfg(target_os = "linux")]
use linux as platform;
#[cfg(target_os = "macos")]
use macos as platform;
#[cfg(target_os = "windows")]
use windows as platform;

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::{self, FlashConfig};
use crate::devices::DeviceDescriptor;
use crate::utils::{format_size, CancelToken, ProgressTracker};
use crate::{log_debug, log_error, log_info, log_warn};

const MODULE: &str = "flash";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Idle,
    Writing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("Refusing to write to {0}: not a removable device")]
    NotRemovable(String),
    #[error("Image ({image} bytes) does not fit on device ({capacity} bytes)")]
    ImageTooLarge { image: u64, capacity: u64 },
    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Write failed after {bytes_written} bytes: {reason}")]
    Failed { reason: String, bytes_written: u64 },
    #[error("Write cancelled, {durable_offset} bytes durable")]
    Cancelled { durable_offset: u64 },
    #[error("Writer is {0:?}, expected Idle")]
    InvalidState(WriterState),
}

impl WriteError {
    /// True when no byte reached the device
    pub fn is_guard(&self) -> bool {
        matches!(
            self,
            WriteError::NotRemovable(_)
                | WriteError::ImageTooLarge { .. }
                | WriteError::Open { .. }
                | WriteError::InvalidState(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteProgress {
    pub bytes_written: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Permit fixed or system disks
    pub allow_non_removable: bool,
    pub chunk_size: usize,
    /// Chunks between durable flushes
    pub flush_interval_chunks: u64,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions::from(&FlashConfig::default())
    }
}

impl From<&FlashConfig> for WriteOptions {
    fn from(config: &FlashConfig) -> Self {
        Self {
            allow_non_removable: false,
            chunk_size: config.chunk_size,
            flush_interval_chunks: config.flush_interval_chunks.max(1),
        }
    }
}

/// Writes one image to one device at a time
#[derive(Debug)]
pub struct BlockWriter {
    state: WriterState,
    options: WriteOptions,
}

impl BlockWriter {
    pub fn new(options: WriteOptions) -> Self {
        Self {
            state: WriterState::Idle,
            options,
        }
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Return to `Idle` after a terminal state
    pub fn reset(&mut self) {
        if self.state != WriterState::Writing {
            self.state = WriterState::Idle;
        }
    }

    /// Write `source` to `device`, returning the number of image bytes written
    ///
    /// The final flush runs with cancellation shielded; cancel requests
    /// during it are refused.
    pub fn write(
        &mut self,
        source: &Path,
        device: &DeviceDescriptor,
        cancel: &CancelToken,
        progress: impl FnMut(WriteProgress),
    ) -> Result<u64, WriteError> {
        if self.state != WriterState::Idle {
            return Err(WriteError::InvalidState(self.state));
        }

        if (!device.removable || device.is_system) && !self.options.allow_non_removable {
            log_error!(
                MODULE,
                "Refusing to write to non-removable device {}",
                device.id
            );
            return Err(WriteError::NotRemovable(device.id.clone()));
        }

        let image_size = std::fs::metadata(source)
            .map_err(|source_err| WriteError::Open {
                path: source.to_path_buf(),
                source: source_err,
            })?
            .len();
        if device.total_bytes > 0 && image_size > device.total_bytes {
            log_error!(
                MODULE,
                "Image {} larger than device {}",
                format_size(image_size),
                format_size(device.total_bytes)
            );
            return Err(WriteError::ImageTooLarge {
                image: image_size,
                capacity: device.total_bytes,
            });
        }

        self.state = WriterState::Writing;
        let result = self.write_inner(source, image_size, device, cancel, progress);
        self.state = match &result {
            Ok(_) => WriterState::Completed,
            Err(WriteError::Cancelled { .. }) => WriterState::Cancelled,
            Err(_) => WriterState::Failed,
        };
        result
    }

    fn write_inner(
        &self,
        source: &Path,
        image_size: u64,
        device: &DeviceDescriptor,
        cancel: &CancelToken,
        mut progress: impl FnMut(WriteProgress),
    ) -> Result<u64, WriteError> {
        log_info!(
            MODULE,
            "Starting flash: {} -> {} ({})",
            source.display(),
            device.path.display(),
            format_size(image_size)
        );

        let mut image = File::open(source).map_err(|e| WriteError::Open {
            path: source.to_path_buf(),
            source: e,
        })?;
        let mut target = platform::open_target(&device.path).map_err(|e| WriteError::Open {
            path: device.path.clone(),
            source: e,
        })?;
        let pad_to_sector = target.metadata().map(|m| !m.is_file()).unwrap_or(true);

        let chunk_size = self.options.chunk_size.max(config::flash::SECTOR_SIZE);
        let mut buffer = vec![0u8; chunk_size];
        let mut written = 0u64;
        let mut durable = 0u64;
        let mut chunks = 0u64;
        let mut tracker = ProgressTracker::new(
            "Write",
            MODULE,
            image_size,
            config::logging::FLASH_LOG_INTERVAL_MB,
        );

        let failed = |reason: String, bytes_written: u64| {
            log_error!(MODULE, "Flash failed at {} bytes: {}", bytes_written, reason);
            WriteError::Failed {
                reason,
                bytes_written,
            }
        };

        progress(WriteProgress {
            bytes_written: 0,
            total_bytes: image_size,
        });

        while written < image_size {
            if cancel.is_cancelled() {
                log_info!(MODULE, "Write cancelled, {} bytes durable", durable);
                return Err(WriteError::Cancelled {
                    durable_offset: durable,
                });
            }

            let n = read_chunk(&mut image, &mut buffer)
                .map_err(|e| failed(format!("read from image: {}", e), written))?;
            if n == 0 {
                return Err(failed(
                    format!("image ended at {} of {} bytes", written, image_size),
                    written,
                ));
            }

            let len = if pad_to_sector && n % config::flash::SECTOR_SIZE != 0 {
                let padded = n.div_ceil(config::flash::SECTOR_SIZE) * config::flash::SECTOR_SIZE;
                buffer[n..padded].fill(0);
                padded
            } else {
                n
            };

            target
                .write_all(&buffer[..len])
                .map_err(|e| failed(e.to_string(), written))?;
            written += n as u64;
            chunks += 1;
            tracker.update(n as u64);

            if chunks % self.options.flush_interval_chunks == 0 {
                target
                    .sync_data()
                    .map_err(|e| failed(format!("flush: {}", e), written))?;
                durable = written;
                log_debug!(MODULE, "Durable at {} bytes", durable);
            }

            progress(WriteProgress {
                bytes_written: written,
                total_bytes: image_size,
            });
        }

        let Some(_shield) = cancel.shield() else {
            log_info!(MODULE, "Write cancelled before final flush");
            return Err(WriteError::Cancelled {
                durable_offset: durable,
            });
        };

        log_info!(MODULE, "Write complete, syncing device...");
        target
            .flush()
            .and_then(|_| target.sync_all())
            .map_err(|e| failed(format!("final flush: {}", e), written))?;
        if let Err(e) = platform::finalize(&target) {
            log_warn!(MODULE, "Device cache flush failed: {}", e);
        }

        tracker.finish();
        log_info!(MODULE, "Flash complete!");
        Ok(written)
    }
}

/// Fill `buffer` unless EOF comes first
fn read_chunk(reader: &mut impl Read, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::mock::MockEnumerator;

    fn image(dir: &Path, len: usize) -> PathBuf {
        let path = dir.join("image.img");
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, data).unwrap();
        path
    }

    fn small_chunks() -> WriteOptions {
        WriteOptions {
            allow_non_removable: false,
            chunk_size: 4096,
            flush_interval_chunks: 2,
        }
    }

    #[test]
    fn test_writes_image_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockEnumerator::new(dir.path().join("dev")).unwrap();
        let device = mock.add_device("card", 64 * 1024, true).unwrap();
        let source = image(dir.path(), 10_000);

        let mut writer = BlockWriter::new(small_chunks());
        let mut events = Vec::new();
        let written = writer
            .write(&source, &device, &CancelToken::new(), |p| events.push(p))
            .unwrap();

        assert_eq!(written, 10_000);
        assert_eq!(writer.state(), WriterState::Completed);
        let on_device = std::fs::read(&device.path).unwrap();
        assert_eq!(on_device.len(), 64 * 1024);
        assert_eq!(&on_device[..10_000], &std::fs::read(&source).unwrap()[..]);
        assert_eq!(events.last().unwrap().bytes_written, 10_000);
    }

    #[test]
    fn test_non_removable_guard_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockEnumerator::new(dir.path().join("dev")).unwrap();
        let device = mock.add_device("disk", 64 * 1024, false).unwrap();
        let source = image(dir.path(), 1000);

        let mut writer = BlockWriter::new(small_chunks());
        let err = writer
            .write(&source, &device, &CancelToken::new(), |_| {})
            .unwrap_err();
        assert!(matches!(err, WriteError::NotRemovable(_)));
        assert!(err.is_guard());
        assert_eq!(writer.state(), WriterState::Failed);
        assert!(std::fs::read(&device.path).unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_override_allows_fixed_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockEnumerator::new(dir.path().join("dev")).unwrap();
        let device = mock.add_device("disk", 64 * 1024, false).unwrap();
        let source = image(dir.path(), 1000);

        let mut writer = BlockWriter::new(WriteOptions {
            allow_non_removable: true,
            ..small_chunks()
        });
        assert_eq!(
            writer
                .write(&source, &device, &CancelToken::new(), |_| {})
                .unwrap(),
            1000
        );
    }

    #[test]
    fn test_image_too_large() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockEnumerator::new(dir.path().join("dev")).unwrap();
        let device = mock.add_device("card", 1024, true).unwrap();
        let source = image(dir.path(), 2048);

        let mut writer = BlockWriter::new(small_chunks());
        assert!(matches!(
            writer.write(&source, &device, &CancelToken::new(), |_| {}),
            Err(WriteError::ImageTooLarge {
                image: 2048,
                capacity: 1024
            })
        ));
    }

    #[test]
    fn test_cancel_reports_durable_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockEnumerator::new(dir.path().join("dev")).unwrap();
        let device = mock.add_device("card", 64 * 1024, true).unwrap();
        let source = image(dir.path(), 40_000);
        let cancel = CancelToken::new();

        let mut writer = BlockWriter::new(small_chunks());
        let err = writer
            .write(&source, &device, &cancel, |p| {
                // After the third chunk; the second chunk was the last flush
                if p.bytes_written == 3 * 4096 {
                    cancel.cancel();
                }
            })
            .unwrap_err();

        match err {
            WriteError::Cancelled { durable_offset } => assert_eq!(durable_offset, 2 * 4096),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(writer.state(), WriterState::Cancelled);

        assert!(matches!(
            writer.write(&source, &device, &CancelToken::new(), |_| {}),
            Err(WriteError::InvalidState(WriterState::Cancelled))
        ));
        writer.reset();
        assert_eq!(writer.state(), WriterState::Idle);
    }
}
