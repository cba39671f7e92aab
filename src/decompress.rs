//! Decompression module
//!
//! Single forward pass over a compressed image (XZ, GZ, BZ2, ZST, ZIP)
//! into a raw image, using a fixed-size buffer regardless of image size.
//! Output goes to a `.partial` file that is renamed only on success, and is
//! hashed with SHA-256 on the way out so cache hits can check it later.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use lzma_rust2::XzReaderMt;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zstd::stream::read::Decoder as ZstdDecoder;

use crate::cache::{CacheEntry, CacheError, ImageCache, StagedImage};
use crate::config;
use crate::images::CompressionKind;
use crate::utils::{
    get_recommended_threads, sanitize_file_name, strip_compression_ext, CancelToken,
    ProgressTracker,
};
use crate::{log_debug, log_info, log_warn};

const MODULE: &str = "decompress";

/// Member extensions picked out of zip archives
const ZIP_IMAGE_EXTS: &[&str] = &[".img", ".iso", ".raw"];

#[derive(Debug, Error)]
pub enum DecompressError {
    #[error("Unsupported compression format: {0}")]
    Unsupported(String),
    #[error("{format} decompression failed: {reason}")]
    Corrupt { format: &'static str, reason: String },
    #[error("Decompression I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("Decompression cancelled")]
    Cancelled,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> DecompressError + '_ {
    move |source| DecompressError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Decompression progress, measured on the compressed side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecompressProgress {
    /// Compressed bytes consumed
    pub bytes_processed: u64,
    /// Compressed input size
    pub total_bytes: u64,
    /// Raw bytes produced so far
    pub bytes_written: u64,
}

/// Counts bytes pulled from the compressed input
struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

impl<R: Seek> Seek for CountingReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

/// Decompress `input` into `output`, returning the raw size
///
/// Nothing is left at `output` unless the whole stream decoded cleanly.
pub fn decompress_file(
    input: &Path,
    output: &Path,
    kind: CompressionKind,
    cancel: &CancelToken,
    progress: impl FnMut(DecompressProgress),
) -> Result<u64, DecompressError> {
    decompress_staged(input, output, kind, cancel, progress).map(|staged| staged.size)
}

/// Decompress `input` into `output`, returning its size and SHA-256
pub fn decompress_staged(
    input: &Path,
    output: &Path,
    kind: CompressionKind,
    cancel: &CancelToken,
    progress: impl FnMut(DecompressProgress),
) -> Result<StagedImage, DecompressError> {
    if !kind.is_compressed() {
        return Err(DecompressError::Unsupported(kind.to_string()));
    }

    let partial = partial_path(output);
    let result = decompress_to(input, &partial, kind, cancel, progress).and_then(|(size, digest)| {
        std::fs::rename(&partial, output).map_err(io_err(output))?;
        Ok(StagedImage {
            path: output.to_path_buf(),
            size,
            digest,
        })
    });

    if result.is_err() {
        let _ = std::fs::remove_file(&partial);
    }
    result
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

fn decompress_to(
    input: &Path,
    output: &Path,
    kind: CompressionKind,
    cancel: &CancelToken,
    progress: impl FnMut(DecompressProgress),
) -> Result<(u64, String), DecompressError> {
    let file = File::open(input).map_err(io_err(input))?;
    let total = file.metadata().map_err(io_err(input))?.len();
    let count = Arc::new(AtomicU64::new(0));
    let reader = CountingReader {
        inner: file,
        count: Arc::clone(&count),
    };

    log_info!(
        MODULE,
        "Decompressing {} ({}) -> {}",
        input.display(),
        kind,
        output.display()
    );

    match kind {
        CompressionKind::Xz => {
            let threads = get_recommended_threads();
            log_info!(
                MODULE,
                "Using Rust lzma-rust2 with {} threads for XZ decompression",
                threads
            );
            // XzReaderMt requires Seek + Read, so the file is passed unbuffered
            let decoder = XzReaderMt::new(reader, false, threads as u32).map_err(|e| {
                DecompressError::Corrupt {
                    format: "xz",
                    reason: e.to_string(),
                }
            })?;
            copy_stream(decoder, "xz", output, total, &count, cancel, progress)
        }
        CompressionKind::Gzip => {
            let buffered = BufReader::with_capacity(config::download::DECOMPRESS_BUFFER_SIZE, reader);
            copy_stream(
                GzDecoder::new(buffered),
                "gzip",
                output,
                total,
                &count,
                cancel,
                progress,
            )
        }
        CompressionKind::Bzip2 => {
            let buffered = BufReader::with_capacity(config::download::DECOMPRESS_BUFFER_SIZE, reader);
            copy_stream(
                BzDecoder::new(buffered),
                "bzip2",
                output,
                total,
                &count,
                cancel,
                progress,
            )
        }
        CompressionKind::Zstd => {
            let buffered = BufReader::with_capacity(config::download::DECOMPRESS_BUFFER_SIZE, reader);
            let decoder =
                ZstdDecoder::with_buffer(buffered).map_err(|e| DecompressError::Corrupt {
                    format: "zstd",
                    reason: e.to_string(),
                })?;
            copy_stream(decoder, "zstd", output, total, &count, cancel, progress)
        }
        CompressionKind::Zip => {
            let zip_err = |e: zip::result::ZipError| DecompressError::Corrupt {
                format: "zip",
                reason: e.to_string(),
            };
            let mut archive = zip::ZipArchive::new(reader).map_err(zip_err)?;
            let index = find_zip_image(&mut archive).map_err(zip_err)?.ok_or_else(|| {
                DecompressError::Corrupt {
                    format: "zip",
                    reason: "archive contains no disk image".to_string(),
                }
            })?;
            let member = archive.by_index(index).map_err(zip_err)?;
            log_info!(MODULE, "Extracting zip member {}", member.name());
            copy_stream(member, "zip", output, total, &count, cancel, progress)
        }
        CompressionKind::None => Err(DecompressError::Unsupported(kind.to_string())),
    }
}

/// First member with a disk image extension, or the only file in the archive
fn find_zip_image<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
) -> zip::result::ZipResult<Option<usize>> {
    let mut files = Vec::new();
    for i in 0..archive.len() {
        let member = archive.by_index(i)?;
        if member.is_dir() {
            continue;
        }
        let name = member.name().to_ascii_lowercase();
        if ZIP_IMAGE_EXTS.iter().any(|ext| name.ends_with(ext)) {
            return Ok(Some(i));
        }
        files.push(i);
    }
    Ok(match files.as_slice() {
        [only] => Some(*only),
        _ => None,
    })
}

fn copy_stream<R: Read>(
    mut decoder: R,
    format: &'static str,
    output: &Path,
    total: u64,
    count: &AtomicU64,
    cancel: &CancelToken,
    mut progress: impl FnMut(DecompressProgress),
) -> Result<(u64, String), DecompressError> {
    let output_file = File::create(output).map_err(io_err(output))?;
    let mut writer = BufWriter::with_capacity(config::download::DECOMPRESS_BUFFER_SIZE, output_file);
    let mut buffer = vec![0u8; config::download::CHUNK_SIZE];
    let mut written = 0u64;
    let mut hasher = Sha256::new();
    let mut tracker = ProgressTracker::new(
        "Decompress",
        MODULE,
        0,
        config::logging::DECOMPRESS_LOG_INTERVAL_MB,
    );

    loop {
        if cancel.is_cancelled() {
            log_info!(MODULE, "Decompression cancelled");
            return Err(DecompressError::Cancelled);
        }

        let n = decoder
            .read(&mut buffer)
            .map_err(|e| DecompressError::Corrupt {
                format,
                reason: e.to_string(),
            })?;
        if n == 0 {
            break;
        }

        writer.write_all(&buffer[..n]).map_err(io_err(output))?;
        hasher.update(&buffer[..n]);
        written += n as u64;
        tracker.update(n as u64);
        progress(DecompressProgress {
            bytes_processed: count.load(Ordering::Relaxed).min(total),
            total_bytes: total,
            bytes_written: written,
        });
    }

    let file = writer
        .into_inner()
        .map_err(|e| DecompressError::Io {
            path: output.to_path_buf(),
            source: e.into_error(),
        })?;
    file.sync_all().map_err(io_err(output))?;

    tracker.finish();
    log_debug!(MODULE, "{} -> {} raw bytes", format, written);
    Ok((written, hex::encode(hasher.finalize())))
}

/// Produce (or reuse) the decompressed sibling of a cache entry
pub fn decompress(
    cache: &ImageCache,
    entry: &CacheEntry,
    cancel: &CancelToken,
    progress: impl FnMut(DecompressProgress),
) -> Result<CacheEntry, DecompressError> {
    if entry.raw_image().is_some() {
        log_debug!(MODULE, "{} needs no decompression", entry.checksum);
        return Ok(entry.clone());
    }

    let output = cache.decompressed_path(&entry.checksum);
    let staged = decompress_staged(&entry.path, &output, entry.compression, cancel, progress)?;
    let updated = cache.attach_decompressed(&entry.checksum, staged.digest)?;
    log_info!(
        MODULE,
        "Decompression complete: {}",
        output.display()
    );
    Ok(updated)
}

/// Decompressed custom image in the scratch directory, removed on drop
#[derive(Debug)]
pub struct ScratchImage {
    path: PathBuf,
}

impl ScratchImage {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchImage {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => log_debug!(MODULE, "Removed scratch image {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log_warn!(
                MODULE,
                "Failed to remove scratch image {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

/// Decompress a caller-supplied image into `scratch_dir`
///
/// `tag` keeps concurrent jobs on the same file apart. The output lives only
/// as long as the returned [`ScratchImage`].
pub fn decompress_custom(
    input: &Path,
    kind: CompressionKind,
    scratch_dir: &Path,
    tag: &str,
    cancel: &CancelToken,
    progress: impl FnMut(DecompressProgress),
) -> Result<ScratchImage, DecompressError> {
    let filename = input
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("custom.img");
    let output = scratch_dir.join(format!(
        "{}-{}",
        sanitize_file_name(tag),
        sanitize_file_name(strip_compression_ext(filename))
    ));

    std::fs::create_dir_all(scratch_dir).map_err(io_err(scratch_dir))?;
    if let Err(e) = decompress_file(input, &output, kind, cancel, progress) {
        log_warn!(MODULE, "Custom image decompression failed: {}", e);
        return Err(e);
    }
    Ok(ScratchImage { path: output })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_gzip_reports_progress_and_renames() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..500_000u32).map(|i| (i % 97) as u8).collect();
        let input = dir.path().join("image.img.gz");
        std::fs::write(&input, gzip(&data)).unwrap();
        let output = dir.path().join("image.img");

        let mut last = None;
        let written = decompress_file(
            &input,
            &output,
            CompressionKind::Gzip,
            &CancelToken::new(),
            |p| last = Some(p),
        )
        .unwrap();

        assert_eq!(written, data.len() as u64);
        assert_eq!(std::fs::read(&output).unwrap(), data);
        assert!(!partial_path(&output).exists());
        let last = last.unwrap();
        assert_eq!(last.bytes_written, data.len() as u64);
        assert!(last.bytes_processed <= last.total_bytes);
    }

    #[test]
    fn test_corrupt_stream_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = gzip(&vec![1u8; 200_000]);
        let len = bytes.len();
        bytes.truncate(len / 2);
        let input = dir.path().join("broken.gz");
        std::fs::write(&input, bytes).unwrap();
        let output = dir.path().join("broken.img");

        let err = decompress_file(
            &input,
            &output,
            CompressionKind::Gzip,
            &CancelToken::new(),
            |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, DecompressError::Corrupt { format: "gzip", .. }));
        assert!(!output.exists());
        assert!(!partial_path(&output).exists());
    }

    #[test]
    fn test_none_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("raw.img");
        std::fs::write(&input, b"raw").unwrap();
        assert!(matches!(
            decompress_file(
                &input,
                &dir.path().join("out"),
                CompressionKind::None,
                &CancelToken::new(),
                |_| {}
            ),
            Err(DecompressError::Unsupported(_))
        ));
    }

    #[test]
    fn test_cancel_cleans_partial() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("image.gz");
        std::fs::write(&input, gzip(&vec![3u8; 100_000])).unwrap();
        let output = dir.path().join("image.img");
        let cancel = CancelToken::new();
        cancel.cancel();

        assert!(matches!(
            decompress_file(&input, &output, CompressionKind::Gzip, &cancel, |_| {}),
            Err(DecompressError::Cancelled)
        ));
        assert!(!output.exists());
        assert!(!partial_path(&output).exists());
    }

    #[test]
    fn test_staged_digest_matches_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("image.img.gz");
        std::fs::write(&input, gzip(b"hash me")).unwrap();
        let output = dir.path().join("image.img");

        let staged = decompress_staged(
            &input,
            &output,
            CompressionKind::Gzip,
            &CancelToken::new(),
            |_| {},
        )
        .unwrap();
        assert_eq!(staged.size, 7);
        assert_eq!(staged.digest, hex::encode(Sha256::digest(b"hash me")));
    }

    #[test]
    fn test_custom_output_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("custom.img.gz");
        std::fs::write(&input, gzip(b"custom image")).unwrap();
        let scratch = dir.path().join("scratch");

        let first = decompress_custom(
            &input,
            CompressionKind::Gzip,
            &scratch,
            "job-1",
            &CancelToken::new(),
            |_| {},
        )
        .unwrap();
        let second = decompress_custom(
            &input,
            CompressionKind::Gzip,
            &scratch,
            "job-2",
            &CancelToken::new(),
            |_| {},
        )
        .unwrap();
        assert_eq!(
            first.path().file_name().unwrap().to_string_lossy(),
            "job-1-custom.img"
        );
        assert_ne!(first.path(), second.path());
        assert_eq!(std::fs::read(first.path()).unwrap(), b"custom image");

        drop(first);
        drop(second);
        assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);
    }
}
